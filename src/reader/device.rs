//! Per-device state on the reader side.

use tracing::{debug, info, trace};

use crate::codes::{syn, KeyState, MetaState, Source};
use crate::hub::{DeviceClasses, RawEvent, RawEventKind, RawEventSource};
use crate::listener::{InputDeviceInfo, KeyboardType, NotifyArgs};
use crate::policy::ConfigChanges;
use crate::properties::PropertyMap;
use crate::reader::mapper::{
    CursorMapper, JoystickMapper, KeyboardMapper, Mapper, MultiTouchMapper, SingleTouchMapper,
    SwitchMapper,
};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::Nanos;

/// A registered input device and its mapper stack.
///
/// Mappers are processed in registration order for every raw event; they may
/// have interleaved side effects (a gamepad's buttons and sticks are handled
/// by different mappers but must be delivered in input order).
pub struct InputDevice {
    id: i32,
    name: String,
    classes: DeviceClasses,
    is_external: bool,
    sources: Source,
    configuration: PropertyMap,
    mappers: Vec<Mapper>,
    /// Dropping events after a kernel buffer overrun, until the next sync.
    drop_until_next_sync: bool,
}

impl InputDevice {
    /// Builds the mapper stack for a device from its capability classes.
    pub(crate) fn new(hub: &dyn RawEventSource, id: i32, classes: DeviceClasses) -> Self {
        let identifier = hub.device_identifier(id).unwrap_or_default();
        let configuration = hub.device_configuration(id);

        let mut mappers = Vec::new();

        if classes.contains(DeviceClasses::SWITCH) {
            mappers.push(Mapper::Switch(SwitchMapper::new()));
        }

        // Keyboard-like capabilities accumulate into one keyboard mapper.
        let mut keyboard_source = Source::empty();
        let mut keyboard_type = KeyboardType::NonAlphabetic;
        if classes.contains(DeviceClasses::KEYBOARD) {
            keyboard_source |= Source::KEYBOARD;
        }
        if classes.contains(DeviceClasses::ALPHA_KEY) {
            keyboard_type = KeyboardType::Alphabetic;
        }
        if classes.contains(DeviceClasses::DPAD) {
            keyboard_source |= Source::DPAD;
        }
        if classes.contains(DeviceClasses::GAMEPAD) {
            keyboard_source |= Source::GAMEPAD;
        }
        if !keyboard_source.is_empty() {
            mappers.push(Mapper::Keyboard(KeyboardMapper::new(
                keyboard_source,
                keyboard_type,
            )));
        }

        if classes.contains(DeviceClasses::CURSOR) {
            mappers.push(Mapper::Cursor(CursorMapper::new()));
        }

        if classes.contains(DeviceClasses::TOUCH_MT) {
            mappers.push(Mapper::MultiTouch(MultiTouchMapper::new()));
        } else if classes.contains(DeviceClasses::TOUCH) {
            mappers.push(Mapper::SingleTouch(SingleTouchMapper::new()));
        }

        if classes.contains(DeviceClasses::JOYSTICK) {
            mappers.push(Mapper::Joystick(JoystickMapper::new()));
        }

        InputDevice {
            id,
            name: identifier.name,
            classes,
            is_external: classes.contains(DeviceClasses::EXTERNAL),
            sources: Source::empty(),
            configuration,
            mappers,
            drop_until_next_sync: false,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classes(&self) -> DeviceClasses {
        self.classes
    }

    pub fn sources(&self) -> Source {
        self.sources
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    /// A device with no mappers produces nothing and is skipped.
    pub fn is_ignored(&self) -> bool {
        self.mappers.is_empty()
    }

    fn split(&mut self) -> (DeviceContext<'_>, &mut [Mapper]) {
        let InputDevice {
            id,
            name,
            classes,
            is_external,
            configuration,
            mappers,
            ..
        } = self;
        (
            DeviceContext {
                id: *id,
                name: name.as_str(),
                external: *is_external,
                configuration,
                classes: *classes,
            },
            mappers,
        )
    }

    pub(crate) fn configure(&mut self, ctx: &mut ReaderContext<'_>, changes: ConfigChanges) {
        self.sources = Source::empty();
        if self.is_ignored() {
            return;
        }
        let (dev, mappers) = self.split();
        let mut sources = Source::empty();
        for mapper in mappers.iter_mut() {
            mapper.configure(ctx, &dev, changes);
            sources |= mapper.sources();
        }
        self.sources = sources;
    }

    pub(crate) fn reset(&mut self, ctx: &mut ReaderContext<'_>, when: Nanos) {
        let (dev, mappers) = self.split();
        for mapper in mappers.iter_mut() {
            mapper.reset(ctx, &dev, when);
        }
        ctx.notify(NotifyArgs::DeviceReset {
            when,
            device_id: self.id,
        });
    }

    pub(crate) fn process(&mut self, ctx: &mut ReaderContext<'_>, events: &[RawEvent]) {
        // Process all events in order for each mapper; bulk handoff per
        // mapper would reorder interleaved side effects.
        for raw in events {
            trace!(
                device = self.id,
                kind = ?raw.kind,
                code = raw.code,
                value = raw.value,
                "input event"
            );
            if self.drop_until_next_sync {
                if raw.kind == RawEventKind::Sync && raw.code == syn::REPORT {
                    self.drop_until_next_sync = false;
                    debug!(device = self.id, "recovered from input event buffer overrun");
                } else {
                    debug!(device = self.id, "dropped input event while waiting for next sync");
                }
            } else if raw.kind == RawEventKind::Sync && raw.code == syn::DROPPED {
                info!(device = %self.name, "detected input event buffer overrun");
                self.drop_until_next_sync = true;
                self.reset(ctx, raw.when);
            } else {
                let (dev, mappers) = self.split();
                for mapper in mappers.iter_mut() {
                    mapper.process(ctx, &dev, raw);
                }
            }
        }
    }

    pub(crate) fn timeout_expired(&mut self, ctx: &mut ReaderContext<'_>, when: Nanos) {
        let (dev, mappers) = self.split();
        for mapper in mappers.iter_mut() {
            mapper.timeout_expired(ctx, &dev, when);
        }
    }

    pub fn device_info(&self) -> InputDeviceInfo {
        let mut info = InputDeviceInfo::new(self.id, &self.name);
        for mapper in &self.mappers {
            mapper.populate_device_info(&mut info);
        }
        info
    }

    fn context(&self) -> DeviceContext<'_> {
        DeviceContext {
            id: self.id,
            name: &self.name,
            external: self.is_external,
            configuration: &self.configuration,
            classes: self.classes,
        }
    }

    pub(crate) fn key_code_state(
        &self,
        hub: &dyn RawEventSource,
        source_mask: Source,
        key_code: i32,
    ) -> KeyState {
        self.query_state(source_mask, |mapper, dev| {
            mapper.key_code_state(hub, dev, key_code)
        })
    }

    pub(crate) fn scan_code_state(
        &self,
        hub: &dyn RawEventSource,
        source_mask: Source,
        scan_code: i32,
    ) -> KeyState {
        self.query_state(source_mask, |mapper, dev| {
            mapper.scan_code_state(hub, dev, scan_code)
        })
    }

    pub(crate) fn switch_state(
        &self,
        hub: &dyn RawEventSource,
        source_mask: Source,
        switch_code: i32,
    ) -> KeyState {
        self.query_state(source_mask, |mapper, dev| {
            mapper.switch_state(hub, dev, switch_code)
        })
    }

    fn query_state(
        &self,
        source_mask: Source,
        query: impl Fn(&Mapper, &DeviceContext<'_>) -> KeyState,
    ) -> KeyState {
        let dev = self.context();
        let mut result = KeyState::Unknown;
        for mapper in &self.mappers {
            if crate::codes::sources_match_mask(mapper.sources(), source_mask) {
                let state = query(mapper, &dev);
                if state >= KeyState::Down {
                    return state;
                }
                result = result.max(state);
            }
        }
        result
    }

    pub(crate) fn mark_supported_key_codes(
        &self,
        hub: &dyn RawEventSource,
        source_mask: Source,
        key_codes: &[i32],
        out_flags: &mut [u8],
    ) -> bool {
        let dev = self.context();
        let mut result = false;
        for mapper in &self.mappers {
            if crate::codes::sources_match_mask(mapper.sources(), source_mask) {
                result |= mapper.mark_supported_key_codes(hub, &dev, key_codes, out_flags);
            }
        }
        result
    }

    pub(crate) fn meta_state(&self) -> MetaState {
        let mut state = MetaState::empty();
        for mapper in &self.mappers {
            state |= mapper.meta_state();
        }
        state
    }

    pub(crate) fn fade_pointer(&mut self) {
        for mapper in &mut self.mappers {
            mapper.fade_pointer();
        }
    }

    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "  Device {}: {}", self.id, self.name);
        let _ = writeln!(out, "    Classes: {:?}", self.classes);
        let _ = writeln!(out, "    IsExternal: {}", self.is_external);
        let _ = writeln!(out, "    Sources: {:?}", self.sources);
        for mapper in &self.mappers {
            mapper.dump(out);
        }
    }
}
