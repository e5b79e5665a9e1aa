//! Keyboard mapper: key tracking, meta state, dpad rotation, LEDs.

use smallvec::SmallVec;
use tracing::info;

use crate::codes::{
    key, keycodes, led, KeyAction, KeyFlags, KeyState, MetaState, PolicyFlags, Source,
};
use crate::hub::{RawEvent, RawEventKind, RawEventSource};
use crate::listener::{InputDeviceInfo, KeyArgs, KeyboardType, NotifyArgs};
use crate::policy::ConfigChanges;
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::geometry::rotate_value;
use crate::utils::{Nanos, Rotation};

// Dpad key codes enumerated counter-clockwise, unrotated first.
const KEYCODE_ROTATION_MAP: [[i32; 4]; 4] = [
    [
        keycodes::DPAD_DOWN,
        keycodes::DPAD_RIGHT,
        keycodes::DPAD_UP,
        keycodes::DPAD_LEFT,
    ],
    [
        keycodes::DPAD_RIGHT,
        keycodes::DPAD_UP,
        keycodes::DPAD_LEFT,
        keycodes::DPAD_DOWN,
    ],
    [
        keycodes::DPAD_UP,
        keycodes::DPAD_LEFT,
        keycodes::DPAD_DOWN,
        keycodes::DPAD_RIGHT,
    ],
    [
        keycodes::DPAD_LEFT,
        keycodes::DPAD_DOWN,
        keycodes::DPAD_RIGHT,
        keycodes::DPAD_UP,
    ],
];

fn rotate_key_code(key_code: i32, rotation: Rotation) -> i32 {
    rotate_value(key_code, rotation, &KEYCODE_ROTATION_MAP)
}

/// Meta bit affected by a key code, plus whether it is a toggle lock.
fn meta_mask_for_key(key_code: i32) -> Option<(MetaState, bool)> {
    match key_code {
        keycodes::ALT_LEFT => Some((MetaState::ALT_LEFT_ON, false)),
        keycodes::ALT_RIGHT => Some((MetaState::ALT_RIGHT_ON, false)),
        keycodes::SHIFT_LEFT => Some((MetaState::SHIFT_LEFT_ON, false)),
        keycodes::SHIFT_RIGHT => Some((MetaState::SHIFT_RIGHT_ON, false)),
        keycodes::CTRL_LEFT => Some((MetaState::CTRL_LEFT_ON, false)),
        keycodes::CTRL_RIGHT => Some((MetaState::CTRL_RIGHT_ON, false)),
        keycodes::META_LEFT => Some((MetaState::META_LEFT_ON, false)),
        keycodes::META_RIGHT => Some((MetaState::META_RIGHT_ON, false)),
        keycodes::SYM => Some((MetaState::SYM_ON, false)),
        keycodes::FUNCTION => Some((MetaState::FUNCTION_ON, false)),
        keycodes::CAPS_LOCK => Some((MetaState::CAPS_LOCK_ON, true)),
        keycodes::NUM_LOCK => Some((MetaState::NUM_LOCK_ON, true)),
        keycodes::SCROLL_LOCK => Some((MetaState::SCROLL_LOCK_ON, true)),
        _ => None,
    }
}

fn is_meta_key(key_code: i32) -> bool {
    meta_mask_for_key(key_code).is_some()
}

/// Applies one key transition to the meta state. Lock keys toggle on down;
/// ordinary modifiers are held.
fn update_meta_state(key_code: i32, down: bool, old_state: MetaState) -> MetaState {
    let Some((mask, is_lock)) = meta_mask_for_key(key_code) else {
        return old_state;
    };
    let state = if is_lock {
        if down {
            old_state ^ mask
        } else {
            old_state
        }
    } else if down {
        old_state | mask
    } else {
        old_state & !mask
    };
    state.normalized()
}

#[derive(Debug, Clone, Copy)]
struct KeyDown {
    key_code: i32,
    scan_code: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct LedState {
    /// The device exposes this LED.
    available: bool,
    /// What we believe the LED currently shows.
    on: bool,
}

#[derive(Debug, Clone, Copy)]
struct Parameters {
    orientation_aware: bool,
    associated_display_id: i32,
}

/// Cooks key events for keyboards, dpads and gamepads.
pub struct KeyboardMapper {
    source: Source,
    keyboard_type: KeyboardType,
    parameters: Parameters,
    key_downs: SmallVec<[KeyDown; 4]>,
    meta_state: MetaState,
    down_time: Nanos,
    caps_lock_led: LedState,
    num_lock_led: LedState,
    scroll_lock_led: LedState,
}

impl KeyboardMapper {
    pub fn new(source: Source, keyboard_type: KeyboardType) -> Self {
        KeyboardMapper {
            source,
            keyboard_type,
            parameters: Parameters {
                orientation_aware: false,
                associated_display_id: -1,
            },
            key_downs: SmallVec::new(),
            meta_state: MetaState::empty(),
            down_time: 0,
            caps_lock_led: LedState::default(),
            num_lock_led: LedState::default(),
            scroll_lock_led: LedState::default(),
        }
    }

    pub fn sources(&self) -> Source {
        self.source
    }

    pub fn populate_device_info(&self, info: &mut InputDeviceInfo) {
        info.keyboard_type = info.keyboard_type.max(self.keyboard_type);
    }

    pub fn meta_state(&self) -> MetaState {
        self.meta_state
    }

    pub fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: ConfigChanges,
    ) {
        if changes.is_empty() {
            self.parameters.orientation_aware = dev
                .configuration
                .get_bool("keyboard.orientationAware")
                .unwrap_or(false);
            self.parameters.associated_display_id =
                if self.parameters.orientation_aware { 0 } else { -1 };
            self.reset_led_state(ctx, dev);
        }
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        // Synthesize up events for keys currently down so nothing is left
        // stuck after a device reset.
        while let Some(key_down) = self.key_downs.last().copied() {
            self.process_key(
                ctx,
                dev,
                when,
                false,
                key_down.key_code,
                key_down.scan_code,
                PolicyFlags::empty(),
            );
        }
        self.meta_state = MetaState::empty();
        self.down_time = 0;
        self.reset_led_state(ctx, dev);
        ctx.update_global_meta_state();
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        if raw.kind != RawEventKind::Key {
            return;
        }
        let scan_code = raw.code;
        if !is_keyboard_or_gamepad_key(scan_code) {
            return;
        }
        let key_code = ctx
            .hub
            .map_key(dev.id, scan_code)
            .map(|(key_code, _)| key_code)
            .unwrap_or(keycodes::UNKNOWN);
        self.process_key(ctx, dev, raw.when, raw.value != 0, key_code, scan_code, raw.flags);
    }

    #[allow(clippy::too_many_arguments)]
    fn process_key(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        down: bool,
        key_code: i32,
        scan_code: i32,
        policy_flags: PolicyFlags,
    ) {
        let mut key_code = key_code;
        let mut policy_flags = policy_flags;

        if down {
            // Rotate dpad codes to match the display orientation.
            if self.parameters.orientation_aware && self.parameters.associated_display_id >= 0 {
                let rotation = ctx
                    .policy
                    .display_viewport(self.parameters.associated_display_id, dev.external)
                    .map(|viewport| viewport.rotation)
                    .unwrap_or(Rotation::Rot0);
                key_code = rotate_key_code(key_code, rotation);
            }

            if let Some(key_down) = self.key_downs.iter().find(|k| k.scan_code == scan_code) {
                // Key repeat: reuse the key code recorded at down time so
                // pairing survives display rotation.
                key_code = key_down.key_code;
            } else {
                if policy_flags.contains(PolicyFlags::VIRTUAL)
                    && ctx.should_drop_virtual_key(when, key_code, scan_code)
                {
                    return;
                }
                self.key_downs.push(KeyDown { key_code, scan_code });
            }
            self.down_time = when;
        } else {
            match self.key_downs.iter().position(|k| k.scan_code == scan_code) {
                Some(index) => {
                    key_code = self.key_downs[index].key_code;
                    self.key_downs.remove(index);
                }
                None => {
                    info!(
                        device = dev.name,
                        key_code, scan_code, "dropping key up, key was not down"
                    );
                    return;
                }
            }
        }

        let old_meta_state = self.meta_state;
        let new_meta_state = update_meta_state(key_code, down, old_meta_state);
        if old_meta_state != new_meta_state {
            self.meta_state = new_meta_state;
            self.update_led_state(ctx, dev, false);
            ctx.update_global_meta_state();
        }

        // Key down on an external keyboard should wake the device; internal
        // keyboards wake only through their layout, to avoid pocket wakes.
        // The layout's own wake flags are kept either way.
        if down
            && dev.external
            && !policy_flags.intersects(PolicyFlags::WAKE | PolicyFlags::WAKE_DROPPED)
        {
            policy_flags |= PolicyFlags::WAKE_DROPPED;
        }

        if down && !is_meta_key(key_code) {
            ctx.fade_pointer();
        }

        let down_time = self.down_time;
        ctx.notify(NotifyArgs::Key(KeyArgs {
            when,
            device_id: dev.id,
            source: self.source,
            policy_flags,
            action: if down { KeyAction::Down } else { KeyAction::Up },
            flags: KeyFlags::FROM_SYSTEM,
            key_code,
            scan_code,
            meta_state: self.meta_state,
            down_time,
        }));
    }

    pub fn key_code_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        key_code: i32,
    ) -> KeyState {
        hub.key_code_state(dev.id, key_code)
    }

    pub fn scan_code_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        scan_code: i32,
    ) -> KeyState {
        hub.scan_code_state(dev.id, scan_code)
    }

    fn reset_led_state(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) {
        self.caps_lock_led = LedState {
            available: ctx.hub.has_led(dev.id, led::CAPSL),
            on: false,
        };
        self.num_lock_led = LedState {
            available: ctx.hub.has_led(dev.id, led::NUML),
            on: false,
        };
        self.scroll_lock_led = LedState {
            available: ctx.hub.has_led(dev.id, led::SCROLLL),
            on: false,
        };
        self.update_led_state(ctx, dev, true);
    }

    fn update_led_state(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, reset: bool) {
        let meta_state = self.meta_state;
        Self::update_led_for_modifier(
            ctx,
            dev,
            &mut self.caps_lock_led,
            led::CAPSL,
            meta_state.contains(MetaState::CAPS_LOCK_ON),
            reset,
        );
        Self::update_led_for_modifier(
            ctx,
            dev,
            &mut self.num_lock_led,
            led::NUML,
            meta_state.contains(MetaState::NUM_LOCK_ON),
            reset,
        );
        Self::update_led_for_modifier(
            ctx,
            dev,
            &mut self.scroll_lock_led,
            led::SCROLLL,
            meta_state.contains(MetaState::SCROLL_LOCK_ON),
            reset,
        );
    }

    fn update_led_for_modifier(
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        led_state: &mut LedState,
        led: i32,
        desired: bool,
        reset: bool,
    ) {
        if led_state.available && (reset || led_state.on != desired) {
            ctx.hub.set_led_state(dev.id, led, desired);
            led_state.on = desired;
        }
    }

    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "    Keyboard Input Mapper:");
        let _ = writeln!(
            out,
            "      OrientationAware: {}",
            self.parameters.orientation_aware
        );
        let _ = writeln!(out, "      KeyboardType: {:?}", self.keyboard_type);
        let _ = writeln!(out, "      KeyDowns: {} keys currently down", self.key_downs.len());
        let _ = writeln!(out, "      MetaState: {:?}", self.meta_state);
        let _ = writeln!(out, "      DownTime: {}", self.down_time);
    }
}

/// Everything in the button range is ignored except gamepad and joystick
/// buttons, which behave like keyboard keys.
fn is_keyboard_or_gamepad_key(scan_code: i32) -> bool {
    scan_code < key::BTN_MOUSE
        || scan_code >= key::KEY_OK
        || (key::BTN_JOYSTICK..key::BTN_DIGI).contains(&scan_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing::*;

    const SCAN_A: i32 = 30;
    const KEYCODE_A: i32 = 29;
    const SCAN_DPAD_UP: i32 = 103;

    fn key_event(when: Nanos, code: i32, value: i32) -> RawEvent {
        RawEvent {
            when,
            device_id: 1,
            kind: RawEventKind::Key,
            code,
            value,
            flags: PolicyFlags::empty(),
        }
    }

    fn keyboard_fixture() -> MapperFixture {
        let fixture = MapperFixture::new();
        fixture.hub.add_key_mapping(1, SCAN_A, KEYCODE_A, PolicyFlags::empty());
        fixture
            .hub
            .add_key_mapping(1, SCAN_DPAD_UP, keycodes::DPAD_UP, PolicyFlags::empty());
        fixture
            .hub
            .add_key_mapping(1, 58, keycodes::CAPS_LOCK, PolicyFlags::empty());
        fixture
            .hub
            .add_key_mapping(1, 42, keycodes::SHIFT_LEFT, PolicyFlags::empty());
        fixture
    }

    fn key_args(events: &[NotifyArgs]) -> Vec<&KeyArgs> {
        events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Key(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn down_up_pairing() {
        let mut fixture = keyboard_fixture();
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(100, SCAN_A, 1));
            mapper.process(ctx, dev, &key_event(200, SCAN_A, 0));
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].action, KeyAction::Down);
        assert_eq!(keys[0].key_code, KEYCODE_A);
        assert_eq!(keys[0].down_time, 100);
        assert_eq!(keys[1].action, KeyAction::Up);
        assert_eq!(keys[1].down_time, 100);
    }

    #[test]
    fn unmatched_up_is_dropped() {
        let mut fixture = keyboard_fixture();
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(100, SCAN_A, 0));
        });
        assert!(fixture.drain().is_empty());
    }

    #[test]
    fn repeat_reuses_stored_key_code() {
        let mut fixture = keyboard_fixture();
        fixture.set_rotation(Rotation::Rot0);
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD | Source::DPAD, KeyboardType::NonAlphabetic);
        fixture.dev_config.set("keyboard.orientationAware", "1");
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, ConfigChanges::empty());
        });

        // Key goes down at rotation 0, display rotates, then the key repeats
        // and releases: the key code recorded at down time sticks.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(100, SCAN_DPAD_UP, 1));
        });
        fixture.set_rotation(Rotation::Rot90);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(200, SCAN_DPAD_UP, 1));
            mapper.process(ctx, dev, &key_event(300, SCAN_DPAD_UP, 0));
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.key_code == keycodes::DPAD_UP));
    }

    #[test]
    fn dpad_rotation_on_down() {
        let mut fixture = keyboard_fixture();
        fixture.set_rotation(Rotation::Rot90);
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD | Source::DPAD, KeyboardType::NonAlphabetic);
        fixture.dev_config.set("keyboard.orientationAware", "1");
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, ConfigChanges::empty());
            mapper.process(ctx, dev, &key_event(100, SCAN_DPAD_UP, 1));
            mapper.process(ctx, dev, &key_event(200, SCAN_DPAD_UP, 0));
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert_eq!(keys[0].key_code, keycodes::DPAD_LEFT);
        assert_eq!(keys[1].key_code, keycodes::DPAD_LEFT);
    }

    #[test]
    fn meta_state_shift_and_caps() {
        let mut fixture = keyboard_fixture();
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(1, 42, 1)); // shift down
        });
        assert!(mapper.meta_state().contains(MetaState::SHIFT_ON));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(2, 42, 0)); // shift up
            mapper.process(ctx, dev, &key_event(3, 58, 1)); // caps lock toggles
            mapper.process(ctx, dev, &key_event(4, 58, 0));
        });
        assert!(!mapper.meta_state().contains(MetaState::SHIFT_ON));
        assert!(mapper.meta_state().contains(MetaState::CAPS_LOCK_ON));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(5, 58, 1));
            mapper.process(ctx, dev, &key_event(6, 58, 0));
        });
        assert!(!mapper.meta_state().contains(MetaState::CAPS_LOCK_ON));
    }

    #[test]
    fn caps_lock_drives_led() {
        let mut fixture = keyboard_fixture();
        fixture.hub.set_led_available(1, led::CAPSL);
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, ConfigChanges::empty());
        });
        assert_eq!(fixture.hub.led_state(1, led::CAPSL), Some(false));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(1, 58, 1));
        });
        assert_eq!(fixture.hub.led_state(1, led::CAPSL), Some(true));
    }

    #[test]
    fn external_keyboard_wakes() {
        let mut fixture = keyboard_fixture();
        fixture.external = true;
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(1, SCAN_A, 1));
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert!(keys[0].policy_flags.contains(PolicyFlags::WAKE_DROPPED));
    }

    #[test]
    fn layout_wake_flag_is_kept_unioned() {
        let mut fixture = keyboard_fixture();
        fixture.external = true;
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            let mut raw = key_event(1, SCAN_A, 1);
            raw.flags = PolicyFlags::WAKE;
            mapper.process(ctx, dev, &raw);
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert!(keys[0].policy_flags.contains(PolicyFlags::WAKE));
        assert!(!keys[0].policy_flags.contains(PolicyFlags::WAKE_DROPPED));
    }

    #[test]
    fn reset_releases_held_keys() {
        let mut fixture = keyboard_fixture();
        let mut mapper = KeyboardMapper::new(Source::KEYBOARD, KeyboardType::Alphabetic);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &key_event(1, SCAN_A, 1));
            mapper.process(ctx, dev, &key_event(2, SCAN_DPAD_UP, 1));
        });
        fixture.drain();
        fixture.with_ctx(|ctx, dev| {
            mapper.reset(ctx, dev, 10);
        });
        let events = fixture.drain();
        let keys = key_args(&events);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.action == KeyAction::Up));
        // A second reset is a no-op.
        fixture.with_ctx(|ctx, dev| {
            mapper.reset(ctx, dev, 20);
        });
        assert!(key_args(&fixture.drain()).is_empty());
    }
}
