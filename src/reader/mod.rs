//! The input reader: pulls raw events from the hub, cooks them through each
//! device's mapper stack, and flushes notifications to the listener.
//!
//! Exactly one thread runs [`InputReader::loop_once`] in a loop. State
//! queries may be made from any thread; they take the registry lock, read,
//! and never call out while holding it beyond a non-blocking wake write.

use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, warn};

use crate::codes::{KeyState, MetaState, Source};
use crate::hub::{DeviceClasses, RawEvent, RawEventKind, RawEventSource};
use crate::listener::{InputDeviceInfo, Listener, NotifyArgs, QueuedListener};
use crate::policy::{ConfigChanges, Policy, ReaderConfiguration};
use crate::properties::PropertyMap;
use crate::utils::clock::millis_until;
use crate::utils::{Clock, Nanos};

pub mod device;
pub mod mapper;

pub use self::device::InputDevice;

/// Raw events pulled from the hub per loop iteration.
const EVENT_BUFFER_SIZE: usize = 256;

/// Read-only facts about a device, handed to every mapper call.
///
/// Mappers hold no reference to their device; this context replaces the
/// device back-pointer.
pub struct DeviceContext<'a> {
    pub id: i32,
    pub name: &'a str,
    pub external: bool,
    pub configuration: &'a PropertyMap,
    pub classes: DeviceClasses,
}

/// Side effects a mapper wants the reader to apply after the current call.
#[derive(Debug, Default)]
pub struct ContextRequests {
    update_global_meta_state: bool,
    fade_pointer: bool,
    timeout_at: Option<Nanos>,
    disable_virtual_keys_until: Option<Nanos>,
}

/// Reader services available to mappers during a call.
pub struct ReaderContext<'a> {
    pub hub: &'a dyn RawEventSource,
    pub policy: &'a dyn Policy,
    pub config: &'a ReaderConfiguration,
    pub global_meta_state: MetaState,
    pub(crate) virtual_keys_disabled_until: Nanos,
    pub(crate) queue: &'a mut QueuedListener,
    pub(crate) requests: &'a mut ContextRequests,
}

impl ReaderContext<'_> {
    /// Queues one cooked notification for the end-of-loop flush.
    pub fn notify(&mut self, args: NotifyArgs) {
        self.queue.push(args);
    }

    /// Asks the reader to recompute the global meta state from all devices
    /// once the current batch ends.
    pub fn update_global_meta_state(&mut self) {
        self.requests.update_global_meta_state = true;
    }

    /// Asks the reader to fade the pointer of every device.
    pub fn fade_pointer(&mut self) {
        self.requests.fade_pointer = true;
    }

    /// Schedules a wakeup; the earliest requested time wins.
    pub fn request_timeout_at(&mut self, when: Nanos) {
        let current = self.requests.timeout_at.unwrap_or(Nanos::MAX);
        if when < current {
            self.requests.timeout_at = Some(when);
        }
    }

    /// Blocks new virtual key presses until `time`.
    pub fn disable_virtual_keys_until(&mut self, time: Nanos) {
        self.requests.disable_virtual_keys_until = Some(time);
    }

    /// Whether a virtual key press must be dropped because of recent touch
    /// activity.
    pub fn should_drop_virtual_key(&self, now: Nanos, key_code: i32, scan_code: i32) -> bool {
        if now < self.virtual_keys_disabled_until {
            info!(
                key_code,
                scan_code,
                remaining_ms = (self.virtual_keys_disabled_until - now) / 1_000_000,
                "dropping virtual key, virtual keys are temporarily disabled"
            );
            true
        } else {
            false
        }
    }
}

struct ReaderState {
    devices: IndexMap<i32, InputDevice>,
    config: ReaderConfiguration,
    queue: QueuedListener,
    global_meta_state: MetaState,
    disable_virtual_keys_timeout: Nanos,
    next_timeout: Nanos,
    config_changes_to_refresh: ConfigChanges,
}

/// Cooks raw events from a [`RawEventSource`] and feeds a [`Listener`].
pub struct InputReader {
    hub: Arc<dyn RawEventSource>,
    policy: Arc<dyn Policy>,
    listener: Mutex<Box<dyn Listener>>,
    state: Mutex<ReaderState>,
    event_buffer: Mutex<Vec<RawEvent>>,
    clock: Clock,
    span: tracing::Span,
}

impl InputReader {
    pub fn new(
        hub: Arc<dyn RawEventSource>,
        policy: Arc<dyn Policy>,
        listener: Box<dyn Listener>,
    ) -> Self {
        let config = policy.reader_configuration();
        hub.set_excluded_device_names(&config.excluded_device_names);
        InputReader {
            hub,
            policy,
            listener: Mutex::new(listener),
            state: Mutex::new(ReaderState {
                devices: IndexMap::new(),
                config,
                queue: QueuedListener::new(),
                global_meta_state: MetaState::empty(),
                disable_virtual_keys_timeout: Nanos::MIN,
                next_timeout: Nanos::MAX,
                config_changes_to_refresh: ConfigChanges::empty(),
            }),
            event_buffer: Mutex::new(vec![
                RawEvent {
                    when: 0,
                    device_id: 0,
                    kind: RawEventKind::Sync,
                    code: 0,
                    value: 0,
                    flags: crate::codes::PolicyFlags::empty(),
                };
                EVENT_BUFFER_SIZE
            ]),
            clock: Clock::new(),
            span: info_span!("input_reader"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a single iteration of the processing loop: refresh pending
    /// configuration, wait for events, process them, flush the listener.
    pub fn loop_once(&self) {
        let _guard = self.span.enter();

        let mut timeout_ms = -1;
        {
            let mut state = self.lock();
            let changes = state.config_changes_to_refresh;
            state.config_changes_to_refresh = ConfigChanges::empty();
            if !changes.is_empty() {
                self.refresh_configuration(&mut state, changes);
            }
            if state.next_timeout != Nanos::MAX {
                timeout_ms = millis_until(self.clock.now(), state.next_timeout);
            }
        }

        let mut buffer = self
            .event_buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = self.hub.poll_once(timeout_ms, &mut buffer[..]);

        let pending = {
            let mut state = self.lock();
            if count > 0 {
                self.process_events(&mut state, &buffer[..count]);
            }
            if (count == 0 || timeout_ms == 0) && state.next_timeout != Nanos::MAX {
                let now = self.clock.now();
                if now >= state.next_timeout {
                    debug!(latency_ms = (now - state.next_timeout) / 1_000_000, "timeout expired");
                    state.next_timeout = Nanos::MAX;
                    self.timeout_expired(&mut state, now);
                }
            }
            state.queue.drain()
        };
        drop(buffer);

        // The listener runs outside all reader locks.
        if !pending.is_empty() {
            let mut listener = self
                .listener
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for args in &pending {
                listener.notify(args);
            }
        }
    }

    fn process_events(&self, state: &mut ReaderState, events: &[RawEvent]) {
        let mut remaining = events;
        while !remaining.is_empty() {
            let first = &remaining[0];
            let batch_size = if first.kind.is_synthetic() {
                match first.kind {
                    RawEventKind::DeviceAdded => self.add_device(state, first.when, first.device_id),
                    RawEventKind::DeviceRemoved => {
                        self.remove_device(state, first.when, first.device_id)
                    }
                    RawEventKind::ScanComplete => self.handle_configuration_changed(state, first.when),
                    _ => unreachable!(),
                }
                1
            } else {
                // A maximal run of events for one device, terminated by any
                // synthetic event.
                let device_id = first.device_id;
                let mut batch_size = 1;
                while batch_size < remaining.len()
                    && !remaining[batch_size].kind.is_synthetic()
                    && remaining[batch_size].device_id == device_id
                {
                    batch_size += 1;
                }
                self.process_events_for_device(state, device_id, &remaining[..batch_size]);
                batch_size
            };
            remaining = &remaining[batch_size..];
        }
    }

    /// Runs `operation` with a mapper context and applies the side effects
    /// it requested.
    fn with_context<R>(
        &self,
        state: &mut ReaderState,
        operation: impl FnOnce(&mut ReaderContext<'_>, &mut IndexMap<i32, InputDevice>) -> R,
    ) -> R {
        let mut requests = ContextRequests::default();
        let ReaderState {
            devices,
            config,
            queue,
            global_meta_state,
            disable_virtual_keys_timeout,
            ..
        } = &mut *state;
        let mut ctx = ReaderContext {
            hub: &*self.hub,
            policy: &*self.policy,
            config,
            global_meta_state: *global_meta_state,
            virtual_keys_disabled_until: *disable_virtual_keys_timeout,
            queue,
            requests: &mut requests,
        };
        let result = operation(&mut ctx, devices);
        self.apply_requests(state, requests);
        result
    }

    fn apply_requests(&self, state: &mut ReaderState, requests: ContextRequests) {
        if requests.update_global_meta_state {
            state.global_meta_state = state
                .devices
                .values()
                .fold(MetaState::empty(), |acc, device| acc | device.meta_state());
        }
        if requests.fade_pointer {
            for device in state.devices.values_mut() {
                device.fade_pointer();
            }
        }
        if let Some(when) = requests.timeout_at {
            if when < state.next_timeout {
                state.next_timeout = when;
            }
        }
        if let Some(time) = requests.disable_virtual_keys_until {
            state.disable_virtual_keys_timeout = time;
        }
    }

    fn add_device(&self, state: &mut ReaderState, when: Nanos, device_id: i32) {
        if state.devices.contains_key(&device_id) {
            warn!(device_id, "ignoring spurious device added event");
            return;
        }
        let classes = self.hub.device_classes(device_id);
        let mut device = InputDevice::new(&*self.hub, device_id, classes);
        self.with_context(state, |ctx, _| {
            device.configure(ctx, ConfigChanges::empty());
            device.reset(ctx, when);
        });

        if device.is_ignored() {
            info!(
                device_id,
                name = device.name(),
                "device added (ignored non-input device)"
            );
        } else {
            info!(
                device_id,
                name = device.name(),
                sources = ?device.sources(),
                "device added"
            );
        }
        state.devices.insert(device_id, device);
    }

    fn remove_device(&self, state: &mut ReaderState, when: Nanos, device_id: i32) {
        let Some(mut device) = state.devices.shift_remove(&device_id) else {
            warn!(device_id, "ignoring spurious device removed event");
            return;
        };
        info!(device_id, name = device.name(), "device removed");
        self.with_context(state, |ctx, _| {
            device.reset(ctx, when);
        });
    }

    fn process_events_for_device(
        &self,
        state: &mut ReaderState,
        device_id: i32,
        events: &[RawEvent],
    ) {
        self.with_context(state, |ctx, devices| match devices.get_mut(&device_id) {
            Some(device) if !device.is_ignored() => device.process(ctx, events),
            Some(_) => {}
            None => debug!(device_id, "discarding events for unknown device"),
        });
    }

    fn timeout_expired(&self, state: &mut ReaderState, when: Nanos) {
        self.with_context(state, |ctx, devices| {
            for device in devices.values_mut() {
                if !device.is_ignored() {
                    device.timeout_expired(ctx, when);
                }
            }
        });
    }

    fn handle_configuration_changed(&self, state: &mut ReaderState, when: Nanos) {
        // The global meta state depends on the set of devices.
        let requests = ContextRequests {
            update_global_meta_state: true,
            ..Default::default()
        };
        self.apply_requests(state, requests);
        state.queue.push(NotifyArgs::ConfigurationChanged { when });
    }

    fn refresh_configuration(&self, state: &mut ReaderState, changes: ConfigChanges) {
        state.config = self.policy.reader_configuration();
        self.hub
            .set_excluded_device_names(&state.config.excluded_device_names);

        info!(?changes, "reconfiguring input devices");
        if changes.contains(ConfigChanges::MUST_REOPEN) {
            self.hub.request_reopen();
        } else {
            self.with_context(state, |ctx, devices| {
                for device in devices.values_mut() {
                    device.configure(ctx, changes);
                }
            });
        }
    }

    // --- queries; may be called from any thread ---

    /// Requests that some or all configuration be re-read from the policy on
    /// the next loop iteration.
    pub fn request_refresh_configuration(&self, changes: ConfigChanges) {
        if changes.is_empty() {
            return;
        }
        let need_wake = {
            let mut state = self.lock();
            let need_wake = state.config_changes_to_refresh.is_empty();
            state.config_changes_to_refresh |= changes;
            need_wake
        };
        if need_wake {
            self.hub.wake();
        }
    }

    pub fn input_device_info(&self, device_id: i32) -> Option<InputDeviceInfo> {
        let state = self.lock();
        let device = state.devices.get(&device_id)?;
        if device.is_ignored() {
            return None;
        }
        Some(device.device_info())
    }

    pub fn input_device_ids(&self) -> Vec<i32> {
        let state = self.lock();
        state
            .devices
            .values()
            .filter(|device| !device.is_ignored())
            .map(|device| device.id())
            .collect()
    }

    pub fn get_key_code_state(&self, device_id: i32, source_mask: Source, key_code: i32) -> KeyState {
        self.get_state(device_id, source_mask, |device| {
            device.key_code_state(&*self.hub, source_mask, key_code)
        })
    }

    pub fn get_scan_code_state(
        &self,
        device_id: i32,
        source_mask: Source,
        scan_code: i32,
    ) -> KeyState {
        self.get_state(device_id, source_mask, |device| {
            device.scan_code_state(&*self.hub, source_mask, scan_code)
        })
    }

    pub fn get_switch_state(&self, device_id: i32, source_mask: Source, switch_code: i32) -> KeyState {
        // A global switch query goes to the device that owns the switch.
        let device_id = if device_id < 0 {
            self.hub.switch_owner(switch_code).unwrap_or(device_id)
        } else {
            device_id
        };
        self.get_state(device_id, source_mask, |device| {
            device.switch_state(&*self.hub, source_mask, switch_code)
        })
    }

    fn get_state(
        &self,
        device_id: i32,
        source_mask: Source,
        query: impl Fn(&InputDevice) -> KeyState,
    ) -> KeyState {
        let state = self.lock();
        if device_id >= 0 {
            match state.devices.get(&device_id) {
                Some(device)
                    if !device.is_ignored()
                        && crate::codes::sources_match_mask(device.sources(), source_mask) =>
                {
                    query(device)
                }
                _ => KeyState::Unknown,
            }
        } else {
            let mut result = KeyState::Unknown;
            for device in state.devices.values() {
                if device.is_ignored()
                    || !crate::codes::sources_match_mask(device.sources(), source_mask)
                {
                    continue;
                }
                let device_state = query(device);
                if device_state >= KeyState::Down {
                    return device_state;
                }
                result = result.max(device_state);
            }
            result
        }
    }

    /// Determines whether physical keys exist for the given key codes,
    /// writing 1 into `out_flags` for each supported code.
    pub fn has_keys(
        &self,
        device_id: i32,
        source_mask: Source,
        key_codes: &[i32],
        out_flags: &mut [u8],
    ) -> bool {
        out_flags[..key_codes.len()].fill(0);
        let state = self.lock();
        if device_id >= 0 {
            match state.devices.get(&device_id) {
                Some(device)
                    if !device.is_ignored()
                        && crate::codes::sources_match_mask(device.sources(), source_mask) =>
                {
                    device.mark_supported_key_codes(&*self.hub, source_mask, key_codes, out_flags)
                }
                _ => false,
            }
        } else {
            let mut result = false;
            for device in state.devices.values() {
                if !device.is_ignored()
                    && crate::codes::sources_match_mask(device.sources(), source_mask)
                {
                    result |=
                        device.mark_supported_key_codes(&*self.hub, source_mask, key_codes, out_flags);
                }
            }
            result
        }
    }

    /// Heartbeat: proves the reader loop is alive by round-tripping the
    /// registry lock and the hub's wake pipe.
    pub fn monitor(&self) {
        drop(self.lock());
        self.hub.wake();
    }

    /// Appends a human-readable description of the reader state.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        self.hub.dump(out);
        out.push('\n');
        let state = self.lock();
        let _ = writeln!(out, "Input Reader State:");
        for device in state.devices.values() {
            device.dump(out);
        }
        let _ = writeln!(out, "  Configuration:");
        let _ = writeln!(
            out,
            "    ExcludedDeviceNames: {:?}",
            state.config.excluded_device_names
        );
        let _ = writeln!(
            out,
            "    VirtualKeyQuietTime: {:.1}ms",
            state.config.virtual_key_quiet_time as f64 * 1e-6
        );
        let _ = writeln!(out, "    PointerGesture:");
        let _ = writeln!(
            out,
            "      Enabled: {}",
            state.config.pointer_gestures_enabled
        );
        let _ = writeln!(
            out,
            "      TapInterval: {:.1}ms",
            state.config.pointer_gesture_tap_interval as f64 * 1e-6
        );
        let _ = writeln!(
            out,
            "      MultitouchSettleInterval: {:.1}ms",
            state.config.pointer_gesture_multitouch_settle_interval as f64 * 1e-6
        );
        let _ = writeln!(
            out,
            "      SwipeMaxWidthRatio: {:.2}",
            state.config.pointer_gesture_swipe_max_width_ratio
        );
        let _ = writeln!(out, "    GlobalMetaState: {:?}", state.global_meta_state);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by the mapper and reader tests.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    use crate::codes::{ButtonState, KeyState, MetaState, PolicyFlags};
    use crate::hub::{
        DeviceClasses, InputDeviceIdentifier, RawAbsoluteAxisInfo, RawEvent, RawEventSource,
        VirtualKeyDefinition,
    };
    use crate::keymap::AxisInfo;
    use crate::listener::{NotifyArgs, PointerCoords, QueuedListener};
    use crate::policy::{
        DisplayViewport, Policy, PointerController, Presentation, ReaderConfiguration, Transition,
    };
    use crate::properties::PropertyMap;
    use crate::utils::{BitSet32, Nanos, Rotation};

    use super::{ContextRequests, DeviceContext, ReaderContext};

    #[derive(Default)]
    struct FakeDevice {
        identifier: InputDeviceIdentifier,
        classes: DeviceClasses,
        configuration: PropertyMap,
        axis_infos: HashMap<i32, RawAbsoluteAxisInfo>,
        axis_values: HashMap<i32, i32>,
        rel_axes: HashSet<i32>,
        properties: HashSet<i32>,
        scan_codes: HashSet<i32>,
        key_mappings: HashMap<i32, (i32, PolicyFlags)>,
        axis_mappings: HashMap<i32, AxisInfo>,
        leds_available: HashSet<i32>,
        led_states: HashMap<i32, bool>,
        virtual_keys: Vec<VirtualKeyDefinition>,
        key_states: HashMap<i32, KeyState>,
        switch_states: HashMap<i32, KeyState>,
    }

    /// An in-memory hub: configure device facts, enqueue raw events.
    #[derive(Default)]
    pub struct FakeEventSource {
        devices: Mutex<HashMap<i32, FakeDevice>>,
        events: Mutex<VecDeque<RawEvent>>,
        woken: Mutex<bool>,
    }

    impl FakeEventSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_device(&self, device_id: i32, name: &str, classes: DeviceClasses) {
            let mut devices = self.devices.lock().unwrap();
            let device = devices.entry(device_id).or_default();
            device.identifier.name = name.to_owned();
            device.classes = classes;
        }

        pub fn set_device_configuration(&self, device_id: i32, configuration: PropertyMap) {
            self.with_device(device_id, |d| d.configuration = configuration);
        }

        pub fn set_absolute_axis_info(&self, device_id: i32, axis: i32, info: RawAbsoluteAxisInfo) {
            self.with_device(device_id, |d| {
                d.axis_infos.insert(axis, info);
            });
        }

        pub fn set_absolute_axis_value(&self, device_id: i32, axis: i32, value: i32) {
            self.with_device(device_id, |d| {
                d.axis_values.insert(axis, value);
            });
        }

        pub fn set_relative_axis(&self, device_id: i32, axis: i32) {
            self.with_device(device_id, |d| {
                d.rel_axes.insert(axis);
            });
        }

        pub fn set_input_property(&self, device_id: i32, property: i32) {
            self.with_device(device_id, |d| {
                d.properties.insert(property);
            });
        }

        pub fn set_scan_code(&self, device_id: i32, scan_code: i32) {
            self.with_device(device_id, |d| {
                d.scan_codes.insert(scan_code);
            });
        }

        pub fn add_key_mapping(&self, device_id: i32, scan_code: i32, key_code: i32, flags: PolicyFlags) {
            self.with_device(device_id, |d| {
                d.key_mappings.insert(scan_code, (key_code, flags));
            });
        }

        pub fn add_axis_mapping(&self, device_id: i32, scan_code: i32, info: AxisInfo) {
            self.with_device(device_id, |d| {
                d.axis_mappings.insert(scan_code, info);
            });
        }

        pub fn set_led_available(&self, device_id: i32, led: i32) {
            self.with_device(device_id, |d| {
                d.leds_available.insert(led);
            });
        }

        pub fn led_state(&self, device_id: i32, led: i32) -> Option<bool> {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id)?.led_states.get(&led).copied()
        }

        pub fn set_virtual_keys(&self, device_id: i32, keys: Vec<VirtualKeyDefinition>) {
            self.with_device(device_id, |d| d.virtual_keys = keys);
        }

        pub fn enqueue(&self, event: RawEvent) {
            self.events.lock().unwrap().push_back(event);
        }

        pub fn was_woken(&self) -> bool {
            *self.woken.lock().unwrap()
        }

        fn with_device<R>(&self, device_id: i32, f: impl FnOnce(&mut FakeDevice) -> R) -> R {
            let mut devices = self.devices.lock().unwrap();
            f(devices.entry(device_id).or_default())
        }
    }

    impl RawEventSource for FakeEventSource {
        fn poll_once(&self, _timeout_ms: i32, buffer: &mut [RawEvent]) -> usize {
            let mut events = self.events.lock().unwrap();
            let mut count = 0;
            while count < buffer.len() {
                let Some(event) = events.pop_front() else {
                    break;
                };
                buffer[count] = event;
                count += 1;
            }
            count
        }

        fn wake(&self) {
            *self.woken.lock().unwrap() = true;
        }

        fn request_reopen(&self) {}

        fn set_excluded_device_names(&self, _names: &[String]) {}

        fn device_identifier(&self, device_id: i32) -> Option<InputDeviceIdentifier> {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id).map(|d| d.identifier.clone())
        }

        fn device_classes(&self, device_id: i32) -> DeviceClasses {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id).map(|d| d.classes).unwrap_or_default()
        }

        fn device_configuration(&self, device_id: i32) -> PropertyMap {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .map(|d| d.configuration.clone())
                .unwrap_or_default()
        }

        fn absolute_axis_info(&self, device_id: i32, axis: i32) -> RawAbsoluteAxisInfo {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .and_then(|d| d.axis_infos.get(&axis).copied())
                .unwrap_or_default()
        }

        fn absolute_axis_value(&self, device_id: i32, axis: i32) -> Option<i32> {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id)?.axis_values.get(&axis).copied()
        }

        fn has_relative_axis(&self, device_id: i32, axis: i32) -> bool {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id).is_some_and(|d| d.rel_axes.contains(&axis))
        }

        fn has_input_property(&self, device_id: i32, property: i32) -> bool {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .is_some_and(|d| d.properties.contains(&property))
        }

        fn has_scan_code(&self, device_id: i32, scan_code: i32) -> bool {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .is_some_and(|d| d.scan_codes.contains(&scan_code) || d.key_mappings.contains_key(&scan_code))
        }

        fn map_key(&self, device_id: i32, scan_code: i32) -> Option<(i32, PolicyFlags)> {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id)?.key_mappings.get(&scan_code).copied()
        }

        fn map_axis(&self, device_id: i32, scan_code: i32) -> Option<AxisInfo> {
            let devices = self.devices.lock().unwrap();
            devices.get(&device_id)?.axis_mappings.get(&scan_code).copied()
        }

        fn scan_code_state(&self, device_id: i32, scan_code: i32) -> KeyState {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .and_then(|d| d.key_states.get(&scan_code).copied())
                .unwrap_or(KeyState::Up)
        }

        fn key_code_state(&self, device_id: i32, key_code: i32) -> KeyState {
            let devices = self.devices.lock().unwrap();
            let Some(device) = devices.get(&device_id) else {
                return KeyState::Unknown;
            };
            let down = device
                .key_mappings
                .iter()
                .filter(|(_, (code, _))| *code == key_code)
                .any(|(scan, _)| device.key_states.get(scan) == Some(&KeyState::Down));
            if down {
                KeyState::Down
            } else {
                KeyState::Up
            }
        }

        fn switch_state(&self, device_id: i32, switch_code: i32) -> KeyState {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .and_then(|d| d.switch_states.get(&switch_code).copied())
                .unwrap_or(KeyState::Up)
        }

        fn mark_supported_key_codes(
            &self,
            device_id: i32,
            key_codes: &[i32],
            out_flags: &mut [u8],
        ) -> bool {
            let devices = self.devices.lock().unwrap();
            let Some(device) = devices.get(&device_id) else {
                return false;
            };
            for (index, key_code) in key_codes.iter().enumerate() {
                if device.key_mappings.values().any(|(code, _)| code == key_code) {
                    out_flags[index] = 1;
                }
            }
            true
        }

        fn has_led(&self, device_id: i32, led: i32) -> bool {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .is_some_and(|d| d.leds_available.contains(&led))
        }

        fn set_led_state(&self, device_id: i32, led: i32, on: bool) {
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.get_mut(&device_id) {
                device.led_states.insert(led, on);
            }
        }

        fn virtual_key_definitions(&self, device_id: i32) -> Vec<VirtualKeyDefinition> {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&device_id)
                .map(|d| d.virtual_keys.clone())
                .unwrap_or_default()
        }

        fn switch_owner(&self, _switch_code: i32) -> Option<i32> {
            None
        }

        fn dump(&self, out: &mut String) {
            out.push_str("Fake Event Source\n");
        }
    }

    #[derive(Debug)]
    struct ControllerState {
        x: f32,
        y: f32,
        button_state: ButtonState,
        presentation: Option<Presentation>,
        spot_count: usize,
        faded: bool,
    }

    /// Records cursor movements and spots for assertions.
    pub struct FakePointerController {
        bounds: (f32, f32, f32, f32),
        state: Mutex<ControllerState>,
    }

    impl FakePointerController {
        pub fn new() -> Self {
            FakePointerController {
                bounds: (0.0, 0.0, 799.0, 479.0),
                state: Mutex::new(ControllerState {
                    x: 100.0,
                    y: 200.0,
                    button_state: ButtonState::empty(),
                    presentation: None,
                    spot_count: 0,
                    faded: false,
                }),
            }
        }

        pub fn spot_count(&self) -> usize {
            self.state.lock().unwrap().spot_count
        }

        pub fn is_faded(&self) -> bool {
            self.state.lock().unwrap().faded
        }
    }

    impl PointerController for FakePointerController {
        fn bounds(&self) -> Option<(f32, f32, f32, f32)> {
            Some(self.bounds)
        }

        fn move_by(&self, delta_x: f32, delta_y: f32) {
            let mut state = self.state.lock().unwrap();
            state.x = (state.x + delta_x).clamp(self.bounds.0, self.bounds.2);
            state.y = (state.y + delta_y).clamp(self.bounds.1, self.bounds.3);
        }

        fn set_position(&self, x: f32, y: f32) {
            let mut state = self.state.lock().unwrap();
            state.x = x.clamp(self.bounds.0, self.bounds.2);
            state.y = y.clamp(self.bounds.1, self.bounds.3);
        }

        fn position(&self) -> (f32, f32) {
            let state = self.state.lock().unwrap();
            (state.x, state.y)
        }

        fn set_button_state(&self, button_state: ButtonState) {
            self.state.lock().unwrap().button_state = button_state;
        }

        fn set_presentation(&self, presentation: Presentation) {
            self.state.lock().unwrap().presentation = Some(presentation);
        }

        fn set_spots(
            &self,
            _spot_coords: &[PointerCoords],
            _spot_id_to_index: &[u32],
            spot_id_bits: BitSet32,
        ) {
            self.state.lock().unwrap().spot_count = spot_id_bits.count() as usize;
        }

        fn clear_spots(&self) {
            self.state.lock().unwrap().spot_count = 0;
        }

        fn fade(&self, _transition: Transition) {
            self.state.lock().unwrap().faded = true;
        }

        fn unfade(&self, _transition: Transition) {
            self.state.lock().unwrap().faded = false;
        }
    }

    /// Policy fake with a settable viewport.
    pub struct FakePolicy {
        viewport: Mutex<DisplayViewport>,
        pub controller: Arc<FakePointerController>,
    }

    impl FakePolicy {
        pub fn new(controller: Arc<FakePointerController>) -> Self {
            FakePolicy {
                viewport: Mutex::new(DisplayViewport {
                    width: 480,
                    height: 800,
                    rotation: Rotation::Rot0,
                }),
                controller,
            }
        }

        pub fn set_viewport(&self, viewport: DisplayViewport) {
            *self.viewport.lock().unwrap() = viewport;
        }

        pub fn set_rotation(&self, rotation: Rotation) {
            self.viewport.lock().unwrap().rotation = rotation;
        }
    }

    impl Policy for FakePolicy {
        fn reader_configuration(&self) -> ReaderConfiguration {
            ReaderConfiguration::default()
        }

        fn display_viewport(&self, _display_id: i32, _external: bool) -> Option<DisplayViewport> {
            Some(*self.viewport.lock().unwrap())
        }

        fn obtain_pointer_controller(
            &self,
            _device_id: i32,
        ) -> Option<Arc<dyn PointerController>> {
            Some(self.controller.clone())
        }
    }

    /// A recording listener for reader-level tests.
    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Arc<Mutex<Vec<NotifyArgs>>>,
    }

    impl crate::listener::Listener for RecordingListener {
        fn notify(&mut self, args: &NotifyArgs) {
            self.events.lock().unwrap().push(args.clone());
        }
    }

    /// Harness for driving a single mapper directly.
    pub struct MapperFixture {
        pub hub: Arc<FakeEventSource>,
        pub policy: Arc<FakePolicy>,
        pub controller: Arc<FakePointerController>,
        pub config: ReaderConfiguration,
        pub dev_config: PropertyMap,
        pub external: bool,
        pub global_meta_state: MetaState,
        pub virtual_keys_disabled_until: Nanos,
        pub last_timeout_request: Option<Nanos>,
        queue: QueuedListener,
        device_name: String,
    }

    impl MapperFixture {
        pub fn new() -> Self {
            let hub = Arc::new(FakeEventSource::new());
            hub.add_device(1, "test-device", DeviceClasses::empty());
            let controller = Arc::new(FakePointerController::new());
            let policy = Arc::new(FakePolicy::new(controller.clone()));
            MapperFixture {
                hub,
                policy,
                controller,
                config: ReaderConfiguration::default(),
                dev_config: PropertyMap::new(),
                external: false,
                global_meta_state: MetaState::empty(),
                virtual_keys_disabled_until: Nanos::MIN,
                last_timeout_request: None,
                queue: QueuedListener::new(),
                device_name: "test-device".to_owned(),
            }
        }

        pub fn set_rotation(&self, rotation: Rotation) {
            self.policy.set_rotation(rotation);
        }

        pub fn with_ctx<R>(
            &mut self,
            f: impl FnOnce(&mut ReaderContext<'_>, &DeviceContext<'_>) -> R,
        ) -> R {
            let mut requests = ContextRequests::default();
            let dev = DeviceContext {
                id: 1,
                name: &self.device_name,
                external: self.external,
                configuration: &self.dev_config,
                classes: DeviceClasses::empty(),
            };
            let mut ctx = ReaderContext {
                hub: &*self.hub,
                policy: &*self.policy,
                config: &self.config,
                global_meta_state: self.global_meta_state,
                virtual_keys_disabled_until: self.virtual_keys_disabled_until,
                queue: &mut self.queue,
                requests: &mut requests,
            };
            let result = f(&mut ctx, &dev);
            if let Some(time) = requests.disable_virtual_keys_until {
                self.virtual_keys_disabled_until = time;
            }
            if let Some(when) = requests.timeout_at {
                self.last_timeout_request = Some(when);
            }
            result
        }

        pub fn drain(&mut self) -> Vec<NotifyArgs> {
            self.queue.drain()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::codes::{keycodes, syn, KeyAction, PolicyFlags};

    fn raw(device_id: i32, kind: RawEventKind, code: i32, value: i32, when: Nanos) -> RawEvent {
        RawEvent {
            when,
            device_id,
            kind,
            code,
            value,
            flags: PolicyFlags::empty(),
        }
    }

    fn synthetic(device_id: i32, kind: RawEventKind, when: Nanos) -> RawEvent {
        raw(device_id, kind, 0, 0, when)
    }

    fn reader_with_keyboard() -> (InputReader, Arc<FakeEventSource>, Arc<Mutex<Vec<NotifyArgs>>>) {
        let hub = Arc::new(FakeEventSource::new());
        hub.add_device(
            1,
            "keyboard",
            DeviceClasses::KEYBOARD | DeviceClasses::ALPHA_KEY,
        );
        hub.add_key_mapping(1, 30, 29, PolicyFlags::empty());
        let controller = Arc::new(FakePointerController::new());
        let policy = Arc::new(FakePolicy::new(controller));
        let listener = RecordingListener::default();
        let events = listener.events.clone();
        let reader = InputReader::new(hub.clone(), policy, Box::new(listener));
        (reader, hub, events)
    }

    #[test]
    fn device_added_produces_reset_and_configuration_change() {
        let (reader, hub, events) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, NotifyArgs::DeviceReset { device_id: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, NotifyArgs::ConfigurationChanged { .. })));
        assert_eq!(reader.input_device_ids(), vec![1]);
    }

    #[test]
    fn key_events_flow_to_listener_in_order() {
        let (reader, hub, events) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();
        events.lock().unwrap().clear();

        hub.enqueue(raw(1, RawEventKind::Key, 30, 1, 20));
        hub.enqueue(raw(1, RawEventKind::Sync, syn::REPORT, 0, 20));
        hub.enqueue(raw(1, RawEventKind::Key, 30, 0, 30));
        hub.enqueue(raw(1, RawEventKind::Sync, syn::REPORT, 0, 30));
        reader.loop_once();

        let events = events.lock().unwrap();
        let keys: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Key(args) => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].action, KeyAction::Down);
        assert_eq!(keys[0].key_code, 29);
        assert_eq!(keys[1].action, KeyAction::Up);
    }

    #[test]
    fn device_removed_releases_held_keys() {
        let (reader, hub, events) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();
        hub.enqueue(raw(1, RawEventKind::Key, 30, 1, 20));
        hub.enqueue(raw(1, RawEventKind::Sync, syn::REPORT, 0, 20));
        reader.loop_once();
        events.lock().unwrap().clear();

        hub.enqueue(synthetic(1, RawEventKind::DeviceRemoved, 40));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 40));
        reader.loop_once();

        let events = events.lock().unwrap();
        let key_up = events.iter().any(|e| {
            matches!(e, NotifyArgs::Key(args) if args.action == KeyAction::Up && args.key_code == 29)
        });
        assert!(key_up, "held key must be released on removal: {events:?}");
        assert!(events
            .iter()
            .any(|e| matches!(e, NotifyArgs::DeviceReset { device_id: 1, .. })));
        assert!(reader.input_device_ids().is_empty());
    }

    #[test]
    fn buffer_overrun_resets_device_and_drops_until_sync() {
        let (reader, hub, events) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();
        hub.enqueue(raw(1, RawEventKind::Key, 30, 1, 20));
        hub.enqueue(raw(1, RawEventKind::Sync, syn::REPORT, 0, 20));
        reader.loop_once();
        events.lock().unwrap().clear();

        // Overrun: the key is synthesized up, then events are dropped until
        // the next sync.
        hub.enqueue(raw(1, RawEventKind::Sync, syn::DROPPED, 0, 30));
        hub.enqueue(raw(1, RawEventKind::Key, 30, 1, 31)); // dropped
        hub.enqueue(raw(1, RawEventKind::Sync, syn::REPORT, 0, 32));
        reader.loop_once();

        let recorded = events.lock().unwrap().clone();
        let ups: Vec<_> = recorded
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Key(args) if args.action == KeyAction::Up => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(ups.len(), 1);
        assert!(recorded
            .iter()
            .any(|e| matches!(e, NotifyArgs::DeviceReset { device_id: 1, .. })));
        // The dropped down never produced a notification.
        assert!(!recorded
            .iter()
            .any(|e| matches!(e, NotifyArgs::Key(args) if args.action == KeyAction::Down && args.when == 31)));
    }

    #[test]
    fn refresh_configuration_wakes_the_hub() {
        let (reader, hub, _) = reader_with_keyboard();
        reader.request_refresh_configuration(ConfigChanges::DISPLAY_INFO);
        assert!(hub.was_woken());
        reader.loop_once();
    }

    #[test]
    fn has_keys_marks_supported_codes() {
        let (reader, hub, _) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();

        let mut flags = [0u8; 2];
        let supported = reader.has_keys(1, Source::KEYBOARD, &[29, keycodes::HOME], &mut flags);
        assert!(supported);
        assert_eq!(flags, [1, 0]);
    }

    #[test]
    fn state_queries_respect_source_masks() {
        let (reader, hub, _) = reader_with_keyboard();
        hub.enqueue(synthetic(1, RawEventKind::DeviceAdded, 10));
        hub.enqueue(synthetic(-1, RawEventKind::ScanComplete, 10));
        reader.loop_once();

        assert_eq!(
            reader.get_scan_code_state(1, Source::KEYBOARD, 30),
            KeyState::Up
        );
        // A joystick mask never matches the keyboard.
        assert_eq!(
            reader.get_scan_code_state(1, Source::JOYSTICK, 30),
            KeyState::Unknown
        );
    }
}
