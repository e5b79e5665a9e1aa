//! The event hub: device discovery, classification and multiplexed reads.
//!
//! The hub owns every open device node. A single caller (the reader thread)
//! pulls batches of [`RawEvent`]s out of [`RawEventSource::poll_once`];
//! device hotplug shows up in the same stream as synthetic
//! `DeviceAdded`/`DeviceRemoved`/`ScanComplete` events, so the consumer
//! observes a totally ordered view of devices and their events.
//!
//! The hub holds a wake lock at all times except across the blocking wait.
//! Drivers hold their own kernel wake lock while unread events remain, so
//! releasing the user-space lock only during the wait keeps the system from
//! suspending while events are being processed while still allowing suspend
//! when idle.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use rustix::event::epoll;
use rustix::fs::{inotify, Mode, OFlags};
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn};

use crate::codes::{ev, sw, KeyState, PolicyFlags};
use crate::env::EnvironmentConfig;
use crate::keymap::{AxisInfo, KeyLayout};
use crate::properties::PropertyMap;
use crate::utils::{Clock, Nanos};

pub mod device;
mod virtual_keys;

pub use self::device::{
    DeviceClasses, EvdevBitmask, HubDevice, InputDeviceIdentifier, RawAbsoluteAxisInfo,
    VirtualKeyDefinition,
};

/// Device id reserved for the built-in keyboard alias.
pub const BUILT_IN_KEYBOARD_ID: i32 = 0;

/// Events read per device in one go.
const READ_BATCH: usize = 256;

/// Errors at the kernel boundary. These never propagate past the hub's
/// public surface except from construction.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to create the multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("failed to watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create the wake pipe: {0}")]
    WakePipe(#[source] io::Error),
}

/// Kind of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Key,
    Rel,
    Abs,
    Switch,
    Sync,
    /// A device was opened; `device_id` identifies it.
    DeviceAdded,
    /// A device was closed and will receive no further events.
    DeviceRemoved,
    /// End of an add/remove batch.
    ScanComplete,
    /// An event type the reader does not interpret.
    Other(u16),
}

impl RawEventKind {
    fn from_type(ev_type: u16) -> Self {
        match ev_type {
            ev::SYN => RawEventKind::Sync,
            ev::KEY => RawEventKind::Key,
            ev::REL => RawEventKind::Rel,
            ev::ABS => RawEventKind::Abs,
            ev::SW => RawEventKind::Switch,
            other => RawEventKind::Other(other),
        }
    }

    /// True for the device lifecycle events the hub synthesizes itself.
    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            RawEventKind::DeviceAdded | RawEventKind::DeviceRemoved | RawEventKind::ScanComplete
        )
    }
}

/// One kernel-reported or synthetic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Monotonic nanoseconds.
    pub when: Nanos,
    pub device_id: i32,
    pub kind: RawEventKind,
    pub code: i32,
    pub value: i32,
    /// Policy flags from the key layout, for key events.
    pub flags: PolicyFlags,
}

impl RawEvent {
    fn synthetic(when: Nanos, device_id: i32, kind: RawEventKind) -> Self {
        RawEvent {
            when,
            device_id,
            kind,
            code: 0,
            value: 0,
            flags: PolicyFlags::empty(),
        }
    }
}

/// Supplies key layouts for newly opened devices.
pub trait KeyLayoutProvider: Send + Sync {
    fn load(
        &self,
        identifier: &InputDeviceIdentifier,
        configuration: &PropertyMap,
    ) -> Option<Arc<dyn KeyLayout>>;
}

/// The hub abstraction consumed by the reader. Implemented by [`EventHub`]
/// and by test fakes.
///
/// `poll_once` must only ever be called from one thread; every other method
/// may be called from any thread.
pub trait RawEventSource: Send + Sync {
    /// Fills `buffer` with up to `buffer.len()` raw events, blocking up to
    /// `timeout_ms` milliseconds (negative blocks indefinitely). Returns the
    /// number of events written; 0 means the wait timed out or was woken.
    fn poll_once(&self, timeout_ms: i32, buffer: &mut [RawEvent]) -> usize;

    /// Unblocks a pending `poll_once`. Idempotent.
    fn wake(&self);

    /// Requests that all devices be closed and reopened, then wakes the
    /// reader. Idempotent.
    fn request_reopen(&self);

    /// Devices with these names are dropped instead of opened.
    fn set_excluded_device_names(&self, names: &[String]);

    fn device_identifier(&self, device_id: i32) -> Option<InputDeviceIdentifier>;

    fn device_classes(&self, device_id: i32) -> DeviceClasses;

    fn device_configuration(&self, device_id: i32) -> PropertyMap;

    fn absolute_axis_info(&self, device_id: i32, axis: i32) -> RawAbsoluteAxisInfo;

    /// Current value of an absolute axis.
    fn absolute_axis_value(&self, device_id: i32, axis: i32) -> Option<i32>;

    fn has_relative_axis(&self, device_id: i32, axis: i32) -> bool;

    fn has_input_property(&self, device_id: i32, property: i32) -> bool;

    fn has_scan_code(&self, device_id: i32, scan_code: i32) -> bool;

    fn map_key(&self, device_id: i32, scan_code: i32) -> Option<(i32, PolicyFlags)>;

    fn map_axis(&self, device_id: i32, scan_code: i32) -> Option<AxisInfo>;

    fn scan_code_state(&self, device_id: i32, scan_code: i32) -> KeyState;

    fn key_code_state(&self, device_id: i32, key_code: i32) -> KeyState;

    fn switch_state(&self, device_id: i32, switch_code: i32) -> KeyState;

    /// Sets `out_flags[i]` to 1 for every `key_codes[i]` the device can
    /// produce. Returns false when the device has no key layout.
    fn mark_supported_key_codes(&self, device_id: i32, key_codes: &[i32], out_flags: &mut [u8])
        -> bool;

    fn has_led(&self, device_id: i32, led: i32) -> bool;

    fn set_led_state(&self, device_id: i32, led: i32, on: bool);

    fn virtual_key_definitions(&self, device_id: i32) -> Vec<VirtualKeyDefinition>;

    /// The device that owns a switch code: the first open device that
    /// reported it.
    fn switch_owner(&self, switch_code: i32) -> Option<i32>;

    fn dump(&self, out: &mut String);
}

/// Named wake lock held through sysfs. Acquire and release are best-effort;
/// systems without the control files simply run without one.
#[derive(Debug)]
struct WakeLock {
    name: String,
    lock_path: Option<PathBuf>,
    unlock_path: Option<PathBuf>,
}

impl WakeLock {
    fn new(env: &EnvironmentConfig) -> Self {
        WakeLock {
            name: env.wake_lock_name.clone(),
            lock_path: env.wake_lock_path.clone(),
            unlock_path: env.wake_unlock_path.clone(),
        }
    }

    fn write(path: &Option<PathBuf>, name: &str) {
        if let Some(path) = path {
            if let Err(err) = std::fs::write(path, name) {
                trace!(?path, "wake lock write failed: {err}");
            }
        }
    }

    fn acquire(&self) {
        Self::write(&self.lock_path, &self.name);
    }

    fn release(&self) {
        Self::write(&self.unlock_path, &self.name);
    }
}

enum Ready {
    Device(i32),
    Watch,
    Wake,
}

const EPOLL_DATA_WATCH: u64 = u64::MAX;
const EPOLL_DATA_WAKE: u64 = u64::MAX - 1;

struct HubState {
    devices: IndexMap<i32, HubDevice>,
    opened: bool,
    needs_reopen: bool,
    /// Ids with a pending DeviceAdded synthetic.
    opening: VecDeque<i32>,
    /// Devices pending a DeviceRemoved synthetic; fds close when dropped.
    closing: VecDeque<HubDevice>,
    need_finished_scan: bool,
    built_in_keyboard_id: i32,
    next_device_id: i32,
    switch_owners: [i32; sw::SW_CNT],
    excluded_devices: Vec<String>,
    ready: VecDeque<Ready>,
    awoken: bool,
}

impl HubState {
    /// Resolves the built-in keyboard alias to a real id.
    fn resolve_id(&self, device_id: i32) -> i32 {
        if device_id == BUILT_IN_KEYBOARD_ID {
            self.built_in_keyboard_id
        } else {
            device_id
        }
    }

    fn device(&self, device_id: i32) -> Option<&HubDevice> {
        self.devices.get(&self.resolve_id(device_id))
    }

    /// The id a device is published under: the alias for the built-in
    /// keyboard, its own id otherwise.
    fn published_id(&self, device_id: i32) -> i32 {
        if device_id == self.built_in_keyboard_id {
            BUILT_IN_KEYBOARD_ID
        } else {
            device_id
        }
    }
}

/// The real event hub over `/dev/input`-style character devices.
pub struct EventHub {
    env: EnvironmentConfig,
    layouts: Arc<dyn KeyLayoutProvider>,
    epoll: OwnedFd,
    watch: OwnedFd,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    wake_lock: WakeLock,
    num_cpus: usize,
    clock: Clock,
    state: Mutex<HubState>,
    span: tracing::Span,
}

impl EventHub {
    /// Creates the hub: multiplexer, directory watch, wake pipe. Devices are
    /// not opened until the first `poll_once`.
    pub fn new(
        env: EnvironmentConfig,
        layouts: Arc<dyn KeyLayoutProvider>,
    ) -> Result<Self, HubError> {
        let span = info_span!("event_hub");
        let _guard = span.enter();

        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)
            .map_err(|err| HubError::Multiplexer(err.into()))?;

        let watch = inotify::inotify_init(
            inotify::CreateFlags::NONBLOCK | inotify::CreateFlags::CLOEXEC,
        )
        .map_err(|err| HubError::Watch {
            path: env.device_dir.clone(),
            source: err.into(),
        })?;
        inotify::inotify_add_watch(
            &watch,
            &env.device_dir,
            inotify::WatchFlags::CREATE | inotify::WatchFlags::DELETE,
        )
        .map_err(|err| HubError::Watch {
            path: env.device_dir.clone(),
            source: err.into(),
        })?;

        let (wake_read, wake_write) =
            rustix::pipe::pipe_with(rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC)
                .map_err(|err| HubError::WakePipe(err.into()))?;

        epoll::add(
            &epoll,
            &watch,
            epoll::EventData::new_u64(EPOLL_DATA_WATCH),
            epoll::EventFlags::IN,
        )
        .map_err(|err| HubError::Multiplexer(err.into()))?;
        epoll::add(
            &epoll,
            &wake_read,
            epoll::EventData::new_u64(EPOLL_DATA_WAKE),
            epoll::EventFlags::IN,
        )
        .map_err(|err| HubError::Multiplexer(err.into()))?;

        let wake_lock = WakeLock::new(&env);
        wake_lock.acquire();

        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as usize;

        info!(device_dir = ?env.device_dir, num_cpus, "event hub initialized");
        drop(_guard);

        Ok(EventHub {
            env,
            layouts,
            epoll,
            watch,
            wake_read,
            wake_write,
            wake_lock,
            num_cpus,
            clock: Clock::new(),
            state: Mutex::new(HubState {
                devices: IndexMap::new(),
                opened: false,
                needs_reopen: false,
                opening: VecDeque::new(),
                closing: VecDeque::new(),
                need_finished_scan: false,
                built_in_keyboard_id: -1,
                next_device_id: 1,
                switch_owners: [-1; sw::SW_CNT],
                excluded_devices: Vec::new(),
                ready: VecDeque::new(),
                awoken: false,
            }),
            span,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scan_devices(&self, state: &mut HubState) {
        let entries = match std::fs::read_dir(&self.env.device_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = ?self.env.device_dir, "device directory scan failed: {err}");
                return;
            }
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            self.open_device(state, &entry.path());
        }
    }

    fn open_device(&self, state: &mut HubState, path: &Path) {
        let _guard = self.span.enter();

        let fd = match rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            // Read-only is enough for everything except LED output.
            Err(_) => match rustix::fs::open(
                path,
                OFlags::RDONLY | OFlags::NONBLOCK | OFlags::CLOEXEC,
                Mode::empty(),
            ) {
                Ok(fd) => fd,
                Err(err) => {
                    warn!(?path, "could not open device node: {err}");
                    return;
                }
            },
        };

        let mut identifier = InputDeviceIdentifier {
            name: device::get_device_name(&fd).unwrap_or_default(),
            ..Default::default()
        };

        if state.excluded_devices.iter().any(|n| *n == identifier.name) {
            info!(?path, name = %identifier.name, "ignoring excluded device");
            return;
        }

        let input_id = match device::get_input_id(&fd) {
            Ok(id) => id,
            Err(err) => {
                warn!(?path, "could not get device input id: {err}");
                return;
            }
        };
        identifier.bus = input_id.bustype;
        identifier.vendor = input_id.vendor;
        identifier.product = input_id.product;
        identifier.version = input_id.version;
        identifier.location = device::get_physical_location(&fd).unwrap_or_default();
        identifier.unique_id = device::get_unique_id(&fd).unwrap_or_default();

        if let Ok(version) = device::get_driver_version(&fd) {
            trace!(?path, version, "driver version");
        }

        let (configuration, configuration_file) =
            device::load_configuration(&self.env.config_dir, &identifier);

        let device_id = state.next_device_id;
        let mut hub_device = HubDevice {
            fd,
            id: device_id,
            path: path.to_owned(),
            identifier,
            classes: DeviceClasses::empty(),
            key_bitmask: EvdevBitmask::default(),
            abs_bitmask: EvdevBitmask::default(),
            rel_bitmask: EvdevBitmask::default(),
            sw_bitmask: EvdevBitmask::default(),
            led_bitmask: EvdevBitmask::default(),
            prop_bitmask: EvdevBitmask::default(),
            configuration,
            configuration_file,
            virtual_keys: Vec::new(),
            key_layout: None,
        };

        if let Err(err) = device::probe_capabilities(&mut hub_device) {
            warn!(?path, "could not probe device capabilities: {err}");
            return;
        }

        device::classify_capabilities(&mut hub_device);

        // Record switch ownership: the first device reporting a switch code
        // owns it.
        for code in 0..sw::SW_CNT {
            if hub_device.sw_bitmask.has(code as i32) && state.switch_owners[code] < 0 {
                state.switch_owners[code] = device_id;
            }
        }

        // Load the virtual keys for touch devices. A device with virtual
        // keys also acts as a keyboard.
        if hub_device.classes.contains(DeviceClasses::TOUCH) {
            hub_device.virtual_keys =
                virtual_keys::load(&self.env.virtual_key_dir, &hub_device.identifier.name);
            if !hub_device.virtual_keys.is_empty() {
                hub_device.classes |= DeviceClasses::KEYBOARD;
            }
        }

        // Joysticks need the layout too because it may assign axes.
        if hub_device
            .classes
            .intersects(DeviceClasses::KEYBOARD | DeviceClasses::JOYSTICK)
        {
            hub_device.key_layout = self
                .layouts
                .load(&hub_device.identifier, &hub_device.configuration);
            device::classify_keyboard(&mut hub_device);
        }

        if hub_device.classes.is_empty() {
            debug!(?path, name = %hub_device.identifier.name, "dropping device with no capability classes");
            return;
        }

        if hub_device.is_external() {
            hub_device.classes |= DeviceClasses::EXTERNAL;
        }

        // First eligible internal full keyboard becomes the built-in
        // keyboard alias.
        if state.built_in_keyboard_id < 0
            && hub_device.classes.contains(DeviceClasses::ALPHA_KEY)
            && !hub_device.classes.contains(DeviceClasses::EXTERNAL)
            && hub_device.key_layout.is_some()
        {
            state.built_in_keyboard_id = device_id;
        }

        if let Err(err) = epoll::add(
            &self.epoll,
            &hub_device.fd,
            epoll::EventData::new_u64(device_id as u64),
            epoll::EventFlags::IN,
        ) {
            warn!(?path, "could not register device with the multiplexer: {err}");
            return;
        }

        info!(
            id = device_id,
            ?path,
            name = %hub_device.identifier.name,
            classes = ?hub_device.classes,
            builtin_keyboard = state.built_in_keyboard_id == device_id,
            "new device"
        );

        state.next_device_id += 1;
        state.devices.insert(device_id, hub_device);
        state.opening.push_back(device_id);
    }

    fn close_device_by_path(&self, state: &mut HubState, path: &Path) {
        let id = state
            .devices
            .values()
            .find(|device| device.path == path)
            .map(|device| device.id);
        match id {
            Some(id) => self.close_device(state, id),
            None => trace!(?path, "remove for a device that was never opened"),
        }
    }

    fn close_device(&self, state: &mut HubState, device_id: i32) {
        let Some(device) = state.devices.shift_remove(&device_id) else {
            return;
        };
        let _guard = self.span.enter();
        info!(
            id = device_id,
            path = ?device.path,
            name = %device.identifier.name,
            classes = ?device.classes,
            "removed device"
        );

        for owner in state.switch_owners.iter_mut() {
            if *owner == device_id {
                *owner = -1;
            }
        }
        if state.built_in_keyboard_id == device_id {
            warn!(id = device_id, "built-in keyboard is closing");
            state.built_in_keyboard_id = -1;
        }

        let _ = epoll::delete(&self.epoll, &device.fd);

        // If the add was never reported, the consumer does not need to hear
        // about the removal either.
        if let Some(pos) = state.opening.iter().position(|&id| id == device_id) {
            state.opening.remove(pos);
            debug!(id = device_id, "device closed immediately after opening");
            return;
        }
        state.closing.push_back(device);
    }

    /// Reads pending directory-watch records and opens/closes devices.
    fn read_watch(&self, state: &mut HubState) {
        let mut buffer = [0u8; 1024];
        loop {
            let len = match rustix::io::read(&self.watch, &mut buffer) {
                Ok(0) => return,
                Ok(len) => len,
                Err(rustix::io::Errno::AGAIN) => return,
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => {
                    warn!("could not read directory watch: {err}");
                    return;
                }
            };
            let mut offset = 0;
            const HEADER: usize = std::mem::size_of::<libc::inotify_event>();
            while offset + HEADER <= len {
                let event = unsafe {
                    &*(buffer[offset..].as_ptr() as *const libc::inotify_event)
                };
                let name_len = event.len as usize;
                let name_bytes = &buffer[offset + HEADER..offset + HEADER + name_len];
                let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_len);
                let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
                if !name.is_empty() {
                    let path = self.env.device_dir.join(&name);
                    if event.mask & libc::IN_CREATE != 0 {
                        self.open_device(state, &path);
                    } else {
                        self.close_device_by_path(state, &path);
                    }
                }
                offset += HEADER + name_len;
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buffer = [0u8; 16];
        while matches!(rustix::io::read(&self.wake_read, &mut buffer), Ok(n) if n > 0) {}
    }

    /// Reads raw events from one device into `buffer`. Returns the number
    /// written and whether the device vanished.
    fn read_device_events(
        &self,
        state: &mut HubState,
        device_id: i32,
        buffer: &mut [RawEvent],
    ) -> (usize, bool) {
        let Some(device) = state.devices.get(&device_id) else {
            return (0, false);
        };
        let published_id = state.published_id(device_id);

        const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();
        let mut read_buffer: [libc::input_event; READ_BATCH] = unsafe { std::mem::zeroed() };
        let capacity = buffer.len().min(READ_BATCH);
        let read_size = unsafe {
            libc::read(
                device.fd.as_raw_fd(),
                read_buffer.as_mut_ptr() as *mut libc::c_void,
                EVENT_SIZE * capacity,
            )
        };

        if read_size < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENODEV) => return (0, true),
                Some(libc::EAGAIN) | Some(libc::EINTR) => return (0, false),
                _ => {
                    warn!(id = device_id, "could not read events: {err}");
                    return (0, false);
                }
            }
        }
        if read_size == 0 {
            // End of file also means the device is gone.
            return (0, true);
        }
        let read_size = read_size as usize;
        if read_size % EVENT_SIZE != 0 {
            warn!(
                id = device_id,
                read_size, "discarding malformed read, size not a multiple of the event record"
            );
            return (0, false);
        }

        let layout = device.key_layout.clone();
        let count = read_size / EVENT_SIZE;
        for (slot, iev) in buffer.iter_mut().zip(read_buffer[..count].iter()) {
            // Use the timestamp from the event itself; the kernel stamps it
            // with the same monotonic clock the rest of the stack uses.
            let when = iev.time.tv_sec as i64 * 1_000_000_000 + iev.time.tv_usec as i64 * 1_000;
            let mut flags = PolicyFlags::empty();
            if iev.type_ == ev::KEY {
                if let Some(layout) = &layout {
                    if let Some((_, layout_flags)) = layout.map_key(iev.code as i32) {
                        flags = layout_flags;
                    }
                }
            }
            *slot = RawEvent {
                when,
                device_id: published_id,
                kind: RawEventKind::from_type(iev.type_),
                code: iev.code as i32,
                value: iev.value,
                flags,
            };
        }
        (count, false)
    }

    fn emit_synthetics(&self, state: &mut HubState, buffer: &mut [RawEvent], count: &mut usize) {
        let now = self.clock.now();
        while *count < buffer.len() {
            let Some(device) = state.closing.pop_front() else {
                break;
            };
            trace!(id = device.id, "reporting device closed");
            let id = state.published_id(device.id);
            buffer[*count] = RawEvent::synthetic(now, id, RawEventKind::DeviceRemoved);
            *count += 1;
            state.need_finished_scan = true;
        }
        while *count < buffer.len() {
            let Some(device_id) = state.opening.pop_front() else {
                break;
            };
            trace!(id = device_id, "reporting device opened");
            let id = state.published_id(device_id);
            buffer[*count] = RawEvent::synthetic(now, id, RawEventKind::DeviceAdded);
            *count += 1;
            state.need_finished_scan = true;
        }
        if state.need_finished_scan
            && state.closing.is_empty()
            && state.opening.is_empty()
            && *count < buffer.len()
        {
            state.need_finished_scan = false;
            buffer[*count] = RawEvent::synthetic(now, -1, RawEventKind::ScanComplete);
            *count += 1;
        }
    }
}

impl RawEventSource for EventHub {
    fn poll_once(&self, timeout_ms: i32, buffer: &mut [RawEvent]) -> usize {
        debug_assert!(!buffer.is_empty());
        let mut state = self.lock();

        if !state.opened {
            self.scan_devices(&mut state);
            state.opened = true;
            state.need_finished_scan = true;
        }

        let mut count = 0;
        loop {
            if state.needs_reopen {
                state.needs_reopen = false;
                let ids: Vec<i32> = state.devices.keys().copied().collect();
                for id in ids {
                    self.close_device(&mut state, id);
                }
                self.scan_devices(&mut state);
            }

            self.emit_synthetics(&mut state, buffer, &mut count);
            if count == buffer.len() {
                break;
            }

            let mut devices_changed = false;
            while let Some(ready) = state.ready.pop_front() {
                match ready {
                    Ready::Device(device_id) => {
                        let (read, removed) =
                            self.read_device_events(&mut state, device_id, &mut buffer[count..]);
                        count += read;
                        if removed {
                            self.close_device(&mut state, device_id);
                            devices_changed = true;
                            break;
                        }
                        if count == buffer.len() {
                            break;
                        }
                    }
                    Ready::Watch => {
                        self.read_watch(&mut state);
                        devices_changed = true;
                        break;
                    }
                    Ready::Wake => {
                        trace!("awoken");
                        self.drain_wake_pipe();
                        state.awoken = true;
                    }
                }
            }
            if devices_changed {
                continue; // report added or removed devices immediately
            }

            if count != 0 || state.awoken {
                state.awoken = false;
                break;
            }

            // Blocking wait; mind the wake lock handoff.
            drop(state);
            self.wake_lock.release();
            let mut events = epoll::EventVec::with_capacity(32);
            let result = epoll::wait(&self.epoll, &mut events, timeout_ms);
            self.wake_lock.acquire();
            state = self.lock();

            match result {
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => {
                    // Sleep after errors to avoid spinning; hopefully the
                    // error is transient.
                    warn!("wait failed: {err}");
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                Ok(()) => {
                    if events.iter().next().is_none() {
                        break; // timed out
                    }
                    // On SMP it is possible to wake before the driver has
                    // finished writing a multi-event packet; a short settle
                    // lets one read pick up the whole packet.
                    if self.num_cpus > 1 {
                        std::thread::sleep(Duration::from_micros(250));
                    }
                    for event in events.iter() {
                        let ready = match event.data.u64() {
                            EPOLL_DATA_WATCH => Ready::Watch,
                            EPOLL_DATA_WAKE => Ready::Wake,
                            id => Ready::Device(id as i32),
                        };
                        state.ready.push_back(ready);
                    }
                }
            }
        }
        count
    }

    fn wake(&self) {
        let _ = rustix::io::write(&self.wake_write, &[1u8]);
    }

    fn request_reopen(&self) {
        self.lock().needs_reopen = true;
        self.wake();
    }

    fn set_excluded_device_names(&self, names: &[String]) {
        self.lock().excluded_devices = names.to_vec();
    }

    fn device_identifier(&self, device_id: i32) -> Option<InputDeviceIdentifier> {
        let state = self.lock();
        state.device(device_id).map(|device| device.identifier.clone())
    }

    fn device_classes(&self, device_id: i32) -> DeviceClasses {
        let state = self.lock();
        state
            .device(device_id)
            .map(|device| device.classes)
            .unwrap_or_default()
    }

    fn device_configuration(&self, device_id: i32) -> PropertyMap {
        let state = self.lock();
        state
            .device(device_id)
            .map(|device| device.configuration.clone())
            .unwrap_or_default()
    }

    fn absolute_axis_info(&self, device_id: i32, axis: i32) -> RawAbsoluteAxisInfo {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return RawAbsoluteAxisInfo::default();
        };
        if !device.abs_bitmask.has(axis) {
            return RawAbsoluteAxisInfo::default();
        }
        match device::get_absolute_axis_info(&device.fd, axis) {
            Ok((info, _)) => info,
            Err(err) => {
                warn!(id = device_id, axis, "error reading absolute axis info: {err}");
                RawAbsoluteAxisInfo::default()
            }
        }
    }

    fn absolute_axis_value(&self, device_id: i32, axis: i32) -> Option<i32> {
        let state = self.lock();
        let device = state.device(device_id)?;
        device::get_absolute_axis_info(&device.fd, axis)
            .ok()
            .map(|(_, value)| value)
    }

    fn has_relative_axis(&self, device_id: i32, axis: i32) -> bool {
        let state = self.lock();
        state
            .device(device_id)
            .map_or(false, |device| device.rel_bitmask.has(axis))
    }

    fn has_input_property(&self, device_id: i32, property: i32) -> bool {
        let state = self.lock();
        state
            .device(device_id)
            .map_or(false, |device| device.prop_bitmask.has(property))
    }

    fn has_scan_code(&self, device_id: i32, scan_code: i32) -> bool {
        let state = self.lock();
        state
            .device(device_id)
            .map_or(false, |device| device.key_bitmask.has(scan_code))
    }

    fn map_key(&self, device_id: i32, scan_code: i32) -> Option<(i32, PolicyFlags)> {
        let state = self.lock();
        if let Some(mapped) = state
            .device(device_id)
            .and_then(|device| device.key_layout.as_ref())
            .and_then(|layout| layout.map_key(scan_code))
        {
            return Some(mapped);
        }
        // Fall back to the built-in keyboard layout, so bare scan codes from
        // auxiliary devices still resolve.
        if state.built_in_keyboard_id >= 0 && state.resolve_id(device_id) != state.built_in_keyboard_id
        {
            return state
                .devices
                .get(&state.built_in_keyboard_id)
                .and_then(|device| device.key_layout.as_ref())
                .and_then(|layout| layout.map_key(scan_code));
        }
        None
    }

    fn map_axis(&self, device_id: i32, scan_code: i32) -> Option<AxisInfo> {
        let state = self.lock();
        state
            .device(device_id)
            .and_then(|device| device.key_layout.as_ref())
            .and_then(|layout| layout.map_axis(scan_code))
    }

    fn scan_code_state(&self, device_id: i32, scan_code: i32) -> KeyState {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return KeyState::Unknown;
        };
        match device::get_key_state_bits(&device.fd) {
            Ok(bits) => {
                if bits.has(scan_code) {
                    KeyState::Down
                } else {
                    KeyState::Up
                }
            }
            Err(_) => KeyState::Unknown,
        }
    }

    fn key_code_state(&self, device_id: i32, key_code: i32) -> KeyState {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return KeyState::Unknown;
        };
        let Some(layout) = &device.key_layout else {
            return KeyState::Unknown;
        };
        let scan_codes = layout.scan_codes_for_key(key_code);
        match device::get_key_state_bits(&device.fd) {
            Ok(bits) => {
                if scan_codes.iter().any(|&scan_code| bits.has(scan_code)) {
                    KeyState::Down
                } else {
                    KeyState::Up
                }
            }
            Err(_) => KeyState::Unknown,
        }
    }

    fn switch_state(&self, device_id: i32, switch_code: i32) -> KeyState {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return KeyState::Unknown;
        };
        match device::get_switch_state_bits(&device.fd) {
            Ok(bits) => {
                if bits.has(switch_code) {
                    KeyState::Down
                } else {
                    KeyState::Up
                }
            }
            Err(_) => KeyState::Unknown,
        }
    }

    fn mark_supported_key_codes(
        &self,
        device_id: i32,
        key_codes: &[i32],
        out_flags: &mut [u8],
    ) -> bool {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return false;
        };
        let Some(layout) = &device.key_layout else {
            return false;
        };
        for (index, &key_code) in key_codes.iter().enumerate() {
            // Check the scan codes the layout names against the codes the
            // driver actually emits.
            if layout
                .scan_codes_for_key(key_code)
                .iter()
                .any(|&scan_code| device.key_bitmask.has(scan_code))
            {
                out_flags[index] = 1;
            }
        }
        true
    }

    fn has_led(&self, device_id: i32, led: i32) -> bool {
        let state = self.lock();
        state
            .device(device_id)
            .map_or(false, |device| device.led_bitmask.has(led))
    }

    fn set_led_state(&self, device_id: i32, led: i32, on: bool) {
        let state = self.lock();
        let Some(device) = state.device(device_id) else {
            return;
        };
        let event = libc::input_event {
            time: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            type_: ev::LED,
            code: led as u16,
            value: i32::from(on),
        };
        let result = unsafe {
            libc::write(
                device.fd.as_raw_fd(),
                &event as *const libc::input_event as *const libc::c_void,
                std::mem::size_of::<libc::input_event>(),
            )
        };
        if result < 0 {
            debug!(id = device_id, led, "could not write led state");
        }
    }

    fn virtual_key_definitions(&self, device_id: i32) -> Vec<VirtualKeyDefinition> {
        let state = self.lock();
        state
            .device(device_id)
            .map(|device| device.virtual_keys.clone())
            .unwrap_or_default()
    }

    fn switch_owner(&self, switch_code: i32) -> Option<i32> {
        if !(0..sw::SW_CNT as i32).contains(&switch_code) {
            return None;
        }
        let state = self.lock();
        let owner = state.switch_owners[switch_code as usize];
        (owner >= 0).then(|| state.published_id(owner))
    }

    fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let state = self.lock();
        let _ = writeln!(out, "Event Hub State:");
        let _ = writeln!(out, "  BuiltInKeyboardId: {}", state.built_in_keyboard_id);
        let _ = writeln!(out, "  Devices:");
        for device in state.devices.values() {
            let _ = writeln!(out, "    {}: {}", device.id, device.identifier.name);
            let _ = writeln!(out, "      Classes: {:?}", device.classes);
            let _ = writeln!(out, "      Path: {:?}", device.path);
            let _ = writeln!(out, "      Location: {}", device.identifier.location);
            let _ = writeln!(out, "      UniqueId: {}", device.identifier.unique_id);
            let _ = writeln!(
                out,
                "      Identifier: bus=0x{:04x}, vendor=0x{:04x}, product=0x{:04x}, version=0x{:04x}",
                device.identifier.bus,
                device.identifier.vendor,
                device.identifier.product,
                device.identifier.version
            );
            let _ = writeln!(out, "      ConfigurationFile: {:?}", device.configuration_file);
            let _ = writeln!(out, "      VirtualKeys: {}", device.virtual_keys.len());
        }
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        self.wake_lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_kind_mapping() {
        assert_eq!(RawEventKind::from_type(ev::KEY), RawEventKind::Key);
        assert_eq!(RawEventKind::from_type(ev::SYN), RawEventKind::Sync);
        assert_eq!(RawEventKind::from_type(ev::SW), RawEventKind::Switch);
        assert_eq!(RawEventKind::from_type(0x04), RawEventKind::Other(0x04));
        assert!(!RawEventKind::Key.is_synthetic());
        assert!(RawEventKind::ScanComplete.is_synthetic());
    }
}
