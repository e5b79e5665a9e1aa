//! Hub-side device records: opening, capability probing, classification.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::codes::{abs, bus, input_prop, key, keycodes, led, rel, sw};
use crate::keymap::KeyLayout;
use crate::properties::PropertyMap;

/// Identity of a kernel input device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDeviceIdentifier {
    pub name: String,
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub location: String,
    pub unique_id: String,
}

bitflags! {
    /// Capability classes assigned to a device when it is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceClasses: u32 {
        /// The device has keys or buttons.
        const KEYBOARD = 1 << 0;
        /// The keyboard is alphabetic.
        const ALPHA_KEY = 1 << 1;
        /// The device is a touchscreen or touchpad.
        const TOUCH = 1 << 2;
        /// The device is a cursor device such as a trackball or mouse.
        const CURSOR = 1 << 3;
        /// The device reports distinct multi-touch pointers.
        const TOUCH_MT = 1 << 4;
        /// The device has a directional pad.
        const DPAD = 1 << 5;
        /// The device has gamepad buttons.
        const GAMEPAD = 1 << 6;
        /// The device has switches.
        const SWITCH = 1 << 7;
        /// The device has joystick absolute axes.
        const JOYSTICK = 1 << 8;
        /// The device is attached over an external bus.
        const EXTERNAL = 1 << 16;
    }
}

/// A bitmask of event codes as reported by `EVIOCGBIT` and friends.
#[derive(Clone, Default)]
pub struct EvdevBitmask {
    bits: Vec<u8>,
}

impl EvdevBitmask {
    pub fn with_code_count(count: usize) -> Self {
        EvdevBitmask {
            bits: vec![0; (count + 7) / 8],
        }
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bits
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Whether `code` is set. Out-of-range codes are unset.
    pub fn has(&self, code: i32) -> bool {
        if code < 0 {
            return false;
        }
        let code = code as usize;
        self.bits
            .get(code / 8)
            .map_or(false, |byte| byte & (1 << (code % 8)) != 0)
    }

    /// Whether any bit is set in the byte range covering `[start, end)`
    /// codes, the coarse test used by device classification.
    pub fn any_in_code_range(&self, start_code: i32, end_code: i32) -> bool {
        let start = (start_code as usize) / 8;
        let end = ((end_code as usize + 7) / 8).min(self.bits.len());
        self.bits[start.min(self.bits.len())..end]
            .iter()
            .any(|&byte| byte != 0)
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|&byte| byte != 0)
    }
}

impl fmt::Debug for EvdevBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvdevBitmask(")?;
        for byte in self.bits.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Range and tolerance of a raw absolute axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawAbsoluteAxisInfo {
    /// When false the other fields are zero and the axis is absent.
    pub valid: bool,
    pub min: i32,
    pub max: i32,
    pub flat: i32,
    pub fuzz: i32,
    pub resolution: i32,
}

impl RawAbsoluteAxisInfo {
    pub fn clear(&mut self) {
        *self = RawAbsoluteAxisInfo::default();
    }

    /// Number of raw units across the range, inclusive.
    pub fn range_span(&self) -> i32 {
        self.max - self.min + 1
    }
}

/// One virtual key hit box as read from the definition file, in display
/// pixels at the device's natural orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualKeyDefinition {
    pub scan_code: i32,
    pub center_x: i32,
    pub center_y: i32,
    pub width: i32,
    pub height: i32,
}

/// An open device node owned by the hub.
pub struct HubDevice {
    pub fd: OwnedFd,
    pub id: i32,
    pub path: PathBuf,
    pub identifier: InputDeviceIdentifier,
    pub classes: DeviceClasses,
    pub key_bitmask: EvdevBitmask,
    pub abs_bitmask: EvdevBitmask,
    pub rel_bitmask: EvdevBitmask,
    pub sw_bitmask: EvdevBitmask,
    pub led_bitmask: EvdevBitmask,
    pub prop_bitmask: EvdevBitmask,
    pub configuration: PropertyMap,
    pub configuration_file: Option<PathBuf>,
    pub virtual_keys: Vec<VirtualKeyDefinition>,
    pub key_layout: Option<Arc<dyn KeyLayout>>,
}

impl fmt::Debug for HubDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubDevice")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("name", &self.identifier.name)
            .field("classes", &self.classes)
            .finish_non_exhaustive()
    }
}

impl HubDevice {
    /// Whether the layout maps `key_code` to a scan code the device emits.
    pub fn has_key_code(&self, key_code: i32) -> bool {
        let Some(layout) = &self.key_layout else {
            return false;
        };
        layout
            .scan_codes_for_key(key_code)
            .iter()
            .any(|&scan_code| self.key_bitmask.has(scan_code))
    }

    pub fn is_external(&self) -> bool {
        if let Some(internal) = self.configuration.get_bool("device.internal") {
            return !internal;
        }
        self.identifier.bus == bus::USB || self.identifier.bus == bus::BLUETOOTH
    }
}

// Keys any of which make a device a gamepad.
const GAMEPAD_KEYCODES: [i32; 30] = [
    keycodes::BUTTON_A,
    keycodes::BUTTON_B,
    keycodes::BUTTON_C,
    keycodes::BUTTON_X,
    keycodes::BUTTON_Y,
    keycodes::BUTTON_Z,
    keycodes::BUTTON_L1,
    keycodes::BUTTON_R1,
    keycodes::BUTTON_L2,
    keycodes::BUTTON_R2,
    keycodes::BUTTON_THUMBL,
    keycodes::BUTTON_THUMBR,
    keycodes::BUTTON_START,
    keycodes::BUTTON_SELECT,
    keycodes::BUTTON_MODE,
    keycodes::BUTTON_1,
    keycodes::BUTTON_2,
    keycodes::BUTTON_3,
    keycodes::BUTTON_4,
    keycodes::BUTTON_5,
    keycodes::BUTTON_6,
    keycodes::BUTTON_7,
    keycodes::BUTTON_8,
    keycodes::BUTTON_9,
    keycodes::BUTTON_10,
    keycodes::BUTTON_11,
    keycodes::BUTTON_12,
    keycodes::BUTTON_13,
    keycodes::BUTTON_14,
    keycodes::BUTTON_15,
];

/// Derives the capability-independent classes from the probed bitmasks.
///
/// Classes that depend on the key layout (alpha, dpad, gamepad) are added by
/// the caller once the layout is loaded.
pub fn classify_capabilities(device: &mut HubDevice) {
    // Keys or buttons. Everything in the button range is ignored except
    // gamepad and joystick buttons, which behave like keyboards.
    let have_keyboard_keys = device.key_bitmask.any_in_code_range(0, key::BTN_MISC)
        || device
            .key_bitmask
            .any_in_code_range(key::KEY_OK, key::KEY_MAX + 1);
    let have_gamepad_buttons = device
        .key_bitmask
        .any_in_code_range(key::BTN_MISC, key::BTN_MOUSE)
        || device
            .key_bitmask
            .any_in_code_range(key::BTN_JOYSTICK, key::BTN_DIGI);
    if have_keyboard_keys || have_gamepad_buttons {
        device.classes |= DeviceClasses::KEYBOARD;
    }

    // Cursor devices such as trackballs and mice.
    if device.key_bitmask.has(key::BTN_MOUSE)
        && device.rel_bitmask.has(rel::X)
        && device.rel_bitmask.has(rel::Y)
    {
        device.classes |= DeviceClasses::CURSOR;
    }

    // Touch devices. Some controllers report axes that collide with the MT
    // range, so a multi-touch device must also report BTN_TOUCH or have no
    // gamepad buttons at all.
    if device.abs_bitmask.has(abs::MT_POSITION_X) && device.abs_bitmask.has(abs::MT_POSITION_Y) {
        if device.key_bitmask.has(key::BTN_TOUCH) || !have_gamepad_buttons {
            device.classes |= DeviceClasses::TOUCH | DeviceClasses::TOUCH_MT;
        }
    } else if device.key_bitmask.has(key::BTN_TOUCH)
        && device.abs_bitmask.has(abs::X)
        && device.abs_bitmask.has(abs::Y)
    {
        device.classes |= DeviceClasses::TOUCH;
    }

    // Joysticks always have gamepad buttons; this keeps accelerometers and
    // other sensors with absolute axes out.
    if have_gamepad_buttons
        && !device.classes.contains(DeviceClasses::TOUCH)
        && device.abs_bitmask.any_in_code_range(0, abs::ABS_MAX + 1)
    {
        device.classes |= DeviceClasses::JOYSTICK;
    }

    if device.sw_bitmask.any() {
        device.classes |= DeviceClasses::SWITCH;
    }
}

/// Adds the classes that require the key layout to be loaded.
pub fn classify_keyboard(device: &mut HubDevice) {
    if !device.classes.contains(DeviceClasses::KEYBOARD) {
        return;
    }

    // 'Q' support is a cheap test of whether this is an alpha-capable
    // keyboard.
    if device.has_key_code(keycodes::Q) {
        device.classes |= DeviceClasses::ALPHA_KEY;
    }

    if device.has_key_code(keycodes::DPAD_UP)
        && device.has_key_code(keycodes::DPAD_DOWN)
        && device.has_key_code(keycodes::DPAD_LEFT)
        && device.has_key_code(keycodes::DPAD_RIGHT)
    {
        device.classes |= DeviceClasses::DPAD;
    }

    if GAMEPAD_KEYCODES
        .iter()
        .any(|&key_code| device.has_key_code(key_code))
    {
        device.classes |= DeviceClasses::GAMEPAD;
    }
}

// --- evdev ioctls ---
//
// The ioctl shims below are the only unsafe code in the crate. Each one
// hands the kernel a fixed-size out-buffer and checks the return value.

const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr
}

fn ioctl_read_buf(fd: &OwnedFd, nr: u64, buf: &mut [u8]) -> io::Result<usize> {
    let request = ioc(IOC_READ, b'E', nr, buf.len());
    let res = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            request as libc::c_ulong,
            buf.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

fn ioctl_string(fd: &OwnedFd, nr: u64) -> io::Result<String> {
    let mut buf = [0u8; 256];
    let len = ioctl_read_buf(fd, nr, &mut buf)?;
    let end = buf[..len.min(buf.len())]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(len.min(buf.len()));
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

pub fn get_device_name(fd: &OwnedFd) -> io::Result<String> {
    ioctl_string(fd, 0x06)
}

pub fn get_physical_location(fd: &OwnedFd) -> io::Result<String> {
    ioctl_string(fd, 0x07)
}

pub fn get_unique_id(fd: &OwnedFd) -> io::Result<String> {
    ioctl_string(fd, 0x08)
}

pub fn get_driver_version(fd: &OwnedFd) -> io::Result<i32> {
    let mut version: i32 = 0;
    let request = ioc(IOC_READ, b'E', 0x01, std::mem::size_of::<i32>());
    let res = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            request as libc::c_ulong,
            &mut version as *mut i32 as *mut libc::c_void,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(version)
    }
}

pub fn get_input_id(fd: &OwnedFd) -> io::Result<libc::input_id> {
    let mut id = libc::input_id {
        bustype: 0,
        vendor: 0,
        product: 0,
        version: 0,
    };
    let request = ioc(IOC_READ, b'E', 0x02, std::mem::size_of::<libc::input_id>());
    let res = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            request as libc::c_ulong,
            &mut id as *mut libc::input_id as *mut libc::c_void,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

/// Event-code bitmap for one event type (`EVIOCGBIT`).
pub fn get_event_bits(fd: &OwnedFd, ev_type: u16, code_count: usize) -> io::Result<EvdevBitmask> {
    let mut mask = EvdevBitmask::with_code_count(code_count);
    ioctl_read_buf(fd, 0x20 + ev_type as u64, mask.as_mut_bytes())?;
    Ok(mask)
}

/// Device property bitmap (`EVIOCGPROP`).
pub fn get_property_bits(fd: &OwnedFd) -> io::Result<EvdevBitmask> {
    let mut mask = EvdevBitmask::with_code_count(input_prop::INPUT_PROP_CNT);
    ioctl_read_buf(fd, 0x09, mask.as_mut_bytes())?;
    Ok(mask)
}

/// Current key state bitmap (`EVIOCGKEY`).
pub fn get_key_state_bits(fd: &OwnedFd) -> io::Result<EvdevBitmask> {
    let mut mask = EvdevBitmask::with_code_count(key::KEY_CNT);
    ioctl_read_buf(fd, 0x18, mask.as_mut_bytes())?;
    Ok(mask)
}

/// Current switch state bitmap (`EVIOCGSW`).
pub fn get_switch_state_bits(fd: &OwnedFd) -> io::Result<EvdevBitmask> {
    let mut mask = EvdevBitmask::with_code_count(sw::SW_CNT);
    ioctl_read_buf(fd, 0x1b, mask.as_mut_bytes())?;
    Ok(mask)
}

/// Range of one absolute axis (`EVIOCGABS`).
pub fn get_absolute_axis_info(fd: &OwnedFd, axis: i32) -> io::Result<(RawAbsoluteAxisInfo, i32)> {
    let mut info = libc::input_absinfo {
        value: 0,
        minimum: 0,
        maximum: 0,
        fuzz: 0,
        flat: 0,
        resolution: 0,
    };
    let request = ioc(
        IOC_READ,
        b'E',
        0x40 + axis as u64,
        std::mem::size_of::<libc::input_absinfo>(),
    );
    let res = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            request as libc::c_ulong,
            &mut info as *mut libc::input_absinfo as *mut libc::c_void,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out = RawAbsoluteAxisInfo::default();
    if info.minimum != info.maximum {
        out.valid = true;
        out.min = info.minimum;
        out.max = info.maximum;
        out.flat = info.flat;
        out.fuzz = info.fuzz;
        out.resolution = info.resolution as i32;
    }
    Ok((out, info.value))
}

/// Probes every capability bitmap of a freshly opened device.
pub fn probe_capabilities(device: &mut HubDevice) -> io::Result<()> {
    device.key_bitmask = get_event_bits(&device.fd, crate::codes::ev::KEY, key::KEY_CNT)?;
    device.abs_bitmask = get_event_bits(&device.fd, crate::codes::ev::ABS, abs::ABS_CNT)?;
    device.rel_bitmask = get_event_bits(&device.fd, crate::codes::ev::REL, rel::REL_CNT)?;
    device.sw_bitmask = get_event_bits(&device.fd, crate::codes::ev::SW, sw::SW_CNT)?;
    device.led_bitmask = get_event_bits(&device.fd, crate::codes::ev::LED, led::LED_CNT)?;
    device.prop_bitmask = get_property_bits(&device.fd).unwrap_or_else(|err| {
        debug!(path = ?device.path, "no property bitmap: {err}");
        EvdevBitmask::with_code_count(input_prop::INPUT_PROP_CNT)
    });
    Ok(())
}

/// Loads the configuration property file for a device, trying the most
/// specific name first: `<bus>:<vendor>:<product>[:<version>][:<name>]`.
pub fn load_configuration(config_dir: &Path, identifier: &InputDeviceIdentifier) -> (PropertyMap, Option<PathBuf>) {
    let base = format!(
        "{:04x}:{:04x}:{:04x}",
        identifier.bus, identifier.vendor, identifier.product
    );
    let mut candidates = Vec::new();
    if !identifier.name.is_empty() {
        candidates.push(format!(
            "{base}:{:04x}:{}.prop",
            identifier.version, identifier.name
        ));
    }
    candidates.push(format!("{base}:{:04x}.prop", identifier.version));
    candidates.push(format!("{base}.prop"));

    for candidate in candidates {
        let path = config_dir.join(candidate);
        if !path.exists() {
            continue;
        }
        match PropertyMap::load(&path) {
            Ok(map) => return (map, Some(path)),
            Err(err) => {
                warn!(?path, "error loading device configuration: {err}");
                return (PropertyMap::new(), Some(path));
            }
        }
    }
    debug!(name = %identifier.name, "no input device configuration file found");
    (PropertyMap::new(), None)
}
