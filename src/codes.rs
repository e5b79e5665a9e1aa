//! Kernel event codes and the framework-side constants cooked events use.
//!
//! The kernel side mirrors `linux/input.h`; only the codes the hub and the
//! mappers actually consult are spelled out. The framework side (key codes,
//! motion axes, flag words) is the vocabulary of the cooked event stream.

#![allow(missing_docs)]

use bitflags::bitflags;

/// Event types (`EV_*`).
pub mod ev {
    pub const SYN: u16 = 0x00;
    pub const KEY: u16 = 0x01;
    pub const REL: u16 = 0x02;
    pub const ABS: u16 = 0x03;
    pub const SW: u16 = 0x05;
    pub const LED: u16 = 0x11;
}

/// Synchronization codes (`SYN_*`).
pub mod syn {
    pub const REPORT: i32 = 0;
    pub const MT_REPORT: i32 = 2;
    pub const DROPPED: i32 = 3;
}

/// Key and button scan codes (`KEY_*`, `BTN_*`).
pub mod key {
    pub const KEY_Q: i32 = 16;
    pub const KEY_OK: i32 = 0x160;
    pub const KEY_MAX: i32 = 0x2ff;
    pub const KEY_CNT: usize = (KEY_MAX + 1) as usize;

    pub const BTN_MISC: i32 = 0x100;
    pub const BTN_MOUSE: i32 = 0x110;
    pub const BTN_LEFT: i32 = 0x110;
    pub const BTN_RIGHT: i32 = 0x111;
    pub const BTN_MIDDLE: i32 = 0x112;
    pub const BTN_SIDE: i32 = 0x113;
    pub const BTN_EXTRA: i32 = 0x114;
    pub const BTN_FORWARD: i32 = 0x115;
    pub const BTN_BACK: i32 = 0x116;
    pub const BTN_TASK: i32 = 0x117;
    pub const BTN_JOYSTICK: i32 = 0x120;
    pub const BTN_GAMEPAD: i32 = 0x130;
    pub const BTN_DIGI: i32 = 0x140;
    pub const BTN_TOOL_PEN: i32 = 0x140;
    pub const BTN_TOOL_RUBBER: i32 = 0x141;
    pub const BTN_TOOL_BRUSH: i32 = 0x142;
    pub const BTN_TOOL_PENCIL: i32 = 0x143;
    pub const BTN_TOOL_AIRBRUSH: i32 = 0x144;
    pub const BTN_TOOL_FINGER: i32 = 0x145;
    pub const BTN_TOOL_MOUSE: i32 = 0x146;
    pub const BTN_TOOL_LENS: i32 = 0x147;
    pub const BTN_TOUCH: i32 = 0x14a;
    pub const BTN_STYLUS: i32 = 0x14b;
    pub const BTN_STYLUS2: i32 = 0x14c;
    pub const BTN_TOOL_DOUBLETAP: i32 = 0x14d;
    pub const BTN_TOOL_TRIPLETAP: i32 = 0x14e;
    pub const BTN_TOOL_QUADTAP: i32 = 0x14f;
}

/// Relative axes (`REL_*`).
pub mod rel {
    pub const X: i32 = 0x00;
    pub const Y: i32 = 0x01;
    pub const HWHEEL: i32 = 0x06;
    pub const WHEEL: i32 = 0x08;
    pub const REL_MAX: i32 = 0x0f;
    pub const REL_CNT: usize = (REL_MAX + 1) as usize;
}

/// Absolute axes (`ABS_*`).
pub mod abs {
    pub const X: i32 = 0x00;
    pub const Y: i32 = 0x01;
    pub const PRESSURE: i32 = 0x18;
    pub const DISTANCE: i32 = 0x19;
    pub const TILT_X: i32 = 0x1a;
    pub const TILT_Y: i32 = 0x1b;
    pub const TOOL_WIDTH: i32 = 0x1c;
    pub const MT_SLOT: i32 = 0x2f;
    pub const MT_TOUCH_MAJOR: i32 = 0x30;
    pub const MT_TOUCH_MINOR: i32 = 0x31;
    pub const MT_WIDTH_MAJOR: i32 = 0x32;
    pub const MT_WIDTH_MINOR: i32 = 0x33;
    pub const MT_ORIENTATION: i32 = 0x34;
    pub const MT_POSITION_X: i32 = 0x35;
    pub const MT_POSITION_Y: i32 = 0x36;
    pub const MT_TOOL_TYPE: i32 = 0x37;
    pub const MT_TRACKING_ID: i32 = 0x39;
    pub const MT_PRESSURE: i32 = 0x3a;
    pub const MT_DISTANCE: i32 = 0x3b;
    pub const ABS_MAX: i32 = 0x3f;
    pub const ABS_CNT: usize = (ABS_MAX + 1) as usize;
}

/// Switch codes only need their range here; individual codes pass through.
pub mod sw {
    pub const SW_MAX: i32 = 0x0f;
    pub const SW_CNT: usize = (SW_MAX + 1) as usize;
}

/// LED codes (`LED_*`).
pub mod led {
    pub const NUML: i32 = 0x00;
    pub const CAPSL: i32 = 0x01;
    pub const SCROLLL: i32 = 0x02;
    pub const LED_MAX: i32 = 0x0f;
    pub const LED_CNT: usize = (LED_MAX + 1) as usize;
}

/// Values of `ABS_MT_TOOL_TYPE`.
pub mod mt_tool {
    pub const FINGER: i32 = 0;
    pub const PEN: i32 = 1;
}

/// Input device properties (`INPUT_PROP_*`).
pub mod input_prop {
    pub const POINTER: i32 = 0x00;
    pub const DIRECT: i32 = 0x01;
    pub const SEMI_MT: i32 = 0x03;
    pub const INPUT_PROP_MAX: i32 = 0x1f;
    pub const INPUT_PROP_CNT: usize = (INPUT_PROP_MAX + 1) as usize;
}

/// Bus types reported by `EVIOCGID`.
pub mod bus {
    pub const USB: u16 = 0x03;
    pub const BLUETOOTH: u16 = 0x05;
}

/// Framework key codes emitted in cooked key notifications.
///
/// Scan codes are mapped to these by the device's key layout.
pub mod keycodes {
    pub const UNKNOWN: i32 = 0;
    pub const HOME: i32 = 3;
    pub const BACK: i32 = 4;
    pub const DPAD_UP: i32 = 19;
    pub const DPAD_DOWN: i32 = 20;
    pub const DPAD_LEFT: i32 = 21;
    pub const DPAD_RIGHT: i32 = 22;
    pub const DPAD_CENTER: i32 = 23;
    pub const Q: i32 = 45;
    pub const ALT_LEFT: i32 = 57;
    pub const ALT_RIGHT: i32 = 58;
    pub const SHIFT_LEFT: i32 = 59;
    pub const SHIFT_RIGHT: i32 = 60;
    pub const SYM: i32 = 63;
    pub const NUM: i32 = 78;
    pub const BUTTON_A: i32 = 96;
    pub const BUTTON_B: i32 = 97;
    pub const BUTTON_C: i32 = 98;
    pub const BUTTON_X: i32 = 99;
    pub const BUTTON_Y: i32 = 100;
    pub const BUTTON_Z: i32 = 101;
    pub const BUTTON_L1: i32 = 102;
    pub const BUTTON_R1: i32 = 103;
    pub const BUTTON_L2: i32 = 104;
    pub const BUTTON_R2: i32 = 105;
    pub const BUTTON_THUMBL: i32 = 106;
    pub const BUTTON_THUMBR: i32 = 107;
    pub const BUTTON_START: i32 = 108;
    pub const BUTTON_SELECT: i32 = 109;
    pub const BUTTON_MODE: i32 = 110;
    pub const CTRL_LEFT: i32 = 113;
    pub const CTRL_RIGHT: i32 = 114;
    pub const CAPS_LOCK: i32 = 115;
    pub const SCROLL_LOCK: i32 = 116;
    pub const META_LEFT: i32 = 117;
    pub const META_RIGHT: i32 = 118;
    pub const FUNCTION: i32 = 119;
    pub const FORWARD: i32 = 125;
    pub const NUM_LOCK: i32 = 143;
    pub const BUTTON_1: i32 = 188;
    pub const BUTTON_2: i32 = 189;
    pub const BUTTON_3: i32 = 190;
    pub const BUTTON_4: i32 = 191;
    pub const BUTTON_5: i32 = 192;
    pub const BUTTON_6: i32 = 193;
    pub const BUTTON_7: i32 = 194;
    pub const BUTTON_8: i32 = 195;
    pub const BUTTON_9: i32 = 196;
    pub const BUTTON_10: i32 = 197;
    pub const BUTTON_11: i32 = 198;
    pub const BUTTON_12: i32 = 199;
    pub const BUTTON_13: i32 = 200;
    pub const BUTTON_14: i32 = 201;
    pub const BUTTON_15: i32 = 202;
    pub const BUTTON_16: i32 = 203;
}

/// Motion event axes. Axis values are packed into
/// [`PointerCoords`](crate::listener::PointerCoords) keyed by these ids.
pub mod axis {
    pub const X: i32 = 0;
    pub const Y: i32 = 1;
    pub const PRESSURE: i32 = 2;
    pub const SIZE: i32 = 3;
    pub const TOUCH_MAJOR: i32 = 4;
    pub const TOUCH_MINOR: i32 = 5;
    pub const TOOL_MAJOR: i32 = 6;
    pub const TOOL_MINOR: i32 = 7;
    pub const ORIENTATION: i32 = 8;
    pub const VSCROLL: i32 = 9;
    pub const HSCROLL: i32 = 10;
    pub const Z: i32 = 11;
    pub const RX: i32 = 12;
    pub const RY: i32 = 13;
    pub const RZ: i32 = 14;
    pub const HAT_X: i32 = 15;
    pub const HAT_Y: i32 = 16;
    pub const LTRIGGER: i32 = 17;
    pub const RTRIGGER: i32 = 18;
    pub const THROTTLE: i32 = 19;
    pub const RUDDER: i32 = 20;
    pub const WHEEL: i32 = 21;
    pub const GAS: i32 = 22;
    pub const BRAKE: i32 = 23;
    pub const DISTANCE: i32 = 24;
    pub const TILT: i32 = 25;
    pub const GENERIC_1: i32 = 32;
    pub const GENERIC_16: i32 = 47;
}

/// Motion actions. `POINTER_DOWN`/`POINTER_UP` carry the index of the
/// affected pointer shifted into the high byte of the action word.
pub mod motion {
    pub const ACTION_MASK: i32 = 0xff;
    pub const ACTION_POINTER_INDEX_MASK: i32 = 0xff00;
    pub const ACTION_POINTER_INDEX_SHIFT: i32 = 8;

    pub const ACTION_DOWN: i32 = 0;
    pub const ACTION_UP: i32 = 1;
    pub const ACTION_MOVE: i32 = 2;
    pub const ACTION_CANCEL: i32 = 3;
    pub const ACTION_POINTER_DOWN: i32 = 5;
    pub const ACTION_POINTER_UP: i32 = 6;
    pub const ACTION_HOVER_MOVE: i32 = 7;
    pub const ACTION_SCROLL: i32 = 8;
    pub const ACTION_HOVER_ENTER: i32 = 9;
    pub const ACTION_HOVER_EXIT: i32 = 10;

    /// The action with the pointer index stripped.
    #[inline]
    pub fn masked(action: i32) -> i32 {
        action & ACTION_MASK
    }

    /// The pointer index carried in the action word.
    #[inline]
    pub fn pointer_index(action: i32) -> usize {
        ((action & ACTION_POINTER_INDEX_MASK) >> ACTION_POINTER_INDEX_SHIFT) as usize
    }
}

/// Tool type reported per pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolType {
    #[default]
    Unknown,
    Finger,
    Stylus,
    Mouse,
    Eraser,
}

/// State of a key, scan code or switch as reported by a state query.
///
/// The ordering matters: queries across multiple devices keep the
/// largest state observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyState {
    Unknown,
    Up,
    Down,
    /// A virtual key currently held via the touch screen.
    Virtual,
}

/// Direction of a cooked key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

bitflags! {
    /// Policy flags attached to cooked events. Key layout files contribute
    /// the wake flags; the reader adds `VIRTUAL` for on-bezel keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyFlags: u32 {
        const WAKE = 1 << 0;
        const WAKE_DROPPED = 1 << 1;
        const VIRTUAL = 1 << 2;
        const FUNCTION = 1 << 3;
    }
}

bitflags! {
    /// Flags on cooked key events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        const FROM_SYSTEM = 1 << 3;
        const VIRTUAL_HARD_KEY = 1 << 6;
        const CANCELED = 1 << 5;
    }
}

bitflags! {
    /// Meta key state attached to cooked events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaState: u32 {
        const ALT_ON = 0x02;
        const ALT_LEFT_ON = 0x10;
        const ALT_RIGHT_ON = 0x20;
        const SHIFT_ON = 0x01;
        const SHIFT_LEFT_ON = 0x40;
        const SHIFT_RIGHT_ON = 0x80;
        const SYM_ON = 0x04;
        const FUNCTION_ON = 0x08;
        const CTRL_ON = 0x1000;
        const CTRL_LEFT_ON = 0x2000;
        const CTRL_RIGHT_ON = 0x4000;
        const META_ON = 0x10000;
        const META_LEFT_ON = 0x20000;
        const META_RIGHT_ON = 0x40000;
        const CAPS_LOCK_ON = 0x100000;
        const NUM_LOCK_ON = 0x200000;
        const SCROLL_LOCK_ON = 0x400000;
    }
}

impl MetaState {
    /// Recomputes the side-independent bits from the left/right ones.
    pub fn normalized(self) -> MetaState {
        let mut state = self
            & !(MetaState::ALT_ON | MetaState::SHIFT_ON | MetaState::CTRL_ON | MetaState::META_ON);
        if state.intersects(MetaState::ALT_LEFT_ON | MetaState::ALT_RIGHT_ON) {
            state |= MetaState::ALT_ON;
        }
        if state.intersects(MetaState::SHIFT_LEFT_ON | MetaState::SHIFT_RIGHT_ON) {
            state |= MetaState::SHIFT_ON;
        }
        if state.intersects(MetaState::CTRL_LEFT_ON | MetaState::CTRL_RIGHT_ON) {
            state |= MetaState::CTRL_ON;
        }
        if state.intersects(MetaState::META_LEFT_ON | MetaState::META_RIGHT_ON) {
            state |= MetaState::META_ON;
        }
        state
    }
}

bitflags! {
    /// Pointing button state attached to cooked motion events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ButtonState: u32 {
        const PRIMARY = 1 << 0;
        const SECONDARY = 1 << 1;
        const TERTIARY = 1 << 2;
        const BACK = 1 << 3;
        const FORWARD = 1 << 4;
    }
}

impl ButtonState {
    /// True if a button that makes the pointer count as "down" is pressed.
    pub fn is_pointer_down(self) -> bool {
        self.intersects(ButtonState::PRIMARY | ButtonState::SECONDARY | ButtonState::TERTIARY)
    }
}

bitflags! {
    /// Input sources. The low byte is a class mask; concrete sources carry
    /// their class bit so that masked queries can match by class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Source: u32 {
        const CLASS_BUTTON = 1 << 0;
        const CLASS_POINTER = 1 << 1;
        const CLASS_TRACKBALL = 1 << 2;
        const CLASS_POSITION = 1 << 3;
        const CLASS_JOYSTICK = 1 << 4;

        const KEYBOARD = 0x0100 | 1 << 0;
        const DPAD = 0x0200 | 1 << 0;
        const GAMEPAD = 0x0400 | 1 << 0;
        const TOUCHSCREEN = 0x1000 | 1 << 1;
        const MOUSE = 0x2000 | 1 << 1;
        const TRACKBALL = 0x1_0000 | 1 << 2;
        const TOUCHPAD = 0x10_0000 | 1 << 3;
        const JOYSTICK = 0x100_0000 | 1 << 4;
        const SWITCH = 0x8000_0000;
    }
}

/// Mask covering the source class bits.
pub const SOURCE_CLASS_MASK: u32 = 0xff;

/// True if `sources` matches `mask` ignoring the class bits, the test used
/// by all masked state queries.
pub fn sources_match_mask(sources: Source, mask: Source) -> bool {
    sources.bits() & mask.bits() & !SOURCE_CLASS_MASK != 0
}
