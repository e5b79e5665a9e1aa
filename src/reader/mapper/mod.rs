//! Input mappers.
//!
//! Each device owns a stack of mappers, one per capability class. A mapper
//! consumes the device's raw events in order and queues cooked notifications
//! through the [`ReaderContext`](crate::reader::ReaderContext). Mappers hold
//! no reference to their device; everything they need arrives as context on
//! each call.

use crate::codes::{key, ButtonState, KeyAction, KeyState, MetaState, PolicyFlags, Source, ToolType};
use crate::hub::{RawEvent, RawEventSource};
use crate::listener::{InputDeviceInfo, KeyArgs, NotifyArgs};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::Nanos;

pub mod cursor;
pub mod joystick;
pub mod keyboard;
pub mod switch;
pub mod touch;

pub use self::cursor::CursorMapper;
pub use self::joystick::JoystickMapper;
pub use self::keyboard::KeyboardMapper;
pub use self::switch::SwitchMapper;
pub use self::touch::{MultiTouchMapper, SingleTouchMapper};

/// A capability mapper attached to one device.
///
/// Dispatch is a plain match; the set of mapper kinds is closed.
pub enum Mapper {
    Switch(SwitchMapper),
    Keyboard(KeyboardMapper),
    Cursor(CursorMapper),
    SingleTouch(SingleTouchMapper),
    MultiTouch(MultiTouchMapper),
    Joystick(JoystickMapper),
}

impl Mapper {
    pub fn sources(&self) -> Source {
        match self {
            Mapper::Switch(m) => m.sources(),
            Mapper::Keyboard(m) => m.sources(),
            Mapper::Cursor(m) => m.sources(),
            Mapper::SingleTouch(m) => m.touch.sources(),
            Mapper::MultiTouch(m) => m.touch.sources(),
            Mapper::Joystick(m) => m.sources(),
        }
    }

    pub fn populate_device_info(&self, info: &mut InputDeviceInfo) {
        info.add_source(self.sources());
        match self {
            Mapper::Keyboard(m) => m.populate_device_info(info),
            Mapper::Cursor(m) => m.populate_device_info(info),
            Mapper::SingleTouch(m) => m.touch.populate_device_info(info),
            Mapper::MultiTouch(m) => m.touch.populate_device_info(info),
            Mapper::Joystick(m) => m.populate_device_info(info),
            Mapper::Switch(_) => {}
        }
    }

    pub fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: crate::policy::ConfigChanges,
    ) {
        match self {
            Mapper::Switch(m) => m.configure(ctx, dev, changes),
            Mapper::Keyboard(m) => m.configure(ctx, dev, changes),
            Mapper::Cursor(m) => m.configure(ctx, dev, changes),
            Mapper::SingleTouch(m) => m.configure(ctx, dev, changes),
            Mapper::MultiTouch(m) => m.configure(ctx, dev, changes),
            Mapper::Joystick(m) => m.configure(ctx, dev, changes),
        }
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        match self {
            Mapper::Switch(m) => m.reset(ctx, dev, when),
            Mapper::Keyboard(m) => m.reset(ctx, dev, when),
            Mapper::Cursor(m) => m.reset(ctx, dev, when),
            Mapper::SingleTouch(m) => m.reset(ctx, dev, when),
            Mapper::MultiTouch(m) => m.reset(ctx, dev, when),
            Mapper::Joystick(m) => m.reset(ctx, dev, when),
        }
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        match self {
            Mapper::Switch(m) => m.process(ctx, dev, raw),
            Mapper::Keyboard(m) => m.process(ctx, dev, raw),
            Mapper::Cursor(m) => m.process(ctx, dev, raw),
            Mapper::SingleTouch(m) => m.process(ctx, dev, raw),
            Mapper::MultiTouch(m) => m.process(ctx, dev, raw),
            Mapper::Joystick(m) => m.process(ctx, dev, raw),
        }
    }

    pub fn timeout_expired(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
    ) {
        if let Mapper::SingleTouch(m) = self {
            m.touch.timeout_expired(ctx, dev, when);
        } else if let Mapper::MultiTouch(m) = self {
            m.touch.timeout_expired(ctx, dev, when);
        }
    }

    pub fn key_code_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        key_code: i32,
    ) -> KeyState {
        match self {
            Mapper::Keyboard(m) => m.key_code_state(hub, dev, key_code),
            Mapper::SingleTouch(m) => m.touch.key_code_state(key_code),
            Mapper::MultiTouch(m) => m.touch.key_code_state(key_code),
            _ => KeyState::Unknown,
        }
    }

    pub fn scan_code_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        scan_code: i32,
    ) -> KeyState {
        match self {
            Mapper::Keyboard(m) => m.scan_code_state(hub, dev, scan_code),
            Mapper::Cursor(m) => m.scan_code_state(hub, dev, scan_code),
            Mapper::SingleTouch(m) => m.touch.scan_code_state(scan_code),
            Mapper::MultiTouch(m) => m.touch.scan_code_state(scan_code),
            _ => KeyState::Unknown,
        }
    }

    pub fn switch_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        switch_code: i32,
    ) -> KeyState {
        match self {
            Mapper::Switch(m) => m.switch_state(hub, dev, switch_code),
            _ => KeyState::Unknown,
        }
    }

    pub fn mark_supported_key_codes(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        key_codes: &[i32],
        out_flags: &mut [u8],
    ) -> bool {
        match self {
            Mapper::Keyboard(_) => hub.mark_supported_key_codes(dev.id, key_codes, out_flags),
            Mapper::SingleTouch(m) => m.touch.mark_supported_key_codes(key_codes, out_flags),
            Mapper::MultiTouch(m) => m.touch.mark_supported_key_codes(key_codes, out_flags),
            _ => false,
        }
    }

    pub fn meta_state(&self) -> MetaState {
        match self {
            Mapper::Keyboard(m) => m.meta_state(),
            _ => MetaState::empty(),
        }
    }

    pub fn fade_pointer(&mut self) {
        match self {
            Mapper::Cursor(m) => m.fade_pointer(),
            Mapper::SingleTouch(m) => m.touch.fade_pointer(),
            Mapper::MultiTouch(m) => m.touch.fade_pointer(),
            _ => {}
        }
    }

    pub fn dump(&self, out: &mut String) {
        match self {
            Mapper::Switch(_) => {
                out.push_str("    Switch Input Mapper:\n");
            }
            Mapper::Keyboard(m) => m.dump(out),
            Mapper::Cursor(m) => m.dump(out),
            Mapper::SingleTouch(m) => m.touch.dump(out),
            Mapper::MultiTouch(m) => m.touch.dump(out),
            Mapper::Joystick(m) => m.dump(out),
        }
    }
}

/// Pointing button state implied by a button scan code.
pub(crate) fn button_state_for_scan_code(scan_code: i32) -> ButtonState {
    match scan_code {
        key::BTN_LEFT => ButtonState::PRIMARY,
        key::BTN_RIGHT | key::BTN_STYLUS => ButtonState::SECONDARY,
        key::BTN_MIDDLE | key::BTN_STYLUS2 => ButtonState::TERTIARY,
        key::BTN_SIDE | key::BTN_BACK => ButtonState::BACK,
        key::BTN_FORWARD | key::BTN_EXTRA => ButtonState::FORWARD,
        _ => ButtonState::empty(),
    }
}

/// Synthesizes the key event paired with a back/forward button edge.
#[allow(clippy::too_many_arguments)]
fn synthesize_button_key(
    ctx: &mut ReaderContext<'_>,
    dev: &DeviceContext<'_>,
    action: KeyAction,
    when: Nanos,
    source: Source,
    policy_flags: PolicyFlags,
    last_button_state: ButtonState,
    current_button_state: ButtonState,
    button: ButtonState,
    key_code: i32,
) {
    let edge = match action {
        KeyAction::Down => {
            !last_button_state.contains(button) && current_button_state.contains(button)
        }
        KeyAction::Up => {
            last_button_state.contains(button) && !current_button_state.contains(button)
        }
    };
    if edge {
        let meta_state = ctx.global_meta_state;
        ctx.notify(NotifyArgs::Key(KeyArgs {
            when,
            device_id: dev.id,
            source,
            policy_flags,
            action,
            flags: KeyArgs::default_flags(),
            key_code,
            scan_code: 0,
            meta_state,
            down_time: when,
        }));
    }
}

/// Synthesizes back/forward key events for button state edges.
#[allow(clippy::too_many_arguments)]
pub(crate) fn synthesize_button_keys(
    ctx: &mut ReaderContext<'_>,
    dev: &DeviceContext<'_>,
    action: KeyAction,
    when: Nanos,
    source: Source,
    policy_flags: PolicyFlags,
    last_button_state: ButtonState,
    current_button_state: ButtonState,
) {
    synthesize_button_key(
        ctx,
        dev,
        action,
        when,
        source,
        policy_flags,
        last_button_state,
        current_button_state,
        ButtonState::BACK,
        crate::codes::keycodes::BACK,
    );
    synthesize_button_key(
        ctx,
        dev,
        action,
        when,
        source,
        policy_flags,
        last_button_state,
        current_button_state,
        ButtonState::FORWARD,
        crate::codes::keycodes::FORWARD,
    );
}

impl KeyArgs {
    fn default_flags() -> crate::codes::KeyFlags {
        crate::codes::KeyFlags::FROM_SYSTEM
    }
}

/// Tracks the state of mouse or touch pad buttons.
#[derive(Debug, Default)]
pub(crate) struct CursorButtonAccumulator {
    btn_left: bool,
    btn_right: bool,
    btn_middle: bool,
    btn_back: bool,
    btn_side: bool,
    btn_forward: bool,
    btn_extra: bool,
}

impl CursorButtonAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn process(&mut self, raw: &RawEvent) {
        if raw.kind != crate::hub::RawEventKind::Key {
            return;
        }
        let down = raw.value != 0;
        match raw.code {
            key::BTN_LEFT => self.btn_left = down,
            key::BTN_RIGHT => self.btn_right = down,
            key::BTN_MIDDLE => self.btn_middle = down,
            key::BTN_BACK => self.btn_back = down,
            key::BTN_SIDE => self.btn_side = down,
            key::BTN_FORWARD => self.btn_forward = down,
            key::BTN_EXTRA => self.btn_extra = down,
            _ => {}
        }
    }

    pub fn button_state(&self) -> ButtonState {
        let mut state = ButtonState::empty();
        if self.btn_left {
            state |= ButtonState::PRIMARY;
        }
        if self.btn_right {
            state |= ButtonState::SECONDARY;
        }
        if self.btn_middle {
            state |= ButtonState::TERTIARY;
        }
        if self.btn_back || self.btn_side {
            state |= ButtonState::BACK;
        }
        if self.btn_forward || self.btn_extra {
            state |= ButtonState::FORWARD;
        }
        state
    }
}

/// Accumulates relative cursor motion between syncs.
#[derive(Debug, Default)]
pub(crate) struct CursorMotionAccumulator {
    rel_x: i32,
    rel_y: i32,
}

impl CursorMotionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.finish_sync();
    }

    pub fn process(&mut self, raw: &RawEvent) {
        if raw.kind == crate::hub::RawEventKind::Rel {
            match raw.code {
                crate::codes::rel::X => self.rel_x = raw.value,
                crate::codes::rel::Y => self.rel_y = raw.value,
                _ => {}
            }
        }
    }

    pub fn relative_x(&self) -> i32 {
        self.rel_x
    }

    pub fn relative_y(&self) -> i32 {
        self.rel_y
    }

    pub fn finish_sync(&mut self) {
        self.rel_x = 0;
        self.rel_y = 0;
    }
}

/// Accumulates scroll wheel motion between syncs.
#[derive(Debug, Default)]
pub(crate) struct CursorScrollAccumulator {
    have_rel_wheel: bool,
    have_rel_hwheel: bool,
    rel_wheel: i32,
    rel_hwheel: i32,
}

impl CursorScrollAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, hub: &dyn RawEventSource, device_id: i32) {
        self.have_rel_wheel = hub.has_relative_axis(device_id, crate::codes::rel::WHEEL);
        self.have_rel_hwheel = hub.has_relative_axis(device_id, crate::codes::rel::HWHEEL);
    }

    pub fn reset(&mut self) {
        self.finish_sync();
    }

    pub fn process(&mut self, raw: &RawEvent) {
        if raw.kind == crate::hub::RawEventKind::Rel {
            match raw.code {
                crate::codes::rel::WHEEL => self.rel_wheel = raw.value,
                crate::codes::rel::HWHEEL => self.rel_hwheel = raw.value,
                _ => {}
            }
        }
    }

    pub fn have_relative_vwheel(&self) -> bool {
        self.have_rel_wheel
    }

    pub fn have_relative_hwheel(&self) -> bool {
        self.have_rel_hwheel
    }

    pub fn relative_vwheel(&self) -> i32 {
        self.rel_wheel
    }

    pub fn relative_hwheel(&self) -> i32 {
        self.rel_hwheel
    }

    pub fn finish_sync(&mut self) {
        self.rel_wheel = 0;
        self.rel_hwheel = 0;
    }
}

/// Tracks the state of touch, stylus and tool buttons.
#[derive(Debug, Default)]
pub(crate) struct TouchButtonAccumulator {
    have_btn_touch: bool,
    btn_touch: bool,
    btn_stylus: bool,
    btn_stylus2: bool,
    btn_tool_finger: bool,
    btn_tool_pen: bool,
    btn_tool_rubber: bool,
    btn_tool_brush: bool,
    btn_tool_pencil: bool,
    btn_tool_airbrush: bool,
    btn_tool_mouse: bool,
    btn_tool_lens: bool,
    btn_tool_double_tap: bool,
    btn_tool_triple_tap: bool,
    btn_tool_quad_tap: bool,
}

impl TouchButtonAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, hub: &dyn RawEventSource, device_id: i32) {
        self.have_btn_touch = hub.has_scan_code(device_id, key::BTN_TOUCH);
    }

    pub fn reset(&mut self) {
        let have_btn_touch = self.have_btn_touch;
        *self = Self::default();
        self.have_btn_touch = have_btn_touch;
    }

    pub fn process(&mut self, raw: &RawEvent) {
        if raw.kind != crate::hub::RawEventKind::Key {
            return;
        }
        let down = raw.value != 0;
        match raw.code {
            key::BTN_TOUCH => self.btn_touch = down,
            key::BTN_STYLUS => self.btn_stylus = down,
            key::BTN_STYLUS2 => self.btn_stylus2 = down,
            key::BTN_TOOL_FINGER => self.btn_tool_finger = down,
            key::BTN_TOOL_PEN => self.btn_tool_pen = down,
            key::BTN_TOOL_RUBBER => self.btn_tool_rubber = down,
            key::BTN_TOOL_BRUSH => self.btn_tool_brush = down,
            key::BTN_TOOL_PENCIL => self.btn_tool_pencil = down,
            key::BTN_TOOL_AIRBRUSH => self.btn_tool_airbrush = down,
            key::BTN_TOOL_MOUSE => self.btn_tool_mouse = down,
            key::BTN_TOOL_LENS => self.btn_tool_lens = down,
            key::BTN_TOOL_DOUBLETAP => self.btn_tool_double_tap = down,
            key::BTN_TOOL_TRIPLETAP => self.btn_tool_triple_tap = down,
            key::BTN_TOOL_QUADTAP => self.btn_tool_quad_tap = down,
            _ => {}
        }
    }

    /// Stylus buttons act as secondary/tertiary pointing buttons.
    pub fn button_state(&self) -> ButtonState {
        let mut state = ButtonState::empty();
        if self.btn_stylus {
            state |= ButtonState::SECONDARY;
        }
        if self.btn_stylus2 {
            state |= ButtonState::TERTIARY;
        }
        state
    }

    pub fn tool_type(&self) -> ToolType {
        if self.btn_tool_mouse || self.btn_tool_lens {
            ToolType::Mouse
        } else if self.btn_tool_rubber {
            ToolType::Eraser
        } else if self.btn_tool_pen || self.btn_tool_brush || self.btn_tool_pencil || self.btn_tool_airbrush
        {
            ToolType::Stylus
        } else if self.btn_tool_finger
            || self.btn_tool_double_tap
            || self.btn_tool_triple_tap
            || self.btn_tool_quad_tap
        {
            ToolType::Finger
        } else {
            ToolType::Unknown
        }
    }

    /// True while any tool is near or touching the surface.
    pub fn is_tool_active(&self) -> bool {
        self.btn_touch
            || self.btn_tool_finger
            || self.btn_tool_pen
            || self.btn_tool_rubber
            || self.btn_tool_brush
            || self.btn_tool_pencil
            || self.btn_tool_airbrush
            || self.btn_tool_mouse
            || self.btn_tool_lens
            || self.btn_tool_double_tap
            || self.btn_tool_triple_tap
            || self.btn_tool_quad_tap
    }

    /// True while a tool is present but not in contact.
    pub fn is_hovering(&self) -> bool {
        (self.have_btn_touch && !self.btn_touch && self.is_tool_active())
            || (!self.have_btn_touch && self.btn_tool_pen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::RawEventKind;

    fn key_event(code: i32, value: i32) -> RawEvent {
        RawEvent {
            when: 0,
            device_id: 1,
            kind: RawEventKind::Key,
            code,
            value,
            flags: PolicyFlags::empty(),
        }
    }

    #[test]
    fn button_scan_code_mapping() {
        assert_eq!(button_state_for_scan_code(key::BTN_LEFT), ButtonState::PRIMARY);
        assert_eq!(button_state_for_scan_code(key::BTN_STYLUS), ButtonState::SECONDARY);
        assert_eq!(button_state_for_scan_code(key::BTN_STYLUS2), ButtonState::TERTIARY);
        assert_eq!(button_state_for_scan_code(key::BTN_SIDE), ButtonState::BACK);
        assert_eq!(button_state_for_scan_code(key::BTN_EXTRA), ButtonState::FORWARD);
        assert_eq!(button_state_for_scan_code(key::BTN_TASK), ButtonState::empty());
    }

    #[test]
    fn cursor_buttons_accumulate() {
        let mut acc = CursorButtonAccumulator::new();
        acc.process(&key_event(key::BTN_LEFT, 1));
        acc.process(&key_event(key::BTN_SIDE, 1));
        assert_eq!(acc.button_state(), ButtonState::PRIMARY | ButtonState::BACK);
        acc.process(&key_event(key::BTN_LEFT, 0));
        assert_eq!(acc.button_state(), ButtonState::BACK);
    }

    #[test]
    fn touch_button_hover_and_tool() {
        let mut acc = TouchButtonAccumulator::new();
        acc.have_btn_touch = true;
        acc.process(&key_event(key::BTN_TOOL_PEN, 1));
        assert_eq!(acc.tool_type(), ToolType::Stylus);
        assert!(acc.is_tool_active());
        assert!(acc.is_hovering());
        acc.process(&key_event(key::BTN_TOUCH, 1));
        assert!(!acc.is_hovering());
        acc.process(&key_event(key::BTN_TOOL_RUBBER, 1));
        assert_eq!(acc.tool_type(), ToolType::Eraser);
    }
}
