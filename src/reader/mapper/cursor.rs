//! Cursor mapper: mice and trackballs.

use std::sync::Arc;

use tracing::warn;

use crate::codes::{
    axis, motion, ButtonState, KeyAction, KeyState, PolicyFlags, Source,
};
use crate::hub::{RawEvent, RawEventKind, RawEventSource};
use crate::listener::{
    InputDeviceInfo, MotionArgs, MotionPointer, MotionRange, NotifyArgs, PointerCoords,
    PointerProperties,
};
use crate::policy::{ConfigChanges, PointerController, Presentation, Transition};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::geometry::rotate_delta;
use crate::utils::{Nanos, Rotation, VelocityControl};

use super::{
    button_state_for_scan_code, synthesize_button_keys, CursorButtonAccumulator,
    CursorMotionAccumulator, CursorScrollAccumulator,
};

/// Relative movement needed for a trackball to register one unit of motion.
const TRACKBALL_MOVEMENT_THRESHOLD: f32 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Mouse semantics: the cursor position lives in a pointer controller.
    Pointer,
    /// Trackball semantics: normalized relative motions.
    Navigation,
}

#[derive(Debug, Clone, Copy)]
struct Parameters {
    mode: Mode,
    orientation_aware: bool,
    associated_display_id: i32,
}

/// Cooks relative motion, wheel and button events into motion notifications.
pub struct CursorMapper {
    parameters: Parameters,
    source: Source,
    x_scale: f32,
    y_scale: f32,
    x_precision: f32,
    y_precision: f32,
    v_wheel_scale: f32,
    h_wheel_scale: f32,
    button_accumulator: CursorButtonAccumulator,
    motion_accumulator: CursorMotionAccumulator,
    scroll_accumulator: CursorScrollAccumulator,
    pointer_velocity_control: VelocityControl,
    wheel_x_velocity_control: VelocityControl,
    wheel_y_velocity_control: VelocityControl,
    pointer_controller: Option<Arc<dyn PointerController>>,
    button_state: ButtonState,
    down_time: Nanos,
}

impl CursorMapper {
    pub fn new() -> Self {
        CursorMapper {
            parameters: Parameters {
                mode: Mode::Pointer,
                orientation_aware: false,
                associated_display_id: -1,
            },
            source: Source::MOUSE,
            x_scale: 1.0,
            y_scale: 1.0,
            x_precision: 1.0,
            y_precision: 1.0,
            v_wheel_scale: 1.0,
            h_wheel_scale: 1.0,
            button_accumulator: CursorButtonAccumulator::new(),
            motion_accumulator: CursorMotionAccumulator::new(),
            scroll_accumulator: CursorScrollAccumulator::new(),
            pointer_velocity_control: VelocityControl::new(),
            wheel_x_velocity_control: VelocityControl::new(),
            wheel_y_velocity_control: VelocityControl::new(),
            pointer_controller: None,
            button_state: ButtonState::empty(),
            down_time: 0,
        }
    }

    pub fn sources(&self) -> Source {
        self.source
    }

    pub fn populate_device_info(&self, info: &mut InputDeviceInfo) {
        if self.parameters.mode == Mode::Pointer {
            if let Some((min_x, min_y, max_x, max_y)) =
                self.pointer_controller.as_ref().and_then(|c| c.bounds())
            {
                info.add_motion_range(MotionRange {
                    axis: axis::X,
                    source: self.source,
                    min: min_x,
                    max: max_x,
                    flat: 0.0,
                    fuzz: 0.0,
                });
                info.add_motion_range(MotionRange {
                    axis: axis::Y,
                    source: self.source,
                    min: min_y,
                    max: max_y,
                    flat: 0.0,
                    fuzz: 0.0,
                });
            }
        } else {
            info.add_motion_range(MotionRange {
                axis: axis::X,
                source: self.source,
                min: -1.0,
                max: 1.0,
                flat: 0.0,
                fuzz: self.x_scale,
            });
            info.add_motion_range(MotionRange {
                axis: axis::Y,
                source: self.source,
                min: -1.0,
                max: 1.0,
                flat: 0.0,
                fuzz: self.y_scale,
            });
        }
        info.add_motion_range(MotionRange {
            axis: axis::PRESSURE,
            source: self.source,
            min: 0.0,
            max: 1.0,
            flat: 0.0,
            fuzz: 0.0,
        });
        if self.scroll_accumulator.have_relative_vwheel() {
            info.add_motion_range(MotionRange {
                axis: axis::VSCROLL,
                source: self.source,
                min: -1.0,
                max: 1.0,
                flat: 0.0,
                fuzz: 0.0,
            });
        }
        if self.scroll_accumulator.have_relative_hwheel() {
            info.add_motion_range(MotionRange {
                axis: axis::HSCROLL,
                source: self.source,
                min: -1.0,
                max: 1.0,
                flat: 0.0,
                fuzz: 0.0,
            });
        }
    }

    pub fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: ConfigChanges,
    ) {
        if changes.is_empty() {
            self.configure_parameters(dev);

            match self.parameters.mode {
                Mode::Pointer => {
                    self.source = Source::MOUSE;
                    self.x_precision = 1.0;
                    self.y_precision = 1.0;
                    self.x_scale = 1.0;
                    self.y_scale = 1.0;
                    self.pointer_controller = ctx.policy.obtain_pointer_controller(dev.id);
                }
                Mode::Navigation => {
                    self.source = Source::TRACKBALL;
                    self.x_precision = TRACKBALL_MOVEMENT_THRESHOLD;
                    self.y_precision = TRACKBALL_MOVEMENT_THRESHOLD;
                    self.x_scale = 1.0 / TRACKBALL_MOVEMENT_THRESHOLD;
                    self.y_scale = 1.0 / TRACKBALL_MOVEMENT_THRESHOLD;
                }
            }

            self.v_wheel_scale = 1.0;
            self.h_wheel_scale = 1.0;
            self.scroll_accumulator.configure(ctx.hub, dev.id);
        }

        if changes.is_empty() || changes.contains(ConfigChanges::POINTER_SPEED) {
            self.pointer_velocity_control
                .set_parameters(ctx.config.pointer_velocity_control);
            self.wheel_x_velocity_control
                .set_parameters(ctx.config.wheel_velocity_control);
            self.wheel_y_velocity_control
                .set_parameters(ctx.config.wheel_velocity_control);
        }
    }

    fn configure_parameters(&mut self, dev: &DeviceContext<'_>) {
        self.parameters.mode = Mode::Pointer;
        if let Some(mode) = dev.configuration.get_string("cursor.mode") {
            match mode {
                "navigation" => self.parameters.mode = Mode::Navigation,
                "pointer" | "default" => {}
                other => warn!(value = other, "invalid value for cursor.mode"),
            }
        }
        self.parameters.orientation_aware = dev
            .configuration
            .get_bool("cursor.orientationAware")
            .unwrap_or(false);
        self.parameters.associated_display_id =
            if self.parameters.mode == Mode::Pointer || self.parameters.orientation_aware {
                0
            } else {
                -1
            };
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        // Synthesize button releases for anything still held.
        let last_button_state = self.button_state;
        if !last_button_state.is_empty() {
            self.button_accumulator.reset();
            self.button_state = ButtonState::empty();
            let policy_flags = PolicyFlags::empty();
            synthesize_button_keys(
                ctx,
                dev,
                KeyAction::Up,
                when,
                self.source,
                policy_flags,
                last_button_state,
                ButtonState::empty(),
            );
            if last_button_state.is_pointer_down() {
                self.notify_simple_motion(ctx, dev, when, motion::ACTION_UP, ButtonState::empty());
            }
        }
        self.motion_accumulator.reset();
        self.scroll_accumulator.reset();
        self.pointer_velocity_control.reset();
        self.wheel_x_velocity_control.reset();
        self.wheel_y_velocity_control.reset();
        self.down_time = 0;
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        self.button_accumulator.process(raw);
        self.motion_accumulator.process(raw);
        self.scroll_accumulator.process(raw);

        if raw.kind == RawEventKind::Sync && raw.code == crate::codes::syn::REPORT {
            self.sync(ctx, dev, raw.when);
        }
    }

    fn sync(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        let last_button_state = self.button_state;
        let current_button_state = self.button_accumulator.button_state();
        self.button_state = current_button_state;

        let was_down = last_button_state.is_pointer_down();
        let down = current_button_state.is_pointer_down();
        let buttons_changed = current_button_state != last_button_state;
        let down_changed = was_down != down;
        if down_changed && down {
            self.down_time = when;
        }
        let down_time = self.down_time;

        let mut delta_x = self.motion_accumulator.relative_x() as f32 * self.x_scale;
        let mut delta_y = self.motion_accumulator.relative_y() as f32 * self.y_scale;
        let moved = delta_x != 0.0 || delta_y != 0.0;

        if !moved && !buttons_changed && self.scroll_accumulator.relative_vwheel() == 0
            && self.scroll_accumulator.relative_hwheel() == 0
        {
            self.motion_accumulator.finish_sync();
            self.scroll_accumulator.finish_sync();
            return; // no state change
        }

        // Rotate motion into the display frame if requested.
        if self.parameters.orientation_aware && self.parameters.associated_display_id >= 0 && moved
        {
            let rotation = ctx
                .policy
                .display_viewport(self.parameters.associated_display_id, dev.external)
                .map(|viewport| viewport.rotation)
                .unwrap_or(Rotation::Rot0);
            rotate_delta(rotation, &mut delta_x, &mut delta_y);
        }

        let action = if down_changed {
            if down {
                motion::ACTION_DOWN
            } else {
                motion::ACTION_UP
            }
        } else if down || self.pointer_controller.is_none() {
            motion::ACTION_MOVE
        } else {
            motion::ACTION_HOVER_MOVE
        };

        let mut vscroll = if self.scroll_accumulator.have_relative_vwheel() {
            self.scroll_accumulator.relative_vwheel() as f32 * self.v_wheel_scale
        } else {
            0.0
        };
        let mut hscroll = if self.scroll_accumulator.have_relative_hwheel() {
            self.scroll_accumulator.relative_hwheel() as f32 * self.h_wheel_scale
        } else {
            0.0
        };
        let mut unused = 0.0;
        self.wheel_y_velocity_control.apply(when, &mut unused, &mut vscroll);
        self.wheel_x_velocity_control.apply(when, &mut hscroll, &mut unused);
        self.pointer_velocity_control.apply(when, &mut delta_x, &mut delta_y);

        let mut coords = PointerCoords::new();
        if let Some(controller) = &self.pointer_controller {
            if delta_x != 0.0 || delta_y != 0.0 || vscroll != 0.0 || hscroll != 0.0 || buttons_changed
            {
                controller.set_presentation(Presentation::Pointer);
                if delta_x != 0.0 || delta_y != 0.0 {
                    controller.move_by(delta_x, delta_y);
                }
                if buttons_changed {
                    controller.set_button_state(current_button_state);
                }
                controller.unfade(Transition::Immediate);
            }
            let (x, y) = controller.position();
            coords.set_axis_value(axis::X, x);
            coords.set_axis_value(axis::Y, y);
        } else {
            coords.set_axis_value(axis::X, delta_x);
            coords.set_axis_value(axis::Y, delta_y);
        }
        coords.set_axis_value(axis::PRESSURE, if down { 1.0 } else { 0.0 });

        // Moving an external mouse or trackball wakes the device; internal
        // cursor devices stay quiet in your pocket.
        let mut policy_flags = PolicyFlags::empty();
        if dev.external {
            policy_flags |= PolicyFlags::WAKE_DROPPED;
        }

        synthesize_button_keys(
            ctx,
            dev,
            KeyAction::Down,
            when,
            self.source,
            policy_flags,
            last_button_state,
            current_button_state,
        );

        let properties = PointerProperties {
            id: 0,
            tool_type: crate::codes::ToolType::Mouse,
        };
        let meta_state = ctx.global_meta_state;
        ctx.notify(NotifyArgs::Motion(MotionArgs {
            when,
            device_id: dev.id,
            source: self.source,
            policy_flags,
            action,
            flags: 0,
            meta_state,
            button_state: current_button_state,
            edge_flags: 0,
            pointers: vec![MotionPointer { properties, coords }],
            x_precision: self.x_precision,
            y_precision: self.y_precision,
            down_time,
        }));

        // Hover after UP so consumers know the mouse is hovering again.
        if action == motion::ACTION_UP && self.pointer_controller.is_some() {
            ctx.notify(NotifyArgs::Motion(MotionArgs {
                when,
                device_id: dev.id,
                source: self.source,
                policy_flags,
                action: motion::ACTION_HOVER_MOVE,
                flags: 0,
                meta_state,
                button_state: current_button_state,
                edge_flags: 0,
                pointers: vec![MotionPointer { properties, coords }],
                x_precision: self.x_precision,
                y_precision: self.y_precision,
                down_time,
            }));
        }

        if vscroll != 0.0 || hscroll != 0.0 {
            let mut scroll_coords = coords;
            scroll_coords.set_axis_value(axis::VSCROLL, vscroll);
            scroll_coords.set_axis_value(axis::HSCROLL, hscroll);
            ctx.notify(NotifyArgs::Motion(MotionArgs {
                when,
                device_id: dev.id,
                source: self.source,
                policy_flags,
                action: motion::ACTION_SCROLL,
                flags: 0,
                meta_state,
                button_state: current_button_state,
                edge_flags: 0,
                pointers: vec![MotionPointer {
                    properties,
                    coords: scroll_coords,
                }],
                x_precision: self.x_precision,
                y_precision: self.y_precision,
                down_time,
            }));
        }

        synthesize_button_keys(
            ctx,
            dev,
            KeyAction::Up,
            when,
            self.source,
            policy_flags,
            last_button_state,
            current_button_state,
        );

        self.motion_accumulator.finish_sync();
        self.scroll_accumulator.finish_sync();
    }

    fn notify_simple_motion(
        &self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        action: i32,
        button_state: ButtonState,
    ) {
        let mut coords = PointerCoords::new();
        if let Some(controller) = &self.pointer_controller {
            let (x, y) = controller.position();
            coords.set_axis_value(axis::X, x);
            coords.set_axis_value(axis::Y, y);
        }
        coords.set_axis_value(axis::PRESSURE, 0.0);
        let meta_state = ctx.global_meta_state;
        ctx.notify(NotifyArgs::Motion(MotionArgs {
            when,
            device_id: dev.id,
            source: self.source,
            policy_flags: PolicyFlags::empty(),
            action,
            flags: 0,
            meta_state,
            button_state,
            edge_flags: 0,
            pointers: vec![MotionPointer {
                properties: PointerProperties {
                    id: 0,
                    tool_type: crate::codes::ToolType::Mouse,
                },
                coords,
            }],
            x_precision: self.x_precision,
            y_precision: self.y_precision,
            down_time: self.down_time,
        }));
    }

    pub fn scan_code_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        scan_code: i32,
    ) -> KeyState {
        if !button_state_for_scan_code(scan_code).is_empty() {
            hub.scan_code_state(dev.id, scan_code)
        } else {
            KeyState::Unknown
        }
    }

    pub fn fade_pointer(&mut self) {
        if let Some(controller) = &self.pointer_controller {
            controller.fade(Transition::Gradual);
        }
    }

    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "    Cursor Input Mapper:");
        let _ = writeln!(out, "      Mode: {:?}", self.parameters.mode);
        let _ = writeln!(out, "      XScale: {:.3}, YScale: {:.3}", self.x_scale, self.y_scale);
        let _ = writeln!(
            out,
            "      XPrecision: {:.3}, YPrecision: {:.3}",
            self.x_precision, self.y_precision
        );
        let _ = writeln!(out, "      ButtonState: {:?}", self.button_state);
        let _ = writeln!(out, "      DownTime: {}", self.down_time);
    }
}

impl Default for CursorMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{key, rel, syn};
    use crate::reader::testing::*;

    fn raw(kind: RawEventKind, code: i32, value: i32, when: Nanos) -> RawEvent {
        RawEvent {
            when,
            device_id: 1,
            kind,
            code,
            value,
            flags: PolicyFlags::empty(),
        }
    }

    fn motion_args(events: &[NotifyArgs]) -> Vec<&MotionArgs> {
        events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Motion(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    fn navigation_mapper(fixture: &mut MapperFixture) -> CursorMapper {
        fixture.dev_config.set("cursor.mode", "navigation");
        let mut mapper = CursorMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        mapper
    }

    #[test]
    fn trackball_motion_is_normalized() {
        let mut fixture = MapperFixture::new();
        let mut mapper = navigation_mapper(&mut fixture);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Rel, rel::X, 3, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Rel, rel::Y, -6, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        let events = fixture.drain();
        let motions = motion_args(&events);
        assert_eq!(motions.len(), 1);
        assert_eq!(motions[0].action, motion::ACTION_MOVE);
        let coords = motions[0].pointers[0].coords;
        assert!((coords.x() - 0.5).abs() < 1e-6);
        assert!((coords.y() + 1.0).abs() < 1e-6);
        assert_eq!(motions[0].x_precision, TRACKBALL_MOVEMENT_THRESHOLD);
    }

    #[test]
    fn buttons_produce_down_and_up() {
        let mut fixture = MapperFixture::new();
        let mut mapper = navigation_mapper(&mut fixture);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_LEFT, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_LEFT, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });
        let events = fixture.drain();
        let motions = motion_args(&events);
        assert_eq!(motions.len(), 2);
        assert_eq!(motions[0].action, motion::ACTION_DOWN);
        assert_eq!(motions[0].button_state, ButtonState::PRIMARY);
        assert_eq!(motions[0].pointers[0].coords.pressure(), 1.0);
        assert_eq!(motions[1].action, motion::ACTION_UP);
        assert_eq!(motions[1].down_time, 10);
    }

    #[test]
    fn back_button_synthesizes_key() {
        let mut fixture = MapperFixture::new();
        let mut mapper = navigation_mapper(&mut fixture);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_SIDE, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_SIDE, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });
        let events = fixture.drain();
        let keys: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Key(args) => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_code, crate::codes::keycodes::BACK);
        assert_eq!(keys[0].action, KeyAction::Down);
        assert_eq!(keys[1].action, KeyAction::Up);
    }

    #[test]
    fn pointer_mode_feeds_controller() {
        let mut fixture = MapperFixture::new();
        let mut mapper = CursorMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Rel, rel::X, 5, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        let events = fixture.drain();
        let motions = motion_args(&events);
        assert_eq!(motions.len(), 1);
        // Without a button the mouse hovers.
        assert_eq!(motions[0].action, motion::ACTION_HOVER_MOVE);
        let (x, _) = fixture.controller.position();
        assert!(x > 0.0);
    }

    #[test]
    fn wheel_emits_scroll() {
        let mut fixture = MapperFixture::new();
        fixture.hub.set_relative_axis(1, rel::WHEEL);
        let mut mapper = navigation_mapper(&mut fixture);
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Rel, rel::WHEEL, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        let events = fixture.drain();
        let motions = motion_args(&events);
        assert_eq!(motions.len(), 2);
        assert_eq!(motions[1].action, motion::ACTION_SCROLL);
        assert!(motions[1].pointers[0].coords.axis_value(axis::VSCROLL) > 0.0);
    }
}
