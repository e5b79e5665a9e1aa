//! Legacy single-touch protocol decoding.

use crate::codes::{abs, syn, ToolType};
use crate::hub::{RawEvent, RawEventKind};
use crate::policy::ConfigChanges;
use crate::reader::mapper::{CursorButtonAccumulator, TouchButtonAccumulator};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::Nanos;

use super::{DeviceType, TouchMapper};

/// Tracks the absolute axes of the one-finger protocol between syncs.
#[derive(Debug, Default)]
struct SingleTouchMotionAccumulator {
    abs_x: i32,
    abs_y: i32,
    abs_pressure: i32,
    abs_tool_width: i32,
    abs_distance: i32,
    abs_tilt_x: i32,
    abs_tilt_y: i32,
}

impl SingleTouchMotionAccumulator {
    fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) {
        // Start from the current hardware state so a reset mid-stroke does
        // not report a jump to zero.
        self.abs_x = ctx.hub.absolute_axis_value(dev.id, abs::X).unwrap_or(0);
        self.abs_y = ctx.hub.absolute_axis_value(dev.id, abs::Y).unwrap_or(0);
        self.abs_pressure = ctx
            .hub
            .absolute_axis_value(dev.id, abs::PRESSURE)
            .unwrap_or(0);
        self.abs_tool_width = ctx
            .hub
            .absolute_axis_value(dev.id, abs::TOOL_WIDTH)
            .unwrap_or(0);
        self.abs_distance = ctx
            .hub
            .absolute_axis_value(dev.id, abs::DISTANCE)
            .unwrap_or(0);
        self.abs_tilt_x = ctx.hub.absolute_axis_value(dev.id, abs::TILT_X).unwrap_or(0);
        self.abs_tilt_y = ctx.hub.absolute_axis_value(dev.id, abs::TILT_Y).unwrap_or(0);
    }

    fn process(&mut self, raw: &RawEvent) {
        if raw.kind == RawEventKind::Abs {
            match raw.code {
                abs::X => self.abs_x = raw.value,
                abs::Y => self.abs_y = raw.value,
                abs::PRESSURE => self.abs_pressure = raw.value,
                abs::TOOL_WIDTH => self.abs_tool_width = raw.value,
                abs::DISTANCE => self.abs_distance = raw.value,
                abs::TILT_X => self.abs_tilt_x = raw.value,
                abs::TILT_Y => self.abs_tilt_y = raw.value,
                _ => {}
            }
        }
    }
}

/// Decodes the legacy one-finger protocol into the shared touch pipeline.
pub struct SingleTouchMapper {
    pub(crate) touch: TouchMapper,
    motion: SingleTouchMotionAccumulator,
    touch_buttons: TouchButtonAccumulator,
    cursor_buttons: CursorButtonAccumulator,
}

impl SingleTouchMapper {
    pub fn new() -> Self {
        SingleTouchMapper {
            touch: TouchMapper::new(),
            motion: SingleTouchMotionAccumulator::default(),
            touch_buttons: TouchButtonAccumulator::new(),
            cursor_buttons: CursorButtonAccumulator::new(),
        }
    }

    pub fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: ConfigChanges,
    ) {
        if changes.is_empty() {
            self.touch_buttons.configure(ctx.hub, dev.id);

            let axes = &mut self.touch.raw_axes;
            axes.x = ctx.hub.absolute_axis_info(dev.id, abs::X);
            axes.y = ctx.hub.absolute_axis_info(dev.id, abs::Y);
            axes.pressure = ctx.hub.absolute_axis_info(dev.id, abs::PRESSURE);
            axes.tool_major = ctx.hub.absolute_axis_info(dev.id, abs::TOOL_WIDTH);
            axes.distance = ctx.hub.absolute_axis_info(dev.id, abs::DISTANCE);
            axes.tilt_x = ctx.hub.absolute_axis_info(dev.id, abs::TILT_X);
            axes.tilt_y = ctx.hub.absolute_axis_info(dev.id, abs::TILT_Y);
        }
        self.touch.configure(ctx, dev, changes);
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        self.touch.reset(ctx, dev, when);
        self.motion.reset(ctx, dev);
        self.touch_buttons.reset();
        self.cursor_buttons.reset();
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        self.touch_buttons.process(raw);
        self.motion.process(raw);
        if self.touch.parameters.device_type == DeviceType::Pointer {
            self.cursor_buttons.process(raw);
        }

        if raw.kind == RawEventKind::Sync && raw.code == syn::REPORT {
            self.sync(ctx, dev, raw.when);
        }
    }

    fn sync(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        let touch = &mut self.touch;
        touch.current_raw.clear();
        touch.current_button_state =
            self.touch_buttons.button_state() | self.cursor_buttons.button_state();

        if self.touch_buttons.is_tool_active() {
            let is_hovering = self.touch_buttons.is_hovering()
                || (touch.raw_axes.distance.valid && self.motion.abs_distance > 0);
            let tool_type = match self.touch_buttons.tool_type() {
                ToolType::Unknown => ToolType::Finger,
                tool_type => tool_type,
            };

            touch.current_raw.pointer_count = 1;
            let pointer = &mut touch.current_raw.pointers[0];
            pointer.id = 0;
            pointer.x = self.motion.abs_x;
            pointer.y = self.motion.abs_y;
            pointer.pressure = self.motion.abs_pressure;
            pointer.touch_major = 0;
            pointer.touch_minor = 0;
            pointer.tool_major = self.motion.abs_tool_width;
            pointer.tool_minor = self.motion.abs_tool_width;
            pointer.orientation = 0;
            pointer.distance = self.motion.abs_distance;
            pointer.tilt_x = self.motion.abs_tilt_x;
            pointer.tilt_y = self.motion.abs_tilt_y;
            pointer.tool_type = tool_type;
            pointer.is_hovering = is_hovering;
            touch.current_raw.id_to_index[0] = 0;
            touch.current_raw.mark_id_bit(0, is_hovering);
        }

        touch.sync_touch(ctx, dev, when, true);
    }
}

impl Default for SingleTouchMapper {
    fn default() -> Self {
        Self::new()
    }
}
