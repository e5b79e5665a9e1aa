//! Joystick mapper: absolute axis normalization and filtering.

use indexmap::IndexMap;
use tracing::info;

use crate::codes::{abs, axis as motion_axis, motion, PolicyFlags, Source, ToolType};
use crate::hub::{RawAbsoluteAxisInfo, RawEvent, RawEventKind};
use crate::keymap::{AxisInfo, AxisMode};
use crate::listener::{
    InputDeviceInfo, MotionArgs, MotionPointer, MotionRange, NotifyArgs, PointerCoords,
    PointerProperties, MAX_AXES,
};
use crate::policy::ConfigChanges;
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::{avg, Nanos};

#[derive(Debug, Clone)]
struct Axis {
    raw_axis_info: RawAbsoluteAxisInfo,
    axis_info: AxisInfo,
    /// True if the key layout named a motion axis for this raw axis.
    explicitly_mapped: bool,
    scale: f32,
    offset: f32,
    high_scale: f32,
    high_offset: f32,
    min: f32,
    max: f32,
    flat: f32,
    fuzz: f32,
    /// Variations smaller than this are noise.
    filter: f32,
    current_value: f32,
    new_value: f32,
    high_current_value: f32,
    high_new_value: f32,
}

impl Axis {
    #[allow(clippy::too_many_arguments)]
    fn new(
        raw_axis_info: RawAbsoluteAxisInfo,
        axis_info: AxisInfo,
        explicitly_mapped: bool,
        scale: f32,
        offset: f32,
        high_scale: f32,
        high_offset: f32,
        min: f32,
        max: f32,
        flat: f32,
        fuzz: f32,
    ) -> Self {
        Axis {
            raw_axis_info,
            axis_info,
            explicitly_mapped,
            scale,
            offset,
            high_scale,
            high_offset,
            min,
            max,
            flat,
            fuzz,
            filter: 0.0,
            current_value: 0.0,
            new_value: 0.0,
            high_current_value: 0.0,
            high_new_value: 0.0,
        }
    }

    fn reset_value(&mut self) {
        self.current_value = 0.0;
        self.new_value = 0.0;
        self.high_current_value = 0.0;
        self.high_new_value = 0.0;
    }
}

/// Cooks absolute joystick axes into motion events.
pub struct JoystickMapper {
    /// Axes keyed by raw `ABS_*` code.
    axes: IndexMap<i32, Axis>,
}

impl JoystickMapper {
    pub fn new() -> Self {
        JoystickMapper {
            axes: IndexMap::new(),
        }
    }

    pub fn sources(&self) -> Source {
        Source::JOYSTICK
    }

    pub fn populate_device_info(&self, info: &mut InputDeviceInfo) {
        for axis in self.axes.values() {
            info.add_motion_range(MotionRange {
                axis: axis.axis_info.axis,
                source: Source::JOYSTICK,
                min: axis.min,
                max: axis.max,
                flat: axis.flat,
                fuzz: axis.fuzz,
            });
            if axis.axis_info.mode == AxisMode::Split {
                info.add_motion_range(MotionRange {
                    axis: axis.axis_info.high_axis,
                    source: Source::JOYSTICK,
                    min: axis.min,
                    max: axis.max,
                    flat: axis.flat,
                    fuzz: axis.fuzz,
                });
            }
        }
    }

    pub fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: ConfigChanges,
    ) {
        if !changes.is_empty() {
            return;
        }

        // Collect all axes.
        for raw_axis in 0..=abs::ABS_MAX {
            let raw_axis_info = ctx.hub.absolute_axis_info(dev.id, raw_axis);
            if !raw_axis_info.valid {
                continue;
            }

            let (axis_info, explicitly_mapped) = match ctx.hub.map_axis(dev.id, raw_axis) {
                Some(info) => (info, true),
                None => (AxisInfo::default(), false),
            };

            let raw_flat = if axis_info.flat_override >= 0 {
                axis_info.flat_override
            } else {
                raw_axis_info.flat
            };

            let axis = if axis_info.mode == AxisMode::Split {
                let scale = 1.0 / (axis_info.split_value - raw_axis_info.min) as f32;
                let high_scale = 1.0 / (raw_axis_info.max - axis_info.split_value) as f32;
                Axis::new(
                    raw_axis_info,
                    axis_info,
                    explicitly_mapped,
                    scale,
                    0.0,
                    high_scale,
                    0.0,
                    0.0,
                    1.0,
                    raw_flat as f32 * scale,
                    raw_axis_info.fuzz as f32 * scale,
                )
            } else if is_centered_axis(axis_info.axis) {
                let scale = 2.0 / (raw_axis_info.max - raw_axis_info.min) as f32;
                let offset = avg(raw_axis_info.min as f32, raw_axis_info.max as f32) * -scale;
                Axis::new(
                    raw_axis_info,
                    axis_info,
                    explicitly_mapped,
                    scale,
                    offset,
                    scale,
                    offset,
                    -1.0,
                    1.0,
                    raw_flat as f32 * scale,
                    raw_axis_info.fuzz as f32 * scale,
                )
            } else {
                let scale = 1.0 / (raw_axis_info.max - raw_axis_info.min) as f32;
                Axis::new(
                    raw_axis_info,
                    axis_info,
                    explicitly_mapped,
                    scale,
                    0.0,
                    scale,
                    0.0,
                    0.0,
                    1.0,
                    raw_flat as f32 * scale,
                    raw_axis_info.fuzz as f32 * scale,
                )
            };

            let mut axis = axis;
            // Filter out resting noise up front.
            axis.filter = axis.flat * 0.25;
            self.axes.insert(raw_axis, axis);
        }

        // If there are too many axes, start dropping them, preferring to
        // keep the explicitly mapped ones.
        if self.axes.len() > MAX_AXES {
            info!(
                device = dev.name,
                axes = self.axes.len(),
                "joystick has more axes than can be reported, pruning"
            );
            self.prune_axes(dev, true);
            self.prune_axes(dev, false);
        }

        // Assign generic axis ids to the remainder.
        let mut next_generic_axis = motion_axis::GENERIC_1;
        let mut dropped: Vec<i32> = Vec::new();
        let assigned: Vec<i32> = self
            .axes
            .iter()
            .filter(|(_, axis)| axis.axis_info.axis >= 0)
            .map(|(_, axis)| axis.axis_info.axis)
            .collect();
        for (raw_axis, axis) in self.axes.iter_mut() {
            if axis.axis_info.axis >= 0 {
                continue;
            }
            while next_generic_axis <= motion_axis::GENERIC_16 && assigned.contains(&next_generic_axis)
            {
                next_generic_axis += 1;
            }
            if next_generic_axis <= motion_axis::GENERIC_16 {
                axis.axis_info.axis = next_generic_axis;
                next_generic_axis += 1;
            } else {
                info!(
                    device = dev.name,
                    raw_axis, "no generic axis ids left, ignoring axis"
                );
                dropped.push(*raw_axis);
            }
        }
        for raw_axis in dropped {
            self.axes.shift_remove(&raw_axis);
        }
    }

    fn prune_axes(&mut self, dev: &DeviceContext<'_>, ignore_explicitly_mapped: bool) {
        while self.axes.len() > MAX_AXES {
            let victim = self
                .axes
                .iter()
                .rev()
                .find(|(_, axis)| !(ignore_explicitly_mapped && axis.explicitly_mapped))
                .map(|(raw_axis, _)| *raw_axis);
            let Some(raw_axis) = victim else {
                return;
            };
            info!(device = dev.name, raw_axis, "discarding joystick axis, too many axes");
            self.axes.shift_remove(&raw_axis);
        }
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        // Recenter all axes.
        for axis in self.axes.values_mut() {
            axis.reset_value();
        }
        self.sync(ctx, dev, when, true);
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        match raw.kind {
            RawEventKind::Abs => {
                if let Some(axis) = self.axes.get_mut(&raw.code) {
                    let (new_value, high_new_value) = match axis.axis_info.mode {
                        AxisMode::Invert => (
                            (axis.raw_axis_info.max - raw.value) as f32 * axis.scale + axis.offset,
                            0.0,
                        ),
                        AxisMode::Split => {
                            if raw.value < axis.axis_info.split_value {
                                (
                                    (axis.axis_info.split_value - raw.value) as f32 * axis.scale
                                        + axis.offset,
                                    0.0,
                                )
                            } else if raw.value > axis.axis_info.split_value {
                                (
                                    0.0,
                                    (raw.value - axis.axis_info.split_value) as f32
                                        * axis.high_scale
                                        + axis.high_offset,
                                )
                            } else {
                                (0.0, 0.0)
                            }
                        }
                        AxisMode::Normal => {
                            (raw.value as f32 * axis.scale + axis.offset, 0.0)
                        }
                    };
                    axis.new_value = new_value;
                    axis.high_new_value = high_new_value;
                }
            }
            RawEventKind::Sync if raw.code == crate::codes::syn::REPORT => {
                self.sync(ctx, dev, raw.when, false);
            }
            _ => {}
        }
    }

    fn sync(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos, force: bool) {
        if !self.filter_axes(force) {
            return;
        }

        let mut coords = PointerCoords::new();
        for axis in self.axes.values() {
            coords.set_axis_value(axis.axis_info.axis, axis.current_value);
            if axis.axis_info.mode == AxisMode::Split {
                coords.set_axis_value(axis.axis_info.high_axis, axis.high_current_value);
            }
        }

        // Joysticks are noisy even at rest, so axis motion never wakes the
        // device.
        let meta_state = ctx.global_meta_state;
        ctx.notify(NotifyArgs::Motion(MotionArgs {
            when,
            device_id: dev.id,
            source: Source::JOYSTICK,
            policy_flags: PolicyFlags::empty(),
            action: motion::ACTION_MOVE,
            flags: 0,
            meta_state,
            button_state: crate::codes::ButtonState::empty(),
            edge_flags: 0,
            pointers: vec![MotionPointer {
                properties: PointerProperties {
                    id: 0,
                    tool_type: ToolType::Unknown,
                },
                coords,
            }],
            x_precision: 0.0,
            y_precision: 0.0,
            down_time: 0,
        }));
    }

    fn filter_axes(&mut self, force: bool) -> bool {
        let mut significant = force;
        for axis in self.axes.values_mut() {
            if force
                || has_value_changed_significantly(
                    axis.filter,
                    axis.new_value,
                    axis.current_value,
                    axis.min,
                    axis.max,
                )
            {
                axis.current_value = axis.new_value;
                significant = true;
            }
            if axis.axis_info.mode == AxisMode::Split {
                if force
                    || has_value_changed_significantly(
                        axis.filter,
                        axis.high_new_value,
                        axis.high_current_value,
                        axis.min,
                        axis.max,
                    )
                {
                    axis.high_current_value = axis.high_new_value;
                    significant = true;
                }
            }
        }
        significant
    }

    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "    Joystick Input Mapper:");
        let _ = writeln!(out, "      Axes:");
        for (raw_axis, axis) in &self.axes {
            let _ = writeln!(
                out,
                "        raw {:#x} -> {}: min={:.5}, max={:.5}, flat={:.5}, fuzz={:.5}, mode={:?}",
                raw_axis, axis.axis_info.axis, axis.min, axis.max, axis.flat, axis.fuzz,
                axis.axis_info.mode
            );
        }
    }
}

impl Default for JoystickMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn is_centered_axis(axis: i32) -> bool {
    matches!(
        axis,
        motion_axis::X
            | motion_axis::Y
            | motion_axis::Z
            | motion_axis::RX
            | motion_axis::RY
            | motion_axis::RZ
            | motion_axis::HAT_X
            | motion_axis::HAT_Y
            | motion_axis::ORIENTATION
            | motion_axis::RUDDER
            | motion_axis::WHEEL
    )
}

/// Small changes are dropped unless the value converges on a bound or the
/// center, so the resting value always settles exactly.
fn has_value_changed_significantly(
    filter: f32,
    new_value: f32,
    current_value: f32,
    min: f32,
    max: f32,
) -> bool {
    if new_value == current_value {
        return false;
    }
    (new_value - current_value).abs() > filter
        || has_moved_nearer_to_value_within_filtered_range(filter, new_value, current_value, min)
        || has_moved_nearer_to_value_within_filtered_range(filter, new_value, current_value, max)
        || has_moved_nearer_to_value_within_filtered_range(filter, new_value, current_value, 0.0)
}

fn has_moved_nearer_to_value_within_filtered_range(
    filter: f32,
    new_value: f32,
    current_value: f32,
    threshold: f32,
) -> bool {
    let new_distance = (new_value - threshold).abs();
    new_distance < filter && new_distance < (current_value - threshold).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::syn;
    use crate::reader::testing::*;

    fn abs_event(code: i32, value: i32, when: Nanos) -> RawEvent {
        RawEvent {
            when,
            device_id: 1,
            kind: RawEventKind::Abs,
            code,
            value,
            flags: PolicyFlags::empty(),
        }
    }

    fn sync_event(when: Nanos) -> RawEvent {
        RawEvent {
            when,
            device_id: 1,
            kind: RawEventKind::Sync,
            code: syn::REPORT,
            value: 0,
            flags: PolicyFlags::empty(),
        }
    }

    fn motions(events: &[NotifyArgs]) -> Vec<&MotionArgs> {
        events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Motion(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    fn stick_fixture() -> MapperFixture {
        let fixture = MapperFixture::new();
        fixture.hub.set_absolute_axis_info(
            1,
            abs::X,
            RawAbsoluteAxisInfo {
                valid: true,
                min: 0,
                max: 255,
                flat: 8,
                fuzz: 0,
                resolution: 0,
            },
        );
        fixture
    }

    #[test]
    fn centered_axis_normalization() {
        let mut fixture = stick_fixture();
        fixture.hub.add_axis_mapping(
            1,
            abs::X,
            AxisInfo {
                axis: motion_axis::X,
                ..Default::default()
            },
        );
        let mut mapper = JoystickMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 255, 10));
            mapper.process(ctx, dev, &sync_event(10));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        assert_eq!(motion.len(), 1);
        let value = motion[0].pointers[0].coords.axis_value(motion_axis::X);
        assert!((value - 1.0).abs() < 1e-5, "value = {value}");
    }

    #[test]
    fn dead_zone_filters_noise() {
        let mut fixture = stick_fixture();
        fixture.hub.add_axis_mapping(
            1,
            abs::X,
            AxisInfo {
                axis: motion_axis::X,
                ..Default::default()
            },
        );
        let mut mapper = JoystickMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        // Move to center first, then wiggle by less than the filter.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 128, 10));
            mapper.process(ctx, dev, &sync_event(10));
        });
        fixture.drain();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 129, 20));
            mapper.process(ctx, dev, &sync_event(20));
        });
        assert!(motions(&fixture.drain()).is_empty());
        // A large move passes.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 250, 30));
            mapper.process(ctx, dev, &sync_event(30));
        });
        assert_eq!(motions(&fixture.drain()).len(), 1);
    }

    #[test]
    fn split_axis_feeds_two_motion_axes() {
        let mut fixture = stick_fixture();
        fixture.hub.add_axis_mapping(
            1,
            abs::X,
            AxisInfo {
                mode: AxisMode::Split,
                axis: motion_axis::LTRIGGER,
                high_axis: motion_axis::RTRIGGER,
                split_value: 128,
                flat_override: -1,
            },
        );
        let mut mapper = JoystickMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 0, 10));
            mapper.process(ctx, dev, &sync_event(10));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let low = motion[0].pointers[0].coords.axis_value(motion_axis::LTRIGGER);
        let high = motion[0].pointers[0].coords.axis_value(motion_axis::RTRIGGER);
        assert!((low - 1.0).abs() < 1e-5);
        assert_eq!(high, 0.0);

        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 255, 20));
            mapper.process(ctx, dev, &sync_event(20));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let low = motion[0].pointers[0].coords.axis_value(motion_axis::LTRIGGER);
        let high = motion[0].pointers[0].coords.axis_value(motion_axis::RTRIGGER);
        assert_eq!(low, 0.0);
        assert!((high - 1.0).abs() < 1e-5);
    }

    #[test]
    fn unmapped_axis_gets_generic_id() {
        let mut fixture = stick_fixture();
        let mut mapper = JoystickMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        assert_eq!(
            mapper.axes.get(&abs::X).unwrap().axis_info.axis,
            motion_axis::GENERIC_1
        );
    }

    #[test]
    fn inverted_axis() {
        let mut fixture = stick_fixture();
        fixture.hub.add_axis_mapping(
            1,
            abs::X,
            AxisInfo {
                mode: AxisMode::Invert,
                axis: motion_axis::THROTTLE,
                ..Default::default()
            },
        );
        let mut mapper = JoystickMapper::new();
        fixture.with_ctx(|ctx, dev| mapper.configure(ctx, dev, ConfigChanges::empty()));
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 0, 10));
            mapper.process(ctx, dev, &sync_event(10));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let value = motion[0].pointers[0].coords.axis_value(motion_axis::THROTTLE);
        assert!((value - 1.0).abs() < 1e-5, "raw minimum inverts to full scale");

        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &abs_event(abs::X, 255, 20));
            mapper.process(ctx, dev, &sync_event(20));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let value = motion[0].pointers[0].coords.axis_value(motion_axis::THROTTLE);
        assert_eq!(value, 0.0);
    }
}
