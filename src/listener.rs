//! Cooked event notifications.
//!
//! The reader produces five kinds of notifications and hands them to a
//! [`Listener`]. During a loop iteration the mappers push into a
//! [`QueuedListener`]; the queue is flushed in FIFO order once the loop has
//! released its locks, so a listener never observes the reader mid-update.

use crate::codes::{
    axis, ButtonState, KeyAction, KeyFlags, MetaState, PolicyFlags, Source, ToolType,
};
use crate::utils::Nanos;

/// Maximum number of pointers in one motion event.
pub const MAX_POINTERS: usize = 16;

/// Largest pointer id handed to consumers. Ids are stable while a pointer
/// stays down and are reused afterwards.
pub const MAX_POINTER_ID: u32 = 31;

/// Maximum number of axis values one pointer can carry.
pub const MAX_AXES: usize = 30;

/// Axis values for one pointer, packed by axis id.
///
/// Storage is a bitmask of present axes plus a dense value array, so a
/// joystick can report arbitrary generic axes without paying for the full
/// axis space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerCoords {
    bits: u64,
    values: [f32; MAX_AXES],
}

impl Default for PointerCoords {
    fn default() -> Self {
        PointerCoords {
            bits: 0,
            values: [0.0; MAX_AXES],
        }
    }
}

impl PointerCoords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    fn index_of(&self, axis: i32) -> usize {
        (self.bits & ((1u64 << axis) - 1)).count_ones() as usize
    }

    /// Value of `axis`, or 0 when the axis is absent.
    pub fn axis_value(&self, axis: i32) -> f32 {
        debug_assert!((0..64).contains(&axis));
        if self.bits & (1u64 << axis) == 0 {
            return 0.0;
        }
        self.values[self.index_of(axis)]
    }

    /// Sets `axis` to `value`, inserting it if absent. Axis ids beyond the
    /// per-pointer capacity are dropped.
    pub fn set_axis_value(&mut self, axis: i32, value: f32) {
        debug_assert!((0..64).contains(&axis));
        let index = self.index_of(axis);
        if self.bits & (1u64 << axis) == 0 {
            if self.bits.count_ones() as usize >= MAX_AXES {
                return; // too many axes for one pointer
            }
            self.values
                .copy_within(index..self.bits.count_ones() as usize, index + 1);
            self.bits |= 1u64 << axis;
        }
        self.values[index] = value;
    }

    /// Number of axes present.
    pub fn axis_count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.axis_value(axis::X)
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.axis_value(axis::Y)
    }

    #[inline]
    pub fn pressure(&self) -> f32 {
        self.axis_value(axis::PRESSURE)
    }
}

/// Identity of one pointer within a motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerProperties {
    pub id: u32,
    pub tool_type: ToolType,
}

impl PointerProperties {
    pub fn clear(&mut self) {
        *self = PointerProperties::default();
    }
}

/// One pointer of a motion notification.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionPointer {
    pub properties: PointerProperties,
    pub coords: PointerCoords,
}

/// Range of a motion axis advertised in device info.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRange {
    pub axis: i32,
    pub source: Source,
    pub min: f32,
    pub max: f32,
    pub flat: f32,
    pub fuzz: f32,
}

/// Keyboard capability level of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum KeyboardType {
    #[default]
    None,
    NonAlphabetic,
    Alphabetic,
}

/// Description of a registered input device, as returned by
/// [`InputReader::input_device_info`](crate::reader::InputReader::input_device_info).
#[derive(Debug, Clone, Default)]
pub struct InputDeviceInfo {
    pub id: i32,
    pub name: String,
    pub sources: Source,
    pub keyboard_type: KeyboardType,
    pub motion_ranges: Vec<MotionRange>,
}

impl InputDeviceInfo {
    pub fn new(id: i32, name: &str) -> Self {
        InputDeviceInfo {
            id,
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn add_source(&mut self, source: Source) {
        self.sources |= source;
    }

    pub fn add_motion_range(&mut self, range: MotionRange) {
        self.motion_ranges.push(range);
    }
}

/// A cooked key notification.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyArgs {
    pub when: Nanos,
    pub device_id: i32,
    pub source: Source,
    pub policy_flags: PolicyFlags,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: MetaState,
    pub down_time: Nanos,
}

/// A cooked motion notification.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionArgs {
    pub when: Nanos,
    pub device_id: i32,
    pub source: Source,
    pub policy_flags: PolicyFlags,
    /// Action word; see [`crate::codes::motion`].
    pub action: i32,
    pub flags: i32,
    pub meta_state: MetaState,
    pub button_state: ButtonState,
    pub edge_flags: i32,
    pub pointers: Vec<MotionPointer>,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nanos,
}

/// A cooked switch notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchArgs {
    pub when: Nanos,
    pub policy_flags: PolicyFlags,
    pub switch_code: i32,
    pub switch_value: i32,
}

/// One notification from the reader to the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyArgs {
    /// The set of devices or their configuration changed.
    ConfigurationChanged { when: Nanos },
    /// A device was reset: added, removed, reconfigured, or recovered from a
    /// buffer overrun. Any state the listener holds for it is stale.
    DeviceReset { when: Nanos, device_id: i32 },
    Key(KeyArgs),
    Motion(MotionArgs),
    Switch(SwitchArgs),
}

/// Sink for cooked notifications.
pub trait Listener: Send {
    fn notify(&mut self, args: &NotifyArgs);
}

impl<F: FnMut(&NotifyArgs) + Send> Listener for F {
    fn notify(&mut self, args: &NotifyArgs) {
        self(args)
    }
}

/// Buffers notifications produced during one reader loop iteration and
/// flushes them in FIFO order.
#[derive(Debug, Default)]
pub struct QueuedListener {
    queue: Vec<NotifyArgs>,
}

impl QueuedListener {
    pub fn new() -> Self {
        QueuedListener { queue: Vec::new() }
    }

    pub fn push(&mut self, args: NotifyArgs) {
        self.queue.push(args);
    }

    /// Takes the queued notifications, leaving the queue empty. The caller
    /// delivers them after dropping any locks.
    pub fn drain(&mut self) -> Vec<NotifyArgs> {
        std::mem::take(&mut self.queue)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_insertion_keeps_packing() {
        let mut coords = PointerCoords::new();
        coords.set_axis_value(axis::Y, 2.0);
        coords.set_axis_value(axis::X, 1.0);
        coords.set_axis_value(axis::PRESSURE, 0.5);
        assert_eq!(coords.axis_value(axis::X), 1.0);
        assert_eq!(coords.axis_value(axis::Y), 2.0);
        assert_eq!(coords.axis_value(axis::PRESSURE), 0.5);
        assert_eq!(coords.axis_value(axis::SIZE), 0.0);
        assert_eq!(coords.axis_count(), 3);
    }

    #[test]
    fn coords_overwrite() {
        let mut coords = PointerCoords::new();
        coords.set_axis_value(axis::X, 1.0);
        coords.set_axis_value(axis::X, 9.0);
        assert_eq!(coords.axis_value(axis::X), 9.0);
        assert_eq!(coords.axis_count(), 1);
    }

    #[test]
    fn coords_generic_axes() {
        let mut coords = PointerCoords::new();
        coords.set_axis_value(axis::GENERIC_16, 4.0);
        coords.set_axis_value(axis::GENERIC_1, 3.0);
        assert_eq!(coords.axis_value(axis::GENERIC_1), 3.0);
        assert_eq!(coords.axis_value(axis::GENERIC_16), 4.0);
    }

    #[test]
    fn queue_is_fifo() {
        let mut queued = QueuedListener::new();
        queued.push(NotifyArgs::ConfigurationChanged { when: 1 });
        queued.push(NotifyArgs::DeviceReset {
            when: 2,
            device_id: 7,
        });
        let drained = queued.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            NotifyArgs::ConfigurationChanged { when: 1 }
        ));
        assert!(queued.is_empty());
    }
}
