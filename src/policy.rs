//! Reader policy collaborator interface.
//!
//! The policy supplies display geometry, tuning parameters and pointer
//! controllers. It is queried from the reader thread only, but
//! implementations must not call back into the reader since they may run
//! while the registry lock is held.

use std::sync::Arc;

use bitflags::bitflags;

use crate::codes::ButtonState;
use crate::listener::PointerCoords;
use crate::utils::{BitSet32, Nanos, Rotation, VelocityControlParameters};

bitflags! {
    /// Describes which parts of the reader configuration have changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigChanges: u32 {
        /// The pointer speed changed.
        const POINTER_SPEED = 1 << 0;
        /// The pointer gesture control changed.
        const POINTER_GESTURE_ENABLEMENT = 1 << 1;
        /// The display size or orientation changed.
        const DISPLAY_INFO = 1 << 2;
        /// All devices must be reopened.
        const MUST_REOPEN = 1 << 31;
    }
}

/// Size and rotation of a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayViewport {
    /// Width in the natural orientation, in pixels.
    pub width: i32,
    /// Height in the natural orientation, in pixels.
    pub height: i32,
    pub rotation: Rotation,
}

/// Tuning parameters for the reader.
///
/// The defaults match the tuning the gesture detector was calibrated
/// against; embedders normally only override the velocity control
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfiguration {
    /// Time to ignore virtual key presses after any touch activity, to
    /// filter out stray presses while swiping near the edge of the display.
    /// Zero disables the filter.
    pub virtual_key_quiet_time: Nanos,

    /// Device names that are not opened at all.
    pub excluded_device_names: Vec<String>,

    /// Velocity control for pointer movements.
    pub pointer_velocity_control: VelocityControlParameters,
    /// Velocity control for wheel movements.
    pub wheel_velocity_control: VelocityControlParameters,

    /// Whether touchpad-as-pointer gesture detection runs at all.
    pub pointer_gestures_enabled: bool,

    /// Time for fingers and buttons to settle before a new gesture can
    /// begin after leaving swipe or freeform mode.
    pub pointer_gesture_quiet_interval: Nanos,
    /// Minimum speed for the active finger to switch during a button drag,
    /// in pixels per second.
    pub pointer_gesture_drag_min_switch_speed: f32,
    /// Maximum time between down and up for a tap.
    pub pointer_gesture_tap_interval: Nanos,
    /// Maximum time between a tap's up and the next down for a tap-drag.
    /// The tap is held down for this long, so it must stay below any
    /// long-press timeout.
    pub pointer_gesture_tap_drag_interval: Nanos,
    /// Maximum cursor travel between down and up for a tap, in pixels.
    pub pointer_gesture_tap_slop: f32,
    /// Time after the first touch for additional fingers to settle before
    /// multi-finger gestures commit.
    pub pointer_gesture_multitouch_settle_interval: Nanos,
    /// Distance at least two fingers must travel before press promotes to
    /// swipe or freeform, in pixels.
    pub pointer_gesture_multitouch_min_distance: f32,
    /// Minimum cosine of the angle between two displacement vectors for a
    /// swipe; below this the gesture is freeform.
    pub pointer_gesture_swipe_transition_angle_cosine: f32,
    /// Maximum distance between two fingers for a swipe, as a fraction of
    /// the touchpad diagonal.
    pub pointer_gesture_swipe_max_width_ratio: f32,
    /// Fraction of the display diagonal covered by a full touchpad swipe in
    /// movement mode, before acceleration.
    pub pointer_gesture_movement_speed_ratio: f32,
    /// Fraction of the display diagonal covered by a full touchpad swipe in
    /// zoom/freeform mode, before acceleration.
    pub pointer_gesture_zoom_speed_ratio: f32,
}

impl Default for ReaderConfiguration {
    fn default() -> Self {
        const MS: Nanos = 1_000_000;
        ReaderConfiguration {
            virtual_key_quiet_time: 0,
            excluded_device_names: Vec::new(),
            pointer_velocity_control: VelocityControlParameters::new(1.0, 500.0, 3000.0, 3.0),
            wheel_velocity_control: VelocityControlParameters::new(1.0, 15.0, 50.0, 4.0),
            pointer_gestures_enabled: true,
            pointer_gesture_quiet_interval: 100 * MS,
            pointer_gesture_drag_min_switch_speed: 50.0,
            pointer_gesture_tap_interval: 150 * MS,
            pointer_gesture_tap_drag_interval: 150 * MS,
            pointer_gesture_tap_slop: 10.0,
            pointer_gesture_multitouch_settle_interval: 100 * MS,
            pointer_gesture_multitouch_min_distance: 15.0,
            pointer_gesture_swipe_transition_angle_cosine: 0.2588, // cos 75°
            pointer_gesture_swipe_max_width_ratio: 0.25,
            pointer_gesture_movement_speed_ratio: 0.8,
            pointer_gesture_zoom_speed_ratio: 0.3,
        }
    }
}

/// How the pointer controller should present itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// An arrow cursor.
    Pointer,
    /// One spot per gesture pointer.
    Spot,
}

/// How a fade or unfade transition should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Immediate,
    Gradual,
}

/// Cursor presentation owned by the window system.
///
/// The reader moves the cursor and mirrors gesture spots; everything else
/// about rendering is the implementation's concern. Methods take `&self`
/// because the controller is shared between the policy and the mappers.
pub trait PointerController: Send + Sync {
    /// The movement bounds of the cursor, as (min_x, min_y, max_x, max_y).
    fn bounds(&self) -> Option<(f32, f32, f32, f32)>;

    fn move_by(&self, delta_x: f32, delta_y: f32);

    fn set_position(&self, x: f32, y: f32);

    fn position(&self) -> (f32, f32);

    fn set_button_state(&self, state: ButtonState);

    fn set_presentation(&self, presentation: Presentation);

    /// Mirrors gesture pointers as spots. `spot_coords` is indexed through
    /// `spot_id_to_index` by the ids in `spot_id_bits`.
    fn set_spots(&self, spot_coords: &[PointerCoords], spot_id_to_index: &[u32], spot_id_bits: BitSet32);

    fn clear_spots(&self);

    fn fade(&self, transition: Transition);

    fn unfade(&self, transition: Transition);
}

/// Window-manager side of the reader.
pub trait Policy: Send + Sync {
    /// Current reader configuration; polled when a refresh is requested.
    fn reader_configuration(&self) -> ReaderConfiguration;

    /// Geometry of the display a device is associated with, or `None` if
    /// that display is not available.
    fn display_viewport(&self, display_id: i32, external: bool) -> Option<DisplayViewport>;

    /// Obtains the pointer controller for a cursor or pointer device.
    fn obtain_pointer_controller(&self, device_id: i32) -> Option<Arc<dyn PointerController>>;
}
