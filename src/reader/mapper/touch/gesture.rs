//! Pointer gesture detection for touchpads driving a cursor.
//!
//! Raw touchpad frames are folded into a small state machine. One finger
//! hovers or taps, a held button turns into click-or-drag, and two or more
//! fingers start as a press that promotes to a swipe or a freeform gesture
//! once the fingers commit to a direction.

use tracing::debug;

use crate::codes::{axis, motion, PolicyFlags, ToolType};
use crate::listener::{PointerCoords, PointerProperties, MAX_POINTERS};
use crate::policy::Presentation;
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::geometry::rotate_delta;
use crate::utils::{BitSet32, Nanos, VelocityControl, VelocityTracker};

use super::{dispatch_motion, update_moved_pointers, TouchMapper};

const ID_SLOTS: usize = super::ID_SLOTS;

/// Mode of the gesture state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PointerGestureMode {
    /// No fingers, no button; nothing happening.
    #[default]
    Neutral,
    /// A tap was detected; down and up are emitted at the pointer location
    /// and the mode lingers until the tap-drag window closes.
    Tap,
    /// One finger dragging right after a tap; the pointer follows it with
    /// the button held.
    TapDrag,
    /// A pointing button is held; the pointer follows the fastest finger.
    ButtonClickOrDrag,
    /// Exactly one finger without a button; the pointer hovers along.
    Hover,
    /// Two or more fingers that have not yet committed to a direction. The
    /// pointer stays put so buttons under it can be pressed.
    Press,
    /// Two fingers moving the same way; a single gesture pointer follows
    /// their common motion.
    Swipe,
    /// Fingers moving independently; one gesture pointer per finger,
    /// positioned relative to the pointer.
    Freeform,
    /// Waiting out the quiet interval before the next gesture may begin.
    Quiet,
}

/// State carried across frames by the detector.
pub(crate) struct PointerGesture {
    pub first_touch_time: Nanos,
    /// Active pointer id in the raw touch data, -1 if none.
    pub active_touch_id: i32,
    /// Active pointer id in the delivered gesture, -1 if none.
    pub active_gesture_id: i32,

    pub current_mode: PointerGestureMode,
    pub current_id_bits: BitSet32,
    pub current_id_to_index: [u32; ID_SLOTS],
    pub current_properties: [PointerProperties; MAX_POINTERS],
    pub current_coords: [PointerCoords; MAX_POINTERS],

    pub last_mode: PointerGestureMode,
    pub last_id_bits: BitSet32,
    pub last_id_to_index: [u32; ID_SLOTS],
    pub last_properties: [PointerProperties; MAX_POINTERS],
    pub last_coords: [PointerCoords; MAX_POINTERS],

    /// Time the gesture last went down.
    pub down_time: Nanos,
    pub tap_down_time: Nanos,
    pub tap_up_time: Nanos,
    /// Location of the initial tap, in cursor space.
    pub tap_x: f32,
    pub tap_y: f32,
    pub quiet_time: Nanos,

    /// Anchor for multi-finger gestures in raw surface units.
    pub reference_touch_x: f32,
    pub reference_touch_y: f32,
    /// Anchor in cursor space.
    pub reference_gesture_x: f32,
    pub reference_gesture_y: f32,

    /// Per-pointer travel not yet folded into the reference position.
    pub reference_id_bits: BitSet32,
    pub reference_deltas: [(f32, f32); ID_SLOTS],

    /// Touch id to gesture id map used while in freeform mode.
    pub freeform_map: [u32; ID_SLOTS],

    pub velocity_tracker: VelocityTracker,
    pub pointer_velocity_control: VelocityControl,
}

impl PointerGesture {
    pub fn new() -> Self {
        let mut gesture = PointerGesture {
            first_touch_time: Nanos::MIN,
            active_touch_id: -1,
            active_gesture_id: -1,
            current_mode: PointerGestureMode::Neutral,
            current_id_bits: BitSet32::new(),
            current_id_to_index: [0; ID_SLOTS],
            current_properties: [PointerProperties::default(); MAX_POINTERS],
            current_coords: [PointerCoords::default(); MAX_POINTERS],
            last_mode: PointerGestureMode::Neutral,
            last_id_bits: BitSet32::new(),
            last_id_to_index: [0; ID_SLOTS],
            last_properties: [PointerProperties::default(); MAX_POINTERS],
            last_coords: [PointerCoords::default(); MAX_POINTERS],
            down_time: 0,
            tap_down_time: Nanos::MIN,
            tap_up_time: Nanos::MIN,
            tap_x: 0.0,
            tap_y: 0.0,
            quiet_time: Nanos::MIN,
            reference_touch_x: 0.0,
            reference_touch_y: 0.0,
            reference_gesture_x: 0.0,
            reference_gesture_y: 0.0,
            reference_id_bits: BitSet32::new(),
            reference_deltas: [(0.0, 0.0); ID_SLOTS],
            freeform_map: [0; ID_SLOTS],
            velocity_tracker: VelocityTracker::new(),
            pointer_velocity_control: VelocityControl::new(),
        };
        gesture.reset();
        gesture
    }

    pub fn reset(&mut self) {
        self.first_touch_time = Nanos::MIN;
        self.active_touch_id = -1;
        self.active_gesture_id = -1;
        self.current_mode = PointerGestureMode::Neutral;
        self.current_id_bits.clear();
        self.last_mode = PointerGestureMode::Neutral;
        self.last_id_bits.clear();
        self.down_time = 0;
        self.velocity_tracker.clear();
        self.reset_tap();
        self.reset_quiet_time();
    }

    pub fn reset_tap(&mut self) {
        self.tap_down_time = Nanos::MIN;
        self.tap_up_time = Nanos::MIN;
    }

    pub fn reset_quiet_time(&mut self) {
        self.quiet_time = Nanos::MIN;
    }

    /// Writes the single gesture pointer most modes report.
    fn set_single_pointer(&mut self, gesture_id: i32, x: f32, y: f32, pressure: f32) {
        self.current_id_bits.clear();
        self.current_id_bits.mark_bit(gesture_id as u32);
        self.current_id_to_index[gesture_id as usize] = 0;
        self.current_properties[0] = PointerProperties {
            id: gesture_id as u32,
            tool_type: ToolType::Finger,
        };
        self.current_coords[0].clear();
        self.current_coords[0].set_axis_value(axis::X, x);
        self.current_coords[0].set_axis_value(axis::Y, y);
        self.current_coords[0].set_axis_value(axis::PRESSURE, pressure);
    }
}

struct GestureFrame {
    send_events: bool,
    cancel_previous: bool,
    finish_previous: bool,
}

impl TouchMapper {
    /// Runs the detector for one frame (or timeout) and dispatches the
    /// resulting gesture events relative to the pointer.
    pub(crate) fn dispatch_pointer_gestures(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
        is_timeout: bool,
    ) {
        let frame = self.prepare_pointer_gestures(ctx, when, is_timeout);
        if !frame.send_events {
            return;
        }
        let cancel_previous = frame.cancel_previous && !frame.finish_previous;
        let finish_previous = frame.finish_previous;

        let Some(controller) = self.pointer_controller.clone() else {
            return;
        };

        // Update the presentation and spots.
        if self.parameters.gesture_mode == super::GestureMode::Spots {
            controller.set_presentation(Presentation::Spot);
            if finish_previous || cancel_previous {
                controller.clear_spots();
            }
            controller.set_spots(
                &self.gesture.current_coords,
                &self.gesture.current_id_to_index,
                self.gesture.current_id_bits,
            );
        } else {
            controller.set_presentation(Presentation::Pointer);
        }

        // Show or hide the pointer as the mode warrants.
        match self.gesture.current_mode {
            PointerGestureMode::Neutral | PointerGestureMode::Quiet => {
                if self.parameters.gesture_mode == super::GestureMode::Spots
                    && matches!(
                        self.gesture.last_mode,
                        PointerGestureMode::Swipe | PointerGestureMode::Freeform
                    )
                {
                    // Remind the user of where the pointer is after a
                    // spot-based gesture ends.
                    controller.unfade(crate::policy::Transition::Gradual);
                }
            }
            PointerGestureMode::Tap
            | PointerGestureMode::TapDrag
            | PointerGestureMode::ButtonClickOrDrag
            | PointerGestureMode::Hover
            | PointerGestureMode::Press => {
                controller.unfade(crate::policy::Transition::Immediate);
            }
            PointerGestureMode::Swipe | PointerGestureMode::Freeform => {
                if self.parameters.gesture_mode == super::GestureMode::Spots {
                    controller.fade(crate::policy::Transition::Gradual);
                } else {
                    controller.unfade(crate::policy::Transition::Immediate);
                }
            }
        }

        let meta_state = ctx.global_meta_state;
        let button_state = self.current_button_state;

        let down = matches!(
            self.gesture.current_mode,
            PointerGestureMode::Tap
                | PointerGestureMode::TapDrag
                | PointerGestureMode::ButtonClickOrDrag
                | PointerGestureMode::Press
                | PointerGestureMode::Swipe
                | PointerGestureMode::Freeform
        );

        // Update last coordinates of moved pointers so ups observe them.
        let mut move_needed = false;
        if down
            && !cancel_previous
            && !finish_previous
            && !self.gesture.last_id_bits.is_empty()
            && !self.gesture.current_id_bits.is_empty()
        {
            let moved_ids = self.gesture.current_id_bits & self.gesture.last_id_bits;
            move_needed = update_moved_pointers(
                &self.gesture.current_properties,
                &self.gesture.current_coords,
                &self.gesture.current_id_to_index,
                &mut self.gesture.last_properties,
                &mut self.gesture.last_coords,
                &self.gesture.last_id_to_index,
                moved_ids,
            );
            if button_state != self.last_button_state {
                move_needed = true;
            }
        }

        // Pointers that went up or were canceled.
        let mut dispatched_id_bits = self.gesture.last_id_bits;
        if !dispatched_id_bits.is_empty() {
            if cancel_previous {
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.pointer_source,
                    motion::ACTION_CANCEL,
                    0,
                    meta_state,
                    button_state,
                    &self.gesture.last_properties,
                    &self.gesture.last_coords,
                    &self.gesture.last_id_to_index,
                    dispatched_id_bits,
                    -1,
                    0.0,
                    0.0,
                    self.gesture.down_time,
                );
                dispatched_id_bits.clear();
            } else {
                let up_id_bits = if finish_previous {
                    dispatched_id_bits
                } else {
                    dispatched_id_bits & !self.gesture.current_id_bits
                };
                for id in up_id_bits.iter() {
                    dispatch_motion(
                        ctx,
                        dev,
                        when,
                        policy_flags,
                        self.pointer_source,
                        motion::ACTION_POINTER_UP,
                        0,
                        meta_state,
                        button_state,
                        &self.gesture.last_properties,
                        &self.gesture.last_coords,
                        &self.gesture.last_id_to_index,
                        dispatched_id_bits,
                        id as i32,
                        0.0,
                        0.0,
                        self.gesture.down_time,
                    );
                    dispatched_id_bits.clear_bit(id);
                }
            }
        }

        // Pointers that moved.
        if move_needed {
            dispatch_motion(
                ctx,
                dev,
                when,
                policy_flags,
                self.pointer_source,
                motion::ACTION_MOVE,
                0,
                meta_state,
                button_state,
                &self.gesture.current_properties,
                &self.gesture.current_coords,
                &self.gesture.current_id_to_index,
                dispatched_id_bits,
                -1,
                0.0,
                0.0,
                self.gesture.down_time,
            );
        }

        // Pointers that went down.
        if down {
            let down_id_bits = self.gesture.current_id_bits & !dispatched_id_bits;
            for id in down_id_bits.iter() {
                dispatched_id_bits.mark_bit(id);
                if dispatched_id_bits.count() == 1 {
                    self.gesture.down_time = when;
                }
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.pointer_source,
                    motion::ACTION_POINTER_DOWN,
                    0,
                    meta_state,
                    button_state,
                    &self.gesture.current_properties,
                    &self.gesture.current_coords,
                    &self.gesture.current_id_to_index,
                    dispatched_id_bits,
                    id as i32,
                    0.0,
                    0.0,
                    self.gesture.down_time,
                );
            }
        }

        if self.gesture.current_mode == PointerGestureMode::Hover {
            dispatch_motion(
                ctx,
                dev,
                when,
                policy_flags,
                self.pointer_source,
                motion::ACTION_HOVER_MOVE,
                0,
                meta_state,
                button_state,
                &self.gesture.current_properties,
                &self.gesture.current_coords,
                &self.gesture.current_id_to_index,
                self.gesture.current_id_bits,
                -1,
                0.0,
                0.0,
                self.gesture.down_time,
            );
        } else if dispatched_id_bits.is_empty() && !self.gesture.last_id_bits.is_empty() {
            // Synthesize a hover move after everything went up so consumers
            // see a fresh hover at the pointer even without a finger down.
            let (x, y) = controller.position();
            let mut coords = PointerCoords::new();
            coords.set_axis_value(axis::X, x);
            coords.set_axis_value(axis::Y, y);
            let properties = [PointerProperties {
                id: 0,
                tool_type: ToolType::Finger,
            }];
            let id_to_index = [0u32; 1];
            let mut id_bits = BitSet32::new();
            id_bits.mark_bit(0);
            dispatch_motion(
                ctx,
                dev,
                when,
                policy_flags,
                self.pointer_source,
                motion::ACTION_HOVER_MOVE,
                0,
                meta_state,
                button_state,
                &properties,
                &[coords],
                &id_to_index,
                id_bits,
                -1,
                0.0,
                0.0,
                self.gesture.down_time,
            );
        }

        // Roll the gesture state.
        self.gesture.last_mode = self.gesture.current_mode;
        if !down {
            self.gesture.last_id_bits.clear();
        } else {
            self.gesture.last_id_bits = self.gesture.current_id_bits;
            for id in self.gesture.current_id_bits.iter() {
                let index = self.gesture.current_id_to_index[id as usize];
                self.gesture.last_properties[index as usize] =
                    self.gesture.current_properties[index as usize];
                self.gesture.last_coords[index as usize] =
                    self.gesture.current_coords[index as usize];
                self.gesture.last_id_to_index[id as usize] = index;
            }
        }
    }

    /// Cancels any in-flight gesture, e.g. on device reset.
    pub(crate) fn abort_pointer_gestures(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
    ) {
        if !self.gesture.last_id_bits.is_empty() {
            let meta_state = ctx.global_meta_state;
            dispatch_motion(
                ctx,
                dev,
                when,
                policy_flags,
                self.pointer_source,
                motion::ACTION_CANCEL,
                0,
                meta_state,
                self.current_button_state,
                &self.gesture.last_properties,
                &self.gesture.last_coords,
                &self.gesture.last_id_to_index,
                self.gesture.last_id_bits,
                -1,
                0.0,
                0.0,
                self.gesture.down_time,
            );
        }
        self.gesture.reset();
    }

    /// Advances the state machine. Returns what to dispatch, if anything.
    fn prepare_pointer_gestures(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        when: Nanos,
        is_timeout: bool,
    ) -> GestureFrame {
        let config = ctx.config;
        let mut frame = GestureFrame {
            send_events: true,
            cancel_previous: false,
            finish_previous: false,
        };
        let Some(controller) = self.pointer_controller.clone() else {
            frame.send_events = false;
            return frame;
        };

        // Tap timeout: the tap is held down until the tap-drag window closes.
        if is_timeout {
            if self.gesture.last_mode == PointerGestureMode::Tap {
                if when <= self.gesture.tap_up_time + config.pointer_gesture_tap_drag_interval {
                    ctx.request_timeout_at(
                        self.gesture.tap_up_time + config.pointer_gesture_tap_drag_interval,
                    );
                } else {
                    debug!("gestures: tap finished");
                    frame.finish_previous = true;
                    self.gesture.active_gesture_id = -1;
                    self.gesture.current_mode = PointerGestureMode::Neutral;
                    self.gesture.current_id_bits.clear();
                    self.gesture.pointer_velocity_control.reset();
                    return frame;
                }
            }
            frame.send_events = false;
            return frame;
        }

        // Feed the velocity tracker with surface-scaled positions.
        {
            let mut positions = [(0.0f32, 0.0f32); MAX_POINTERS];
            let touching = self.current_raw.touching_id_bits;
            for (index, id) in touching.iter().enumerate() {
                let pointer = self.current_raw.pointer_for_id(id);
                positions[index] = (
                    pointer.x as f32 * self.pointer_gesture_x_movement_scale,
                    pointer.y as f32 * self.pointer_gesture_y_movement_scale,
                );
            }
            self.gesture.velocity_tracker.add_movement(
                when,
                touching,
                &positions[..touching.count() as usize],
            );
        }

        // Pick a new active touch id if needed, keeping the old one for as
        // long as possible.
        let mut active_touch_id = self.gesture.active_touch_id;
        let current_touch_ids = self.current_raw.touching_id_bits;
        if active_touch_id < 0 {
            if !current_touch_ids.is_empty() {
                active_touch_id = current_touch_ids.first_marked_bit() as i32;
                self.gesture.active_touch_id = active_touch_id;
                self.gesture.first_touch_time = when;
            }
        } else if !current_touch_ids.has_bit(active_touch_id as u32) {
            active_touch_id = if current_touch_ids.is_empty() {
                -1
            } else {
                current_touch_ids.first_marked_bit() as i32
            };
            self.gesture.active_touch_id = active_touch_id;
        }

        // Quiet time after leaving swipe/freeform with fingers remaining, or
        // after releasing a button under two or more fingers.
        let mut is_quiet_time = false;
        if active_touch_id < 0 {
            self.gesture.reset_quiet_time();
        } else {
            is_quiet_time =
                when < self.gesture.quiet_time + config.pointer_gesture_quiet_interval;
            if !is_quiet_time {
                if matches!(
                    self.gesture.last_mode,
                    PointerGestureMode::Press
                        | PointerGestureMode::Swipe
                        | PointerGestureMode::Freeform
                ) && current_touch_ids.count() < 2
                {
                    is_quiet_time = true;
                } else if self.gesture.last_mode == PointerGestureMode::ButtonClickOrDrag
                    && current_touch_ids.count() >= 2
                    && !self.current_button_state.is_pointer_down()
                {
                    is_quiet_time = true;
                }
                if is_quiet_time {
                    self.gesture.quiet_time = when;
                }
            }
        }

        if is_quiet_time {
            // Case 1: quiet time.
            if self.gesture.last_mode != PointerGestureMode::Quiet {
                frame.finish_previous = true;
            }
            self.gesture.active_gesture_id = -1;
            self.gesture.current_mode = PointerGestureMode::Quiet;
            self.gesture.current_id_bits.clear();
            self.gesture.pointer_velocity_control.reset();
        } else if self.current_button_state.is_pointer_down() {
            // Case 2: button is pressed. Only the active finger matters, so
            // a second finger resting while clicking an integrated button is
            // never delivered.
            if self.gesture.last_mode != PointerGestureMode::ButtonClickOrDrag {
                frame.finish_previous = true;
                self.gesture.active_gesture_id = 0;
            }

            // Follow the fastest finger during drags.
            if active_touch_id >= 0 && current_touch_ids.count() > 1 {
                let mut best_id = -1;
                let mut best_speed = config.pointer_gesture_drag_min_switch_speed;
                for id in current_touch_ids.iter() {
                    if let Some((vx, vy)) = self.gesture.velocity_tracker.velocity(id) {
                        let speed = vx.hypot(vy);
                        if speed > best_speed {
                            best_id = id as i32;
                            best_speed = speed;
                        }
                    }
                }
                if best_id >= 0 && best_id != active_touch_id {
                    active_touch_id = best_id;
                    self.gesture.active_touch_id = best_id;
                    debug!(best_id, best_speed, "gestures: drag switched pointers");
                }
            }

            if active_touch_id >= 0 && self.last_raw.touching_id_bits.has_bit(active_touch_id as u32)
            {
                let current = self.current_raw.pointer_for_id(active_touch_id as u32);
                let last = self.last_raw.pointer_for_id(active_touch_id as u32);
                let mut delta_x =
                    (current.x - last.x) as f32 * self.pointer_gesture_x_movement_scale;
                let mut delta_y =
                    (current.y - last.y) as f32 * self.pointer_gesture_y_movement_scale;
                rotate_delta(self.surface_orientation, &mut delta_x, &mut delta_y);
                self.gesture
                    .pointer_velocity_control
                    .apply(when, &mut delta_x, &mut delta_y);
                controller.move_by(delta_x, delta_y);
            } else {
                self.gesture.pointer_velocity_control.reset();
            }

            let (x, y) = controller.position();
            self.gesture.current_mode = PointerGestureMode::ButtonClickOrDrag;
            let gesture_id = self.gesture.active_gesture_id;
            self.gesture.set_single_pointer(gesture_id, x, y, 1.0);
        } else if current_touch_ids.is_empty() {
            // Case 3: no fingers, no button.
            if self.gesture.last_mode != PointerGestureMode::Neutral {
                frame.finish_previous = true;
            }

            // Watch for taps coming out of hover or tap-drag mode; checking
            // after tap-drag is what makes double taps work.
            let mut tapped = false;
            if matches!(
                self.gesture.last_mode,
                PointerGestureMode::Hover | PointerGestureMode::TapDrag
            ) && self.last_raw.touching_id_bits.count() == 1
                && when <= self.gesture.tap_down_time + config.pointer_gesture_tap_interval
            {
                let (x, y) = controller.position();
                if (x - self.gesture.tap_x).abs() <= config.pointer_gesture_tap_slop
                    && (y - self.gesture.tap_y).abs() <= config.pointer_gesture_tap_slop
                {
                    debug!("gestures: tap");
                    self.gesture.tap_up_time = when;
                    ctx.request_timeout_at(when + config.pointer_gesture_tap_drag_interval);
                    self.gesture.active_gesture_id = 0;
                    self.gesture.current_mode = PointerGestureMode::Tap;
                    let (tap_x, tap_y) = (self.gesture.tap_x, self.gesture.tap_y);
                    self.gesture.set_single_pointer(0, tap_x, tap_y, 1.0);
                    tapped = true;
                }
            }

            self.gesture.pointer_velocity_control.reset();

            if !tapped {
                self.gesture.active_gesture_id = -1;
                self.gesture.current_mode = PointerGestureMode::Neutral;
                self.gesture.current_id_bits.clear();
            }
        } else if current_touch_ids.count() == 1 {
            // Case 4: exactly one finger, no button: hover, or tap-drag if
            // the finger came right back down near the tap.
            self.gesture.current_mode = PointerGestureMode::Hover;
            if self.gesture.last_mode == PointerGestureMode::Tap {
                if when <= self.gesture.tap_up_time + config.pointer_gesture_tap_drag_interval {
                    let (x, y) = controller.position();
                    if (x - self.gesture.tap_x).abs() <= config.pointer_gesture_tap_slop
                        && (y - self.gesture.tap_y).abs() <= config.pointer_gesture_tap_slop
                    {
                        self.gesture.current_mode = PointerGestureMode::TapDrag;
                    }
                }
            } else if self.gesture.last_mode == PointerGestureMode::TapDrag {
                self.gesture.current_mode = PointerGestureMode::TapDrag;
            }

            if self.last_raw.touching_id_bits.has_bit(active_touch_id as u32) {
                let current = self.current_raw.pointer_for_id(active_touch_id as u32);
                let last = self.last_raw.pointer_for_id(active_touch_id as u32);
                let mut delta_x =
                    (current.x - last.x) as f32 * self.pointer_gesture_x_movement_scale;
                let mut delta_y =
                    (current.y - last.y) as f32 * self.pointer_gesture_y_movement_scale;
                rotate_delta(self.surface_orientation, &mut delta_x, &mut delta_y);
                self.gesture
                    .pointer_velocity_control
                    .apply(when, &mut delta_x, &mut delta_y);
                controller.move_by(delta_x, delta_y);
            } else {
                self.gesture.pointer_velocity_control.reset();
            }

            let down = if self.gesture.current_mode == PointerGestureMode::TapDrag {
                true
            } else {
                if self.gesture.last_mode != PointerGestureMode::Hover {
                    frame.finish_previous = true;
                }
                self.gesture.active_gesture_id = 0;
                false
            };

            let (x, y) = controller.position();
            let gesture_id = self.gesture.active_gesture_id;
            self.gesture
                .set_single_pointer(gesture_id, x, y, if down { 1.0 } else { 0.0 });

            if self.last_raw.touching_id_bits.is_empty() && !current_touch_ids.is_empty() {
                self.gesture.reset_tap();
                self.gesture.tap_down_time = when;
                self.gesture.tap_x = x;
                self.gesture.tap_y = y;
            }
        } else {
            // Case 5: at least two fingers, no button. Feedback for each
            // finger has to start before the fingers move, so begin with the
            // press hypothesis and promote once the motion is unambiguous.
            let settled = when
                >= self.gesture.first_touch_time
                    + config.pointer_gesture_multitouch_settle_interval;
            if !matches!(
                self.gesture.last_mode,
                PointerGestureMode::Press | PointerGestureMode::Swipe | PointerGestureMode::Freeform
            ) {
                frame.finish_previous = true;
            } else if !settled
                && self.current_raw.touching_id_bits.count()
                    > self.last_raw.touching_id_bits.count()
            {
                // More fingers while not yet settled: start the gesture over.
                debug!("gestures: resetting, additional pointers during settle interval");
                frame.cancel_previous = true;
            } else {
                self.gesture.current_mode = self.gesture.last_mode;
            }

            if frame.finish_previous || frame.cancel_previous {
                self.gesture.current_mode = PointerGestureMode::Press;
                self.gesture.active_gesture_id = 0;
                self.gesture.reference_id_bits.clear();
                self.gesture.pointer_velocity_control.reset();

                let (centroid_x, centroid_y) = self.current_raw.centroid_of_touching();
                self.gesture.reference_touch_x = centroid_x;
                self.gesture.reference_touch_y = centroid_y;
                let (x, y) = controller.position();
                self.gesture.reference_gesture_x = x;
                self.gesture.reference_gesture_y = y;
            }

            // Clear the deltas of fingers not yet part of the reference.
            for id in (current_touch_ids & !self.gesture.reference_id_bits).iter() {
                self.gesture.reference_deltas[id as usize] = (0.0, 0.0);
            }
            self.gesture.reference_id_bits = current_touch_ids;

            // Accumulate deltas and compute the common (same-sign minimum)
            // movement of all fingers.
            let mut common_delta_x = 0.0f32;
            let mut common_delta_y = 0.0f32;
            let common_id_bits = self.last_raw.touching_id_bits & current_touch_ids;
            let mut first = true;
            for id in common_id_bits.iter() {
                let current = *self.current_raw.pointer_for_id(id);
                let last = *self.last_raw.pointer_for_id(id);
                let delta = &mut self.gesture.reference_deltas[id as usize];
                delta.0 += (current.x - last.x) as f32;
                delta.1 += (current.y - last.y) as f32;
                if first {
                    common_delta_x = delta.0;
                    common_delta_y = delta.1;
                    first = false;
                } else {
                    common_delta_x = common_vector(common_delta_x, delta.0);
                    common_delta_y = common_vector(common_delta_y, delta.1);
                }
            }

            // Promotion out of press.
            if self.gesture.current_mode == PointerGestureMode::Press {
                let mut dist = [0.0f32; ID_SLOTS];
                let mut dist_over_threshold = 0;
                for id in self.gesture.reference_id_bits.iter() {
                    let delta = self.gesture.reference_deltas[id as usize];
                    dist[id as usize] = (delta.0 * self.pointer_gesture_x_zoom_scale)
                        .hypot(delta.1 * self.pointer_gesture_y_zoom_scale);
                    if dist[id as usize] > config.pointer_gesture_multitouch_min_distance {
                        dist_over_threshold += 1;
                    }
                }

                // Only promote when at least two fingers have traveled.
                if dist_over_threshold >= 2 {
                    let pointer_count = self.current_raw.pointer_count;
                    if pointer_count > 2 {
                        frame.cancel_previous = true;
                        self.gesture.current_mode = PointerGestureMode::Freeform;
                    } else {
                        let p0 = self.current_raw.pointers[0];
                        let p1 = self.current_raw.pointers[1];
                        let mutual_distance = ((p0.x - p1.x) as f32).hypot((p0.y - p1.y) as f32);
                        if mutual_distance > self.pointer_gesture_max_swipe_width {
                            // Too far apart for a swipe.
                            frame.cancel_previous = true;
                            self.gesture.current_mode = PointerGestureMode::Freeform;
                        } else {
                            // Wait for both pointers to start moving before
                            // choosing between swipe and freeform.
                            let id1 = p0.id;
                            let id2 = p1.id;
                            let dist1 = dist[id1 as usize];
                            let dist2 = dist[id2 as usize];
                            if dist1 >= config.pointer_gesture_multitouch_min_distance
                                && dist2 >= config.pointer_gesture_multitouch_min_distance
                            {
                                // The cosine of the angle between the
                                // displacement vectors: dot(v1, v2) =
                                // cos(angle) * mag(v1) * mag(v2).
                                let delta1 = self.gesture.reference_deltas[id1 as usize];
                                let delta2 = self.gesture.reference_deltas[id2 as usize];
                                let dx1 = delta1.0 * self.pointer_gesture_x_zoom_scale;
                                let dy1 = delta1.1 * self.pointer_gesture_y_zoom_scale;
                                let dx2 = delta2.0 * self.pointer_gesture_x_zoom_scale;
                                let dy2 = delta2.1 * self.pointer_gesture_y_zoom_scale;
                                let dot = dx1 * dx2 + dy1 * dy2;
                                let cosine = dot / (dist1 * dist2); // denominator > 0
                                if cosine >= config.pointer_gesture_swipe_transition_angle_cosine {
                                    self.gesture.current_mode = PointerGestureMode::Swipe;
                                } else {
                                    frame.cancel_previous = true;
                                    self.gesture.current_mode = PointerGestureMode::Freeform;
                                }
                            }
                        }
                    }
                }
            } else if self.gesture.current_mode == PointerGestureMode::Swipe {
                // A third finger turns a swipe into freeform.
                if self.current_raw.pointer_count > 2 {
                    frame.cancel_previous = true;
                    self.gesture.current_mode = PointerGestureMode::Freeform;
                }
            }

            // Common motion moves the reference points, except in press mode
            // while the decision is pending.
            if self.gesture.current_mode != PointerGestureMode::Press
                && (common_delta_x != 0.0 || common_delta_y != 0.0)
            {
                for id in self.gesture.reference_id_bits.iter() {
                    self.gesture.reference_deltas[id as usize] = (0.0, 0.0);
                }
                self.gesture.reference_touch_x += common_delta_x;
                self.gesture.reference_touch_y += common_delta_y;

                let mut gesture_delta_x = common_delta_x * self.pointer_gesture_x_movement_scale;
                let mut gesture_delta_y = common_delta_y * self.pointer_gesture_y_movement_scale;
                rotate_delta(self.surface_orientation, &mut gesture_delta_x, &mut gesture_delta_y);
                self.gesture
                    .pointer_velocity_control
                    .apply(when, &mut gesture_delta_x, &mut gesture_delta_y);

                self.gesture.reference_gesture_x += gesture_delta_x;
                self.gesture.reference_gesture_y += gesture_delta_y;
            }

            // Report the gesture pointers.
            if matches!(
                self.gesture.current_mode,
                PointerGestureMode::Press | PointerGestureMode::Swipe
            ) {
                debug_assert!(self.gesture.active_gesture_id >= 0);
                let gesture_id = self.gesture.active_gesture_id;
                let (x, y) = (
                    self.gesture.reference_gesture_x,
                    self.gesture.reference_gesture_y,
                );
                self.gesture.set_single_pointer(gesture_id, x, y, 1.0);
            } else if self.gesture.current_mode == PointerGestureMode::Freeform {
                debug_assert!(self.gesture.active_gesture_id >= 0);
                self.gesture.current_id_bits.clear();

                let mut mapped_touch_ids = BitSet32::new();
                let mut used_gesture_ids = BitSet32::new();
                if self.gesture.last_mode != PointerGestureMode::Freeform {
                    // Entering freeform: seed the map with the active touch,
                    // unless the previous gesture was canceled.
                    if !frame.cancel_previous {
                        mapped_touch_ids.mark_bit(active_touch_id as u32);
                        used_gesture_ids.mark_bit(self.gesture.active_gesture_id as u32);
                        self.gesture.freeform_map[active_touch_id as usize] =
                            self.gesture.active_gesture_id as u32;
                    } else {
                        self.gesture.active_gesture_id = -1;
                    }
                } else {
                    // Carry over all mappings that still apply.
                    mapped_touch_ids = self.last_raw.touching_id_bits & current_touch_ids;
                    used_gesture_ids = self.gesture.last_id_bits;

                    // The active gesture may have ended with its touch.
                    for up_touch_id in
                        (self.last_raw.touching_id_bits & !current_touch_ids).iter()
                    {
                        let up_gesture_id = self.gesture.freeform_map[up_touch_id as usize];
                        if up_gesture_id as i32 == self.gesture.active_gesture_id {
                            self.gesture.active_gesture_id = -1;
                            break;
                        }
                    }
                }

                for index in 0..self.current_raw.pointer_count {
                    let pointer = self.current_raw.pointers[index];
                    let touch_id = pointer.id;
                    let gesture_id = if !mapped_touch_ids.has_bit(touch_id) {
                        let gesture_id = used_gesture_ids.first_unmarked_bit();
                        used_gesture_ids.mark_bit(gesture_id);
                        self.gesture.freeform_map[touch_id as usize] = gesture_id;
                        gesture_id
                    } else {
                        self.gesture.freeform_map[touch_id as usize]
                    };
                    self.gesture.current_id_bits.mark_bit(gesture_id);
                    self.gesture.current_id_to_index[gesture_id as usize] = index as u32;

                    let mut delta_x = (pointer.x as f32 - self.gesture.reference_touch_x)
                        * self.pointer_gesture_x_zoom_scale;
                    let mut delta_y = (pointer.y as f32 - self.gesture.reference_touch_y)
                        * self.pointer_gesture_y_zoom_scale;
                    rotate_delta(self.surface_orientation, &mut delta_x, &mut delta_y);

                    self.gesture.current_properties[index] = PointerProperties {
                        id: gesture_id,
                        tool_type: ToolType::Finger,
                    };
                    self.gesture.current_coords[index].clear();
                    self.gesture.current_coords[index]
                        .set_axis_value(axis::X, self.gesture.reference_gesture_x + delta_x);
                    self.gesture.current_coords[index]
                        .set_axis_value(axis::Y, self.gesture.reference_gesture_y + delta_y);
                    self.gesture.current_coords[index].set_axis_value(axis::PRESSURE, 1.0);
                }

                if self.gesture.active_gesture_id < 0 {
                    self.gesture.active_gesture_id =
                        self.gesture.current_id_bits.first_marked_bit() as i32;
                }
            }
        }

        controller.set_button_state(self.current_button_state);
        frame
    }
}

/// Common-mode component of two displacements: the smaller magnitude when
/// the signs agree, zero otherwise.
fn common_vector(a: f32, b: f32) -> f32 {
    if a > 0.0 && b > 0.0 {
        a.min(b)
    } else if a < 0.0 && b < 0.0 {
        a.max(b)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_vector_follows_shared_sign() {
        assert_eq!(common_vector(3.0, 5.0), 3.0);
        assert_eq!(common_vector(-3.0, -5.0), -3.0);
        assert_eq!(common_vector(3.0, -5.0), 0.0);
        assert_eq!(common_vector(0.0, 5.0), 0.0);
    }
}
