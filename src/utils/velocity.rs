//! Pointer velocity estimation and speed-dependent gain.
//!
//! [`VelocityTracker`] keeps a short history of positions per pointer id and
//! fits a velocity to it; the gesture detector uses it to decide which finger
//! to follow during a drag. [`VelocityControl`] applies an acceleration curve
//! to relative movements, shared by the cursor mapper and the pointer gesture
//! detector.

use crate::utils::{BitSet32, Nanos};

/// Number of samples kept per pointer.
const HISTORY_SIZE: usize = 20;

/// Samples older than this are ignored when estimating velocity.
const HORIZON: Nanos = 100 * 1_000_000; // 100 ms

/// Highest pointer id that can be tracked.
pub const MAX_POINTER_ID: usize = 31;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    when: Nanos,
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Default)]
struct History {
    samples: [Sample; HISTORY_SIZE],
    len: usize,
    next: usize,
}

impl History {
    fn clear(&mut self) {
        self.len = 0;
        self.next = 0;
    }

    fn push(&mut self, sample: Sample) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % HISTORY_SIZE;
        if self.len < HISTORY_SIZE {
            self.len += 1;
        }
    }

    /// Samples in chronological order.
    fn iter(&self) -> impl Iterator<Item = &Sample> {
        let start = (self.next + HISTORY_SIZE - self.len) % HISTORY_SIZE;
        (0..self.len).map(move |i| &self.samples[(start + i) % HISTORY_SIZE])
    }
}

/// Estimates pointer velocity from a sliding window of positions.
#[derive(Debug, Clone)]
pub struct VelocityTracker {
    pointers: Vec<History>,
    tracked_ids: BitSet32,
    last_event_time: Nanos,
}

impl Default for VelocityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VelocityTracker {
    pub fn new() -> Self {
        VelocityTracker {
            pointers: vec![History::default(); MAX_POINTER_ID + 1],
            tracked_ids: BitSet32::new(),
            last_event_time: 0,
        }
    }

    /// Forgets all pointers.
    pub fn clear(&mut self) {
        for history in &mut self.pointers {
            history.clear();
        }
        self.tracked_ids.clear();
    }

    /// Records one frame of positions. `positions` holds one entry per id in
    /// `id_bits`, in ascending id order. Pointers absent from `id_bits` stop
    /// being tracked.
    pub fn add_movement(&mut self, when: Nanos, id_bits: BitSet32, positions: &[(f32, f32)]) {
        for id in (self.tracked_ids & !id_bits).iter() {
            self.pointers[id as usize].clear();
        }
        self.tracked_ids = id_bits;
        self.last_event_time = when;

        for (index, id) in id_bits.iter().enumerate() {
            let (x, y) = positions[index];
            self.pointers[id as usize].push(Sample { when, x, y });
        }
    }

    /// Least-squares velocity of the pointer in units per second, or `None`
    /// if there is not enough recent history.
    pub fn velocity(&self, id: u32) -> Option<(f32, f32)> {
        if id as usize > MAX_POINTER_ID || !self.tracked_ids.has_bit(id) {
            return None;
        }
        let history = &self.pointers[id as usize];
        let newest = history.iter().last()?.when;
        let horizon = newest - HORIZON;

        let mut n = 0.0f32;
        let (mut sum_t, mut sum_x, mut sum_y) = (0.0f32, 0.0f32, 0.0f32);
        let (mut sum_tt, mut sum_tx, mut sum_ty) = (0.0f32, 0.0f32, 0.0f32);
        for sample in history.iter().filter(|s| s.when >= horizon) {
            let t = (sample.when - newest) as f32 * 1e-9;
            n += 1.0;
            sum_t += t;
            sum_x += sample.x;
            sum_y += sample.y;
            sum_tt += t * t;
            sum_tx += t * sample.x;
            sum_ty += t * sample.y;
        }
        if n < 2.0 {
            return None;
        }
        let denom = n * sum_tt - sum_t * sum_t;
        if denom.abs() <= f32::EPSILON {
            return None;
        }
        let vx = (n * sum_tx - sum_t * sum_x) / denom;
        let vy = (n * sum_ty - sum_t * sum_y) / denom;
        Some((vx, vy))
    }
}

/// Parameters of the speed-dependent gain curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityControlParameters {
    /// Base gain applied to all movements.
    pub scale: f32,
    /// Speed (after base gain, units per second) below which no acceleration
    /// is applied.
    pub low_threshold: f32,
    /// Speed at which full acceleration is reached.
    pub high_threshold: f32,
    /// Gain multiplier at and above the high threshold.
    pub acceleration: f32,
}

impl VelocityControlParameters {
    pub fn new(scale: f32, low_threshold: f32, high_threshold: f32, acceleration: f32) -> Self {
        VelocityControlParameters {
            scale,
            low_threshold,
            high_threshold,
            acceleration,
        }
    }
}

impl Default for VelocityControlParameters {
    fn default() -> Self {
        VelocityControlParameters::new(1.0, 0.0, f32::MAX, 1.0)
    }
}

/// If no movements are received within this time the control resets, so a
/// pause in motion does not inherit stale acceleration.
const STOP_TIME: Nanos = 500 * 1_000_000; // 500 ms

/// Applies the gain curve to relative movements.
#[derive(Debug, Clone)]
pub struct VelocityControl {
    parameters: VelocityControlParameters,
    last_movement_time: Nanos,
    raw_x: f32,
    raw_y: f32,
    tracker: VelocityTracker,
}

impl Default for VelocityControl {
    fn default() -> Self {
        Self::new()
    }
}

impl VelocityControl {
    pub fn new() -> Self {
        VelocityControl {
            parameters: VelocityControlParameters::default(),
            last_movement_time: 0,
            raw_x: 0.0,
            raw_y: 0.0,
            tracker: VelocityTracker::new(),
        }
    }

    pub fn set_parameters(&mut self, parameters: VelocityControlParameters) {
        self.parameters = parameters;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last_movement_time = i64::MIN;
        self.raw_x = 0.0;
        self.raw_y = 0.0;
        self.tracker.clear();
    }

    /// Scales `delta_x`/`delta_y` in place according to the current speed.
    pub fn apply(&mut self, when: Nanos, delta_x: &mut f32, delta_y: &mut f32) {
        if *delta_x == 0.0 && *delta_y == 0.0 {
            self.reset();
            return;
        }
        if when >= self.last_movement_time.saturating_add(STOP_TIME) {
            self.reset();
        }
        self.last_movement_time = when;
        self.raw_x += *delta_x;
        self.raw_y += *delta_y;
        let mut ids = BitSet32::new();
        ids.mark_bit(0);
        self.tracker
            .add_movement(when, ids, &[(self.raw_x, self.raw_y)]);

        let mut scale = self.parameters.scale;
        if let Some((vx, vy)) = self.tracker.velocity(0) {
            let speed = (vx * vx + vy * vy).sqrt() * scale;
            if speed >= self.parameters.high_threshold {
                scale *= self.parameters.acceleration;
            } else if speed > self.parameters.low_threshold {
                // Ramp the acceleration linearly between the thresholds.
                scale *= 1.0
                    + (speed - self.parameters.low_threshold)
                        / (self.parameters.high_threshold - self.parameters.low_threshold)
                        * (self.parameters.acceleration - 1.0);
            }
        }
        *delta_x *= scale;
        *delta_y *= scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Nanos = 1_000_000;

    fn one_pointer() -> BitSet32 {
        let mut ids = BitSet32::new();
        ids.mark_bit(0);
        ids
    }

    #[test]
    fn velocity_of_uniform_motion() {
        let mut tracker = VelocityTracker::new();
        // 1000 units per second along +x.
        for i in 0..10 {
            tracker.add_movement(i * 10 * MS, one_pointer(), &[(i as f32 * 10.0, 0.0)]);
        }
        let (vx, vy) = tracker.velocity(0).unwrap();
        assert!((vx - 1000.0).abs() < 1.0, "vx = {vx}");
        assert!(vy.abs() < 1.0, "vy = {vy}");
    }

    #[test]
    fn velocity_needs_history() {
        let mut tracker = VelocityTracker::new();
        assert!(tracker.velocity(0).is_none());
        tracker.add_movement(0, one_pointer(), &[(0.0, 0.0)]);
        assert!(tracker.velocity(0).is_none());
    }

    #[test]
    fn lifted_pointer_is_forgotten() {
        let mut tracker = VelocityTracker::new();
        for i in 0..5 {
            tracker.add_movement(i * 10 * MS, one_pointer(), &[(i as f32, 0.0)]);
        }
        assert!(tracker.velocity(0).is_some());
        tracker.add_movement(60 * MS, BitSet32::new(), &[]);
        assert!(tracker.velocity(0).is_none());
    }

    #[test]
    fn control_scales_but_does_not_accelerate_slow_motion() {
        let mut control = VelocityControl::new();
        control.set_parameters(VelocityControlParameters::new(2.0, 500.0, 3000.0, 3.0));
        let mut when = 0;
        let mut last = (0.0, 0.0);
        for _ in 0..10 {
            let mut dx = 1.0;
            let mut dy = 0.0;
            control.apply(when, &mut dx, &mut dy);
            last = (dx, dy);
            when += 20 * MS;
        }
        // 50 units/s raw, well below the low threshold: only the base scale.
        assert_eq!(last, (2.0, 0.0));
    }

    #[test]
    fn control_accelerates_fast_motion() {
        let mut control = VelocityControl::new();
        control.set_parameters(VelocityControlParameters::new(1.0, 10.0, 100.0, 4.0));
        let mut when = 0;
        let mut last_dx = 0.0;
        for _ in 0..10 {
            let mut dx = 50.0; // 5000 units/s, far above the high threshold
            let mut dy = 0.0;
            control.apply(when, &mut dx, &mut dy);
            last_dx = dx;
            when += 10 * MS;
        }
        assert_eq!(last_dx, 200.0);
    }
}
