//! Touch mapper core, shared by the single-touch and multi-touch protocols.
//!
//! The protocol decoders fill [`RawPointerData`] and call
//! [`TouchMapper::sync_touch`]; everything from there on is common:
//! calibration, the surface transform, virtual-key discrimination, pointer-id
//! assignment, hover tracking, dispatch, and (for touchpads acting as a
//! pointer) gesture detection.

use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codes::{
    axis, motion, ButtonState, KeyAction, KeyFlags, KeyState, PolicyFlags, Source, ToolType,
};
use crate::hub::RawAbsoluteAxisInfo;
use crate::listener::{
    InputDeviceInfo, KeyArgs, MotionArgs, MotionPointer, MotionRange, NotifyArgs, PointerCoords,
    PointerProperties, MAX_POINTERS, MAX_POINTER_ID,
};
use crate::policy::{ConfigChanges, PointerController, Transition};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::{avg, BitSet32, Nanos, Rotation};

mod gesture;
pub mod multi;
pub mod single;

pub use self::multi::MultiTouchMapper;
pub use self::single::SingleTouchMapper;

pub(crate) use self::gesture::PointerGesture;

const ID_SLOTS: usize = MAX_POINTER_ID as usize + 1;

/// Raw per-pointer integer axes as reported by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RawPointer {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub pressure: i32,
    pub touch_major: i32,
    pub touch_minor: i32,
    pub tool_major: i32,
    pub tool_minor: i32,
    pub orientation: i32,
    pub distance: i32,
    pub tilt_x: i32,
    pub tilt_y: i32,
    pub tool_type: ToolType,
    pub is_hovering: bool,
}

/// One frame of raw pointers with the id bookkeeping tables.
#[derive(Debug, Clone)]
pub(crate) struct RawPointerData {
    pub pointer_count: usize,
    pub pointers: [RawPointer; MAX_POINTERS],
    pub hovering_id_bits: BitSet32,
    pub touching_id_bits: BitSet32,
    pub id_to_index: [u32; ID_SLOTS],
}

impl Default for RawPointerData {
    fn default() -> Self {
        RawPointerData {
            pointer_count: 0,
            pointers: [RawPointer::default(); MAX_POINTERS],
            hovering_id_bits: BitSet32::new(),
            touching_id_bits: BitSet32::new(),
            id_to_index: [0; ID_SLOTS],
        }
    }
}

impl RawPointerData {
    pub fn clear(&mut self) {
        self.pointer_count = 0;
        self.hovering_id_bits.clear();
        self.touching_id_bits.clear();
    }

    pub fn id_bits(&self) -> BitSet32 {
        self.touching_id_bits | self.hovering_id_bits
    }

    pub fn mark_id_bit(&mut self, id: u32, hovering: bool) {
        if hovering {
            self.hovering_id_bits.mark_bit(id);
        } else {
            self.touching_id_bits.mark_bit(id);
        }
    }

    pub fn pointer_for_id(&self, id: u32) -> &RawPointer {
        &self.pointers[self.id_to_index[id as usize] as usize]
    }

    /// Centroid of the touching pointers in raw coordinates.
    pub fn centroid_of_touching(&self) -> (f32, f32) {
        let count = self.touching_id_bits.count();
        if count == 0 {
            return (0.0, 0.0);
        }
        let (mut x, mut y) = (0.0f32, 0.0f32);
        for id in self.touching_id_bits.iter() {
            let pointer = self.pointer_for_id(id);
            x += pointer.x as f32;
            y += pointer.y as f32;
        }
        (x / count as f32, y / count as f32)
    }
}

/// One frame of cooked pointers in display space.
#[derive(Debug, Clone)]
pub(crate) struct CookedPointerData {
    pub pointer_count: usize,
    pub properties: [PointerProperties; MAX_POINTERS],
    pub coords: [PointerCoords; MAX_POINTERS],
    pub hovering_id_bits: BitSet32,
    pub touching_id_bits: BitSet32,
    pub id_to_index: [u32; ID_SLOTS],
}

impl Default for CookedPointerData {
    fn default() -> Self {
        CookedPointerData {
            pointer_count: 0,
            properties: [PointerProperties::default(); MAX_POINTERS],
            coords: [PointerCoords::default(); MAX_POINTERS],
            hovering_id_bits: BitSet32::new(),
            touching_id_bits: BitSet32::new(),
            id_to_index: [0; ID_SLOTS],
        }
    }
}

impl CookedPointerData {
    pub fn clear(&mut self) {
        self.pointer_count = 0;
        self.hovering_id_bits.clear();
        self.touching_id_bits.clear();
    }
}

/// Raw axis ranges gathered by the protocol decoder.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawPointerAxes {
    pub x: RawAbsoluteAxisInfo,
    pub y: RawAbsoluteAxisInfo,
    pub pressure: RawAbsoluteAxisInfo,
    pub touch_major: RawAbsoluteAxisInfo,
    pub touch_minor: RawAbsoluteAxisInfo,
    pub tool_major: RawAbsoluteAxisInfo,
    pub tool_minor: RawAbsoluteAxisInfo,
    pub orientation: RawAbsoluteAxisInfo,
    pub distance: RawAbsoluteAxisInfo,
    pub tilt_x: RawAbsoluteAxisInfo,
    pub tilt_y: RawAbsoluteAxisInfo,
    pub tracking_id: RawAbsoluteAxisInfo,
    pub slot: RawAbsoluteAxisInfo,
}

/// How the device surface maps to output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceMode {
    /// Input is discarded, typically because a required axis is missing.
    Disabled,
    /// Direct mapping onto the display (touchscreen).
    Direct,
    /// Unscaled device coordinates (touchpad).
    Unscaled,
    /// Gestures drive a cursor (touchpad as pointer).
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceType {
    TouchScreen,
    TouchPad,
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GestureMode {
    Pointer,
    Spots,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TouchParameters {
    pub device_type: DeviceType,
    pub gesture_mode: GestureMode,
    pub orientation_aware: bool,
    pub associated_display_id: i32,
}

// --- calibration ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SizeCalibration {
    #[default]
    Default,
    None,
    /// Sizes are in the same units as position and scale geometrically.
    Geometric,
    /// Sizes are linear diameters.
    Diameter,
    /// Sizes are areas; the diameter is the square root.
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PressureCalibration {
    #[default]
    Default,
    None,
    /// The axis reports physical pressure.
    Physical,
    /// The axis reports signal amplitude.
    Amplitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PressureSource {
    #[default]
    Default,
    Pressure,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum OrientationCalibration {
    #[default]
    Default,
    None,
    /// The axis interpolates linearly over ±π/2.
    Interpolated,
    /// The axis packs a direction vector into two signed nibbles.
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DistanceCalibration {
    #[default]
    Default,
    None,
    Scaled,
}

/// Parsed calibration properties; immutable after resolution.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Calibration {
    pub size: SizeCalibration,
    pub size_scale: Option<f32>,
    pub size_bias: Option<f32>,
    pub size_is_summed: Option<bool>,
    pub pressure: PressureCalibration,
    pub pressure_source: PressureSource,
    pub pressure_scale: Option<f32>,
    pub orientation: OrientationCalibration,
    pub distance: DistanceCalibration,
    pub distance_scale: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CurrentVirtualKey {
    down: bool,
    down_time: Nanos,
    key_code: i32,
    scan_code: i32,
}

/// A virtual key hit box in raw device coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VirtualKey {
    pub key_code: i32,
    pub scan_code: i32,
    pub flags: PolicyFlags,
    pub hit_left: i32,
    pub hit_top: i32,
    pub hit_right: i32,
    pub hit_bottom: i32,
}

impl VirtualKey {
    fn is_hit(&self, x: i32, y: i32) -> bool {
        x >= self.hit_left && x <= self.hit_right && y >= self.hit_top && y <= self.hit_bottom
    }
}

/// The shared touch pipeline.
pub struct TouchMapper {
    pub(crate) touch_source: Source,
    pub(crate) pointer_source: Source,
    pub(crate) device_mode: DeviceMode,
    pub(crate) parameters: TouchParameters,
    pub(crate) calibration: Calibration,
    pub(crate) raw_axes: RawPointerAxes,

    pub(crate) current_raw: RawPointerData,
    pub(crate) last_raw: RawPointerData,
    pub(crate) current_cooked: CookedPointerData,
    pub(crate) last_cooked: CookedPointerData,
    pub(crate) current_button_state: ButtonState,
    pub(crate) last_button_state: ButtonState,

    sent_hover_enter: bool,
    down_time: Nanos,
    drop_stroke_until_up: bool,

    pub(crate) pointer_controller: Option<Arc<dyn PointerController>>,
    virtual_keys: Vec<VirtualKey>,
    current_virtual_key: CurrentVirtualKey,

    // Surface configuration; recomputed when rotation, size or axis ranges
    // change.
    pub(crate) surface_orientation: Rotation,
    surface_width: i32,
    surface_height: i32,
    associated_display_width: i32,
    associated_display_height: i32,
    x_scale: f32,
    y_scale: f32,
    x_precision: f32,
    y_precision: f32,
    geometric_scale: f32,
    tool_size_linear_scale: f32,
    tool_size_linear_bias: f32,
    tool_size_area_scale: f32,
    tool_size_area_bias: f32,
    pressure_scale: f32,
    size_scale: f32,
    orientation_scale: f32,
    distance_scale: f32,
    have_tilt: bool,
    tilt_x_center: f32,
    tilt_x_scale: f32,
    tilt_y_center: f32,
    tilt_y_scale: f32,
    oriented_ranges: Vec<MotionRange>,
    oriented_x_precision: f32,
    oriented_y_precision: f32,

    // Gesture detection scales, valid in pointer mode.
    pub(crate) pointer_gesture_x_movement_scale: f32,
    pub(crate) pointer_gesture_y_movement_scale: f32,
    pub(crate) pointer_gesture_x_zoom_scale: f32,
    pub(crate) pointer_gesture_y_zoom_scale: f32,
    pub(crate) pointer_gesture_max_swipe_width: f32,
    pub(crate) gesture: PointerGesture,
}

impl TouchMapper {
    pub(crate) fn new() -> Self {
        TouchMapper {
            touch_source: Source::TOUCHSCREEN,
            pointer_source: Source::empty(),
            device_mode: DeviceMode::Disabled,
            parameters: TouchParameters {
                device_type: DeviceType::TouchScreen,
                gesture_mode: GestureMode::Spots,
                orientation_aware: true,
                associated_display_id: 0,
            },
            calibration: Calibration::default(),
            raw_axes: RawPointerAxes::default(),
            current_raw: RawPointerData::default(),
            last_raw: RawPointerData::default(),
            current_cooked: CookedPointerData::default(),
            last_cooked: CookedPointerData::default(),
            current_button_state: ButtonState::empty(),
            last_button_state: ButtonState::empty(),
            sent_hover_enter: false,
            down_time: 0,
            drop_stroke_until_up: false,
            pointer_controller: None,
            virtual_keys: Vec::new(),
            current_virtual_key: CurrentVirtualKey::default(),
            surface_orientation: Rotation::Rot0,
            surface_width: -1,
            surface_height: -1,
            associated_display_width: 0,
            associated_display_height: 0,
            x_scale: 1.0,
            y_scale: 1.0,
            x_precision: 1.0,
            y_precision: 1.0,
            geometric_scale: 1.0,
            tool_size_linear_scale: 0.0,
            tool_size_linear_bias: 0.0,
            tool_size_area_scale: 0.0,
            tool_size_area_bias: 0.0,
            pressure_scale: 0.0,
            size_scale: 0.0,
            orientation_scale: 0.0,
            distance_scale: 0.0,
            have_tilt: false,
            tilt_x_center: 0.0,
            tilt_x_scale: 0.0,
            tilt_y_center: 0.0,
            tilt_y_scale: 0.0,
            oriented_ranges: Vec::new(),
            oriented_x_precision: 1.0,
            oriented_y_precision: 1.0,
            pointer_gesture_x_movement_scale: 1.0,
            pointer_gesture_y_movement_scale: 1.0,
            pointer_gesture_x_zoom_scale: 1.0,
            pointer_gesture_y_zoom_scale: 1.0,
            pointer_gesture_max_swipe_width: 0.0,
            gesture: PointerGesture::new(),
        }
    }

    pub fn sources(&self) -> Source {
        self.touch_source | self.pointer_source
    }

    pub fn populate_device_info(&self, info: &mut InputDeviceInfo) {
        for range in &self.oriented_ranges {
            info.add_motion_range(*range);
        }
        if let Some(controller) = &self.pointer_controller {
            if let Some((min_x, min_y, max_x, max_y)) = controller.bounds() {
                info.add_motion_range(MotionRange {
                    axis: axis::X,
                    source: self.pointer_source,
                    min: min_x,
                    max: max_x,
                    flat: 0.0,
                    fuzz: 0.0,
                });
                info.add_motion_range(MotionRange {
                    axis: axis::Y,
                    source: self.pointer_source,
                    min: min_y,
                    max: max_y,
                    flat: 0.0,
                    fuzz: 0.0,
                });
                info.add_motion_range(MotionRange {
                    axis: axis::PRESSURE,
                    source: self.pointer_source,
                    min: 0.0,
                    max: 1.0,
                    flat: 0.0,
                    fuzz: 0.0,
                });
            }
        }
    }

    /// Configures parameters, calibration and surface. The protocol decoder
    /// must have filled `raw_axes` before the first call.
    pub(crate) fn configure(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        changes: ConfigChanges,
    ) {
        if changes.is_empty() {
            self.configure_parameters(ctx, dev);

            match self.parameters.device_type {
                DeviceType::TouchScreen => {
                    self.touch_source = Source::TOUCHSCREEN;
                    self.pointer_source = Source::empty();
                }
                DeviceType::TouchPad => {
                    self.touch_source = Source::TOUCHPAD;
                    self.pointer_source = Source::empty();
                }
                DeviceType::Pointer => {
                    self.touch_source = Source::TOUCHPAD;
                    self.pointer_source = Source::MOUSE;
                }
            }

            self.parse_calibration(dev);
            self.resolve_calibration();
        }

        if changes.is_empty() || changes.contains(ConfigChanges::POINTER_SPEED) {
            self.gesture
                .pointer_velocity_control
                .set_parameters(ctx.config.pointer_velocity_control);
        }

        if changes.is_empty() || changes.contains(ConfigChanges::DISPLAY_INFO) {
            self.configure_surface(ctx, dev);
        }

        if changes.contains(ConfigChanges::POINTER_GESTURE_ENABLEMENT) {
            self.gesture.reset();
        }
    }

    fn configure_parameters(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) {
        use crate::codes::{input_prop, rel};

        // Spot presentation needs distinct multitouch; semi-MT pads fall
        // back to the plain pointer presentation.
        self.parameters.gesture_mode =
            if ctx.hub.has_input_property(dev.id, input_prop::SEMI_MT) {
                GestureMode::Pointer
            } else {
                GestureMode::Spots
            };
        if let Some(mode) = dev.configuration.get_string("touch.gestureMode") {
            match mode {
                "pointer" => self.parameters.gesture_mode = GestureMode::Pointer,
                "spots" => self.parameters.gesture_mode = GestureMode::Spots,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.gestureMode"),
            }
        }

        self.parameters.device_type = if ctx.hub.has_relative_axis(dev.id, rel::X)
            || ctx.hub.has_relative_axis(dev.id, rel::Y)
        {
            // A cursor device with a touch pad attached; do not use the pad
            // to move the pointer.
            DeviceType::TouchPad
        } else if ctx.hub.has_input_property(dev.id, input_prop::DIRECT) {
            DeviceType::TouchScreen
        } else {
            DeviceType::Pointer
        };
        if let Some(device_type) = dev.configuration.get_string("touch.deviceType") {
            match device_type {
                "touchScreen" => self.parameters.device_type = DeviceType::TouchScreen,
                "touchPad" => self.parameters.device_type = DeviceType::TouchPad,
                "pointer" => self.parameters.device_type = DeviceType::Pointer,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.deviceType"),
            }
        }

        self.parameters.orientation_aware =
            self.parameters.device_type == DeviceType::TouchScreen;
        if let Some(aware) = dev.configuration.get_bool("touch.orientationAware") {
            self.parameters.orientation_aware = aware;
        }

        self.parameters.associated_display_id = if self.parameters.orientation_aware
            || self.parameters.device_type == DeviceType::TouchScreen
            || self.parameters.device_type == DeviceType::Pointer
        {
            0
        } else {
            -1
        };
    }

    fn parse_calibration(&mut self, dev: &DeviceContext<'_>) {
        let config = dev.configuration;
        let out = &mut self.calibration;

        out.size = SizeCalibration::Default;
        if let Some(value) = config.get_string("touch.size.calibration") {
            match value {
                "none" => out.size = SizeCalibration::None,
                "geometric" => out.size = SizeCalibration::Geometric,
                "diameter" => out.size = SizeCalibration::Diameter,
                "area" => out.size = SizeCalibration::Area,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.size.calibration"),
            }
        }
        out.size_scale = config.get_f32("touch.size.scale");
        out.size_bias = config.get_f32("touch.size.bias");
        out.size_is_summed = config.get_bool("touch.size.isSummed");

        out.pressure = PressureCalibration::Default;
        if let Some(value) = config.get_string("touch.pressure.calibration") {
            match value {
                "none" => out.pressure = PressureCalibration::None,
                "physical" => out.pressure = PressureCalibration::Physical,
                "amplitude" => out.pressure = PressureCalibration::Amplitude,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.pressure.calibration"),
            }
        }
        out.pressure_source = PressureSource::Default;
        if let Some(value) = config.get_string("touch.pressure.source") {
            match value {
                "pressure" => out.pressure_source = PressureSource::Pressure,
                "touch" => out.pressure_source = PressureSource::Touch,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.pressure.source"),
            }
        }
        out.pressure_scale = config.get_f32("touch.pressure.scale");

        out.orientation = OrientationCalibration::Default;
        if let Some(value) = config.get_string("touch.orientation.calibration") {
            match value {
                "none" => out.orientation = OrientationCalibration::None,
                "interpolated" => out.orientation = OrientationCalibration::Interpolated,
                "vector" => out.orientation = OrientationCalibration::Vector,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.orientation.calibration"),
            }
        }

        out.distance = DistanceCalibration::Default;
        if let Some(value) = config.get_string("touch.distance.calibration") {
            match value {
                "none" => out.distance = DistanceCalibration::None,
                "scaled" => out.distance = DistanceCalibration::Scaled,
                "default" => {}
                other => warn!(value = other, "invalid value for touch.distance.calibration"),
            }
        }
        out.distance_scale = config.get_f32("touch.distance.scale");
    }

    fn resolve_calibration(&mut self) {
        let axes = &self.raw_axes;
        let out = &mut self.calibration;

        if out.pressure_source == PressureSource::Default {
            if axes.pressure.valid {
                out.pressure_source = PressureSource::Pressure;
            } else if axes.touch_major.valid {
                out.pressure_source = PressureSource::Touch;
            }
        } else if out.pressure_source == PressureSource::Pressure && !axes.pressure.valid {
            warn!("touch.pressure.source is 'pressure' but the axis is not available");
        } else if out.pressure_source == PressureSource::Touch && !axes.touch_major.valid {
            warn!("touch.pressure.source is 'touch' but the touchMajor axis is not available");
        }

        if out.pressure == PressureCalibration::Default {
            out.pressure = if out.pressure_source != PressureSource::Default {
                PressureCalibration::Amplitude
            } else {
                PressureCalibration::None
            };
        }

        if out.size == SizeCalibration::Default {
            out.size = if axes.tool_major.valid || axes.touch_major.valid {
                SizeCalibration::Geometric
            } else {
                SizeCalibration::None
            };
        }

        if out.orientation == OrientationCalibration::Default {
            out.orientation = if axes.orientation.valid {
                OrientationCalibration::Interpolated
            } else {
                OrientationCalibration::None
            };
        }

        if out.distance == DistanceCalibration::Default {
            out.distance = if axes.distance.valid {
                DistanceCalibration::Scaled
            } else {
                DistanceCalibration::None
            };
        }
    }

    /// Recomputes scales, ranges and virtual keys. Returns false while the
    /// device cannot produce motions.
    fn configure_surface(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) -> bool {
        if !self.raw_axes.x.valid || !self.raw_axes.y.valid {
            if self.device_mode != DeviceMode::Disabled {
                warn!(
                    device = dev.name,
                    "touch device did not report support for X or Y axis, it will be inoperable"
                );
                self.device_mode = DeviceMode::Disabled;
            }
            return false;
        }

        let mut orientation = Rotation::Rot0;
        let mut width = self.raw_axes.x.range_span();
        let mut height = self.raw_axes.y.range_span();

        if self.parameters.associated_display_id >= 0 {
            let Some(viewport) = ctx
                .policy
                .display_viewport(self.parameters.associated_display_id, dev.external)
            else {
                return false;
            };
            self.associated_display_width = viewport.width;
            self.associated_display_height = viewport.height;

            // A touch screen inherits the dimensions of the display.
            if self.parameters.device_type == DeviceType::TouchScreen {
                width = viewport.width;
                height = viewport.height;
            }
            if self.parameters.orientation_aware {
                orientation = viewport.rotation;
            }
        }

        self.device_mode = match self.parameters.device_type {
            DeviceType::TouchScreen => DeviceMode::Direct,
            DeviceType::TouchPad => DeviceMode::Unscaled,
            DeviceType::Pointer => DeviceMode::Pointer,
        };

        if self.device_mode == DeviceMode::Pointer && self.pointer_controller.is_none() {
            self.pointer_controller = ctx.policy.obtain_pointer_controller(dev.id);
        }

        let orientation_changed = self.surface_orientation != orientation;
        let size_changed = self.surface_width != width || self.surface_height != height;
        if !orientation_changed && !size_changed {
            return true;
        }
        self.surface_orientation = orientation;

        if size_changed {
            info!(
                device = dev.name,
                width, height, "touch surface size configured"
            );
            self.surface_width = width;
            self.surface_height = height;

            self.x_scale = width as f32 / self.raw_axes.x.range_span() as f32;
            self.y_scale = height as f32 / self.raw_axes.y.range_span() as f32;
            self.x_precision = 1.0 / self.x_scale;
            self.y_precision = 1.0 / self.y_scale;

            self.configure_virtual_keys(ctx, dev);

            // Scale factor for terms that are not oriented in a particular
            // axis. If the pixels are not square we fake it with an average.
            self.geometric_scale = avg(self.x_scale, self.y_scale);

            // Tool and touch size factors.
            self.tool_size_linear_scale = 0.0;
            self.tool_size_linear_bias = 0.0;
            self.tool_size_area_scale = 0.0;
            self.tool_size_area_bias = 0.0;
            match self.calibration.size {
                SizeCalibration::Diameter | SizeCalibration::Area => {
                    if let Some(scale) = self.calibration.size_scale {
                        self.tool_size_linear_scale = scale;
                    } else if self.raw_axes.tool_major.valid && self.raw_axes.tool_major.max != 0 {
                        self.tool_size_linear_scale =
                            width.min(height) as f32 / self.raw_axes.tool_major.max as f32;
                    }
                    if let Some(bias) = self.calibration.size_bias {
                        self.tool_size_linear_bias = bias;
                    }
                    if self.calibration.size == SizeCalibration::Area {
                        if self.raw_axes.tool_major.valid && self.raw_axes.tool_major.max != 0 {
                            self.tool_size_area_scale = 1.0 / self.raw_axes.tool_major.max as f32;
                        }
                    }
                }
                SizeCalibration::Geometric | SizeCalibration::None | SizeCalibration::Default => {}
            }

            // Pressure factors.
            self.pressure_scale = 0.0;
            if self.calibration.pressure != PressureCalibration::None {
                let pressure_axis = match self.calibration.pressure_source {
                    PressureSource::Pressure => self.raw_axes.pressure,
                    PressureSource::Touch => self.raw_axes.touch_major,
                    PressureSource::Default => RawAbsoluteAxisInfo::default(),
                };
                if let Some(scale) = self.calibration.pressure_scale {
                    self.pressure_scale = scale;
                } else if pressure_axis.valid && pressure_axis.max != 0 {
                    self.pressure_scale = 1.0 / pressure_axis.max as f32;
                }
            }

            // Normalized size factor.
            self.size_scale = 0.0;
            if self.calibration.size != SizeCalibration::None {
                if self.raw_axes.tool_major.valid && self.raw_axes.tool_major.max != 0 {
                    self.size_scale = 1.0 / self.raw_axes.tool_major.max as f32;
                } else if self.raw_axes.touch_major.valid && self.raw_axes.touch_major.max != 0 {
                    self.size_scale = 1.0 / self.raw_axes.touch_major.max as f32;
                }
            }

            // Orientation.
            self.orientation_scale = 0.0;
            if self.calibration.orientation == OrientationCalibration::Interpolated
                && self.raw_axes.orientation.valid
                && self.raw_axes.orientation.max != 0
            {
                self.orientation_scale =
                    std::f32::consts::FRAC_PI_2 / self.raw_axes.orientation.max as f32;
            }

            // Distance.
            self.distance_scale = 0.0;
            if self.calibration.distance == DistanceCalibration::Scaled {
                self.distance_scale = self.calibration.distance_scale.unwrap_or(1.0);
            }

            // Tilt.
            self.have_tilt = self.raw_axes.tilt_x.valid && self.raw_axes.tilt_y.valid;
            if self.have_tilt {
                self.tilt_x_center = avg(self.raw_axes.tilt_x.min as f32, self.raw_axes.tilt_x.max as f32);
                self.tilt_y_center = avg(self.raw_axes.tilt_y.min as f32, self.raw_axes.tilt_y.max as f32);
                self.tilt_x_scale = std::f32::consts::PI / 180.0;
                self.tilt_y_scale = std::f32::consts::PI / 180.0;
            }
        }

        // Oriented dimensions, precision and ranges.
        let (oriented_width, oriented_height) = if self.surface_orientation.is_quarter_turn() {
            (self.surface_height as f32, self.surface_width as f32)
        } else {
            (self.surface_width as f32, self.surface_height as f32)
        };
        if self.surface_orientation.is_quarter_turn() {
            self.oriented_x_precision = self.y_precision;
            self.oriented_y_precision = self.x_precision;
        } else {
            self.oriented_x_precision = self.x_precision;
            self.oriented_y_precision = self.y_precision;
        }
        self.rebuild_oriented_ranges(oriented_width, oriented_height);

        // Gesture detection parameters; scale a full touchpad swipe to a
        // fraction of the display diagonal.
        if self.parameters.device_type == DeviceType::Pointer {
            let raw_width = self.raw_axes.x.range_span() as f32;
            let raw_height = self.raw_axes.y.range_span() as f32;
            let raw_diagonal = raw_width.hypot(raw_height);
            let display_diagonal = (self.associated_display_width as f32)
                .hypot(self.associated_display_height as f32);

            self.pointer_gesture_x_movement_scale =
                ctx.config.pointer_gesture_movement_speed_ratio * display_diagonal / raw_diagonal;
            self.pointer_gesture_y_movement_scale = self.pointer_gesture_x_movement_scale;

            self.pointer_gesture_x_zoom_scale =
                ctx.config.pointer_gesture_zoom_speed_ratio * display_diagonal / raw_diagonal;
            self.pointer_gesture_y_zoom_scale = self.pointer_gesture_x_zoom_scale;

            self.pointer_gesture_max_swipe_width =
                ctx.config.pointer_gesture_swipe_max_width_ratio * raw_diagonal;

            self.gesture.reset();
            if self.parameters.gesture_mode == GestureMode::Spots {
                if let Some(controller) = &self.pointer_controller {
                    controller.clear_spots();
                }
            }
        }

        true
    }

    fn rebuild_oriented_ranges(&mut self, oriented_width: f32, oriented_height: f32) {
        let source = self.touch_source;
        self.oriented_ranges.clear();
        self.oriented_ranges.push(MotionRange {
            axis: axis::X,
            source,
            min: 0.0,
            max: oriented_width - 1.0,
            flat: 0.0,
            fuzz: if self.surface_orientation.is_quarter_turn() {
                self.y_scale
            } else {
                self.x_scale
            },
        });
        self.oriented_ranges.push(MotionRange {
            axis: axis::Y,
            source,
            min: 0.0,
            max: oriented_height - 1.0,
            flat: 0.0,
            fuzz: if self.surface_orientation.is_quarter_turn() {
                self.x_scale
            } else {
                self.y_scale
            },
        });
        if self.calibration.pressure != PressureCalibration::None {
            self.oriented_ranges.push(MotionRange {
                axis: axis::PRESSURE,
                source,
                min: 0.0,
                max: 1.0,
                flat: 0.0,
                fuzz: 0.0,
            });
        }
        if self.calibration.size != SizeCalibration::None {
            let diagonal = oriented_width.hypot(oriented_height);
            for size_axis in [
                axis::SIZE,
                axis::TOUCH_MAJOR,
                axis::TOUCH_MINOR,
                axis::TOOL_MAJOR,
                axis::TOOL_MINOR,
            ] {
                let max = if size_axis == axis::SIZE { 1.0 } else { diagonal };
                self.oriented_ranges.push(MotionRange {
                    axis: size_axis,
                    source,
                    min: 0.0,
                    max,
                    flat: 0.0,
                    fuzz: 0.0,
                });
            }
        }
        if self.calibration.orientation != OrientationCalibration::None {
            self.oriented_ranges.push(MotionRange {
                axis: axis::ORIENTATION,
                source,
                min: -std::f32::consts::FRAC_PI_2,
                max: std::f32::consts::FRAC_PI_2,
                flat: 0.0,
                fuzz: 0.0,
            });
        }
        if self.calibration.distance != DistanceCalibration::None {
            self.oriented_ranges.push(MotionRange {
                axis: axis::DISTANCE,
                source,
                min: self.raw_axes.distance.min as f32 * self.distance_scale,
                max: self.raw_axes.distance.max as f32 * self.distance_scale,
                flat: 0.0,
                fuzz: self.raw_axes.distance.fuzz as f32 * self.distance_scale,
            });
        }
    }

    fn configure_virtual_keys(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) {
        let definitions = ctx.hub.virtual_key_definitions(dev.id);
        self.virtual_keys.clear();
        if definitions.is_empty() {
            return;
        }

        let touch_left = self.raw_axes.x.min;
        let touch_top = self.raw_axes.y.min;
        let touch_width = self.raw_axes.x.range_span();
        let touch_height = self.raw_axes.y.range_span();

        for definition in definitions {
            let Some((key_code, flags)) = ctx.hub.map_key(dev.id, definition.scan_code) else {
                warn!(
                    scan_code = definition.scan_code,
                    "virtual key has no key code mapping, ignoring"
                );
                continue;
            };

            // Convert the display-space hit box into raw touch coordinates.
            let half_width = definition.width / 2;
            let half_height = definition.height / 2;
            self.virtual_keys.push(VirtualKey {
                key_code,
                scan_code: definition.scan_code,
                flags,
                hit_left: (definition.center_x - half_width) * touch_width / self.surface_width
                    + touch_left,
                hit_right: (definition.center_x + half_width) * touch_width / self.surface_width
                    + touch_left,
                hit_top: (definition.center_y - half_height) * touch_height / self.surface_height
                    + touch_top,
                hit_bottom: (definition.center_y + half_height) * touch_height
                    / self.surface_height
                    + touch_top,
            });
        }
    }

    pub(crate) fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        // A virtual key held across a reset is canceled rather than left
        // hanging.
        if self.current_virtual_key.down {
            self.current_virtual_key.down = false;
            self.dispatch_virtual_key(
                ctx,
                dev,
                when,
                PolicyFlags::empty(),
                KeyAction::Up,
                KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY | KeyFlags::CANCELED,
            );
        } else if !self.last_raw.id_bits().is_empty() {
            // Synthesize up events for whatever is still down.
            self.current_raw.clear();
            self.current_button_state = ButtonState::empty();
            self.sync_touch(ctx, dev, when, true);
        }

        self.current_raw.clear();
        self.last_raw.clear();
        self.current_cooked.clear();
        self.last_cooked.clear();
        self.current_button_state = ButtonState::empty();
        self.last_button_state = ButtonState::empty();
        self.sent_hover_enter = false;
        self.down_time = 0;
        self.drop_stroke_until_up = false;
        self.gesture.reset();

        if let Some(controller) = &self.pointer_controller {
            if self.parameters.gesture_mode == GestureMode::Spots {
                controller.fade(Transition::Gradual);
                controller.clear_spots();
            }
        }
    }

    pub(crate) fn timeout_expired(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
    ) {
        if self.device_mode == DeviceMode::Pointer && self.pointer_controller.is_some() {
            self.dispatch_pointer_gestures(ctx, dev, when, PolicyFlags::empty(), true);
        }
    }

    /// Processes one complete frame of raw pointer data.
    pub(crate) fn sync_touch(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        have_pointer_ids: bool,
    ) {
        if !self.configure_surface(ctx, dev) {
            return;
        }

        if !have_pointer_ids {
            self.assign_pointer_ids();
        }

        let mut policy_flags = PolicyFlags::empty();
        let initial_down = self.last_raw.touching_id_bits.is_empty()
            && !self.current_raw.touching_id_bits.is_empty();
        if initial_down {
            if self.parameters.device_type == DeviceType::TouchScreen {
                // Hide the pointer on an initial touchscreen down.
                ctx.fade_pointer();
            }
            // Initial downs on external touch devices wake the device;
            // internal touch screens stay quiet in your pocket.
            if dev.external {
                policy_flags |= PolicyFlags::WAKE_DROPPED;
            }
        }

        synthesize_button_keys_for_touch(
            ctx,
            dev,
            KeyAction::Down,
            when,
            self.touch_source,
            policy_flags,
            self.last_button_state,
            self.current_button_state,
        );

        let spurious = self.last_raw.id_bits().is_empty()
            && self.current_raw.id_bits().is_empty()
            && self.last_button_state == self.current_button_state;
        if spurious {
            // Nothing changed; do not even roll state.
            return;
        }

        if self.consume_raw_touches(ctx, dev, when, policy_flags) {
            // The stroke belongs to a virtual key or was dropped entirely.
            self.current_cooked.clear();
        } else {
            // Touch activity arms the virtual key quiet window.
            if ctx.config.virtual_key_quiet_time > 0
                && !self.current_raw.touching_id_bits.is_empty()
            {
                ctx.disable_virtual_keys_until(when + ctx.config.virtual_key_quiet_time);
            }

            self.cook_pointer_data();

            if self.device_mode == DeviceMode::Pointer
                && ctx.config.pointer_gestures_enabled
                && self.pointer_controller.is_some()
            {
                self.dispatch_pointer_gestures(ctx, dev, when, policy_flags, false);
            } else {
                self.dispatch_hover_exit(ctx, dev, when, policy_flags);
                self.dispatch_touches(ctx, dev, when, policy_flags);
                self.dispatch_hover_enter_and_move(ctx, dev, when, policy_flags);
            }
        }

        synthesize_button_keys_for_touch(
            ctx,
            dev,
            KeyAction::Up,
            when,
            self.touch_source,
            policy_flags,
            self.last_button_state,
            self.current_button_state,
        );

        self.last_raw = self.current_raw.clone();
        self.last_cooked = self.current_cooked.clone();
        self.last_button_state = self.current_button_state;
    }

    /// Virtual-key discrimination. Returns true when the frame is consumed.
    fn consume_raw_touches(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
    ) -> bool {
        if self.drop_stroke_until_up {
            if self.current_raw.touching_id_bits.is_empty() {
                self.drop_stroke_until_up = false;
            }
            return true;
        }

        if self.current_virtual_key.down {
            if self.current_raw.touching_id_bits.is_empty() {
                // Pointer went up while the virtual key was down.
                self.current_virtual_key.down = false;
                self.dispatch_virtual_key(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    KeyAction::Up,
                    KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY,
                );
                return true;
            }

            if self.current_raw.touching_id_bits.count() == 1 {
                let id = self.current_raw.touching_id_bits.first_marked_bit();
                let pointer = *self.current_raw.pointer_for_id(id);
                if let Some(virtual_key) = self.find_virtual_key_hit(pointer.x, pointer.y) {
                    if virtual_key.key_code == self.current_virtual_key.key_code {
                        // Still inside the same key.
                        return true;
                    }
                }
            }

            // The pointer left the key area or another pointer went down.
            // Cancel the key; a move into the display starts a fresh stroke.
            self.current_virtual_key.down = false;
            self.dispatch_virtual_key(
                ctx,
                dev,
                when,
                policy_flags,
                KeyAction::Up,
                KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY | KeyFlags::CANCELED,
            );

            let id = self.current_raw.touching_id_bits.first_marked_bit();
            let pointer = *self.current_raw.pointer_for_id(id);
            if self.is_point_inside_surface(pointer.x, pointer.y) {
                self.last_raw.clear();
                self.last_cooked.clear();
                return false;
            }
            self.drop_stroke_until_up = true;
            return true;
        }

        if !self.current_raw.touching_id_bits.is_empty()
            && self.last_raw.touching_id_bits.is_empty()
        {
            let id = self.current_raw.touching_id_bits.first_marked_bit();
            let pointer = *self.current_raw.pointer_for_id(id);
            if !self.is_point_inside_surface(pointer.x, pointer.y) {
                // Off-screen down. Exactly one pointer on a virtual key
                // becomes a key press; anything else drops the stroke.
                if self.current_raw.touching_id_bits.count() == 1 {
                    if let Some(virtual_key) = self.find_virtual_key_hit(pointer.x, pointer.y) {
                        let virtual_key = *virtual_key;
                        if ctx.should_drop_virtual_key(
                            when,
                            virtual_key.key_code,
                            virtual_key.scan_code,
                        ) {
                            self.drop_stroke_until_up = true;
                            return true;
                        }
                        self.current_virtual_key = CurrentVirtualKey {
                            down: true,
                            down_time: when,
                            key_code: virtual_key.key_code,
                            scan_code: virtual_key.scan_code,
                        };
                        self.dispatch_virtual_key(
                            ctx,
                            dev,
                            when,
                            policy_flags | virtual_key.flags,
                            KeyAction::Down,
                            KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY,
                        );
                        return true;
                    }
                }
                self.drop_stroke_until_up = true;
                return true;
            }
        }
        false
    }

    fn dispatch_virtual_key(
        &self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
    ) {
        let meta_state = ctx.global_meta_state;
        ctx.notify(NotifyArgs::Key(KeyArgs {
            when,
            device_id: dev.id,
            source: Source::KEYBOARD,
            policy_flags: policy_flags | PolicyFlags::VIRTUAL,
            action,
            flags,
            key_code: self.current_virtual_key.key_code,
            scan_code: self.current_virtual_key.scan_code,
            meta_state,
            down_time: self.current_virtual_key.down_time,
        }));
    }

    fn is_point_inside_surface(&self, x: i32, y: i32) -> bool {
        x >= self.raw_axes.x.min
            && x <= self.raw_axes.x.max
            && y >= self.raw_axes.y.min
            && y <= self.raw_axes.y.max
    }

    fn find_virtual_key_hit(&self, x: i32, y: i32) -> Option<&VirtualKey> {
        self.virtual_keys.iter().find(|key| key.is_hit(x, y))
    }

    /// Transforms the current raw frame into display-space coordinates.
    fn cook_pointer_data(&mut self) {
        let current_pointer_count = self.current_raw.pointer_count;
        self.current_cooked.pointer_count = current_pointer_count;
        self.current_cooked.hovering_id_bits = self.current_raw.hovering_id_bits;
        self.current_cooked.touching_id_bits = self.current_raw.touching_id_bits;
        self.current_cooked.id_to_index = self.current_raw.id_to_index;

        for index in 0..current_pointer_count {
            let input = self.current_raw.pointers[index];

            // Tool sizes.
            let (mut tool_major, mut tool_minor) = match self.calibration.size {
                SizeCalibration::Geometric => {
                    let major = input.tool_major as f32 * self.geometric_scale;
                    let minor = if self.raw_axes.tool_minor.valid {
                        input.tool_minor as f32 * self.geometric_scale
                    } else {
                        major
                    };
                    (major, minor)
                }
                SizeCalibration::Diameter => {
                    let major = if input.tool_major != 0 {
                        input.tool_major as f32 * self.tool_size_linear_scale
                            + self.tool_size_linear_bias
                    } else {
                        0.0
                    };
                    let minor = if self.raw_axes.tool_minor.valid {
                        if input.tool_minor != 0 {
                            input.tool_minor as f32 * self.tool_size_linear_scale
                                + self.tool_size_linear_bias
                        } else {
                            0.0
                        }
                    } else {
                        major
                    };
                    (major, minor)
                }
                SizeCalibration::Area => {
                    let major = if input.tool_major != 0 {
                        let diameter = (input.tool_major as f32 * self.tool_size_area_scale
                            + self.tool_size_area_bias)
                            .max(0.0)
                            .sqrt();
                        diameter * self.tool_size_linear_scale + self.tool_size_linear_bias
                    } else {
                        0.0
                    };
                    (major, major)
                }
                SizeCalibration::None | SizeCalibration::Default => (0.0, 0.0),
            };
            if self.calibration.size_is_summed == Some(true) && current_pointer_count > 0 {
                tool_major /= current_pointer_count as f32;
                tool_minor /= current_pointer_count as f32;
            }

            // Pressure.
            let raw_pressure = match self.calibration.pressure_source {
                PressureSource::Pressure => input.pressure,
                PressureSource::Touch => input.touch_major,
                PressureSource::Default => 0,
            };
            let pressure = match self.calibration.pressure {
                PressureCalibration::Physical | PressureCalibration::Amplitude => {
                    raw_pressure as f32 * self.pressure_scale
                }
                PressureCalibration::None | PressureCalibration::Default => {
                    if input.is_hovering {
                        0.0
                    } else {
                        1.0
                    }
                }
            };

            // Touch sizes.
            let (mut touch_major, mut touch_minor) = match self.calibration.size {
                SizeCalibration::Geometric => {
                    let major = input.touch_major as f32 * self.geometric_scale;
                    let minor = if self.raw_axes.touch_minor.valid {
                        input.touch_minor as f32 * self.geometric_scale
                    } else {
                        major
                    };
                    (major, minor)
                }
                SizeCalibration::Diameter | SizeCalibration::Area => {
                    (tool_major * pressure, tool_minor * pressure)
                }
                SizeCalibration::None | SizeCalibration::Default => (0.0, 0.0),
            };
            if touch_major > tool_major {
                touch_major = tool_major;
            }
            if touch_minor > tool_minor {
                touch_minor = tool_minor;
            }

            // Normalized size.
            let size = if self.calibration.size != SizeCalibration::None {
                let raw_size = if self.raw_axes.tool_minor.valid {
                    avg(input.tool_major as f32, input.tool_minor as f32)
                } else if input.tool_major != 0 {
                    input.tool_major as f32
                } else if self.raw_axes.touch_minor.valid {
                    avg(input.touch_major as f32, input.touch_minor as f32)
                } else {
                    input.touch_major as f32
                };
                raw_size * self.size_scale
            } else {
                0.0
            };

            // Orientation.
            let mut orientation = match self.calibration.orientation {
                OrientationCalibration::Interpolated => {
                    input.orientation as f32 * self.orientation_scale
                }
                OrientationCalibration::Vector => {
                    let c1 = sign_extend_nybble((input.orientation & 0xf0) >> 4);
                    let c2 = sign_extend_nybble(input.orientation & 0x0f);
                    if c1 != 0 || c2 != 0 {
                        let angle = (c1 as f32).atan2(c2 as f32) * 0.5;
                        let vector_scale = 1.0 + (c1 as f32).hypot(c2 as f32) / 16.0;
                        touch_major *= vector_scale;
                        touch_minor /= vector_scale;
                        tool_major *= vector_scale;
                        tool_minor /= vector_scale;
                        angle
                    } else {
                        0.0
                    }
                }
                OrientationCalibration::None | OrientationCalibration::Default => 0.0,
            };

            // Tilt.
            let tilt = if self.have_tilt {
                let tilt_x_angle = (input.tilt_x as f32 - self.tilt_x_center) * self.tilt_x_scale;
                let tilt_y_angle = (input.tilt_y as f32 - self.tilt_y_center) * self.tilt_y_scale;
                (tilt_x_angle.cos() * tilt_y_angle.cos()).acos()
            } else {
                0.0
            };

            // Distance.
            let distance = match self.calibration.distance {
                DistanceCalibration::Scaled => input.distance as f32 * self.distance_scale,
                DistanceCalibration::None | DistanceCalibration::Default => 0.0,
            };

            // X and Y, adjusted for surface orientation.
            let (x, y) = match self.surface_orientation {
                Rotation::Rot0 => (
                    (input.x - self.raw_axes.x.min) as f32 * self.x_scale,
                    (input.y - self.raw_axes.y.min) as f32 * self.y_scale,
                ),
                Rotation::Rot90 => {
                    orientation -= std::f32::consts::FRAC_PI_2;
                    if orientation < -std::f32::consts::FRAC_PI_2 {
                        orientation += std::f32::consts::PI;
                    }
                    (
                        (input.y - self.raw_axes.y.min) as f32 * self.y_scale,
                        (self.raw_axes.x.max - input.x) as f32 * self.x_scale,
                    )
                }
                Rotation::Rot180 => (
                    (self.raw_axes.x.max - input.x) as f32 * self.x_scale,
                    (self.raw_axes.y.max - input.y) as f32 * self.y_scale,
                ),
                Rotation::Rot270 => {
                    orientation += std::f32::consts::FRAC_PI_2;
                    if orientation > std::f32::consts::FRAC_PI_2 {
                        orientation -= std::f32::consts::PI;
                    }
                    (
                        (self.raw_axes.y.max - input.y) as f32 * self.y_scale,
                        (input.x - self.raw_axes.x.min) as f32 * self.x_scale,
                    )
                }
            };

            let coords = &mut self.current_cooked.coords[index];
            coords.clear();
            coords.set_axis_value(axis::X, x);
            coords.set_axis_value(axis::Y, y);
            coords.set_axis_value(axis::PRESSURE, pressure);
            coords.set_axis_value(axis::SIZE, size);
            coords.set_axis_value(axis::TOUCH_MAJOR, touch_major);
            coords.set_axis_value(axis::TOUCH_MINOR, touch_minor);
            coords.set_axis_value(axis::TOOL_MAJOR, tool_major);
            coords.set_axis_value(axis::TOOL_MINOR, tool_minor);
            coords.set_axis_value(axis::ORIENTATION, orientation);
            if distance != 0.0 {
                coords.set_axis_value(axis::DISTANCE, distance);
            }
            if self.have_tilt {
                coords.set_axis_value(axis::TILT, tilt);
            }

            let tool_type = self.resolve_tool_type(input.tool_type);
            let properties = &mut self.current_cooked.properties[index];
            properties.id = input.id;
            properties.tool_type = tool_type;
        }
    }

    fn resolve_tool_type(&self, tool_type: ToolType) -> ToolType {
        if tool_type == ToolType::Unknown {
            ToolType::Finger
        } else {
            tool_type
        }
    }

    fn dispatch_touches(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
    ) {
        let current_id_bits = self.current_cooked.touching_id_bits;
        let last_id_bits = self.last_cooked.touching_id_bits;
        if current_id_bits.is_empty() && last_id_bits.is_empty() {
            return;
        }

        let meta_state = ctx.global_meta_state;
        let button_state = self.current_button_state;

        if current_id_bits == last_id_bits {
            // No pointer id changes: at most a move.
            let moved = update_moved_pointers(
                &self.current_cooked.properties,
                &self.current_cooked.coords,
                &self.current_cooked.id_to_index,
                &mut self.last_cooked.properties,
                &mut self.last_cooked.coords,
                &self.last_cooked.id_to_index,
                current_id_bits,
            );
            if moved || button_state != self.last_button_state {
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.touch_source,
                    motion::ACTION_MOVE,
                    0,
                    meta_state,
                    button_state,
                    &self.current_cooked.properties,
                    &self.current_cooked.coords,
                    &self.current_cooked.id_to_index,
                    current_id_bits,
                    -1,
                    self.oriented_x_precision,
                    self.oriented_y_precision,
                    self.down_time,
                );
            }
        } else {
            // Pointers going up, going down and moving in one frame.
            let up_id_bits = last_id_bits & !current_id_bits;
            let down_id_bits = current_id_bits & !last_id_bits;
            let move_id_bits = last_id_bits & current_id_bits;
            let mut dispatched_id_bits = last_id_bits;

            // Update the last coordinates of the pointers that moved so the
            // up events observe the new positions of the survivors.
            let mut move_needed = update_moved_pointers(
                &self.current_cooked.properties,
                &self.current_cooked.coords,
                &self.current_cooked.id_to_index,
                &mut self.last_cooked.properties,
                &mut self.last_cooked.coords,
                &self.last_cooked.id_to_index,
                move_id_bits,
            );
            if button_state != self.last_button_state {
                move_needed = true;
            }

            for up_id in up_id_bits.iter() {
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.touch_source,
                    motion::ACTION_POINTER_UP,
                    0,
                    meta_state,
                    button_state,
                    &self.last_cooked.properties,
                    &self.last_cooked.coords,
                    &self.last_cooked.id_to_index,
                    dispatched_id_bits,
                    up_id as i32,
                    self.oriented_x_precision,
                    self.oriented_y_precision,
                    self.down_time,
                );
                dispatched_id_bits.clear_bit(up_id);
            }

            if move_needed && !move_id_bits.is_empty() {
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.touch_source,
                    motion::ACTION_MOVE,
                    0,
                    meta_state,
                    button_state,
                    &self.current_cooked.properties,
                    &self.current_cooked.coords,
                    &self.current_cooked.id_to_index,
                    dispatched_id_bits,
                    -1,
                    self.oriented_x_precision,
                    self.oriented_y_precision,
                    self.down_time,
                );
            }

            for down_id in down_id_bits.iter() {
                dispatched_id_bits.mark_bit(down_id);
                if dispatched_id_bits.count() == 1 {
                    // First pointer of a new stroke.
                    self.down_time = when;
                }
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.touch_source,
                    motion::ACTION_POINTER_DOWN,
                    0,
                    meta_state,
                    button_state,
                    &self.current_cooked.properties,
                    &self.current_cooked.coords,
                    &self.current_cooked.id_to_index,
                    dispatched_id_bits,
                    down_id as i32,
                    self.oriented_x_precision,
                    self.oriented_y_precision,
                    self.down_time,
                );
            }
        }
    }

    fn dispatch_hover_exit(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
    ) {
        if self.sent_hover_enter
            && (self.current_cooked.hovering_id_bits.is_empty()
                || !self.current_cooked.touching_id_bits.is_empty())
        {
            let hovering = self.last_cooked.hovering_id_bits;
            if !hovering.is_empty() {
                let meta_state = ctx.global_meta_state;
                dispatch_motion(
                    ctx,
                    dev,
                    when,
                    policy_flags,
                    self.touch_source,
                    motion::ACTION_HOVER_EXIT,
                    0,
                    meta_state,
                    self.current_button_state,
                    &self.last_cooked.properties,
                    &self.last_cooked.coords,
                    &self.last_cooked.id_to_index,
                    hovering,
                    -1,
                    self.oriented_x_precision,
                    self.oriented_y_precision,
                    self.down_time,
                );
            }
            self.sent_hover_enter = false;
        }
    }

    fn dispatch_hover_enter_and_move(
        &mut self,
        ctx: &mut ReaderContext<'_>,
        dev: &DeviceContext<'_>,
        when: Nanos,
        policy_flags: PolicyFlags,
    ) {
        let hovering = self.current_cooked.hovering_id_bits;
        if hovering.is_empty() || !self.current_cooked.touching_id_bits.is_empty() {
            return;
        }
        let meta_state = ctx.global_meta_state;
        if !self.sent_hover_enter {
            self.sent_hover_enter = true;
            dispatch_motion(
                ctx,
                dev,
                when,
                policy_flags,
                self.touch_source,
                motion::ACTION_HOVER_ENTER,
                0,
                meta_state,
                self.current_button_state,
                &self.current_cooked.properties,
                &self.current_cooked.coords,
                &self.current_cooked.id_to_index,
                hovering,
                -1,
                self.oriented_x_precision,
                self.oriented_y_precision,
                self.down_time,
            );
        }
        dispatch_motion(
            ctx,
            dev,
            when,
            policy_flags,
            self.touch_source,
            motion::ACTION_HOVER_MOVE,
            0,
            meta_state,
            self.current_button_state,
            &self.current_cooked.properties,
            &self.current_cooked.coords,
            &self.current_cooked.id_to_index,
            hovering,
            -1,
            self.oriented_x_precision,
            self.oriented_y_precision,
            self.down_time,
        );
    }

    /// Keeps pointer ids stable across frames when the protocol does not
    /// supply tracking ids, by matching pointers between frames in order of
    /// increasing squared distance.
    fn assign_pointer_ids(&mut self) {
        let current_pointer_count = self.current_raw.pointer_count;
        let last_pointer_count = self.last_raw.pointer_count;

        self.current_raw.hovering_id_bits.clear();
        self.current_raw.touching_id_bits.clear();

        if current_pointer_count == 0 {
            return;
        }
        if last_pointer_count == 0 {
            // All pointers are new.
            for index in 0..current_pointer_count {
                let hovering = self.current_raw.pointers[index].is_hovering;
                self.current_raw.pointers[index].id = index as u32;
                self.current_raw.id_to_index[index] = index as u32;
                self.current_raw.mark_id_bit(index as u32, hovering);
            }
            return;
        }
        if current_pointer_count == 1 && last_pointer_count == 1 {
            // No change in count, so the id carries over.
            let id = self.last_raw.pointers[0].id;
            let hovering = self.current_raw.pointers[0].is_hovering;
            self.current_raw.pointers[0].id = id;
            self.current_raw.id_to_index[id as usize] = 0;
            self.current_raw.mark_id_bit(id, hovering);
            return;
        }

        // General case: a heap of squared distances between every pairing,
        // consumed greedily in increasing order.
        #[derive(PartialEq, Eq)]
        struct HeapEntry {
            distance: u64,
            current_index: usize,
            last_index: usize,
        }
        impl Ord for HeapEntry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // Reversed for a min-heap.
                other
                    .distance
                    .cmp(&self.distance)
                    .then(other.current_index.cmp(&self.current_index))
                    .then(other.last_index.cmp(&self.last_index))
            }
        }
        impl PartialOrd for HeapEntry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap = BinaryHeap::with_capacity(current_pointer_count * last_pointer_count);
        for current_index in 0..current_pointer_count {
            for last_index in 0..last_pointer_count {
                let delta_x = (self.current_raw.pointers[current_index].x
                    - self.last_raw.pointers[last_index].x) as i64;
                let delta_y = (self.current_raw.pointers[current_index].y
                    - self.last_raw.pointers[last_index].y) as i64;
                heap.push(HeapEntry {
                    distance: (delta_x * delta_x + delta_y * delta_y) as u64,
                    current_index,
                    last_index,
                });
            }
        }

        let mut matched_current = BitSet32::new();
        let mut matched_last = BitSet32::new();
        let mut used_ids = BitSet32::new();
        let mut matches_remaining = current_pointer_count.min(last_pointer_count);
        while matches_remaining > 0 {
            let entry = heap.pop().expect("match heap exhausted early");
            if matched_current.has_bit(entry.current_index as u32)
                || matched_last.has_bit(entry.last_index as u32)
            {
                continue;
            }
            matched_current.mark_bit(entry.current_index as u32);
            matched_last.mark_bit(entry.last_index as u32);

            let id = self.last_raw.pointers[entry.last_index].id;
            let hovering = self.current_raw.pointers[entry.current_index].is_hovering;
            self.current_raw.pointers[entry.current_index].id = id;
            self.current_raw.id_to_index[id as usize] = entry.current_index as u32;
            self.current_raw.mark_id_bit(id, hovering);
            used_ids.mark_bit(id);
            matches_remaining -= 1;
        }

        // Assign fresh ids from unused low bits to the remaining pointers.
        for _ in 0..current_pointer_count.saturating_sub(last_pointer_count) {
            let current_index = matched_current.first_unmarked_bit() as usize;
            let id = used_ids.first_unmarked_bit();
            let hovering = self.current_raw.pointers[current_index].is_hovering;
            self.current_raw.pointers[current_index].id = id;
            self.current_raw.id_to_index[id as usize] = current_index as u32;
            self.current_raw.mark_id_bit(id, hovering);
            used_ids.mark_bit(id);
            matched_current.mark_bit(current_index as u32);
        }
    }

    pub fn key_code_state(&self, key_code: i32) -> KeyState {
        if self.current_virtual_key.down && self.current_virtual_key.key_code == key_code {
            return KeyState::Virtual;
        }
        if self.virtual_keys.iter().any(|key| key.key_code == key_code) {
            return KeyState::Up;
        }
        KeyState::Unknown
    }

    pub fn scan_code_state(&self, scan_code: i32) -> KeyState {
        if self.current_virtual_key.down && self.current_virtual_key.scan_code == scan_code {
            return KeyState::Virtual;
        }
        if self.virtual_keys.iter().any(|key| key.scan_code == scan_code) {
            return KeyState::Up;
        }
        KeyState::Unknown
    }

    pub fn mark_supported_key_codes(&self, key_codes: &[i32], out_flags: &mut [u8]) -> bool {
        for virtual_key in &self.virtual_keys {
            for (index, &key_code) in key_codes.iter().enumerate() {
                if virtual_key.key_code == key_code {
                    out_flags[index] = 1;
                }
            }
        }
        true
    }

    pub fn fade_pointer(&mut self) {
        if let Some(controller) = &self.pointer_controller {
            controller.fade(Transition::Gradual);
        }
    }

    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "    Touch Input Mapper:");
        let _ = writeln!(out, "      DeviceMode: {:?}", self.device_mode);
        let _ = writeln!(out, "      DeviceType: {:?}", self.parameters.device_type);
        let _ = writeln!(out, "      GestureMode: {:?}", self.parameters.gesture_mode);
        let _ = writeln!(
            out,
            "      SurfaceWidth: {}px, SurfaceHeight: {}px, SurfaceOrientation: {:?}",
            self.surface_width, self.surface_height, self.surface_orientation
        );
        let _ = writeln!(
            out,
            "      XScale: {:.3}, YScale: {:.3}, XPrecision: {:.3}, YPrecision: {:.3}",
            self.x_scale, self.y_scale, self.x_precision, self.y_precision
        );
        let _ = writeln!(out, "      GeometricScale: {:.3}", self.geometric_scale);
        let _ = writeln!(out, "      PressureScale: {:.3}", self.pressure_scale);
        let _ = writeln!(out, "      SizeScale: {:.3}", self.size_scale);
        let _ = writeln!(out, "      OrientationScale: {:.3}", self.orientation_scale);
        let _ = writeln!(out, "      DistanceScale: {:.3}", self.distance_scale);
        if !self.virtual_keys.is_empty() {
            let _ = writeln!(out, "      Virtual Keys:");
            for (index, key) in self.virtual_keys.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "        {}: scanCode={}, keyCode={}, hitLeft={}, hitRight={}, hitTop={}, hitBottom={}",
                    index, key.scan_code, key.key_code, key.hit_left, key.hit_right, key.hit_top,
                    key.hit_bottom
                );
            }
        }
        let _ = writeln!(
            out,
            "      Last Touch: pointerCount={}, buttonState={:?}",
            self.last_raw.pointer_count, self.last_button_state
        );
        if self.parameters.device_type == DeviceType::Pointer {
            let _ = writeln!(
                out,
                "      Pointer Gesture: movementScale={:.3}, zoomScale={:.3}, maxSwipeWidth={:.3}",
                self.pointer_gesture_x_movement_scale,
                self.pointer_gesture_x_zoom_scale,
                self.pointer_gesture_max_swipe_width
            );
        }
    }
}

fn sign_extend_nybble(value: i32) -> i32 {
    if value >= 8 {
        value - 16
    } else {
        value
    }
}

/// Copies pointers that changed from `in_` to `out`, returning whether
/// anything changed.
#[allow(clippy::too_many_arguments)]
fn update_moved_pointers(
    in_properties: &[PointerProperties],
    in_coords: &[PointerCoords],
    in_id_to_index: &[u32],
    out_properties: &mut [PointerProperties],
    out_coords: &mut [PointerCoords],
    out_id_to_index: &[u32],
    id_bits: BitSet32,
) -> bool {
    let mut changed = false;
    for id in id_bits.iter() {
        let in_index = in_id_to_index[id as usize] as usize;
        let out_index = out_id_to_index[id as usize] as usize;
        if in_properties[in_index] != out_properties[out_index] {
            out_properties[out_index] = in_properties[in_index];
            changed = true;
        }
        if in_coords[in_index] != out_coords[out_index] {
            out_coords[out_index] = in_coords[in_index];
            changed = true;
        }
    }
    changed
}

/// Queues one motion notification for the pointers in `id_bits`.
///
/// For `POINTER_DOWN`/`POINTER_UP`, `changed_id` selects the pointer whose
/// index is written into the action word; when it is the only pointer the
/// action transmutes to a plain `DOWN`/`UP`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn dispatch_motion(
    ctx: &mut ReaderContext<'_>,
    dev: &DeviceContext<'_>,
    when: Nanos,
    policy_flags: PolicyFlags,
    source: Source,
    action: i32,
    flags: i32,
    meta_state: crate::codes::MetaState,
    button_state: ButtonState,
    properties: &[PointerProperties],
    coords: &[PointerCoords],
    id_to_index: &[u32],
    id_bits: BitSet32,
    changed_id: i32,
    x_precision: f32,
    y_precision: f32,
    down_time: Nanos,
) {
    let mut pointers = Vec::with_capacity(id_bits.count() as usize);
    let mut action = action;
    for id in id_bits.iter() {
        let index = id_to_index[id as usize] as usize;
        if changed_id >= 0 && id == changed_id as u32 {
            action |= (pointers.len() as i32) << motion::ACTION_POINTER_INDEX_SHIFT;
        }
        pointers.push(MotionPointer {
            properties: properties[index],
            coords: coords[index],
        });
    }
    debug_assert!(!pointers.is_empty());

    if changed_id >= 0 && pointers.len() == 1 {
        // The index is 0, so the action word can be compared directly.
        if action == motion::ACTION_POINTER_DOWN {
            action = motion::ACTION_DOWN;
        } else if action == motion::ACTION_POINTER_UP {
            action = motion::ACTION_UP;
        }
    }

    ctx.notify(NotifyArgs::Motion(MotionArgs {
        when,
        device_id: dev.id,
        source,
        policy_flags,
        action,
        flags,
        meta_state,
        button_state,
        edge_flags: 0,
        pointers,
        x_precision,
        y_precision,
        down_time,
    }));
}

/// Back/forward key synthesis shared with the cursor mapper, kept separate
/// so touch code does not depend on the cursor module.
#[allow(clippy::too_many_arguments)]
fn synthesize_button_keys_for_touch(
    ctx: &mut ReaderContext<'_>,
    dev: &DeviceContext<'_>,
    action: KeyAction,
    when: Nanos,
    source: Source,
    policy_flags: PolicyFlags,
    last_button_state: ButtonState,
    current_button_state: ButtonState,
) {
    super::synthesize_button_keys(
        ctx,
        dev,
        action,
        when,
        source,
        policy_flags,
        last_button_state,
        current_button_state,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{abs, key, keycodes, syn};
    use crate::hub::{RawEvent, RawEventKind, VirtualKeyDefinition};
    use crate::listener::MotionArgs;
    use crate::reader::testing::MapperFixture;

    const MS: Nanos = 1_000_000;

    fn axis_range(min: i32, max: i32) -> RawAbsoluteAxisInfo {
        RawAbsoluteAxisInfo {
            valid: true,
            min,
            max,
            flat: 0,
            fuzz: 0,
            resolution: 0,
        }
    }

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

    fn motions(events: &[NotifyArgs]) -> Vec<&MotionArgs> {
        events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Motion(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    fn keys(events: &[NotifyArgs]) -> Vec<&KeyArgs> {
        events
            .iter()
            .filter_map(|e| match e {
                NotifyArgs::Key(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    // Raw range [25..1019]x[30..1009] on a 480x800 display.
    fn single_touch_fixture() -> (MapperFixture, super::single::SingleTouchMapper) {
        let mut fixture = MapperFixture::new();
        fixture.hub.set_absolute_axis_info(1, abs::X, axis_range(25, 1019));
        fixture.hub.set_absolute_axis_info(1, abs::Y, axis_range(30, 1009));
        fixture.hub.set_scan_code(1, key::BTN_TOUCH);
        fixture.dev_config.set("touch.deviceType", "touchScreen");
        let mut mapper = super::single::SingleTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });
        (fixture, mapper)
    }

    fn to_display_x(raw_x: i32) -> f32 {
        (raw_x - 25) as f32 * (480.0 / 995.0)
    }

    fn to_display_y(raw_y: i32) -> f32 {
        (raw_y - 30) as f32 * (800.0 / 980.0)
    }

    #[test]
    fn single_touch_tap_inside_display() {
        let (mut fixture, mut mapper) = single_touch_fixture();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, 522, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, 519, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        assert_eq!(motion.len(), 2);

        assert_eq!(motion[0].action, motion::ACTION_DOWN);
        assert_eq!(motion[0].pointers.len(), 1);
        assert_eq!(motion[0].pointers[0].properties.id, 0);
        let coords = motion[0].pointers[0].coords;
        assert!((coords.x() - to_display_x(522)).abs() < 0.001, "x = {}", coords.x());
        assert!((coords.y() - to_display_y(519)).abs() < 0.001, "y = {}", coords.y());
        assert_eq!(coords.pressure(), 1.0);
        assert_eq!(motion[0].down_time, 10);

        assert_eq!(motion[1].action, motion::ACTION_UP);
        let up_coords = motion[1].pointers[0].coords;
        assert_eq!(up_coords.x(), coords.x());
        assert_eq!(up_coords.y(), coords.y());
    }

    #[test]
    fn configure_twice_is_idempotent() {
        let (mut fixture, mut mapper) = single_touch_fixture();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::DISPLAY_INFO)
        });
        assert!(fixture.drain().is_empty());
    }

    #[test]
    fn rotation_maps_coordinates_per_quadrant() {
        let (mut fixture, mut mapper) = single_touch_fixture();
        fixture.set_rotation(crate::utils::Rotation::Rot90);
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::DISPLAY_INFO);
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, 522, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, 519, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let coords = motion[0].pointers[0].coords;
        let expected_x = (519 - 30) as f32 * (800.0 / 980.0);
        let expected_y = (1019 - 522) as f32 * (480.0 / 995.0);
        assert!((coords.x() - expected_x).abs() < 0.001);
        assert!((coords.y() - expected_y).abs() < 0.001);
    }

    fn virtual_key_fixture() -> (MapperFixture, super::single::SingleTouchMapper) {
        let mut fixture = MapperFixture::new();
        fixture.hub.set_virtual_keys(
            1,
            vec![VirtualKeyDefinition {
                scan_code: 102,
                center_x: 60,
                center_y: 815,
                width: 20,
                height: 20,
            }],
        );
        fixture
            .hub
            .add_key_mapping(1, 102, keycodes::HOME, PolicyFlags::empty());
        fixture.hub.set_absolute_axis_info(1, abs::X, axis_range(25, 1019));
        fixture.hub.set_absolute_axis_info(1, abs::Y, axis_range(30, 1009));
        fixture.hub.set_scan_code(1, key::BTN_TOUCH);
        fixture.dev_config.set("touch.deviceType", "touchScreen");
        let mut mapper = super::single::SingleTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });
        (fixture, mapper)
    }

    // Raw coordinates of the virtual key's center, below the display area.
    const VKEY_RAW_X: i32 = 149;
    const VKEY_RAW_Y: i32 = 1028;

    #[test]
    fn virtual_key_press_and_release() {
        let (mut fixture, mut mapper) = virtual_key_fixture();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, VKEY_RAW_X, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, VKEY_RAW_Y, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });
        let events = fixture.drain();
        assert!(motions(&events).is_empty(), "virtual key must swallow touches");
        let key_events = keys(&events);
        assert_eq!(key_events.len(), 2);
        assert_eq!(key_events[0].action, KeyAction::Down);
        assert_eq!(key_events[0].key_code, keycodes::HOME);
        assert_eq!(key_events[0].scan_code, 102);
        assert!(key_events[0]
            .flags
            .contains(KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY));
        assert!(key_events[0].policy_flags.contains(PolicyFlags::VIRTUAL));
        assert_eq!(key_events[1].action, KeyAction::Up);
        assert_eq!(key_events[1].key_code, keycodes::HOME);
        assert!(!key_events[1].flags.contains(KeyFlags::CANCELED));
    }

    #[test]
    fn virtual_key_swipe_into_screen_cancels_key() {
        let (mut fixture, mut mapper) = virtual_key_fixture();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, VKEY_RAW_X, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, VKEY_RAW_Y, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            // Swipe up into the display.
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, VKEY_RAW_Y - 100, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 30));
        });
        let events = fixture.drain();

        let key_events = keys(&events);
        assert_eq!(key_events.len(), 2);
        assert_eq!(key_events[0].action, KeyAction::Down);
        assert_eq!(key_events[1].action, KeyAction::Up);
        assert!(key_events[1].flags.contains(KeyFlags::CANCELED));

        let motion = motions(&events);
        assert_eq!(motion.len(), 2);
        assert_eq!(motion[0].action, motion::ACTION_DOWN);
        let coords = motion[0].pointers[0].coords;
        assert!((coords.x() - to_display_x(VKEY_RAW_X)).abs() < 0.001);
        assert!((coords.y() - to_display_y(VKEY_RAW_Y - 100)).abs() < 0.001);
        assert_eq!(motion[1].action, motion::ACTION_UP);
    }

    #[test]
    fn quiet_time_blocks_virtual_keys_after_touches() {
        let (mut fixture, mut mapper) = virtual_key_fixture();
        fixture.config.virtual_key_quiet_time = 100 * MS;
        // A touch inside the display arms the quiet window.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, 500, 10 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, 500, 10 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 20 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20 * MS));
        });
        fixture.drain();
        assert!(fixture.virtual_keys_disabled_until > 0);

        // A virtual key press within the window is dropped entirely.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 40 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, VKEY_RAW_X, 40 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, VKEY_RAW_Y, 40 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 40 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 50 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 50 * MS));
        });
        let events = fixture.drain();
        assert!(keys(&events).is_empty());
        assert!(motions(&events).is_empty());
    }

    // A two-slot multi-touch device on the same 480x800 display.
    fn multi_touch_fixture() -> (MapperFixture, MultiTouchMapper) {
        let mut fixture = MapperFixture::new();
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_X, axis_range(0, 999));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_Y, axis_range(0, 999));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_TRACKING_ID, axis_range(0, 65535));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_SLOT, axis_range(0, 9));
        fixture.hub.set_absolute_axis_value(1, abs::MT_SLOT, 0);
        fixture.dev_config.set("touch.deviceType", "touchScreen");
        let mut mapper = MultiTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });
        (fixture, mapper)
    }

    #[test]
    fn multi_touch_two_finger_sequence() {
        let (mut fixture, mut mapper) = multi_touch_fixture();

        // First finger down.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 100, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 200, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        // Second finger down.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 1, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, 2, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 300, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 400, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });
        // First finger up while the second moves.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 1, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 310, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 0, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, -1, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 30));
        });
        // Both up.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 1, 40));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, -1, 40));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 40));
        });

        let events = fixture.drain();
        let motion = motions(&events);
        let actions: Vec<(i32, usize, usize)> = motion
            .iter()
            .map(|m| {
                (
                    motion::masked(m.action),
                    motion::pointer_index(m.action),
                    m.pointers.len(),
                )
            })
            .collect();
        assert_eq!(
            actions,
            vec![
                (motion::ACTION_DOWN, 0, 1),
                (motion::ACTION_POINTER_DOWN, 1, 2),
                (motion::ACTION_POINTER_UP, 0, 2),
                (motion::ACTION_MOVE, 0, 1),
                (motion::ACTION_UP, 0, 1),
            ]
        );
        // The surviving finger keeps its pointer id across the sequence.
        assert_eq!(motion[1].pointers[1].properties.id, 1);
        assert_eq!(motion[3].pointers[0].properties.id, 1);
        assert_eq!(motion[4].pointers[0].properties.id, 1);
    }

    #[test]
    fn pointer_id_continuity_without_tracking_ids() {
        // Anonymous multi-touch: ids come from frame-to-frame matching.
        let mut fixture = MapperFixture::new();
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_X, axis_range(0, 999));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_Y, axis_range(0, 999));
        fixture.dev_config.set("touch.deviceType", "touchScreen");
        let mut mapper = MultiTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });

        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 100, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 100, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::MT_REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 500, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 500, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::MT_REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 110, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 110, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::MT_REPORT, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, 505, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, 495, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::MT_REPORT, 0, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
        });

        let events = fixture.drain();
        let motion = motions(&events);
        let actions: Vec<i32> = motion.iter().map(|m| motion::masked(m.action)).collect();
        assert_eq!(
            actions,
            vec![motion::ACTION_DOWN, motion::ACTION_POINTER_DOWN, motion::ACTION_MOVE]
        );
        // Ids persist and follow the nearest pointer; no up/down churn.
        let move_args = motion[2];
        assert_eq!(move_args.pointers.len(), 2);
        let by_id = |id: u32| {
            move_args
                .pointers
                .iter()
                .find(|p| p.properties.id == id)
                .unwrap()
                .coords
        };
        let near = |value: f32, raw: i32| (value - raw as f32 * (480.0 / 1000.0)).abs() < 0.5;
        assert!(near(by_id(0).x(), 110));
        assert!(near(by_id(1).x(), 505));
    }

    // A touchpad acting as a pointer: raw range [0..249] squared.
    fn pointer_gesture_fixture() -> (MapperFixture, MultiTouchMapper) {
        let mut fixture = MapperFixture::new();
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_X, axis_range(0, 249));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_POSITION_Y, axis_range(0, 249));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_TRACKING_ID, axis_range(0, 65535));
        fixture
            .hub
            .set_absolute_axis_info(1, abs::MT_SLOT, axis_range(0, 9));
        fixture.hub.set_absolute_axis_value(1, abs::MT_SLOT, 0);
        fixture.dev_config.set("touch.deviceType", "pointer");
        let mut mapper = MultiTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });
        (fixture, mapper)
    }

    fn gesture_movement_scale(config: &crate::policy::ReaderConfiguration) -> f32 {
        let display_diagonal = (480.0f32).hypot(800.0);
        let raw_diagonal = (250.0f32).hypot(250.0);
        config.pointer_gesture_movement_speed_ratio * display_diagonal / raw_diagonal
    }

    fn put_finger(
        fixture: &mut MapperFixture,
        mapper: &mut MultiTouchMapper,
        slot: i32,
        tracking: i32,
        x: i32,
        y: i32,
        when: Nanos,
    ) {
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, slot, when));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, tracking, when));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_X, x, when));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_POSITION_Y, y, when));
        });
    }

    fn sync_frame(fixture: &mut MapperFixture, mapper: &mut MultiTouchMapper, when: Nanos) {
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, when));
        });
    }

    #[test]
    fn two_finger_swipe_reports_common_motion() {
        let (mut fixture, mut mapper) = pointer_gesture_fixture();
        let (start_x, start_y) = fixture.controller.position();

        // Both fingers down together: press, down at the pointer.
        put_finger(&mut fixture, &mut mapper, 0, 1, 100, 100, 0);
        put_finger(&mut fixture, &mut mapper, 1, 2, 150, 100, 0);
        sync_frame(&mut fixture, &mut mapper, 0);
        let events = fixture.drain();
        let motion = motions(&events);
        assert_eq!(motion.len(), 1);
        assert_eq!(motion[0].action, motion::ACTION_DOWN);
        assert_eq!(motion[0].pointers.len(), 1);
        assert_eq!(motion[0].pointers[0].coords.x(), start_x);
        assert_eq!(motion[0].pointers[0].coords.y(), start_y);

        // Both fingers move 30 raw units in +X: promotion to swipe, one
        // gesture pointer following the common delta.
        put_finger(&mut fixture, &mut mapper, 0, 1, 130, 100, 200 * MS);
        put_finger(&mut fixture, &mut mapper, 1, 2, 180, 100, 200 * MS);
        sync_frame(&mut fixture, &mut mapper, 200 * MS);
        let events = fixture.drain();
        let motion = motions(&events);
        assert_eq!(motion.len(), 1, "swipe continues the same gesture");
        assert_eq!(motion::masked(motion[0].action), motion::ACTION_MOVE);
        assert_eq!(motion[0].pointers.len(), 1);

        let scale = gesture_movement_scale(&fixture.config);
        let expected_x = start_x + 30.0 * scale;
        let x = motion[0].pointers[0].coords.x();
        assert!(
            (x - expected_x).abs() < 0.5,
            "x = {x}, expected about {expected_x}"
        );
        assert_eq!(motion[0].pointers[0].coords.y(), start_y);
    }

    #[test]
    fn diverging_fingers_promote_to_freeform() {
        let (mut fixture, mut mapper) = pointer_gesture_fixture();

        put_finger(&mut fixture, &mut mapper, 0, 1, 100, 100, 0);
        put_finger(&mut fixture, &mut mapper, 1, 2, 150, 100, 0);
        sync_frame(&mut fixture, &mut mapper, 0);
        fixture.drain();

        // Fingers move apart: the press is canceled and replaced by one
        // gesture pointer per finger.
        put_finger(&mut fixture, &mut mapper, 0, 1, 70, 100, 200 * MS);
        put_finger(&mut fixture, &mut mapper, 1, 2, 180, 100, 200 * MS);
        sync_frame(&mut fixture, &mut mapper, 200 * MS);
        let events = fixture.drain();
        let motion = motions(&events);
        let actions: Vec<i32> = motion.iter().map(|m| motion::masked(m.action)).collect();
        assert_eq!(
            actions,
            vec![motion::ACTION_CANCEL, motion::ACTION_DOWN, motion::ACTION_POINTER_DOWN]
        );
        assert_eq!(motion[2].pointers.len(), 2);
    }

    #[test]
    fn tap_emits_down_then_up_on_timeout() {
        let (mut fixture, mut mapper) = pointer_gesture_fixture();
        let (pointer_x, pointer_y) = fixture.controller.position();

        put_finger(&mut fixture, &mut mapper, 0, 1, 100, 100, 0);
        sync_frame(&mut fixture, &mut mapper, 0);
        // Finger up 50 ms later without moving: a tap.
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_SLOT, 0, 50 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::MT_TRACKING_ID, -1, 50 * MS));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 50 * MS));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let down = motion
            .iter()
            .find(|m| motion::masked(m.action) == motion::ACTION_DOWN)
            .expect("tap must deliver a down");
        assert_eq!(down.pointers[0].coords.x(), pointer_x);
        assert_eq!(down.pointers[0].coords.y(), pointer_y);
        assert_eq!(down.pointers[0].coords.pressure(), 1.0);

        // The tap is held until the tap-drag window closes.
        let timeout_at = fixture.last_timeout_request.expect("tap requests a timeout");
        assert_eq!(
            timeout_at,
            50 * MS + fixture.config.pointer_gesture_tap_drag_interval
        );
        fixture.with_ctx(|ctx, dev| {
            mapper.touch.timeout_expired(ctx, dev, timeout_at + MS);
        });
        let events = fixture.drain();
        let motion = motions(&events);
        // The up for the tap, then a synthesized hover at the pointer.
        assert_eq!(motion::masked(motion[0].action), motion::ACTION_UP);
        assert!(motion[1..]
            .iter()
            .all(|m| motion::masked(m.action) == motion::ACTION_HOVER_MOVE));
    }

    #[test]
    fn hover_single_finger_reports_hover_moves() {
        let (mut fixture, mut mapper) = pointer_gesture_fixture();
        put_finger(&mut fixture, &mut mapper, 0, 1, 100, 100, 0);
        sync_frame(&mut fixture, &mut mapper, 0);
        put_finger(&mut fixture, &mut mapper, 0, 1, 110, 100, 20 * MS);
        sync_frame(&mut fixture, &mut mapper, 20 * MS);
        let events = fixture.drain();
        let motion = motions(&events);
        assert!(!motion.is_empty());
        assert!(motion
            .iter()
            .all(|m| motion::masked(m.action) == motion::ACTION_HOVER_MOVE));
        // The cursor followed the finger.
        let (x, _) = fixture.controller.position();
        assert!(x > 100.0);
    }

    #[test]
    fn settle_interval_resets_gesture_on_extra_finger() {
        let (mut fixture, mut mapper) = pointer_gesture_fixture();
        put_finger(&mut fixture, &mut mapper, 0, 1, 100, 100, 0);
        put_finger(&mut fixture, &mut mapper, 1, 2, 150, 100, 0);
        sync_frame(&mut fixture, &mut mapper, 0);
        fixture.drain();

        // A third finger inside the settle interval cancels and restarts.
        put_finger(&mut fixture, &mut mapper, 2, 3, 120, 150, 50 * MS);
        sync_frame(&mut fixture, &mut mapper, 50 * MS);
        let events = fixture.drain();
        let motion = motions(&events);
        assert_eq!(motion::masked(motion[0].action), motion::ACTION_CANCEL);
        assert_eq!(motion::masked(motion[1].action), motion::ACTION_DOWN);
    }

    #[test]
    fn hover_pointer_reports_enter_move_exit() {
        // A stylus hovering above a touchscreen.
        let mut fixture = MapperFixture::new();
        fixture.hub.set_absolute_axis_info(1, abs::X, axis_range(25, 1019));
        fixture.hub.set_absolute_axis_info(1, abs::Y, axis_range(30, 1009));
        fixture.hub.set_scan_code(1, key::BTN_TOUCH);
        fixture.dev_config.set("touch.deviceType", "touchScreen");
        let mut mapper = super::single::SingleTouchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.configure(ctx, dev, crate::policy::ConfigChanges::empty())
        });

        fixture.with_ctx(|ctx, dev| {
            // Pen in range without contact.
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOOL_PEN, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, 500, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, 500, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, 520, 20));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 20));
            // Contact.
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 30));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 30));
            // Away entirely.
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 0, 40));
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOOL_PEN, 0, 40));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 40));
        });
        let events = fixture.drain();
        let motion = motions(&events);
        let actions: Vec<i32> = motion.iter().map(|m| motion::masked(m.action)).collect();
        assert_eq!(
            actions,
            vec![
                motion::ACTION_HOVER_ENTER,
                motion::ACTION_HOVER_MOVE,
                motion::ACTION_HOVER_MOVE,
                motion::ACTION_HOVER_EXIT,
                motion::ACTION_DOWN,
                motion::ACTION_UP,
            ]
        );
        assert_eq!(motion[0].pointers[0].properties.tool_type, crate::codes::ToolType::Stylus);
    }

    #[test]
    fn reset_cancels_held_virtual_key() {
        let (mut fixture, mut mapper) = virtual_key_fixture();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(ctx, dev, &raw(RawEventKind::Key, key::BTN_TOUCH, 1, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::X, VKEY_RAW_X, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Abs, abs::Y, VKEY_RAW_Y, 10));
            mapper.process(ctx, dev, &raw(RawEventKind::Sync, syn::REPORT, 0, 10));
        });
        fixture.drain();
        fixture.with_ctx(|ctx, dev| {
            mapper.reset(ctx, dev, 20);
        });
        let events = fixture.drain();
        let key_events = keys(&events);
        assert_eq!(key_events.len(), 1);
        assert_eq!(key_events[0].action, KeyAction::Up);
        assert!(key_events[0].flags.contains(KeyFlags::CANCELED));
    }
}
