//! Multi-touch protocol decoding, both the anonymous (type A) and the
//! slot-based (type B) dialects.

use tracing::warn;

use crate::codes::{abs, mt_tool, syn, ToolType};
use crate::hub::{RawEvent, RawEventKind};
use crate::listener::MAX_POINTERS;
use crate::policy::ConfigChanges;
use crate::reader::mapper::{CursorButtonAccumulator, TouchButtonAccumulator};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::{BitSet32, Nanos};

use super::{DeviceType, TouchMapper, ID_SLOTS};

/// Maximum number of slots tracked for the slot-based protocol.
const MAX_SLOTS: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    in_use: bool,
    have_abs_mt_touch_minor: bool,
    have_abs_mt_width_minor: bool,
    have_abs_mt_tool_type: bool,
    have_position: bool,
    abs_mt_position_x: i32,
    abs_mt_position_y: i32,
    abs_mt_touch_major: i32,
    abs_mt_touch_minor: i32,
    abs_mt_width_major: i32,
    abs_mt_width_minor: i32,
    abs_mt_orientation: i32,
    abs_mt_tracking_id: i32,
    abs_mt_pressure: i32,
    abs_mt_distance: i32,
    abs_mt_tool_type: i32,
}

impl Slot {
    fn clear(&mut self) {
        *self = Slot {
            abs_mt_tracking_id: -1,
            ..Slot::default()
        }
    }

    fn touch_minor(&self) -> i32 {
        if self.have_abs_mt_touch_minor {
            self.abs_mt_touch_minor
        } else {
            self.abs_mt_touch_major
        }
    }

    fn tool_minor(&self) -> i32 {
        if self.have_abs_mt_width_minor {
            self.abs_mt_width_minor
        } else {
            self.abs_mt_width_major
        }
    }

    fn tool_type(&self) -> ToolType {
        if self.have_abs_mt_tool_type {
            match self.abs_mt_tool_type {
                mt_tool::FINGER => ToolType::Finger,
                mt_tool::PEN => ToolType::Stylus,
                _ => ToolType::Unknown,
            }
        } else {
            ToolType::Unknown
        }
    }
}

/// Decodes MT events into the shared touch pipeline, tracking the
/// tracking-id to pointer-id map across frames.
pub struct MultiTouchMapper {
    pub(crate) touch: TouchMapper,
    touch_buttons: TouchButtonAccumulator,
    cursor_buttons: CursorButtonAccumulator,
    slots: Vec<Slot>,
    current_slot: i32,
    using_slots_protocol: bool,
    /// Pointer ids currently allocated, with their kernel tracking ids.
    pointer_id_bits: BitSet32,
    pointer_tracking_id_map: [i32; ID_SLOTS],
}

impl MultiTouchMapper {
    pub fn new() -> Self {
        MultiTouchMapper {
            touch: TouchMapper::new(),
            touch_buttons: TouchButtonAccumulator::new(),
            cursor_buttons: CursorButtonAccumulator::new(),
            slots: Vec::new(),
            current_slot: -1,
            using_slots_protocol: false,
            pointer_id_bits: BitSet32::new(),
            pointer_tracking_id_map: [-1; ID_SLOTS],
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
            axes.x = ctx.hub.absolute_axis_info(dev.id, abs::MT_POSITION_X);
            axes.y = ctx.hub.absolute_axis_info(dev.id, abs::MT_POSITION_Y);
            axes.touch_major = ctx.hub.absolute_axis_info(dev.id, abs::MT_TOUCH_MAJOR);
            axes.touch_minor = ctx.hub.absolute_axis_info(dev.id, abs::MT_TOUCH_MINOR);
            axes.tool_major = ctx.hub.absolute_axis_info(dev.id, abs::MT_WIDTH_MAJOR);
            axes.tool_minor = ctx.hub.absolute_axis_info(dev.id, abs::MT_WIDTH_MINOR);
            axes.orientation = ctx.hub.absolute_axis_info(dev.id, abs::MT_ORIENTATION);
            axes.pressure = ctx.hub.absolute_axis_info(dev.id, abs::MT_PRESSURE);
            axes.distance = ctx.hub.absolute_axis_info(dev.id, abs::MT_DISTANCE);
            axes.tracking_id = ctx.hub.absolute_axis_info(dev.id, abs::MT_TRACKING_ID);
            axes.slot = ctx.hub.absolute_axis_info(dev.id, abs::MT_SLOT);

            if axes.tracking_id.valid && axes.slot.valid && axes.slot.min == 0 && axes.slot.max > 0
            {
                let mut slot_count = axes.slot.max as usize + 1;
                if slot_count > MAX_SLOTS {
                    warn!(
                        device = dev.name,
                        slot_count, "multi-touch device reports more slots than supported"
                    );
                    slot_count = MAX_SLOTS;
                }
                self.using_slots_protocol = true;
                self.slots = vec![
                    Slot {
                        abs_mt_tracking_id: -1,
                        ..Slot::default()
                    };
                    slot_count
                ];
            } else {
                self.using_slots_protocol = false;
                self.slots = vec![
                    Slot {
                        abs_mt_tracking_id: -1,
                        ..Slot::default()
                    };
                    MAX_POINTERS
                ];
            }
            self.clear_slot_state(ctx, dev);
        }
        self.touch.configure(ctx, dev, changes);
    }

    fn clear_slot_state(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.pointer_id_bits.clear();
        if self.using_slots_protocol {
            // Start from the slot index the driver currently has selected;
            // events already queued in the evdev buffer were written against
            // it. If it cannot be read the data from two slots may be
            // confused until the next ABS_MT_SLOT, causing a jump but no
            // stuck touches.
            self.current_slot = ctx
                .hub
                .absolute_axis_value(dev.id, abs::MT_SLOT)
                .unwrap_or(-1);
        } else {
            self.current_slot = 0;
        }
    }

    pub fn reset(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        self.touch.reset(ctx, dev, when);
        self.clear_slot_state(ctx, dev);
        self.touch_buttons.reset();
        self.cursor_buttons.reset();
    }

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, raw: &RawEvent) {
        self.touch_buttons.process(raw);
        if self.touch.parameters.device_type == DeviceType::Pointer {
            self.cursor_buttons.process(raw);
        }

        match raw.kind {
            RawEventKind::Abs => {
                if self.using_slots_protocol && raw.code == abs::MT_SLOT {
                    self.current_slot = raw.value;
                    return;
                }
                if self.current_slot < 0 || self.current_slot as usize >= self.slots.len() {
                    return;
                }
                let slot = &mut self.slots[self.current_slot as usize];
                slot.in_use = true;
                match raw.code {
                    abs::MT_POSITION_X => {
                        slot.have_position = true;
                        slot.abs_mt_position_x = raw.value;
                    }
                    abs::MT_POSITION_Y => {
                        slot.have_position = true;
                        slot.abs_mt_position_y = raw.value;
                    }
                    abs::MT_TOUCH_MAJOR => slot.abs_mt_touch_major = raw.value,
                    abs::MT_TOUCH_MINOR => {
                        slot.have_abs_mt_touch_minor = true;
                        slot.abs_mt_touch_minor = raw.value;
                    }
                    abs::MT_WIDTH_MAJOR => slot.abs_mt_width_major = raw.value,
                    abs::MT_WIDTH_MINOR => {
                        slot.have_abs_mt_width_minor = true;
                        slot.abs_mt_width_minor = raw.value;
                    }
                    abs::MT_ORIENTATION => slot.abs_mt_orientation = raw.value,
                    abs::MT_TRACKING_ID => {
                        if self.using_slots_protocol && raw.value < 0 {
                            // The slot is released.
                            slot.clear();
                        } else {
                            slot.abs_mt_tracking_id = raw.value;
                        }
                    }
                    abs::MT_PRESSURE => slot.abs_mt_pressure = raw.value,
                    abs::MT_DISTANCE => slot.abs_mt_distance = raw.value,
                    abs::MT_TOOL_TYPE => {
                        slot.have_abs_mt_tool_type = true;
                        slot.abs_mt_tool_type = raw.value;
                    }
                    _ => {}
                }
            }
            RawEventKind::Sync => match raw.code {
                syn::MT_REPORT => {
                    // End of data for one anonymous pointer.
                    self.current_slot += 1;
                }
                syn::REPORT => self.sync(ctx, dev, raw.when),
                _ => {}
            },
            _ => {}
        }
    }

    fn sync(&mut self, ctx: &mut ReaderContext<'_>, dev: &DeviceContext<'_>, when: Nanos) {
        let touch = &mut self.touch;
        touch.current_raw.clear();
        touch.current_button_state =
            self.touch_buttons.button_state() | self.cursor_buttons.button_state();

        let mut out_count = 0usize;
        let mut have_pointer_ids = true;
        let mut new_pointer_id_bits = BitSet32::new();

        for slot in self.slots.iter() {
            if !slot.in_use || !slot.have_position {
                // Some drivers send empty packets to report a pointer going
                // up; this also covers unused slots.
                continue;
            }
            if self.using_slots_protocol && slot.abs_mt_tracking_id < 0 {
                continue;
            }
            if out_count >= MAX_POINTERS {
                warn!(
                    device = dev.name,
                    "too many concurrent pointers, ignoring the rest"
                );
                break;
            }

            let is_hovering = self.touch_buttons.is_hovering()
                || (touch.raw_axes.pressure.valid && slot.abs_mt_pressure <= 0)
                || (touch.raw_axes.distance.valid && slot.abs_mt_distance > 0);
            let tool_type = match slot.tool_type() {
                ToolType::Unknown => match self.touch_buttons.tool_type() {
                    ToolType::Unknown => ToolType::Finger,
                    tool_type => tool_type,
                },
                tool_type => tool_type,
            };

            let pointer = &mut touch.current_raw.pointers[out_count];
            pointer.x = slot.abs_mt_position_x;
            pointer.y = slot.abs_mt_position_y;
            pointer.pressure = slot.abs_mt_pressure;
            pointer.touch_major = slot.abs_mt_touch_major;
            pointer.touch_minor = slot.touch_minor();
            pointer.tool_major = slot.abs_mt_width_major;
            pointer.tool_minor = slot.tool_minor();
            pointer.orientation = slot.abs_mt_orientation;
            pointer.distance = slot.abs_mt_distance;
            pointer.tilt_x = 0;
            pointer.tilt_y = 0;
            pointer.tool_type = tool_type;
            pointer.is_hovering = is_hovering;

            // Assign the pointer id from the tracking id when there is one.
            if have_pointer_ids {
                let mut id = -1;
                if slot.abs_mt_tracking_id >= 0 {
                    let tracking_id = slot.abs_mt_tracking_id;
                    for existing in self.pointer_id_bits.iter() {
                        if self.pointer_tracking_id_map[existing as usize] == tracking_id {
                            id = existing as i32;
                        }
                    }
                    if id < 0 && !self.pointer_id_bits.is_full() {
                        let fresh = self.pointer_id_bits.first_unmarked_bit();
                        self.pointer_id_bits.mark_bit(fresh);
                        self.pointer_tracking_id_map[fresh as usize] = tracking_id;
                        id = fresh as i32;
                    }
                }
                if id < 0 {
                    // No usable tracking ids; fall back to distance-based
                    // assignment for the whole frame.
                    have_pointer_ids = false;
                    touch.current_raw.hovering_id_bits.clear();
                    touch.current_raw.touching_id_bits.clear();
                } else {
                    pointer.id = id as u32;
                    touch.current_raw.id_to_index[id as usize] = out_count as u32;
                    touch.current_raw.mark_id_bit(id as u32, is_hovering);
                    new_pointer_id_bits.mark_bit(id as u32);
                }
            }

            out_count += 1;
        }

        touch.current_raw.pointer_count = out_count;
        if have_pointer_ids {
            self.pointer_id_bits = new_pointer_id_bits;
        }

        touch.sync_touch(ctx, dev, when, have_pointer_ids);

        if !self.using_slots_protocol {
            for slot in &mut self.slots {
                slot.clear();
            }
            self.current_slot = 0;
        }
    }
}

impl Default for MultiTouchMapper {
    fn default() -> Self {
        Self::new()
    }
}
