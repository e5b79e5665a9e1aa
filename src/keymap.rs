//! Key layout collaborator interface.
//!
//! A key layout translates kernel scan codes into framework key codes and
//! joystick axis assignments. Loading and parsing layout files is the
//! embedder's concern; the hub only consumes the lookups through this trait.

use smallvec::SmallVec;

use crate::codes::PolicyFlags;

/// How a raw absolute axis maps onto motion axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisMode {
    /// Direct mapping onto one axis.
    #[default]
    Normal,
    /// Raw values are reversed before normalization.
    Invert,
    /// The raw range is split in two halves feeding separate axes, e.g. a
    /// single hardware axis reporting both triggers of a gamepad.
    Split,
}

/// Axis assignment supplied by a key layout for one raw absolute axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisInfo {
    pub mode: AxisMode,
    /// Motion axis id, or -1 when unassigned.
    pub axis: i32,
    /// Motion axis fed by the upper half in split mode.
    pub high_axis: i32,
    /// Raw value at which the split occurs.
    pub split_value: i32,
    /// Overrides the raw flat region when non-negative.
    pub flat_override: i32,
}

impl Default for AxisInfo {
    fn default() -> Self {
        AxisInfo {
            mode: AxisMode::Normal,
            axis: -1,
            high_axis: -1,
            split_value: 0,
            flat_override: -1,
        }
    }
}

/// Scan-code lookup tables for one device.
pub trait KeyLayout: Send + Sync {
    /// Maps a scan code to a key code plus the policy flags the layout file
    /// attached to it.
    fn map_key(&self, scan_code: i32) -> Option<(i32, PolicyFlags)>;

    /// Maps a raw absolute axis to its motion axis assignment.
    fn map_axis(&self, scan_code: i32) -> Option<AxisInfo>;

    /// All scan codes that produce `key_code`. Used to answer key-code state
    /// queries against the kernel's scan-code bitmaps.
    fn scan_codes_for_key(&self, key_code: i32) -> SmallVec<[i32; 4]>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// An in-memory key layout for tests.
    #[derive(Debug, Default)]
    pub struct FakeKeyLayout {
        keys: HashMap<i32, (i32, PolicyFlags)>,
        axes: HashMap<i32, AxisInfo>,
    }

    impl FakeKeyLayout {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_key(&mut self, scan_code: i32, key_code: i32, flags: PolicyFlags) {
            self.keys.insert(scan_code, (key_code, flags));
        }

        pub fn add_axis(&mut self, scan_code: i32, info: AxisInfo) {
            self.axes.insert(scan_code, info);
        }
    }

    impl KeyLayout for FakeKeyLayout {
        fn map_key(&self, scan_code: i32) -> Option<(i32, PolicyFlags)> {
            self.keys.get(&scan_code).copied()
        }

        fn map_axis(&self, scan_code: i32) -> Option<AxisInfo> {
            self.axes.get(&scan_code).copied()
        }

        fn scan_codes_for_key(&self, key_code: i32) -> SmallVec<[i32; 4]> {
            self.keys
                .iter()
                .filter(|(_, (code, _))| *code == key_code)
                .map(|(scan, _)| *scan)
                .collect()
        }
    }
}
