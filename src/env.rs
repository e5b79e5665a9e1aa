//! Process-wide paths and names handed to the hub at startup.

use std::path::PathBuf;

/// Filesystem locations and identifiers the event hub works with.
///
/// The hub takes this by value at construction; nothing here changes at
/// runtime.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Directory scanned and watched for device nodes.
    pub device_dir: PathBuf,
    /// Directory holding per-device configuration property files.
    pub config_dir: PathBuf,
    /// Directory holding virtual key definition files, one per device name
    /// (`virtualkeys.<name>`).
    pub virtual_key_dir: PathBuf,
    /// Name under which the wake lock is held.
    pub wake_lock_name: String,
    /// Wake lock acquire file; `None` disables wake-lock handling.
    pub wake_lock_path: Option<PathBuf>,
    /// Wake lock release file.
    pub wake_unlock_path: Option<PathBuf>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            device_dir: PathBuf::from("/dev/input"),
            config_dir: PathBuf::from("/usr/share/input-configs"),
            virtual_key_dir: PathBuf::from("/sys/board_properties"),
            wake_lock_name: "evreader".to_owned(),
            wake_lock_path: Some(PathBuf::from("/sys/power/wake_lock")),
            wake_unlock_path: Some(PathBuf::from("/sys/power/wake_unlock")),
        }
    }
}
