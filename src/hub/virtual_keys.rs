//! Virtual key definition files.
//!
//! The kernel exports on-bezel capacitive keys as a board property file, one
//! `0x01:<scancode>:<center_x>:<center_y>:<width>:<height>` record per key.
//! Coordinates are display pixels at the device's natural orientation. A
//! missing or unparsable file simply means "no virtual keys".

use std::path::Path;

use scan_fmt::scan_fmt;
use tracing::warn;

use super::device::VirtualKeyDefinition;

/// Parses virtual key definitions from file contents. Records may share a
/// line or be split one per line; malformed records are skipped with a
/// warning.
pub fn parse(contents: &str) -> Vec<VirtualKeyDefinition> {
    let mut keys = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split(':').map(str::trim).collect();
        for record in tokens.chunks(6) {
            if record.len() != 6 {
                warn!(line, "truncated virtual key record");
                continue;
            }
            let record = record.join(":");
            match scan_fmt!(&record, "0x01:{d}:{d}:{d}:{d}:{d}", i32, i32, i32, i32, i32) {
                Ok((scan_code, center_x, center_y, width, height)) => {
                    keys.push(VirtualKeyDefinition {
                        scan_code,
                        center_x,
                        center_y,
                        width,
                        height,
                    });
                }
                Err(_) => warn!(%record, "malformed virtual key record"),
            }
        }
    }
    keys
}

/// Loads the virtual key definitions for a device name, if present.
pub fn load(virtual_key_dir: &Path, device_name: &str) -> Vec<VirtualKeyDefinition> {
    let path = virtual_key_dir.join(format!("virtualkeys.{device_name}"));
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse(&contents),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_record_per_line() {
        let keys = parse("0x01:102:60:815:20:20\n0x01:158:180:815:20:20\n");
        assert_eq!(keys.len(), 2);
        assert_eq!(
            keys[0],
            VirtualKeyDefinition {
                scan_code: 102,
                center_x: 60,
                center_y: 815,
                width: 20,
                height: 20,
            }
        );
        assert_eq!(keys[1].scan_code, 158);
    }

    #[test]
    fn parses_records_sharing_a_line() {
        let keys = parse("0x01:158:55:835:90:55:0x01:139:172:835:125:55");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].scan_code, 158);
        assert_eq!(keys[1].center_x, 172);
    }

    #[test]
    fn malformed_records_are_dropped() {
        let keys = parse("0x02:1:2:3:4:5\n0x01:not:a:number:0:0\n0x01:1:2:3:4:5\n");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].scan_code, 1);
    }
}
