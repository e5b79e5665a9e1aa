//! Per-device configuration properties.
//!
//! Devices are configured through a flat string-keyed property file; the
//! mappers only ever read through the typed getters. Parse failures of an
//! individual value are logged by the caller and treated as "not set".

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tracing::warn;

/// A string-keyed property store with typed getters.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    properties: HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a property file. Lines are `key = value`; `#` starts a comment.
    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    /// Parses property-file syntax from a string.
    pub fn parse(contents: &str) -> Self {
        let mut properties = HashMap::new();
        for (number, line) in contents.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    properties.insert(key.trim().to_owned(), value.trim().to_owned());
                }
                None => warn!(line = number + 1, "malformed property line, skipping"),
            }
        }
        PropertyMap { properties }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_string(key)? {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            other => {
                warn!(key, value = other, "property is not a boolean");
                None
            }
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        let value = self.get_string(key)?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(key, value, "property is not an integer");
                None
            }
        }
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        let value = self.get_string(key)?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(key, value, "property is not a number");
                None
            }
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_owned(), value.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_values() {
        let map = PropertyMap::parse(
            "device.internal = 1\n\
             touch.deviceType = touchScreen # a comment\n\
             touch.size.scale = 2.5\n\
             cursor.mode=navigation\n\
             \n\
             # full line comment\n\
             touch.size.bias = nonsense\n",
        );
        assert_eq!(map.get_bool("device.internal"), Some(true));
        assert_eq!(map.get_string("touch.deviceType"), Some("touchScreen"));
        assert_eq!(map.get_f32("touch.size.scale"), Some(2.5));
        assert_eq!(map.get_string("cursor.mode"), Some("navigation"));
        assert_eq!(map.get_f32("touch.size.bias"), None);
        assert_eq!(map.get_string("missing"), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let map = PropertyMap::parse("no equals sign here\nvalid = yes\n");
        assert_eq!(map.get_string("valid"), Some("yes"));
        assert_eq!(map.properties.len(), 1);
    }
}
