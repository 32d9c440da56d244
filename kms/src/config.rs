//! Driver options
//!
//! Options arrive as a `key=value` list separated by whitespace or commas,
//! e.g. `flip=off max_scanouts=2,backend=exynos`. Keys are case-insensitive.

use alloc::string::{String, ToString};

use crate::drivers::cursor::{DEFAULT_CURSOR_HEIGHT, DEFAULT_CURSOR_WIDTH};
use crate::drivers::gem::{BoBackendKind, DEFAULT_PITCH_ALIGNMENT};
use crate::drivers::scanout::MAX_SCANOUTS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("option `{0}` is not of the form key=value")]
    Malformed(String),
    #[error("unknown option `{0}`")]
    UnknownKey(String),
    #[error("option `{key}`: invalid value `{value}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsConfig {
    /// Row pitch alignment of allocated buffers, in bytes
    pub pitch_alignment: u32,
    pub max_scanouts: usize,
    pub hw_cursor: bool,
    /// Allow per-CRTC scanout buffers
    pub flip: bool,
    pub cursor_width: u32,
    pub cursor_height: u32,
    /// Minimum DMA burst width of the cursor plane, in pixels
    pub cursor_min_burst_width: u32,
    /// Empty event reads tolerated while draining page flips
    pub flip_drain_max_polls: usize,
    pub min_width: u32,
    pub min_height: u32,
    /// Forces a buffer backend instead of probing the driver name
    pub backend: Option<BoBackendKind>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            pitch_alignment: DEFAULT_PITCH_ALIGNMENT,
            max_scanouts: MAX_SCANOUTS,
            hw_cursor: true,
            flip: true,
            cursor_width: DEFAULT_CURSOR_WIDTH,
            cursor_height: DEFAULT_CURSOR_HEIGHT,
            cursor_min_burst_width: 0,
            flip_drain_max_polls: 8,
            min_width: 320,
            min_height: 200,
            backend: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_nonzero(key: &str, value: &str) -> Result<u32, ConfigError> {
    match parse_num::<u32>(key, value)? {
        0 => Err(invalid(key, value)),
        n => Ok(n),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
}

impl KmsConfig {
    /// Parses an option string on top of the defaults.
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for option in options.split(|c: char| c.is_whitespace() || c == ',').filter(|s| !s.is_empty()) {
            let (key, value) = option.split_once('=').ok_or_else(|| ConfigError::Malformed(option.to_string()))?;
            config.set(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key.to_ascii_lowercase().as_str() {
            "pitch_alignment" => {
                let align: u32 = parse_num(key, value)?;
                if !align.is_power_of_two() {
                    return Err(invalid(key, value));
                }
                self.pitch_alignment = align;
            }
            "max_scanouts" => {
                let n: usize = parse_num(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value));
                }
                self.max_scanouts = n;
            }
            "hw_cursor" => self.hw_cursor = parse_bool(key, value)?,
            "flip" => self.flip = parse_bool(key, value)?,
            "cursor_width" => self.cursor_width = parse_nonzero(key, value)?,
            "cursor_height" => self.cursor_height = parse_nonzero(key, value)?,
            "cursor_min_burst" => self.cursor_min_burst_width = parse_num(key, value)?,
            "flip_drain_polls" => self.flip_drain_max_polls = parse_num(key, value)?,
            "min_width" => self.min_width = parse_num(key, value)?,
            "min_height" => self.min_height = parse_num(key, value)?,
            "backend" => {
                self.backend = match value {
                    "auto" => None,
                    name => Some(BoBackendKind::from_name(name).ok_or_else(|| invalid(key, value))?),
                };
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KmsConfig::parse("").unwrap();
        assert_eq!(config, KmsConfig::default());
        assert_eq!(config.pitch_alignment, 64);
        assert_eq!(config.max_scanouts, 3);
        assert_eq!((config.cursor_width, config.cursor_height), (64, 64));
    }

    #[test]
    fn test_parse_mixed_separators() {
        let config = KmsConfig::parse("flip=off  MAX_SCANOUTS=2,backend=rockchip\tcursor_min_burst=96").unwrap();
        assert!(!config.flip);
        assert_eq!(config.max_scanouts, 2);
        assert_eq!(config.backend, Some(BoBackendKind::Rockchip));
        assert_eq!(config.cursor_min_burst_width, 96);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(KmsConfig::parse("flip"), Err(ConfigError::Malformed(String::from("flip"))));
        assert_eq!(KmsConfig::parse("colour=blue"), Err(ConfigError::UnknownKey(String::from("colour"))));
        assert!(matches!(KmsConfig::parse("pitch_alignment=48"), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(KmsConfig::parse("hw_cursor=maybe"), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(KmsConfig::parse("backend=nouveau"), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(KmsConfig::parse("max_scanouts=0"), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_cursor_size_rejected() {
        assert!(matches!(KmsConfig::parse("cursor_width=0"), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(KmsConfig::parse("cursor_height=0"), Err(ConfigError::InvalidValue { .. })));
        let config = KmsConfig::parse("cursor_width=32,cursor_height=48").unwrap();
        assert_eq!((config.cursor_width, config.cursor_height), (32, 48));
    }
}
