use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::viewport::{ViewportState, ZoomLimits};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub zoom: ZoomConfig,
    pub gestures: GestureConfig,
    pub layout: LayoutConfig,
    pub bridge: BridgeConfig,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "load_timeout_secs")]
    pub load_timeout: Duration,
    /// Forward sandbox diagnostics to the host as `console` messages.
    pub forward_console: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            zoom: ZoomConfig::default(),
            gestures: GestureConfig::default(),
            layout: LayoutConfig::default(),
            bridge: BridgeConfig::default(),
            load_timeout: Duration::from_secs(30),
            forward_console: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoomConfig {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        let limits = ZoomLimits::default();
        Self {
            min: limits.min,
            max: limits.max,
            step: limits.step,
        }
    }
}

impl ZoomConfig {
    pub fn limits(&self) -> ZoomLimits {
        ZoomLimits {
            min: self.min,
            max: self.max,
            step: self.step,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    pub pinch_dead_zone_px: f32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "double_tap_window_ms")]
    pub double_tap_window: Duration,
    /// Double tap on empty space toggles between fit-width and 2x.
    pub double_tap_zoom: bool,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            pinch_dead_zone_px: 10.0,
            double_tap_window: Duration::from_millis(300),
            double_tap_zoom: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub container_width: f32,
    pub container_height: f32,
    pub horizontal_padding: f32,
    pub device_pixel_ratio: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            container_width: 800.0,
            container_height: 1000.0,
            horizontal_padding: 40.0,
            device_pixel_ratio: 1.0,
        }
    }
}

impl LayoutConfig {
    pub fn viewport(&self) -> ViewportState {
        ViewportState::new(
            self.container_width,
            self.container_height,
            self.device_pixel_ratio,
        )
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Grace period before a navigation call is handed to the sandbox.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "settle_delay_ms")]
    pub settle_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
        }
    }
}

impl ViewerConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "pagebridge", "pagebridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ViewerConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zoom = &self.zoom;
        if !(zoom.min.is_finite() && zoom.min > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "zoom.min must be positive, got {}",
                zoom.min
            )));
        }
        if !(zoom.max.is_finite() && zoom.max >= zoom.min) {
            return Err(ConfigError::Invalid(format!(
                "zoom.max ({}) must not be below zoom.min ({})",
                zoom.max, zoom.min
            )));
        }
        if !(zoom.step > 0.0 && zoom.step < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "zoom.step must be in (0, 1), got {}",
                zoom.step
            )));
        }
        if self.gestures.pinch_dead_zone_px < 0.0 {
            return Err(ConfigError::Invalid(
                "gestures.pinch_dead_zone_px must not be negative".into(),
            ));
        }
        if self.load_timeout.is_zero() {
            return Err(ConfigError::Invalid("load_timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
        assert_eq!(config.load_timeout, Duration::from_secs(30));
        assert_eq!(config.zoom.limits(), ZoomLimits::default());
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
load_timeout_secs = 5
forward_console = false

[zoom]
max = 4.0

[gestures]
double_tap_window_ms = 250
double_tap_zoom = false

[bridge]
settle_delay_ms = 20
"#,
        )
        .unwrap();

        let config = ViewerConfig::load(&path).unwrap();
        assert_eq!(config.load_timeout, Duration::from_secs(5));
        assert!(!config.forward_console);
        assert_eq!(config.zoom.max, 4.0);
        assert_eq!(config.zoom.min, 0.5);
        assert_eq!(config.gestures.double_tap_window, Duration::from_millis(250));
        assert!(!config.gestures.double_tap_zoom);
        assert_eq!(config.gestures.pinch_dead_zone_px, 10.0);
        assert_eq!(config.bridge.settle_delay, Duration::from_millis(20));
        assert_eq!(config.layout, LayoutConfig::default());
    }

    #[test]
    fn rejects_inverted_zoom_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[zoom]\nmin = 2.0\nmax = 1.0\n").unwrap();
        assert!(matches!(
            ViewerConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "zoom = [").unwrap();
        match ViewerConfig::load(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
