use serde::{Deserialize, Serialize};

use crate::control::ZoomRange;
use crate::error::Result;
use crate::exchange::CodecKind;
pub use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Control channel settings
    pub control: ControlConfig,
    /// Out-of-band exchange settings
    pub exchange: ExchangeConfig,
    /// Power advisor settings
    pub advisor: AdvisorConfig,
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Lowest accepted zoom level
    pub zoom_min: f64,
    /// Highest accepted zoom level
    pub zoom_max: f64,
    /// Minimum seconds between repeated diagnostics of the same kind
    pub diagnostic_throttle_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let range = ZoomRange::default();
        Self {
            zoom_min: range.min,
            zoom_max: range.max,
            diagnostic_throttle_secs: 5,
        }
    }
}

impl ControlConfig {
    pub fn zoom_range(&self) -> Result<ZoomRange> {
        ZoomRange::new(self.zoom_min, self.zoom_max)
    }
}

/// Out-of-band exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExchangeConfig {
    pub codec: CodecKind,
}

/// Power advisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Suggestion endpoint; no endpoint means the safe default is always used
    pub endpoint: Option<String>,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Reported device model
    pub device_model: String,
    /// Reported OS version
    pub os_version: String,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5000,
            device_model: "generic".to_string(),
            os_version: std::env::consts::OS.to_string(),
        }
    }
}
