//! Control channel message format
//!
//! JSON text messages, one per data channel message:
//!
//! ```json
//! {"type": "zoom", "level": 2.5}
//! {"type": "flash", "enabled": true}
//! {"type": "capture"}
//! {"type": "photo", "imageData": "data:image/jpeg;base64,/9j/4AAQ..."}
//! ```
//!
//! Messages with an unknown `type` are ignored so newer peers can add
//! commands without breaking older ones.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

/// Message type tags
pub const MSG_ZOOM: &str = "zoom";
pub const MSG_FLASH: &str = "flash";
pub const MSG_CAPTURE: &str = "capture";
pub const MSG_PHOTO: &str = "photo";

const KNOWN_TYPES: [&str; 4] = [MSG_ZOOM, MSG_FLASH, MSG_CAPTURE, MSG_PHOTO];

/// Message carried on the control data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Set the camera zoom factor
    #[serde(rename = "zoom")]
    Zoom { level: f64 },
    /// Turn the torch on or off
    #[serde(rename = "flash")]
    Flash { enabled: bool },
    /// Ask the camera side for one still image
    #[serde(rename = "capture")]
    CaptureRequest,
    /// Still image as a data URI
    #[serde(rename = "photo")]
    PhotoPayload {
        #[serde(rename = "imageData")]
        image_data: String,
    },
}

impl ControlMessage {
    /// Wire type tag
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Zoom { .. } => MSG_ZOOM,
            ControlMessage::Flash { .. } => MSG_FLASH,
            ControlMessage::CaptureRequest => MSG_CAPTURE,
            ControlMessage::PhotoPayload { .. } => MSG_PHOTO,
        }
    }

    /// Build a photo message from raw image bytes
    pub fn photo(mime_type: &str, data: &[u8]) -> Self {
        ControlMessage::PhotoPayload {
            image_data: encode_data_uri(mime_type, data),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check field constraints against the local zoom range
    pub fn validate(&self, zoom: &ZoomRange) -> Result<()> {
        match self {
            ControlMessage::Zoom { level } => zoom.check(*level),
            ControlMessage::PhotoPayload { image_data } => {
                decode_data_uri(image_data).map(|_| ())
            }
            ControlMessage::Flash { .. } | ControlMessage::CaptureRequest => Ok(()),
        }
    }
}

/// Allowed zoom factors (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomRange {
    fn default() -> Self {
        Self { min: 1.0, max: 4.0 }
    }
}

impl ZoomRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min <= 0.0 || min > max {
            return Err(AppError::Config(format!(
                "Invalid zoom range {}..={}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, level: f64) -> bool {
        level.is_finite() && level >= self.min && level <= self.max
    }

    pub fn check(&self, level: f64) -> Result<()> {
        if self.contains(level) {
            Ok(())
        } else {
            Err(AppError::InvalidControl(format!(
                "Zoom level {} outside {}..={}",
                level, self.min, self.max
            )))
        }
    }
}

/// Parse one inbound control message
///
/// Returns `Ok(None)` for a well-formed message with an unrecognized type.
pub fn parse_control_message(data: &[u8]) -> Result<Option<ControlMessage>> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| AppError::InvalidControl(format!("Not JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::InvalidControl("Missing type field".to_string()))?;

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        debug!("Ignoring control message of unknown type '{}'", kind);
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| AppError::InvalidControl(format!("Bad '{}' message: {}", kind, e)))
}

/// `data:<mime>;base64,<payload>`
pub fn encode_data_uri(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// Split a base64 data URI into its mime type and bytes
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| AppError::InvalidControl("Image data is not a data URI".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| AppError::InvalidControl("Data URI has no payload".to_string()))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| AppError::InvalidControl("Data URI is not base64".to_string()))?;
    if mime_type.is_empty() {
        return Err(AppError::InvalidControl(
            "Data URI has no mime type".to_string(),
        ));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| AppError::InvalidControl(format!("Bad base64 image data: {}", e)))?;
    Ok((mime_type.to_string(), bytes))
}
