//! Out-of-band exchange codecs
//!
//! A session description leaves the device as text: rendered as a QR code,
//! or copied and pasted by hand. The negotiation is the same either way; only
//! the codec differs. Decoding treats its input as untrusted: any scanned
//! string may arrive, and anything that is not a payload becomes
//! `AppError::MalformedPayload`.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::webrtc::signaling::SessionDescription;

/// Prefix identifying `TextCodec` payloads
pub const TEXT_PAYLOAD_PREFIX: &str = "camlink:";

/// Text handed to the optical code / clipboard collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandPayload(String);

impl OutOfBandPayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for OutOfBandPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pluggable payload encoding
pub trait ExchangeCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, desc: &SessionDescription) -> Result<OutOfBandPayload>;

    fn decode(&self, payload: &str) -> Result<SessionDescription>;
}

/// Available codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Compact JSON, meant for QR rendering
    #[default]
    Qr,
    /// Prefixed URL-safe base64, meant for copy/paste through chat apps
    Text,
}

impl CodecKind {
    pub fn codec(&self) -> Arc<dyn ExchangeCodec> {
        match self {
            CodecKind::Qr => Arc::new(QrCodec),
            CodecKind::Text => Arc::new(TextCodec),
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::Qr => write!(f, "qr"),
            CodecKind::Text => write!(f, "text"),
        }
    }
}

fn to_json(desc: &SessionDescription) -> Result<String> {
    Ok(serde_json::to_string(desc)?)
}

fn from_json(text: &str) -> Result<SessionDescription> {
    let desc: SessionDescription = serde_json::from_str(text)
        .map_err(|e| AppError::MalformedPayload(format!("Not a session description: {}", e)))?;
    if desc.sdp.trim().is_empty() {
        return Err(AppError::MalformedPayload(
            "Session description body is empty".to_string(),
        ));
    }
    Ok(desc)
}

/// JSON payload: `{"type":"offer","sdp":"..."}`
#[derive(Debug, Default, Clone, Copy)]
pub struct QrCodec;

impl ExchangeCodec for QrCodec {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn encode(&self, desc: &SessionDescription) -> Result<OutOfBandPayload> {
        to_json(desc).map(OutOfBandPayload)
    }

    fn decode(&self, payload: &str) -> Result<SessionDescription> {
        from_json(payload.trim())
    }
}

/// `camlink:<base64url(json)>`, safe to paste through chat apps that mangle
/// line breaks and quotes. Plain JSON is accepted on decode as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl ExchangeCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn encode(&self, desc: &SessionDescription) -> Result<OutOfBandPayload> {
        Ok(OutOfBandPayload(format!(
            "{}{}",
            TEXT_PAYLOAD_PREFIX,
            URL_SAFE_NO_PAD.encode(to_json(desc)?)
        )))
    }

    fn decode(&self, payload: &str) -> Result<SessionDescription> {
        let payload = payload.trim();
        if payload.starts_with('{') {
            return from_json(payload);
        }

        let encoded = payload.strip_prefix(TEXT_PAYLOAD_PREFIX).ok_or_else(|| {
            AppError::MalformedPayload(format!("Missing '{}' prefix", TEXT_PAYLOAD_PREFIX))
        })?;
        // Pasting may wrap long lines
        let encoded: String = encoded.split_whitespace().collect();
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|e| AppError::MalformedPayload(format!("Bad base64: {}", e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AppError::MalformedPayload("Payload is not UTF-8".to_string()))?;
        from_json(&text)
    }
}
