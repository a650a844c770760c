//! Camera device trait
//!
//! The camera is an external collaborator. Implementations report missing
//! hardware features as `AppError::UnsupportedCapability`, which the control
//! handler keeps local.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{AppError, Result};

/// Still image produced by the camera
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// e.g. "image/jpeg"
    pub mime_type: String,
    pub data: Bytes,
}

impl CapturedFrame {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// Camera controls reachable from the control channel
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Device name (for diagnostics)
    fn name(&self) -> &str;

    /// Apply a zoom factor already validated against the zoom range
    async fn set_zoom(&self, _level: f64) -> Result<()> {
        Err(AppError::unsupported("zoom", format!("{} has no zoom control", self.name())))
    }

    /// Switch the torch
    async fn set_torch(&self, _enabled: bool) -> Result<()> {
        Err(AppError::unsupported("torch", format!("{} has no torch", self.name())))
    }

    /// Grab the current frame as an encoded still image
    async fn capture_frame(&self) -> Result<CapturedFrame>;
}

/// Camera with no controllable hardware (data-only sessions)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCamera;

#[async_trait]
impl CameraDevice for NullCamera {
    fn name(&self) -> &str {
        "null"
    }

    async fn capture_frame(&self) -> Result<CapturedFrame> {
        Err(AppError::unsupported("capture", "no capture device attached"))
    }
}

/// Camera backed by a fixed image, used by the demo and tests
#[derive(Debug, Clone)]
pub struct StillImageCamera {
    frame: CapturedFrame,
    torch: bool,
}

impl StillImageCamera {
    pub fn new(frame: CapturedFrame) -> Self {
        Self { frame, torch: true }
    }

    /// Report the torch as unsupported
    pub fn without_torch(mut self) -> Self {
        self.torch = false;
        self
    }
}

#[async_trait]
impl CameraDevice for StillImageCamera {
    fn name(&self) -> &str {
        "still-image"
    }

    async fn set_zoom(&self, level: f64) -> Result<()> {
        tracing::debug!("Still image camera zoom -> {:.1}x", level);
        Ok(())
    }

    async fn set_torch(&self, enabled: bool) -> Result<()> {
        if !self.torch {
            return Err(AppError::unsupported("torch", "still image camera has no torch"));
        }
        tracing::debug!("Still image camera torch -> {}", enabled);
        Ok(())
    }

    async fn capture_frame(&self) -> Result<CapturedFrame> {
        Ok(self.frame.clone())
    }
}
