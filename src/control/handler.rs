//! Inbound control message dispatch
//!
//! Every failure here stays local: it is logged, published as a
//! `control.diagnostic` event and never answered over the channel. The only
//! reply the protocol knows is the photo sent back for a capture request.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::device::CameraDevice;
use super::message::{parse_control_message, ControlMessage, ZoomRange};
use crate::error::AppError;
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Applies inbound control messages to the local camera
pub struct ControlHandler {
    device: Arc<dyn CameraDevice>,
    zoom_range: ZoomRange,
    events: Arc<EventBus>,
    throttler: LogThrottler,
}

impl ControlHandler {
    pub fn new(
        device: Arc<dyn CameraDevice>,
        zoom_range: ZoomRange,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            device,
            zoom_range,
            events,
            throttler: LogThrottler::default(),
        }
    }

    /// Use a custom throttle interval for repeated diagnostics
    pub fn with_throttler(mut self, throttler: LogThrottler) -> Self {
        self.throttler = throttler;
        self
    }

    /// Parse and handle raw channel data; returns the reply to send, if any
    pub async fn handle_raw(&self, data: &[u8]) -> Option<ControlMessage> {
        match parse_control_message(data) {
            Ok(Some(msg)) => self.handle(msg).await,
            Ok(None) => None,
            Err(e) => {
                warn_throttled!(self.throttler, "parse", "Dropping control message: {}", e);
                self.diagnostic("parse", e.to_string());
                None
            }
        }
    }

    /// Handle one parsed message; returns the reply to send, if any
    pub async fn handle(&self, msg: ControlMessage) -> Option<ControlMessage> {
        debug!("Control message received: {}", msg.kind());

        if let Err(e) = msg.validate(&self.zoom_range) {
            warn!("Rejecting {} message: {}", msg.kind(), e);
            self.diagnostic(msg.kind(), e.to_string());
            return None;
        }

        self.events.publish(SessionEvent::ControlReceived {
            message: msg.clone(),
        });

        match msg {
            ControlMessage::Zoom { level } => {
                let result = self.device.set_zoom(level).await;
                self.report("zoom", result.err());
                None
            }
            ControlMessage::Flash { enabled } => {
                let result = self.device.set_torch(enabled).await;
                self.report("torch", result.err());
                None
            }
            ControlMessage::CaptureRequest => match self.device.capture_frame().await {
                Ok(frame) => {
                    info!(
                        "Captured {} ({} bytes) for peer",
                        frame.mime_type,
                        frame.data.len()
                    );
                    Some(ControlMessage::photo(&frame.mime_type, &frame.data))
                }
                Err(e) => {
                    self.report("capture", Some(e));
                    None
                }
            },
            ControlMessage::PhotoPayload { image_data } => {
                info!("Photo received ({} bytes encoded)", image_data.len());
                self.events.publish(SessionEvent::PhotoReceived {
                    image_data,
                    received_at: chrono::Utc::now(),
                });
                None
            }
        }
    }

    fn report(&self, capability: &str, error: Option<AppError>) {
        let Some(error) = error else {
            self.throttler.clear(capability);
            return;
        };
        match &error {
            AppError::UnsupportedCapability { .. } => {
                warn_throttled!(self.throttler, capability, "{}", error);
            }
            _ => warn!("{} request failed on {}: {}", capability, self.device.name(), error),
        }
        self.diagnostic(capability, error.to_string());
    }

    fn diagnostic(&self, capability: &str, message: String) {
        self.events.publish(SessionEvent::ControlDiagnostic {
            capability: capability.to_string(),
            message,
        });
    }
}
