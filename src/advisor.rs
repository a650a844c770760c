//! Power-management advisory oracle
//!
//! The host asks an external suggestion service whether it should keep the
//! camera service alive given its device status. The service is opaque and
//! unreliable: every fault collapses into the same conservative advice, so
//! callers never see an error from `advise_or_default`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AdvisorConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};

/// Reason attached to the fallback advice
pub const FALLBACK_REASON: &str = concat!(
    "Could not get a suggestion due to an internal error. ",
    "Defaulting to not keeping the service alive to save power."
);

/// Device status sent to the advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_model: String,
    pub os_version: String,
    /// Percent, 0 to 100
    pub battery_level: u8,
    pub is_screen_on: bool,
}

impl DeviceStatus {
    /// Battery level is clamped to 0..=100
    pub fn new(
        device_model: impl Into<String>,
        os_version: impl Into<String>,
        battery_level: i32,
        is_screen_on: bool,
    ) -> Self {
        Self {
            device_model: device_model.into(),
            os_version: os_version.into(),
            battery_level: battery_level.clamp(0, 100) as u8,
            is_screen_on,
        }
    }
}

/// Advisor suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    pub should_keep_alive: bool,
    pub reason: String,
}

impl Advice {
    /// Conservative advice used whenever the advisor fails
    pub fn fallback() -> Self {
        Self {
            should_keep_alive: false,
            reason: FALLBACK_REASON.to_string(),
        }
    }
}

#[async_trait]
pub trait PowerAdvisor: Send + Sync {
    async fn advise(&self, status: &DeviceStatus) -> Result<Advice>;
}

/// Ask `advisor`, substituting `Advice::fallback()` on any fault
///
/// The resulting advice is published on `events` when given.
pub async fn advise_or_default(
    advisor: &dyn PowerAdvisor,
    status: &DeviceStatus,
    events: Option<&EventBus>,
) -> Advice {
    let advice = match advisor.advise(status).await {
        Ok(advice) => {
            debug!(
                "Advisor suggests keep_alive={} ({})",
                advice.should_keep_alive, advice.reason
            );
            advice
        }
        Err(e) => {
            warn!("Power advisor failed, using fallback: {}", e);
            Advice::fallback()
        }
    };

    if let Some(events) = events {
        events.publish(SessionEvent::AdvisorSuggestion {
            should_keep_alive: advice.should_keep_alive,
            reason: advice.reason.clone(),
        });
    }
    advice
}

/// Advisor behind an HTTP endpoint: POST `DeviceStatus` JSON, expect `Advice` JSON
pub struct HttpAdvisor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| AppError::Config(format!("Invalid advisor endpoint: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Advisor(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }

    /// Advisor from config; `None` without an endpoint
    pub fn from_config(config: &AdvisorConfig) -> Result<Option<Self>> {
        match config.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Ok(Some(Self::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PowerAdvisor for HttpAdvisor {
    async fn advise(&self, status: &DeviceStatus) -> Result<Advice> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(status)
            .send()
            .await
            .map_err(|e| AppError::Advisor(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Advisor(format!(
                "Advisor returned {}",
                response.status()
            )));
        }

        response
            .json::<Advice>()
            .await
            .map_err(|e| AppError::Advisor(format!("Invalid advice: {}", e)))
    }
}

/// Advisor used when no endpoint is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdvisor;

#[async_trait]
impl PowerAdvisor for NoAdvisor {
    async fn advise(&self, _status: &DeviceStatus) -> Result<Advice> {
        Err(AppError::Advisor("No advisor configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingAdvisor;

    #[async_trait]
    impl PowerAdvisor for FailingAdvisor {
        async fn advise(&self, _status: &DeviceStatus) -> Result<Advice> {
            Err(AppError::Advisor("model unavailable".to_string()))
        }
    }

    struct FixedAdvisor(Advice);

    #[async_trait]
    impl PowerAdvisor for FixedAdvisor {
        async fn advise(&self, _status: &DeviceStatus) -> Result<Advice> {
            Ok(self.0.clone())
        }
    }

    fn status() -> DeviceStatus {
        DeviceStatus::new("Pixel 7", "Android 14", 42, true)
    }

    #[tokio::test]
    async fn test_fault_yields_fallback() {
        let advice = advise_or_default(&FailingAdvisor, &status(), None).await;
        assert!(!advice.should_keep_alive);
        assert_eq!(advice.reason, FALLBACK_REASON);

        let advice = advise_or_default(&NoAdvisor, &status(), None).await;
        assert_eq!(advice, Advice::fallback());
    }

    #[tokio::test]
    async fn test_suggestion_is_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let expected = Advice {
            should_keep_alive: true,
            reason: "Plugged in".to_string(),
        };
        let advice =
            advise_or_default(&FixedAdvisor(expected.clone()), &status(), Some(&bus)).await;
        assert_eq!(advice, expected);

        match rx.recv().await.unwrap() {
            SessionEvent::AdvisorSuggestion {
                should_keep_alive,
                reason,
            } => {
                assert!(should_keep_alive);
                assert_eq!(reason, "Plugged in");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_fallback() {
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let advisor = HttpAdvisor::new("http://127.0.0.1:9/advice", Duration::from_millis(500))
            .unwrap();
        let advice = advise_or_default(&advisor, &status(), None).await;
        assert_eq!(advice, Advice::fallback());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_value(DeviceStatus::new("Pixel", "14", 150, false)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "deviceModel": "Pixel",
                "osVersion": "14",
                "batteryLevel": 100,
                "isScreenOn": false,
            })
        );
        assert_eq!(DeviceStatus::new("a", "b", -3, true).battery_level, 0);

        let advice: Advice =
            serde_json::from_str(r#"{"shouldKeepAlive":true,"reason":"charging"}"#).unwrap();
        assert!(advice.should_keep_alive);
    }

    #[test]
    fn test_from_config() {
        let mut config = AdvisorConfig::default();
        assert!(HttpAdvisor::from_config(&config).unwrap().is_none());
        config.endpoint = Some("not a url".to_string());
        assert!(HttpAdvisor::from_config(&config).is_err());
        config.endpoint = Some("https://advisor.example/suggest".to_string());
        assert!(HttpAdvisor::from_config(&config).unwrap().is_some());
    }
}
