//! HTTPS prober for the appliance web UI

use crate::types::WebStatus;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

/// Time a single probe may take
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Body marker of a logged-in-capable UI
pub const DASHBOARD_MARKER: &str = "Dashboard";

/// Web UI capability of an appliance
#[async_trait]
pub trait WebProbe: Send + Sync {
    /// Issue one request and classify the answer
    async fn probe(&self) -> WebStatus;
}

/// Classify a response: 200 with the marker is up, 5xx is down, anything else unsure
pub fn classify(status: u16, body: &str) -> WebStatus {
    match status {
        200 if body.contains(DASHBOARD_MARKER) => WebStatus::Up,
        500..=599 => WebStatus::Down,
        _ => WebStatus::Unsure,
    }
}

/// reqwest-based prober; certificate verification is off for self-signed appliances
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    url: String,
}

impl HttpProber {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, PROBE_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WebProbe for HttpProber {
    async fn probe(&self) -> WebStatus {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                // Refused connections are expected while the appliance boots
                if !e.is_connect() {
                    debug!("Probe of {} failed: {}", self.url, e);
                }
                return WebStatus::Down;
            }
        };
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!("Probe of {} lost the body: {}", self.url, e);
                return WebStatus::Down;
            }
        };
        let verdict = classify(status, &body);
        trace!(url = %self.url, status, %verdict, "web probe");
        verdict
    }
}
