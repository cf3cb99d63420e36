//! Site availability probes
//!
//! The tracker only sees the `Prober` trait. Production uses `HttpProber`,
//! tests use scripted probers with canned outcomes.

use async_trait::async_trait;
use sitewatch_common::{SiteDescriptor, StatusOutcome, WatchError};
use std::time::Duration;
use tracing::{debug, warn};

/// One availability check per site per tick
#[async_trait]
pub trait Prober: Send + Sync {
    /// Never fails: transport problems come back as a non-success outcome
    async fn probe(&self, site: &SiteDescriptor) -> StatusOutcome;
}

/// HTTP GET prober. 2xx and 3xx count as up; redirects are not followed.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("sitewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, site: &SiteDescriptor) -> StatusOutcome {
        match self.client.get(&site.url).send().await {
            Ok(response) => {
                let outcome = StatusOutcome::from_status(response.status().as_u16());
                debug!("[TRACKER] {} -> {}", site.name, outcome.describe());
                outcome
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else if e.is_connect() {
                    format!("connect failed: {}", e)
                } else {
                    e.to_string()
                };
                let err = WatchError::ProbeTransport {
                    site: site.name.clone(),
                    reason: reason.clone(),
                };
                warn!("[TRACKER] {}", err);
                StatusOutcome::transport_failure(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_unreachable_host_is_down() {
        let prober = HttpProber::new(Duration::from_secs(2)).unwrap();
        let site = SiteDescriptor {
            name: "app1".to_string(),
            runtime_version: "8.1".to_string(),
            root_path: PathBuf::from("/srv/app1"),
            // Port 9 on loopback is closed on any sane test host
            url: "http://127.0.0.1:9/".to_string(),
        };
        let outcome = prober.probe(&site).await;
        assert!(!outcome.success);
        assert!(outcome.code.is_none());
        assert!(outcome.error.is_some());
    }
}
