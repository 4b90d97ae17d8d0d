use crate::config::Config;
use crate::server::ServerStatus;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Up/down probe behind the sidebar's status dot. Any HTTP response counts
/// as Up (a 500 still means something is listening and serving); only a
/// failure to connect within the timeout is Down. The polling cadence
/// belongs to the caller.
pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn check(&self, url: &str) -> ServerStatus {
        match self.client.get(url).send().await {
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Server responded");
                ServerStatus::Up
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                ServerStatus::Down
            }
        }
    }
}
