use reqwest::Client;
use std::time::{Duration, Instant};

/// Throttled liveness reporter. Triggered by pipeline activity rather than a
/// dedicated timer, so "no messages flowing" shows up as a missed heartbeat,
/// which is itself the monitored condition.
pub struct HeartbeatReporter {
    client: Client,
    url: Option<String>,
    interval: Duration,
    last_attempt: Instant,
}

impl HeartbeatReporter {
    pub fn new(url: Option<String>, interval: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            interval,
            last_attempt: Instant::now(),
        }
    }

    fn is_due(&self) -> bool {
        self.url.is_some() && self.last_attempt.elapsed() >= self.interval
    }

    /// Send one GET if the interval has elapsed. Failures are logged and the
    /// next qualifying trigger retries; nothing here affects message
    /// processing.
    pub async fn tick(&mut self) {
        if !self.is_due() {
            return;
        }
        let Some(url) = self.url.as_deref() else {
            return;
        };
        self.last_attempt = Instant::now();
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("heartbeat delivered");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "heartbeat rejected; will retry next interval");
            }
            Err(err) => {
                tracing::warn!(error = %err, "heartbeat failed; will retry next interval");
            }
        }
    }
}
