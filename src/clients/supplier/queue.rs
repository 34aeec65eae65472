//! Serialized request queue for the supplier API.
//!
//! The supplier enforces a very low global request rate, so every outbound
//! call (token fetches included) is executed one at a time by a single worker
//! task that spaces requests apart and fails fast while a cooldown is active.

use metrics::counter;
use reqwest::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::SupplierError;
use crate::config::SupplierConfig;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub min_interval: Duration,
    pub rate_limit_backoff: Duration,
    pub invalid_key_cooldown: Duration,
    pub capacity: usize,
}

impl From<&SupplierConfig> for QueueSettings {
    fn from(cfg: &SupplierConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(cfg.min_request_interval_ms),
            rate_limit_backoff: Duration::from_millis(cfg.rate_limit_backoff_ms),
            invalid_key_cooldown: Duration::from_millis(cfg.invalid_key_cooldown_ms),
            capacity: cfg.queue_capacity.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct Gate {
    last_request: Option<Instant>,
    rate_limited_at: Option<Instant>,
    invalid_key_at: Option<Instant>,
}

impl Gate {
    fn check(&self, settings: &QueueSettings, now: Instant) -> Result<(), SupplierError> {
        if let Some(at) = self.invalid_key_at {
            let elapsed = now.saturating_duration_since(at);
            if elapsed < settings.invalid_key_cooldown {
                return Err(SupplierError::KeyCooldown {
                    retry_after: settings.invalid_key_cooldown - elapsed,
                });
            }
        }
        if let Some(at) = self.rate_limited_at {
            let elapsed = now.saturating_duration_since(at);
            if elapsed < settings.rate_limit_backoff {
                return Err(SupplierError::RateLimited {
                    retry_after: settings.rate_limit_backoff - elapsed,
                });
            }
        }
        Ok(())
    }

    fn spacing(&self, settings: &QueueSettings, now: Instant) -> Duration {
        self.last_request
            .map(|last| settings.min_interval.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Response, SupplierError>>,
}

/// Handle to the queue worker. Cloning shares the same worker and cooldown state.
#[derive(Clone)]
pub struct RequestQueue {
    sender: mpsc::Sender<Job>,
    gate: Arc<Mutex<Gate>>,
    settings: QueueSettings,
}

impl RequestQueue {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(http: reqwest::Client, settings: QueueSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.capacity);
        let gate = Arc::new(Mutex::new(Gate::default()));
        tokio::spawn(run_worker(http, receiver, Arc::clone(&gate), settings));
        Self {
            sender,
            gate,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Executes `request` once every earlier request has gone out.
    pub async fn submit(&self, request: Request) -> Result<Response, SupplierError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| SupplierError::QueueClosed)?;
        response.await.map_err(|_| SupplierError::QueueClosed)?
    }

    /// Starts the invalid-key cooldown; queued and new requests fail fast until it ends.
    pub async fn note_invalid_key(&self) {
        self.gate.lock().await.invalid_key_at = Some(Instant::now());
    }

    pub async fn note_rate_limited(&self) {
        self.gate.lock().await.rate_limited_at = Some(Instant::now());
    }
}

async fn run_worker(
    http: reqwest::Client,
    mut receiver: mpsc::Receiver<Job>,
    gate: Arc<Mutex<Gate>>,
    settings: QueueSettings,
) {
    while let Some(job) = receiver.recv().await {
        let wait = {
            let gate = gate.lock().await;
            let now = Instant::now();
            if let Err(err) = gate.check(&settings, now) {
                counter!("settlement.supplier.requests_rejected", 1);
                debug!(error = %err, "Supplier request rejected during cooldown");
                let _ = job.reply.send(Err(err));
                continue;
            }
            gate.spacing(&settings, now)
        };

        if !wait.is_zero() {
            sleep(wait).await;
        }
        gate.lock().await.last_request = Some(Instant::now());

        let url = job.request.url().path().to_string();
        let result = http.execute(job.request).await.map_err(SupplierError::from);
        counter!("settlement.supplier.requests", 1);

        if let Ok(response) = &result {
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                warn!(path = %url, "Supplier rate limit hit; backing off");
                gate.lock().await.rate_limited_at = Some(Instant::now());
            }
        }
        let _ = job.reply.send(result);
    }
    debug!("Supplier request queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(min_interval_ms: u64) -> QueueSettings {
        QueueSettings {
            min_interval: Duration::from_millis(min_interval_ms),
            rate_limit_backoff: Duration::from_secs(300),
            invalid_key_cooldown: Duration::from_secs(60),
            capacity: 16,
        }
    }

    fn get(http: &reqwest::Client, url: String) -> Request {
        http.get(url).build().unwrap()
    }

    #[tokio::test]
    async fn requests_are_spaced_apart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let queue = RequestQueue::spawn(http.clone(), settings(60));
        let started = std::time::Instant::now();
        let calls = (0..3).map(|_| {
            let queue = queue.clone();
            let request = get(&http, format!("{}/ping", server.uri()));
            async move { queue.submit(request).await }
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().status(), StatusCode::OK);
        }
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn rate_limit_response_starts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let queue = RequestQueue::spawn(http.clone(), settings(1));
        let first = queue
            .submit(get(&http, format!("{}/a", server.uri())))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::TOO_MANY_REQUESTS);

        let second = queue
            .submit(get(&http, format!("{}/b", server.uri())))
            .await
            .unwrap_err();
        assert_matches!(second, SupplierError::RateLimited { .. });
    }

    #[tokio::test]
    async fn invalid_key_cooldown_fails_fast() {
        let server = MockServer::start().await;
        let http = reqwest::Client::new();
        let queue = RequestQueue::spawn(http.clone(), settings(1));
        queue.note_invalid_key().await;

        let err = queue
            .submit(get(&http, format!("{}/a", server.uri())))
            .await
            .unwrap_err();
        assert_matches!(err, SupplierError::KeyCooldown { retry_after } if retry_after <= Duration::from_secs(60));
    }
}
