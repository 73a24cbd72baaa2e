//! reqwest-based snapshot store with timeouts and bounded retry.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::{BackendError, BackendResult, FetchRequest, FetchResponse, SaveRequest, SnapshotStore};
use crate::config::{BackendConfig, RetryPolicy};

/// HTTP client for the document backend
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    fetch_url: String,
    save_url: String,
    retry: RetryPolicy,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(BackendError::Client)?;

        Ok(Self {
            client,
            fetch_url: config.fetch_url(),
            save_url: config.save_url(),
            retry: config.retry,
        })
    }

    /// POST a JSON body, retrying transient failures
    async fn post_with_retry<B>(&self, url: &str, body: &B) -> BackendResult<reqwest::Response>
    where
        B: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.client.post(url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => BackendError::Status {
                    url: url.to_string(),
                    status: resp.status().as_u16(),
                },
                Err(source) => BackendError::Transport {
                    url: url.to_string(),
                    source,
                },
            };

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(error);
            }

            let delay = with_jitter(self.retry.backoff_for(attempt));
            warn!(
                url,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Backend request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SnapshotStore for HttpBackend {
    #[instrument(name = "backend_fetch_snapshot", skip_all, fields(doc_id = %request.doc_id))]
    async fn fetch_snapshot(&self, request: &FetchRequest) -> BackendResult<FetchResponse> {
        let response = match self.post_with_retry(&self.fetch_url, request).await {
            Ok(response) => response,
            // The backend answers 404 for documents it has never stored
            Err(BackendError::Status { status: 404, .. }) => {
                debug!("Backend has no record for document");
                return Ok(FetchResponse::default());
            }
            Err(e) => return Err(e),
        };

        response
            .json::<FetchResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    #[instrument(name = "backend_persist", skip_all, fields(doc_id = %request.doc_id))]
    async fn persist(&self, request: &SaveRequest) -> BackendResult<()> {
        self.post_with_retry(&self.save_url, request).await?;
        debug!(bytes = request.doc_uint8.len(), "Document persisted");
        Ok(())
    }
}

/// Spread retries of many rooms so they do not hit the backend in lockstep
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
