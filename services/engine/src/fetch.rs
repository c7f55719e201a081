//! Image artifact fetching with bounded retries.
//!
//! Transient failures (connect errors, timeouts, 5xx) are retried with
//! exponential backoff up to a configured attempt budget. Not-found and
//! other 4xx responses are fatal on the first attempt.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from image fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch of {uri} refused with status {status}")]
    Fatal { uri: String, status: u16 },

    #[error("fetch of {uri} failed after {attempts} attempts: {detail}")]
    Exhausted {
        uri: String,
        attempts: u32,
        detail: String,
    },

    #[error("failed to build fetch client: {0}")]
    Client(String),
}

/// Configuration for the image fetcher.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per retry.
    pub initial_backoff: Duration,
    /// Per-request timeout; bounds each in-flight attempt.
    pub request_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum AttemptError {
    Fatal { status: u16 },
    Transient(String),
}

pub struct ImageFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl ImageFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Fetch `uri` into `dest`, returning the byte count.
    pub async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_detail = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.try_fetch(uri, dest).await {
                Ok(bytes) => {
                    debug!(uri = %uri, attempt, bytes, "image fetched");
                    return Ok(bytes);
                }
                Err(AttemptError::Fatal { status }) => {
                    return Err(FetchError::Fatal {
                        uri: uri.to_string(),
                        status,
                    });
                }
                Err(AttemptError::Transient(detail)) => {
                    warn!(uri = %uri, attempt, detail = %detail, "transient fetch failure");
                    last_detail = detail;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            uri: uri.to_string(),
            attempts: self.config.max_attempts,
            detail: last_detail,
        })
    }

    async fn try_fetch(&self, uri: &str, dest: &Path) -> Result<u64, AttemptError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AttemptError::Fatal {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(AttemptError::Transient(format!("status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        tokio::fs::write(dest, &body).await.map_err(|e| {
            AttemptError::Transient(format!("write to {}: {e}", dest.display()))
        })?;

        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> FetcherConfig {
        FetcherConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_fetch_writes_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dfs.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"artifact".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dfs.tar.gz");
        let fetcher = ImageFetcher::new(test_config()).unwrap();

        let bytes = fetcher
            .fetch(&format!("{}/dfs.tar.gz", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn test_not_found_is_fatal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.tar.gz"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = ImageFetcher::new(test_config()).unwrap();

        let err = fetcher
            .fetch(
                &format!("{}/missing.tar.gz", server.uri()),
                &dir.path().join("missing"),
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Fatal { status, .. } => assert_eq!(status, 404),
            other => panic!("expected fatal error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.tar.gz"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = ImageFetcher::new(test_config()).unwrap();

        let bytes = fetcher
            .fetch(
                &format!("{}/flaky.tar.gz", server.uri()),
                &dir.path().join("flaky"),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down.tar.gz"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = ImageFetcher::new(test_config()).unwrap();

        let err = fetcher
            .fetch(
                &format!("{}/down.tar.gz", server.uri()),
                &dir.path().join("down"),
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhausted error, got {other}"),
        }
    }
}
