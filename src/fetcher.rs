//! Outbound fetcher: one bounded-time GET per target.

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

/// Retrieves the raw body behind a target.
///
/// The fetcher knows nothing about the payload schema; decoding belongs to
/// the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken, target: &str) -> Result<Bytes, FetchError>;
}

/// Parse a target as an absolute `http`/`https` URL.
pub fn parse_target(target: &str) -> Result<Url, FetchError> {
    let url = Url::parse(target).map_err(|e| FetchError::InvalidTarget {
        target: target.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FetchError::InvalidTarget {
            target: target.to_string(),
            reason: format!("unsupported scheme {scheme:?}"),
        }),
    }
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    call_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(call_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(call_timeout).build()?;

        Ok(Self {
            client,
            call_timeout,
        })
    }

    async fn get(&self, target: &str, url: Url) -> Result<Bytes, FetchError> {
        let start = Instant::now();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(target, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = target, status = status.as_u16(), "Upstream returned non-success status");
            return Err(FetchError::Upstream {
                target: target.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(target, e))?;

        debug!(
            url = target,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetch complete"
        );

        Ok(body)
    }

    fn transport_error(&self, target: &str, err: reqwest::Error) -> FetchError {
        let message = if err.is_timeout() {
            format!("timed out after {:?}", self.call_timeout)
        } else {
            err.to_string()
        };

        FetchError::Transport {
            target: target.to_string(),
            message,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, cancel, target), fields(url = %target))]
    async fn fetch(&self, cancel: &CancellationToken, target: &str) -> Result<Bytes, FetchError> {
        let url = parse_target(target)?;

        tokio::select! {
            result = self.get(target, url) => result,
            _ = cancel.cancelled() => Err(FetchError::Transport {
                target: target.to_string(),
                message: "request cancelled".to_string(),
            }),
        }
    }
}
