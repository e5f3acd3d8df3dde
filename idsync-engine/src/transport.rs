//! HTTP transport abstraction.
//!
//! The processor and the opt-out path only ever issue GET requests, so the
//! seam is a single async method. [`ReqwestTransport`] is the production
//! implementation; [`mock::MockTransport`] scripts responses for tests.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Content type sent with sync hits.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// An outbound GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl NetworkRequest {
    /// A GET for `url` with the same connect and read timeout.
    #[must_use]
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            headers: Vec::new(),
            connect_timeout: timeout,
            read_timeout: timeout,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Transport-level failures, before or instead of an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts, refused/unresolved connections and dropped connections are
    /// transient; the hit should be tried again later.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::ConnectionLost(_)
        )
    }
}

/// Outcome of a request. A transport error may come with or without a status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: Option<u16>,
    pub body: Option<Vec<u8>>,
    pub error: Option<TransportError>,
}

impl HttpResponse {
    /// A completed response.
    #[must_use]
    pub fn with_status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(status),
            body: Some(body.into()),
            error: None,
        }
    }

    /// A request that never produced a response.
    #[must_use]
    pub fn failed(error: TransportError) -> Self {
        Self {
            status: None,
            body: None,
            error: Some(error),
        }
    }
}

/// Something that can perform GET requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs the request. Never fails outright; errors are reported in
    /// [`HttpResponse::error`].
    async fn get(&self, request: &NetworkRequest) -> HttpResponse;
}

/// [`HttpTransport`] over a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport that gives up connecting, or waiting on a read,
    /// after `timeout`.
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| EngineError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn classify(e: &reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::ConnectionFailed(e.to_string())
        } else if e.is_builder() {
            TransportError::InvalidRequest(e.to_string())
        } else if e.is_request() || e.is_body() {
            TransportError::ConnectionLost(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &NetworkRequest) -> HttpResponse {
        let mut builder = self
            .client
            .get(request.url.clone())
            .timeout(request.read_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "request failed");
                return HttpResponse::failed(Self::classify(&e));
            }
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => HttpResponse::with_status(status, body.to_vec()),
            Err(e) => HttpResponse {
                status: Some(status),
                body: None,
                error: Some(Self::classify(&e)),
            },
        }
    }
}

/// A scripted transport for testing.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Mutex, PoisonError};
    use tokio::sync::Notify;

    /// Replies with queued responses in order, then with a fallback.
    /// Every request is recorded.
    pub struct MockTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        fallback: HttpResponse,
        requests: Mutex<Vec<NetworkRequest>>,
        notify: Notify,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        /// A transport that answers every request with `200` and an empty body.
        pub fn new() -> Self {
            Self::with_fallback(HttpResponse::with_status(200, Vec::new()))
        }

        /// A transport that answers with `fallback` once the script runs out.
        pub fn with_fallback(fallback: HttpResponse) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback,
                requests: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }
        }

        /// Queues a response for the next unanswered request.
        pub fn push_response(&self, response: HttpResponse) {
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(response);
        }

        /// All requests received so far.
        pub fn requests(&self) -> Vec<NetworkRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        /// Waits until at least `n` requests have been received.
        pub async fn wait_for_requests(&self, n: usize) {
            loop {
                let notified = self.notify.notified();
                if self.request_count() >= n {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn get(&self, request: &NetworkRequest) -> HttpResponse {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            let response = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            self.notify.notify_waiters();
            response
        }
    }
}
