//! HTTP transport with SSRF protection on every hop.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use tracing::debug;
use url::Url;

use crate::security::validate_url;
use crate::transport::{HostScope, Transport, TransportError};

/// Default timeout for HTTP requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum number of redirects.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default maximum response size (64 MB).
pub const DEFAULT_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// [`Transport`] over HTTP(S).
///
/// Loopback, private and link-local hosts are refused, including as redirect
/// targets, unless the retrieval's [`HostScope`] is `Local` or the transport
/// was built with `allow_local`. 5xx, 408 and 429 responses, timeouts and
/// connection failures are transient; 404 and 410 are not-found; other
/// failures are permanent.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Validates every redirect hop.
    public: reqwest::Client,
    /// Follows redirects to local hosts too.
    local: reqwest::Client,
    allow_local: bool,
    max_size: u64,
}

/// Builder for [`HttpTransport`].
#[derive(Debug)]
pub struct HttpTransportBuilder {
    timeout: Duration,
    allow_local: bool,
    max_redirects: usize,
    max_size: u64,
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder {
            timeout: DEFAULT_TIMEOUT,
            allow_local: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    async fn get(&self, location: &Url, scope: HostScope) -> Result<Vec<u8>, TransportError> {
        let allow_local = self.allow_local || scope.allows_local();
        validate_url(location, allow_local).map_err(|e| TransportError::permanent(e.to_string()))?;

        let client = if allow_local { &self.local } else { &self.public };
        let response = client
            .get(location.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, location));
        }

        if let Some(len) = response.content_length()
            && len > self.max_size
        {
            return Err(too_large(len, self.max_size));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            let len = (body.len() + chunk.len()) as u64;
            if len > self.max_size {
                return Err(too_large(len, self.max_size));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(location = %location, bytes = body.len(), "Retrieved");
        Ok(body)
    }
}

impl Transport for HttpTransport {
    async fn retrieve(&self, location: &Url, scope: HostScope) -> Result<Vec<u8>, TransportError> {
        self.get(location, scope).await
    }
}

impl HttpTransportBuilder {
    /// Set timeout for HTTP requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow fetching from local network addresses for every provider.
    pub fn allow_local(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    /// Set maximum number of redirects.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set maximum response size in bytes.
    pub fn max_size(mut self, max: u64) -> Self {
        self.max_size = max;
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let local = self.client(true)?;
        let public = if self.allow_local {
            local.clone()
        } else {
            self.client(false)?
        };

        Ok(HttpTransport {
            public,
            local,
            allow_local: self.allow_local,
            max_size: self.max_size,
        })
    }

    fn client(&self, allow_local: bool) -> Result<reqwest::Client, TransportError> {
        let max_redirects = self.max_redirects;
        let redirect = Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("too many redirects (max {max_redirects})"));
            }
            match validate_url(attempt.url(), allow_local) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .redirect(redirect)
            .user_agent(concat!("pkgsys/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::permanent(format!("Failed to build HTTP client: {e}")))
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_redirect() {
        TransportError::permanent(error.to_string())
    } else if error.is_timeout() || error.is_connect() || error.is_body() || error.is_request() {
        TransportError::transient(error.to_string())
    } else {
        TransportError::permanent(error.to_string())
    }
}

fn status_error(status: StatusCode, location: &Url) -> TransportError {
    let message = format!("HTTP {status}: {location}");
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        TransportError::not_found(message)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::transient(message)
    } else {
        TransportError::permanent(message)
    }
}

fn too_large(size: u64, max: u64) -> TransportError {
    TransportError::permanent(format!(
        "Response too large: {size} bytes exceeds maximum of {max} bytes"
    ))
}
