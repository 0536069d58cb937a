//! JSON-over-HTTP upstream adapter.
//!
//! Every call is a `POST {base_url}/resources/{resource_id}/{endpoint}` whose
//! body is the serialized [`UpstreamCall`]. A 2xx response carries a serialized
//! [`UpstreamReply`]; other statuses are mapped onto [`FailureClass`]:
//!
//! ```text
//! 304                     -> NotModified
//! 429                     -> RateLimited (Retry-After honoured)
//! 400/401/403/404/409/422 -> NonRetryable
//! 408/504                 -> Timeout
//! other 5xx, transport    -> Transient
//! ```

use async_trait::async_trait;
use gridflow_core::{FailureClass, UpstreamError};
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{Upstream, UpstreamCall, UpstreamReply};

/// HTTP upstream client
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpUpstream {
    /// Create a client with a per-request transport timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating HTTP upstream");

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, call: &UpstreamCall) -> String {
        format!("{}/resources/{}/{}", self.base_url, call.resource_id(), call.endpoint())
    }
}

/// Map a non-success status to a failure class.
pub(crate) fn classify_status(status: StatusCode) -> FailureClass {
    match status.as_u16() {
        429 => FailureClass::RateLimited,
        400 | 401 | 403 | 404 | 409 | 422 => FailureClass::NonRetryable,
        408 | 504 => FailureClass::Timeout,
        _ if status.is_server_error() => FailureClass::Transient,
        _ => FailureClass::NonRetryable,
    }
}

fn parse_retry_after(value: Option<&header::HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::timeout(err.to_string())
    } else {
        UpstreamError::transient(err.to_string())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self, call), fields(endpoint = call.endpoint(), resource = call.resource_id()))]
    async fn invoke(&self, call: UpstreamCall) -> Result<UpstreamReply, UpstreamError> {
        let url = self.url_for(&call);
        debug!(url = %url, "Sending upstream request");

        let mut request = self.client.post(&url).json(&call);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let UpstreamCall::Read { validator: Some(v), .. } = &call {
            request = request.header(header::IF_NONE_MATCH, v.as_str());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(UpstreamReply::NotModified);
        }

        if !status.is_success() {
            let class = classify_status(status);
            let retry_after = parse_retry_after(response.headers().get(header::RETRY_AFTER));
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, class = ?class, "Upstream returned error");

            let message = format!("status {}: {}", status, body);
            return Err(match class {
                FailureClass::RateLimited => UpstreamError::rate_limited(message, retry_after),
                FailureClass::Timeout => UpstreamError::timeout(message),
                FailureClass::NonRetryable => UpstreamError::non_retryable(message),
                FailureClass::Transient => UpstreamError::transient(message),
            });
        }

        response.json::<UpstreamReply>().await.map_err(|e| {
            UpstreamError::non_retryable(format!("malformed upstream reply: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::RateLimited);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureClass::NonRetryable);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), FailureClass::Timeout);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), FailureClass::Transient);
    }

    #[test]
    fn test_retry_after_parsing() {
        let value = header::HeaderValue::from_static("3");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(3)));

        let value = header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&value)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_url_layout() {
        let upstream = HttpUpstream::new("http://localhost:9000/", Duration::from_secs(5)).unwrap();
        let call = UpstreamCall::BatchWrite { resource_id: "doc-1".into(), writes: vec![] };
        assert_eq!(upstream.url_for(&call), "http://localhost:9000/resources/doc-1/batch_write");
    }
}
