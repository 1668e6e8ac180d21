//! Abstraction over the HTTP client used to deliver payloads.
//!
//! The scheduler only depends on the [`Transport`] trait. [`HttpTransport`] implements it with
//! `reqwest`, tests substitute a scripted transport.

use std::future::Future;
use std::time::Duration;

use beacon_config::Config;
use bytes::Bytes;
use reqwest::header;
use url::Url;

/// A request to deliver a single payload.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// The ingestion URL.
    pub url: Url,
    /// The encoded payload.
    pub body: Bytes,
    /// Value of the `Content-Type` header.
    pub content_type: &'static str,
    /// Value of the `Content-Encoding` header, if the payload is compressed.
    pub content_encoding: Option<&'static str>,
}

/// The parts of a response the channel acts upon.
#[derive(Clone, Debug, Default)]
pub struct TransportResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The raw value of the `Retry-After` header.
    pub retry_after: Option<String>,
    /// The response body.
    pub body: Bytes,
}

/// An error delivering a request, before a response was received.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request did not complete within the timeout.
    #[error("request timed out")]
    Timeout,
    /// The request could not be sent or the response could not be read.
    #[error("could not send request")]
    SendFailed(#[from] reqwest::Error),
}

impl TransportError {
    /// Returns `true` if the error indicates a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::SendFailed(error) => error.is_timeout(),
        }
    }
}

/// Delivers payloads to the ingestion endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Sends the request and returns the response, regardless of its status.
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// Maximum size of a response body that is read.
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Transport sending requests with a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with timeouts from the configuration.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.http_connection_timeout())
            .timeout(config.http_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(request.url)
            .header(header::CONTENT_TYPE, request.content_type)
            .body(request.body);

        if let Some(encoding) = request.content_encoding {
            builder = builder.header(header::CONTENT_ENCODING, encoding);
        }

        let mut response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            // Only the beginning of the body is parsed, but it is consumed entirely so that the
            // connection can be reused.
            if body.len() + chunk.len() <= MAX_RESPONSE_SIZE {
                body.extend_from_slice(&chunk);
            }
        }

        Ok(TransportResponse {
            status,
            retry_after,
            body: body.into(),
        })
    }
}
