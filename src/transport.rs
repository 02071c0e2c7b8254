//! HTTP POST transport for SOAP envelopes.

use crate::error::{SoapError, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn, Instrument, Span};

/// Content type of SOAP 1.2 requests.
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Raw HTTP response. Any status is a successful exchange at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One request/response exchange with a SOAP endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        action: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    span: Span,
    trace_messages: bool,
}

impl HttpTransport {
    pub fn new() -> Result<Self, SoapError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            span: Span::none(),
            trace_messages: false,
        }
    }

    /// Span every exchange is recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Log full envelopes at trace level.
    pub fn trace_messages(mut self, enabled: bool) -> Self {
        self.trace_messages = enabled;
        self
    }

    async fn exchange(
        &self,
        endpoint: &str,
        action: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .timeout(timeout);
        if !action.is_empty() {
            request = request.header("SOAPAction", action);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        action: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let trace_messages = self.trace_messages;

        async move {
            debug!(endpoint = %endpoint, action = %action, bytes = body.len(), "Sending SOAP request");
            if trace_messages {
                trace!(envelope = %String::from_utf8_lossy(&body), "SOAP request");
            }

            let result = match tokio::time::timeout(timeout, self.exchange(endpoint, action, body, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };

            match result {
                Ok(ref response) => {
                    debug!(status = response.status, bytes = response.body.len(), "Received SOAP response");
                    if trace_messages {
                        trace!(envelope = %String::from_utf8_lossy(&response.body), "SOAP response");
                    }
                }
                Err(ref e) => warn!(endpoint = %endpoint, error = %e, "SOAP exchange failed"),
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(error.to_string())
    }
}
