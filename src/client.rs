//! Client-side dispatch: typed request in, typed response or fault out.

use crate::config::ClientConfig;
use crate::envelope::{Envelope, Header};
use crate::error::SoapError;
use crate::operation::{Credentials, Operation, SoapMessage};
use crate::security::{Clock, SecurityHeaderFactory};
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn, Instrument, Span};

/// Sends typed operations to SOAP endpoints.
///
/// Each `invoke` is independent; a dispatcher can be shared across tasks.
pub struct ClientDispatcher<T: Transport = HttpTransport> {
    transport: T,
    security: SecurityHeaderFactory,
    timeout: Duration,
    span: Span,
    trace_messages: bool,
}

impl ClientDispatcher<HttpTransport> {
    pub fn from_config(config: &ClientConfig) -> Result<Self, SoapError> {
        Ok(Self::new(HttpTransport::new()?)
            .with_timeout(config.timeout())
            .trace_messages(config.trace_messages))
    }
}

impl<T: Transport> ClientDispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            security: SecurityHeaderFactory::default(),
            timeout: ClientConfig::default().timeout(),
            span: Span::none(),
            trace_messages: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clock used for `wsu:Created`, e.g. an `OffsetClock` tracking a device.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.security = SecurityHeaderFactory::new(clock);
        self
    }

    /// Span all invocations are recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Log full envelopes at trace level.
    pub fn trace_messages(mut self, enabled: bool) -> Self {
        self.trace_messages = enabled;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Call `Op` on `endpoint`. A fault reply becomes `SoapError::Fault`.
    pub async fn invoke<Op: Operation>(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
        request: &Op::Request,
    ) -> Result<Op::Response, SoapError> {
        async move {
            debug!(action = Op::ACTION, endpoint = %endpoint, "Invoking operation");

            let mut envelope = Envelope::new(request.to_element()?);
            if let Some(credentials) = credentials {
                envelope = envelope.with_header(Header::with_security(
                    self.security
                        .generate(&credentials.username, &credentials.password),
                ));
            }
            let body = envelope.to_xml()?;
            if self.trace_messages {
                trace!(envelope = %String::from_utf8_lossy(&body), "Request envelope");
            }

            let response = self
                .transport
                .send(endpoint, Op::ACTION, body, self.timeout)
                .await?;
            if self.trace_messages {
                trace!(
                    status = response.status,
                    envelope = %String::from_utf8_lossy(&response.body),
                    "Response envelope"
                );
            }

            let envelope = Envelope::from_xml(&response.body).map_err(|e| match e {
                SoapError::Parse(msg) if !response.is_success() => {
                    SoapError::Parse(format!("HTTP status {}: {}", response.status, msg))
                }
                other => other,
            })?;

            let content = envelope.into_content().map_err(|e| {
                if let SoapError::Fault(ref fault) = e {
                    warn!(
                        action = Op::ACTION,
                        code = %fault.code,
                        subcode = fault.subcode.as_deref().unwrap_or(""),
                        reason = %fault.reason,
                        "Peer returned fault"
                    );
                }
                e
            })?;

            Op::Response::from_element(&content)
        }
        .instrument(self.span.clone())
        .await
    }
}
