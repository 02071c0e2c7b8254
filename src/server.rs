//! Server-side dispatch.
//!
//! `Receiving -> Authenticating -> Routing -> Handling -> Responding`. Every
//! path ends in a well-formed envelope: either the handler's response or a
//! fault describing the stage that failed.

use crate::config::{OnvifConfig, ServerConfig};
use crate::envelope::{
    parse_soap_action, Body, Envelope, Fault, FaultCode, Header, NOT_AUTHORIZED_SUBCODE,
};
use crate::error::SoapError;
use crate::operation::{HandlerError, Operation, SoapMessage};
use crate::security::{Clock, CredentialStore, SecurityValidator};
use crate::xml::Element;
use async_trait::async_trait;
use futures::FutureExt;
use glob::Pattern;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subcode for requests naming an action nobody registered.
pub const ACTION_NOT_SUPPORTED_SUBCODE: &str = "ter:ActionNotSupported";

/// Used when even the fault envelope cannot be encoded.
const FALLBACK_FAULT: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault>"#,
    r#"<s:Code><s:Value>s:Receiver</s:Value></s:Code>"#,
    r#"<s:Reason><s:Text xml:lang="en">internal error</s:Text></s:Reason>"#,
    r#"</s:Fault></s:Body></s:Envelope>"#
);

/// What a handler knows about the request besides its body.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Resolved action URI
    pub action: String,
    /// Authenticated user, when the action required credentials
    pub username: Option<String>,
    /// Request header, if any
    pub header: Option<Header>,
}

/// Encoded reply plus the HTTP status a listener should send with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Counters for processed and faulted requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub requests_processed: u64,
    pub requests_faulted: u64,
}

#[async_trait]
trait Route: Send + Sync {
    async fn call(&self, ctx: RequestContext, body: Element) -> Result<Element, Fault>;
}

struct TypedRoute<Op, F, Fut> {
    handler: F,
    _marker: PhantomData<fn() -> (Op, Fut)>,
}

#[async_trait]
impl<Op, F, Fut> Route for TypedRoute<Op, F, Fut>
where
    Op: Operation,
    F: Fn(RequestContext, Op::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Op::Response, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext, body: Element) -> Result<Element, Fault> {
        let request = Op::Request::from_element(&body).map_err(|e| {
            debug!(action = Op::ACTION, error = %e, "Request body does not match operation");
            Fault::sender("invalid request body")
        })?;

        match (self.handler)(ctx, request).await {
            Ok(response) => response.to_element().map_err(|e| {
                warn!(action = Op::ACTION, error = %e, "Failed to encode response");
                Fault::receiver("response encoding failed")
            }),
            Err(e) => {
                let fault = Fault::receiver(e.reason);
                Err(match e.subcode {
                    Some(subcode) => fault.with_subcode(subcode),
                    None => fault,
                })
            }
        }
    }
}

/// Routes incoming envelopes to registered handlers.
///
/// Stateless across requests; share it behind an `Arc` and call `handle`
/// from as many tasks as needed.
pub struct ServerDispatcher {
    config: ServerConfig,
    require_auth: bool,
    exempt_actions: Vec<Pattern>,
    validator: SecurityValidator,
    routes: HashMap<String, Arc<dyn Route>>,
    requests_processed: AtomicU64,
    requests_faulted: AtomicU64,
}

impl ServerDispatcher {
    pub fn new(config: &OnvifConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self, SoapError> {
        let exempt_actions = config
            .security
            .exempt_actions
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    SoapError::Config(format!("invalid exempt action pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config: config.server.clone(),
            require_auth: config.security.require_auth,
            exempt_actions,
            validator: SecurityValidator::new(credentials, &config.security),
            routes: HashMap::new(),
            requests_processed: AtomicU64::new(0),
            requests_faulted: AtomicU64::new(0),
        })
    }

    /// Clock used for timestamp checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.validator = self.validator.with_clock(clock);
        self
    }

    /// Register `handler` for `Op::ACTION`, replacing any earlier one.
    pub fn register<Op, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        Op: Operation,
        F: Fn(RequestContext, Op::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Op::Response, HandlerError>> + Send + 'static,
    {
        let route = TypedRoute::<Op, F, Fut> {
            handler,
            _marker: PhantomData,
        };
        self.routes.insert(Op::ACTION.to_string(), Arc::new(route));
        self
    }

    /// Registered actions, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn metrics(&self) -> DispatchMetrics {
        DispatchMetrics {
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            requests_faulted: self.requests_faulted.load(Ordering::Relaxed),
        }
    }

    /// Handle a raw request and return the encoded reply.
    pub async fn handle(&self, request: &[u8]) -> Vec<u8> {
        self.respond(request, None).await.body
    }

    /// Handle a raw request. `soap_action` is the SOAPAction header value (or
    /// the content-type `action` parameter) when the listener has one.
    pub async fn respond(&self, request: &[u8], soap_action: Option<&str>) -> ServerResponse {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);

        let (status, envelope) = match self.dispatch(request, soap_action).await {
            Ok(content) => (200, Envelope::new(content)),
            Err(fault) => {
                self.requests_faulted.fetch_add(1, Ordering::Relaxed);
                let status = match fault.code {
                    FaultCode::Sender => 400,
                    _ => 500,
                };
                (status, Envelope::fault(fault))
            }
        };

        let body = envelope.to_xml().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode reply");
            Envelope::fault(Fault::receiver("response encoding failed"))
                .to_xml()
                .unwrap_or_else(|_| FALLBACK_FAULT.as_bytes().to_vec())
        });
        let status = if body.starts_with(FALLBACK_FAULT.as_bytes()) { 500 } else { status };

        ServerResponse { status, body }
    }

    async fn dispatch(&self, request: &[u8], soap_action: Option<&str>) -> Result<Element, Fault> {
        // Receiving
        if request.len() > self.config.max_body_size {
            warn!(
                body_size = request.len(),
                max_size = self.config.max_body_size,
                "SOAP request too large"
            );
            return Err(Fault::sender("request too large"));
        }

        let envelope = Envelope::from_xml_with_depth(request, self.config.max_body_depth)
            .map_err(|e| {
                warn!(error = %e, "Malformed SOAP request");
                Fault::sender("malformed request")
            })?;

        let content = match envelope.body {
            Body::Content(content) => content,
            Body::Fault(_) => return Err(Fault::sender("request body is a fault")),
        };
        let header = envelope.header;

        if let Some(block) = header.as_ref().and_then(Header::first_not_understood) {
            debug!(header = %block.qualified_name(), "Mandatory header not understood");
            return Err(Fault::new(
                FaultCode::MustUnderstand,
                format!("header {} not understood", block.qualified_name()),
            ));
        }

        let action = resolve_action(soap_action, header.as_ref(), &content);

        // Authenticating
        let username = if self.requires_auth(&action) {
            let security = header.as_ref().and_then(|h| h.security.as_ref());
            match self.validator.validate(security) {
                Ok(username) => Some(username),
                Err(e) => {
                    warn!(action = %action, error = e.as_str(), "Request not authorized");
                    return Err(Fault::sender(e.fault_reason()).with_subcode(NOT_AUTHORIZED_SUBCODE));
                }
            }
        } else {
            None
        };

        // Routing
        let route = self.routes.get(&action).cloned().ok_or_else(|| {
            debug!(action = %action, "No handler registered");
            Fault::receiver("unsupported action").with_subcode(ACTION_NOT_SUPPORTED_SUBCODE)
        })?;

        debug!(action = %action, username = ?username, "Dispatching request");

        // Handling
        let ctx = RequestContext {
            action: action.clone(),
            username,
            header,
        };
        match AssertUnwindSafe(route.call(ctx, content)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                warn!(action = %action, "Handler panicked");
                Err(Fault::receiver("internal error"))
            }
        }
    }

    fn requires_auth(&self, action: &str) -> bool {
        self.require_auth && !self.exempt_actions.iter().any(|p| p.matches(action))
    }
}

/// SOAPAction, then wsa:Action, then `<namespace>/<local name>` of the body.
fn resolve_action(soap_action: Option<&str>, header: Option<&Header>, content: &Element) -> String {
    if let Some(action) = soap_action.map(parse_soap_action).filter(|a| !a.is_empty()) {
        return action;
    }
    if let Some(action) = header
        .and_then(|h| h.action.as_deref())
        .filter(|a| !a.is_empty())
    {
        return action.to_string();
    }
    match content.namespace {
        Some(ref ns) => format!("{}/{}", ns.trim_end_matches('/'), content.name),
        None => content.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityHeaderFactory;

    const NS: &str = "http://example.org/svc";

    struct Ping(String);

    impl SoapMessage for Ping {
        fn to_element(&self) -> Result<Element, SoapError> {
            Ok(Element::new(NS, "Ping").with_text(self.0.as_str()))
        }

        fn from_element(element: &Element) -> Result<Self, SoapError> {
            element.expect_name(NS, "Ping")?;
            Ok(Ping(element.text_trimmed().to_string()))
        }
    }

    struct PingOp;

    impl Operation for PingOp {
        const ACTION: &'static str = "http://example.org/svc/Ping";
        type Request = Ping;
        type Response = Ping;
    }

    fn open_dispatcher() -> ServerDispatcher {
        let mut config = OnvifConfig::default();
        config.security.require_auth = false;
        let mut dispatcher =
            ServerDispatcher::new(&config, Arc::new(HashMap::<String, String>::new())).unwrap();
        dispatcher.register::<PingOp, _, _>(|_ctx, req: Ping| async move {
            if req.0 == "panic" {
                panic!("boom");
            }
            if req.0 == "fail" {
                return Err(HandlerError::new("device busy"));
            }
            Ok(Ping(format!("pong:{}", req.0)))
        });
        dispatcher
    }

    fn request(content: Element) -> Vec<u8> {
        Envelope::new(content).to_xml().unwrap()
    }

    async fn fault_of(dispatcher: &ServerDispatcher, body: &[u8]) -> Fault {
        let reply = dispatcher.handle(body).await;
        match Envelope::from_xml(&reply).unwrap().body {
            Body::Fault(fault) => fault,
            Body::Content(c) => panic!("expected fault, got {}", c.qualified_name()),
        }
    }

    #[test]
    fn test_resolve_action_order() {
        let content = Element::new("http://www.onvif.org/ver10/device/wsdl", "GetScopes");
        let header = Header {
            action: Some("urn:from-header".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_action(Some("\"urn:from-http\""), Some(&header), &content),
            "urn:from-http"
        );
        assert_eq!(resolve_action(Some(""), Some(&header), &content), "urn:from-header");
        assert_eq!(
            resolve_action(None, None, &content),
            "http://www.onvif.org/ver10/device/wsdl/GetScopes"
        );
    }

    #[tokio::test]
    async fn test_success() {
        let dispatcher = open_dispatcher();
        let reply = dispatcher
            .respond(&request(Element::new(NS, "Ping").with_text("1")), None)
            .await;
        assert_eq!(reply.status, 200);
        let content = Envelope::from_xml(&reply.body).unwrap().into_content().unwrap();
        assert_eq!(content.text, "pong:1");
        assert_eq!(dispatcher.metrics().requests_processed, 1);
        assert_eq!(dispatcher.metrics().requests_faulted, 0);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let dispatcher = open_dispatcher();
        let fault = fault_of(&dispatcher, b"<not-xml").await;
        assert_eq!(fault.code, FaultCode::Sender);
        assert_eq!(fault.reason, "malformed request");
    }

    #[tokio::test]
    async fn test_oversized_request() {
        let dispatcher = open_dispatcher();
        let big = vec![b' '; dispatcher.config.max_body_size + 1];
        let fault = fault_of(&dispatcher, &big).await;
        assert_eq!(fault.reason, "request too large");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let dispatcher = open_dispatcher();
        let reply = dispatcher
            .respond(&request(Element::new(NS, "Reboot")), None)
            .await;
        assert_eq!(reply.status, 500);
        match Envelope::from_xml(&reply.body).unwrap().body {
            Body::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::Receiver);
                assert_eq!(fault.reason, "unsupported action");
                assert_eq!(fault.subcode.as_deref(), Some(ACTION_NOT_SUPPORTED_SUBCODE));
            }
            Body::Content(_) => panic!("expected fault"),
        }
    }

    #[tokio::test]
    async fn test_invalid_body_handler_error_and_panic() {
        let dispatcher = open_dispatcher();

        let wrong_shape = request(Element::new(NS, "Pong"));
        let fault = fault_of(
            &dispatcher,
            &dispatcher_request_with_action(&wrong_shape),
        )
        .await;
        assert_eq!(fault.code, FaultCode::Sender);
        assert_eq!(fault.reason, "invalid request body");

        let fault = fault_of(&dispatcher, &request(Element::new(NS, "Ping").with_text("fail"))).await;
        assert_eq!(fault.code, FaultCode::Receiver);
        assert_eq!(fault.reason, "device busy");

        let fault = fault_of(&dispatcher, &request(Element::new(NS, "Ping").with_text("panic"))).await;
        assert_eq!(fault.code, FaultCode::Receiver);
        assert_eq!(fault.reason, "internal error");
    }

    fn dispatcher_request_with_action(body: &[u8]) -> Vec<u8> {
        // Route a Pong body to the Ping handler via wsa:Action
        let mut envelope = Envelope::from_xml(body).unwrap();
        envelope.header = Some(Header {
            action: Some(PingOp::ACTION.to_string()),
            ..Default::default()
        });
        envelope.to_xml().unwrap()
    }

    #[tokio::test]
    async fn test_must_understand() {
        let dispatcher = open_dispatcher();
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Header><x:Ext xmlns:x="urn:x" s:mustUnderstand="1"/></s:Header><s:Body><p:Ping xmlns:p="http://example.org/svc">1</p:Ping></s:Body></s:Envelope>"#;
        let fault = fault_of(&dispatcher, xml.as_bytes()).await;
        assert_eq!(fault.code, FaultCode::MustUnderstand);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let credentials = Arc::new(HashMap::from([("admin".to_string(), "pw".to_string())]));
        let mut dispatcher = ServerDispatcher::new(&OnvifConfig::default(), credentials).unwrap();
        dispatcher.register::<PingOp, _, _>(|ctx, _req: Ping| async move {
            Ok(Ping(ctx.username.unwrap_or_default()))
        });

        let fault = fault_of(&dispatcher, &request(Element::new(NS, "Ping"))).await;
        assert_eq!(fault.code, FaultCode::Sender);
        assert_eq!(fault.subcode.as_deref(), Some(NOT_AUTHORIZED_SUBCODE));
        assert_eq!(fault.reason, "Authentication failed: missing credentials");

        let security = SecurityHeaderFactory::default().generate("admin", "pw");
        let body = Envelope::new(Element::new(NS, "Ping"))
            .with_header(Header::with_security(security))
            .to_xml()
            .unwrap();
        let content = Envelope::from_xml(&dispatcher.handle(&body).await)
            .unwrap()
            .into_content()
            .unwrap();
        assert_eq!(content.text, "admin");
    }

    #[test]
    fn test_invalid_exempt_pattern() {
        let mut config = OnvifConfig::default();
        config.security.exempt_actions = vec!["[".to_string()];
        assert!(ServerDispatcher::new(&config, Arc::new(HashMap::<String, String>::new())).is_err());
    }
}
