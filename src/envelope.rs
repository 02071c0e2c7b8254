//! SOAP 1.2 envelope codec.
//!
//! `Envelope::to_xml` / `Envelope::from_xml` are pure transforms. Faults are
//! detected before anything else in the Body so a fault response is never
//! decoded as typed content.

use crate::error::SoapError;
use crate::security::Security;
use crate::xml::{Element, XML_NS};
use std::fmt;

/// SOAP 1.2 envelope namespace.
pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// WS-Security extension namespace.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
/// WS-Security utility namespace (`Created`).
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
/// WS-Addressing (2004/08, as used by WS-Discovery 2005/04).
pub const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
/// WS-Discovery 2005/04.
pub const WSD_NS: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
/// ONVIF error subcodes.
pub const ONVIF_ERROR_NS: &str = "http://www.onvif.org/ver10/error";
/// ONVIF network types (`dn:NetworkVideoTransmitter`).
pub const ONVIF_NETWORK_NS: &str = "http://www.onvif.org/ver10/network/wsdl";
/// ONVIF device service (`tds:Device`).
pub const ONVIF_DEVICE_NS: &str = "http://www.onvif.org/ver10/device/wsdl";

/// Subcode carried by authentication faults.
pub const NOT_AUTHORIZED_SUBCODE: &str = "ter:NotAuthorized";

/// Default element nesting limit for `Envelope::from_xml`.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Prefixes declared on every envelope we emit. QName-valued text such as
/// `s:Sender` or `dn:NetworkVideoTransmitter` relies on these declarations.
pub const PREFIXES: &[(&str, &str)] = &[
    ("s", SOAP_ENV_NS),
    ("wsse", WSSE_NS),
    ("wsu", WSU_NS),
    ("wsa", WSA_NS),
    ("d", WSD_NS),
    ("ter", ONVIF_ERROR_NS),
    ("dn", ONVIF_NETWORK_NS),
    ("tds", ONVIF_DEVICE_NS),
];

/// A SOAP envelope: optional Header, required Body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Option<Header>,
    pub body: Body,
}

/// Body holds exactly one of typed content or a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Content(Element),
    Fault(Fault),
}

/// SOAP Header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// WS-Security header (if present)
    pub security: Option<Security>,
    /// wsa:Action
    pub action: Option<String>,
    /// wsa:MessageID
    pub message_id: Option<String>,
    /// wsa:RelatesTo
    pub relates_to: Option<String>,
    /// wsa:To
    pub to: Option<String>,
    /// wsa:ReplyTo/wsa:Address
    pub reply_to: Option<String>,
    /// Header blocks this codec does not interpret
    pub other: Vec<Element>,
}

impl Header {
    /// Header carrying only a Security block.
    pub fn with_security(security: Security) -> Self {
        Self {
            security: Some(security),
            ..Default::default()
        }
    }

    /// First uninterpreted header block flagged `mustUnderstand`.
    pub fn first_not_understood(&self) -> Option<&Element> {
        self.other.iter().find(|e| must_understand(e))
    }

    fn to_element(&self) -> Element {
        let mut header = Element::new(SOAP_ENV_NS, "Header");

        let addressing = [
            ("Action", &self.action),
            ("MessageID", &self.message_id),
            ("RelatesTo", &self.relates_to),
            ("To", &self.to),
        ];
        for (name, value) in addressing {
            if let Some(value) = value {
                header.children.push(Element::new(WSA_NS, name).with_text(value.as_str()));
            }
        }
        if let Some(ref reply_to) = self.reply_to {
            header.children.push(
                Element::new(WSA_NS, "ReplyTo")
                    .with_child(Element::new(WSA_NS, "Address").with_text(reply_to.as_str())),
            );
        }
        if let Some(ref security) = self.security {
            header.children.push(security.to_element());
        }
        header.children.extend(self.other.iter().cloned());
        header
    }

    fn from_element(element: &Element) -> Result<Self, SoapError> {
        let mut header = Header::default();

        for child in &element.children {
            match (child.namespace.as_deref(), child.name.as_str()) {
                (Some(WSSE_NS), "Security") => {
                    header.security = Some(Security::from_element(child)?);
                }
                (Some(WSA_NS), "Action") => header.action = Some(child.text_trimmed().to_string()),
                (Some(WSA_NS), "MessageID") => {
                    header.message_id = Some(child.text_trimmed().to_string())
                }
                (Some(WSA_NS), "RelatesTo") => {
                    header.relates_to = Some(child.text_trimmed().to_string())
                }
                (Some(WSA_NS), "To") => header.to = Some(child.text_trimmed().to_string()),
                (Some(WSA_NS), "ReplyTo") => {
                    header.reply_to = child
                        .child(WSA_NS, "Address")
                        .map(|a| a.text_trimmed().to_string());
                }
                _ => header.other.push(child.clone()),
            }
        }

        Ok(header)
    }
}

/// SOAP 1.2 fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    Sender,
    Receiver,
    VersionMismatch,
    MustUnderstand,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "Sender",
            Self::Receiver => "Receiver",
            Self::VersionMismatch => "VersionMismatch",
            Self::MustUnderstand => "MustUnderstand",
        }
    }

    /// Parse a code value, ignoring any prefix. SOAP 1.1 `Client`/`Server`
    /// are accepted as aliases.
    pub fn parse(value: &str) -> Option<Self> {
        let local = value.trim().rsplit(':').next().unwrap_or("");
        match local {
            "Sender" | "Client" => Some(Self::Sender),
            "Receiver" | "Server" => Some(Self::Receiver),
            "VersionMismatch" => Some(Self::VersionMismatch),
            "MustUnderstand" => Some(Self::MustUnderstand),
            _ => None,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: FaultCode,
    /// Subcode value as written, e.g. `ter:NotAuthorized`
    pub subcode: Option<String>,
    pub reason: String,
    pub detail: Option<Element>,
    /// Code value as received when it is not one of the SOAP 1.2 codes,
    /// e.g. `s:Client.Authentication`
    pub raw_code: Option<String>,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            subcode: None,
            reason: reason.into(),
            detail: None,
            raw_code: None,
        }
    }

    pub fn sender(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Sender, reason)
    }

    pub fn receiver(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Receiver, reason)
    }

    pub fn with_subcode(mut self, subcode: impl Into<String>) -> Self {
        self.subcode = Some(subcode.into());
        self
    }

    pub fn with_detail(mut self, detail: Element) -> Self {
        self.detail = Some(detail);
        self
    }

    fn to_element(&self) -> Element {
        let mut code = Element::new(SOAP_ENV_NS, "Code")
            .with_child(Element::new(SOAP_ENV_NS, "Value").with_text(format!("s:{}", self.code)));
        if let Some(ref subcode) = self.subcode {
            code.children.push(
                Element::new(SOAP_ENV_NS, "Subcode")
                    .with_child(Element::new(SOAP_ENV_NS, "Value").with_text(subcode.as_str())),
            );
        }

        let reason = Element::new(SOAP_ENV_NS, "Reason").with_child(
            Element::new(SOAP_ENV_NS, "Text")
                .with_ns_attribute(XML_NS, "lang", "en")
                .with_text(self.reason.as_str()),
        );

        let mut fault = Element::new(SOAP_ENV_NS, "Fault")
            .with_child(code)
            .with_child(reason);
        if let Some(ref detail) = self.detail {
            fault.children.push(detail.clone());
        }
        fault
    }

    /// Read a fault leniently: children are matched by local name so
    /// unqualified faults from sloppy firmware still decode.
    fn from_element(element: &Element) -> Result<Self, SoapError> {
        let code_element = element.child_by_local_name("Code");

        let code_value = code_element
            .and_then(|c| c.child_by_local_name("Value"))
            .or_else(|| element.child_by_local_name("faultcode"))
            .map(Element::text_trimmed)
            .ok_or_else(|| SoapError::Parse("Fault has no Code".to_string()))?;

        let subcode = code_element
            .and_then(|c| c.child_by_local_name("Subcode"))
            .and_then(|s| s.child_by_local_name("Value"))
            .map(|v| v.text_trimmed().to_string());

        // Dotted SOAP 1.1 codes map to their base, anything else to Receiver
        let (code, raw_code) = match FaultCode::parse(code_value) {
            Some(code) => (code, None),
            None => {
                let base = code_value.split('.').next().unwrap_or(code_value);
                let code = FaultCode::parse(base).unwrap_or(FaultCode::Receiver);
                (code, Some(code_value.to_string()))
            }
        };

        let reason = element
            .child_by_local_name("Reason")
            .and_then(|r| r.child_by_local_name("Text"))
            .or_else(|| element.child_by_local_name("faultstring"))
            .map(|t| t.text_trimmed().to_string())
            .unwrap_or_default();

        let detail = element
            .child_by_local_name("Detail")
            .or_else(|| element.child_by_local_name("detail"))
            .cloned();

        Ok(Self {
            code,
            subcode,
            reason,
            detail,
            raw_code,
        })
    }
}

impl Envelope {
    /// Envelope with typed content and no header.
    pub fn new(content: Element) -> Self {
        Self {
            header: None,
            body: Body::Content(content),
        }
    }

    /// Envelope carrying a fault.
    pub fn fault(fault: Fault) -> Self {
        Self {
            header: None,
            body: Body::Fault(fault),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    /// Body content, or the fault as an error.
    pub fn into_content(self) -> Result<Element, SoapError> {
        match self.body {
            Body::Content(element) => Ok(element),
            Body::Fault(fault) => Err(SoapError::Fault(fault)),
        }
    }

    /// Serialize to UTF-8 bytes with an XML declaration.
    pub fn to_xml(&self) -> Result<Vec<u8>, SoapError> {
        let mut envelope = Element::new(SOAP_ENV_NS, "Envelope");
        if let Some(ref header) = self.header {
            envelope.children.push(header.to_element());
        }

        let body = match self.body {
            Body::Content(ref content) => content.clone(),
            Body::Fault(ref fault) => fault.to_element(),
        };
        envelope
            .children
            .push(Element::new(SOAP_ENV_NS, "Body").with_child(body));

        let document = envelope.write_document(PREFIXES)?;
        let mut out = Vec::with_capacity(document.len() + 40);
        out.extend_from_slice(br#"<?xml version="1.0" encoding="UTF-8"?>"#);
        out.extend_from_slice(document.as_bytes());
        Ok(out)
    }

    /// Parse raw bytes as a SOAP 1.2 envelope.
    pub fn from_xml(data: &[u8]) -> Result<Self, SoapError> {
        Self::from_xml_with_depth(data, DEFAULT_MAX_DEPTH)
    }

    /// Parse with an explicit element nesting limit.
    pub fn from_xml_with_depth(data: &[u8], max_depth: usize) -> Result<Self, SoapError> {
        let root = Element::parse(data, max_depth)?;

        if !root.is(SOAP_ENV_NS, "Envelope") {
            return Err(match (root.name.as_str(), root.namespace.as_deref()) {
                ("Envelope", Some(ns)) => {
                    SoapError::Parse(format!("unsupported envelope namespace {}", ns))
                }
                _ => SoapError::Parse(format!(
                    "expected SOAP Envelope, found {}",
                    root.qualified_name()
                )),
            });
        }

        let mut header = None;
        let mut body = None;

        for child in root.children {
            match (child.namespace.as_deref(), child.name.as_str()) {
                (Some(SOAP_ENV_NS), "Header") => {
                    if body.is_some() {
                        return Err(SoapError::Parse("Header must precede Body".to_string()));
                    }
                    if header.is_some() {
                        return Err(SoapError::Parse("duplicate Header".to_string()));
                    }
                    header = Some(Header::from_element(&child)?);
                }
                (Some(SOAP_ENV_NS), "Body") => {
                    if body.is_some() {
                        return Err(SoapError::Parse("duplicate Body".to_string()));
                    }
                    body = Some(parse_body(child)?);
                }
                _ => {
                    return Err(SoapError::Parse(format!(
                        "unexpected element {} in Envelope",
                        child.qualified_name()
                    )));
                }
            }
        }

        let body = body.ok_or_else(|| SoapError::Parse("Envelope has no Body".to_string()))?;
        Ok(Self { header, body })
    }
}

fn parse_body(body: Element) -> Result<Body, SoapError> {
    // Fault wins over anything else in the Body
    if let Some(fault) = body
        .children
        .iter()
        .find(|c| c.name == "Fault" && matches!(c.namespace.as_deref(), None | Some(SOAP_ENV_NS)))
    {
        return Ok(Body::Fault(Fault::from_element(fault)?));
    }

    let mut children = body.children.into_iter();
    match (children.next(), children.next()) {
        (Some(content), None) => Ok(Body::Content(content)),
        (None, _) => Err(SoapError::Parse("Body is empty".to_string())),
        _ => Err(SoapError::Parse(
            "Body must contain exactly one element".to_string(),
        )),
    }
}

fn must_understand(element: &Element) -> bool {
    matches!(
        element.ns_attribute(SOAP_ENV_NS, "mustUnderstand"),
        Some("1") | Some("true")
    )
}

/// Extract SOAPAction from HTTP header value (removes quotes).
pub fn parse_soap_action(header_value: &str) -> String {
    header_value.trim().trim_matches('"').to_string()
}

/// Extract the `action` parameter of an `application/soap+xml` content type.
pub fn action_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("action"))
        .map(|(_, value)| parse_soap_action(value))
        .filter(|action| !action.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Header>
    <wsa:Action xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">urn:test/GetUser</wsa:Action>
    <m:Trans xmlns:m="http://example.org/trans">234</m:Trans>
  </soap:Header>
  <soap:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_sample() {
        let envelope = Envelope::from_xml(SAMPLE.as_bytes()).unwrap();
        let header = envelope.header.as_ref().unwrap();
        assert_eq!(header.action.as_deref(), Some("urn:test/GetUser"));
        assert_eq!(header.other.len(), 1);
        assert!(header.first_not_understood().is_none());

        match envelope.body {
            Body::Content(ref content) => {
                assert!(content.is("http://example.org/users", "GetUser"));
                assert_eq!(
                    content.required_child_text("http://example.org/users", "UserId").unwrap(),
                    "123"
                );
            }
            Body::Fault(_) => panic!("unexpected fault"),
        }
    }

    #[test]
    fn test_round_trip_with_header() {
        let envelope = Envelope::new(
            Element::new("http://example.org/users", "GetUser")
                .with_child(Element::new("http://example.org/users", "UserId").with_text("9")),
        )
        .with_header(Header {
            action: Some("urn:a".to_string()),
            message_id: Some("urn:uuid:1".to_string()),
            reply_to: Some("urn:reply".to_string()),
            ..Default::default()
        });

        let bytes = envelope.to_xml().unwrap();
        assert_eq!(Envelope::from_xml(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_fault_round_trip() {
        let fault = Fault::sender("Authentication failed")
            .with_subcode(NOT_AUTHORIZED_SUBCODE)
            .with_detail(Element::new(SOAP_ENV_NS, "Detail").with_child(
                Element::new("http://example.org/err", "Info").with_text("expired"),
            ));
        let bytes = Envelope::fault(fault.clone()).to_xml().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("<s:Value>s:Sender</s:Value>"));
        assert!(text.contains(r#"xml:lang="en""#));

        let parsed = Envelope::from_xml(&bytes).unwrap();
        assert_eq!(parsed.body, Body::Fault(fault));
    }

    #[test]
    fn test_fault_takes_precedence_over_garbage() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <junk><more>not a response</more></junk>
    <s:Fault>
      <s:Code><s:Value>s:Receiver</s:Value></s:Code>
      <s:Reason><s:Text xml:lang="en">device busy</s:Text></s:Reason>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let envelope = Envelope::from_xml(xml.as_bytes()).unwrap();
        match envelope.body {
            Body::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::Receiver);
                assert_eq!(fault.reason, "device busy");
            }
            Body::Content(_) => panic!("fault must win"),
        }
    }

    #[test]
    fn test_unqualified_fault() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><Fault><Code><Value>Sender</Value></Code><Reason><Text>Authentication failed</Text></Reason></Fault></s:Body></s:Envelope>"#;
        let err = Envelope::from_xml(xml.as_bytes())
            .unwrap()
            .into_content()
            .unwrap_err();
        match err {
            SoapError::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::Sender);
                assert_eq!(fault.reason, "Authentication failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dotted_and_vendor_fault_codes() {
        let dotted = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Code><s:Value>s:Client.Authentication</s:Value></s:Code><s:Reason><s:Text>Authentication failed</s:Text></s:Reason><s:Detail><x:Why xmlns:x="urn:x">token</x:Why></s:Detail></s:Fault></s:Body></s:Envelope>"#;
        match Envelope::from_xml(dotted.as_bytes()).unwrap().body {
            Body::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::Sender);
                assert_eq!(fault.reason, "Authentication failed");
                assert_eq!(fault.raw_code.as_deref(), Some("s:Client.Authentication"));
                assert_eq!(fault.subcode, None);
                assert!(fault.detail.is_some());
            }
            Body::Content(_) => panic!("expected fault"),
        }

        let vendor = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Code><s:Value>acme:Overheated</s:Value><s:Subcode><s:Value>acme:Fan</s:Value></s:Subcode></s:Code><s:Reason><s:Text>too hot</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        let err = Envelope::from_xml(vendor.as_bytes())
            .unwrap()
            .into_content()
            .unwrap_err();
        match err {
            SoapError::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::Receiver);
                assert_eq!(fault.subcode.as_deref(), Some("acme:Fan"));
                assert_eq!(fault.raw_code.as_deref(), Some("acme:Overheated"));
                assert_eq!(fault.reason, "too hot");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fault_without_code_is_parse_error() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Reason><s:Text>x</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        assert!(matches!(
            Envelope::from_xml(xml.as_bytes()),
            Err(SoapError::Parse(_))
        ));
    }

    #[test]
    fn test_header_after_body_rejected() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><a/></s:Body><s:Header/></s:Envelope>"#;
        assert!(matches!(
            Envelope::from_xml(xml.as_bytes()),
            Err(SoapError::Parse(_))
        ));
    }

    #[test]
    fn test_body_shape_errors() {
        let missing = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Header/></s:Envelope>"#;
        let empty = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body/></s:Envelope>"#;
        let two = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><a/><b/></s:Body></s:Envelope>"#;
        for xml in [missing, empty, two] {
            assert!(matches!(
                Envelope::from_xml(xml.as_bytes()),
                Err(SoapError::Parse(_))
            ));
        }
    }

    #[test]
    fn test_soap_11_envelope_rejected() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><a/></soap:Body></soap:Envelope>"#;
        let err = Envelope::from_xml(xml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported envelope namespace"));
    }

    #[test]
    fn test_must_understand_header() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Header><x:Ext xmlns:x="urn:x" s:mustUnderstand="true"/></s:Header><s:Body><a/></s:Body></s:Envelope>"#;
        let envelope = Envelope::from_xml(xml.as_bytes()).unwrap();
        let ext = envelope.header.unwrap();
        assert_eq!(ext.first_not_understood().unwrap().name, "Ext");
    }

    #[test]
    fn test_fault_code_parse() {
        assert_eq!(FaultCode::parse("env:Sender"), Some(FaultCode::Sender));
        assert_eq!(FaultCode::parse("Server"), Some(FaultCode::Receiver));
        assert_eq!(FaultCode::parse("s:MustUnderstand"), Some(FaultCode::MustUnderstand));
        assert_eq!(FaultCode::parse("Bogus"), None);
    }

    #[test]
    fn test_parse_soap_action() {
        assert_eq!(parse_soap_action("\"GetUser\""), "GetUser");
        assert_eq!(parse_soap_action("GetUser"), "GetUser");
        assert_eq!(parse_soap_action("  \"GetUser\"  "), "GetUser");
    }

    #[test]
    fn test_action_from_content_type() {
        assert_eq!(
            action_from_content_type(
                r#"application/soap+xml; charset=utf-8; action="http://www.onvif.org/ver10/device/wsdl/GetScopes""#
            )
            .as_deref(),
            Some("http://www.onvif.org/ver10/device/wsdl/GetScopes")
        );
        assert_eq!(action_from_content_type("application/soap+xml"), None);
    }
}
