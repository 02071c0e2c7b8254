//! WS-Discovery Probe / ProbeMatches messages and matching rules.

use crate::envelope::{Envelope, Header, WSA_NS, WSD_NS};
use crate::error::SoapError;
use crate::xml::Element;
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;
use uuid::Uuid;

pub const PROBE_ACTION: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe";
pub const PROBE_MATCHES_ACTION: &str =
    "http://schemas.xmlsoap.org/ws/2005/04/discovery/ProbeMatches";
/// `wsa:To` of multicast probes.
pub const DISCOVERY_TO: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";
/// `wsa:To` of unicast replies.
pub const ANONYMOUS_ROLE: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

pub const MATCH_BY_RFC2396: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/rfc2396";
pub const MATCH_BY_STRCMP0: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/strcmp0";

/// ONVIF device type advertised by cameras.
pub const NETWORK_VIDEO_TRANSMITTER: &str = "dn:NetworkVideoTransmitter";
/// ONVIF device service type.
pub const DEVICE_TYPE: &str = "tds:Device";

/// Scope matching rule carried in `Scopes/@MatchBy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchBy {
    /// Case-insensitive scheme and authority, segment-wise path prefix
    #[default]
    Rfc2396,
    /// Exact string equality
    Strcmp0,
}

impl MatchBy {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Rfc2396 => MATCH_BY_RFC2396,
            Self::Strcmp0 => MATCH_BY_STRCMP0,
        }
    }

    /// Unknown rules fall back to the default.
    pub fn from_uri(uri: &str) -> Self {
        match uri.trim().rsplit('/').next() {
            Some("strcmp0") => Self::Strcmp0,
            _ => Self::Rfc2396,
        }
    }

    /// Whether `requested` selects `advertised`.
    pub fn scope_matches(&self, requested: &str, advertised: &str) -> bool {
        match self {
            Self::Strcmp0 => requested == advertised,
            Self::Rfc2396 => {
                let (req_base, req_segments) = split_scope(requested);
                let (adv_base, adv_segments) = split_scope(advertised);
                req_base.eq_ignore_ascii_case(adv_base)
                    && req_segments.len() <= adv_segments.len()
                    && req_segments.iter().zip(&adv_segments).all(|(r, a)| r == a)
            }
        }
    }
}

/// Split `scheme://authority/a/b` into `scheme://authority` and its path
/// segments. Opaque URIs come back whole with no segments.
fn split_scope(scope: &str) -> (&str, Vec<&str>) {
    let scope = scope.trim();
    let Some(idx) = scope.find("://") else {
        return (scope, Vec::new());
    };
    let after = idx + 3;
    match scope[after..].find('/') {
        Some(slash) => {
            let base = &scope[..after + slash];
            let segments = scope[after + slash..]
                .split('/')
                .filter(|s| !s.is_empty())
                .collect();
            (base, segments)
        }
        None => (scope, Vec::new()),
    }
}

/// Local part of a QName such as `dn:NetworkVideoTransmitter`.
pub fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

fn split_list(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// A Probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// `wsa:MessageID`, `urn:uuid:...` for probes we send
    pub message_id: String,
    /// Requested types as QNames
    pub types: Vec<String>,
    /// Requested scopes
    pub scopes: Vec<String>,
    pub match_by: MatchBy,
}

impl Probe {
    /// Probe with a fresh message id.
    pub fn new(types: Vec<String>, scopes: Vec<String>) -> Self {
        Self {
            message_id: new_message_id(),
            types,
            scopes,
            match_by: MatchBy::default(),
        }
    }

    /// Whether a device advertising `device` should answer. Each non-empty
    /// filter needs at least one hit.
    pub fn accepts(&self, device: &ProbeMatch) -> bool {
        let types_ok = self.types.is_empty()
            || self.types.iter().any(|requested| {
                device
                    .types
                    .iter()
                    .any(|advertised| local_name(requested) == local_name(advertised))
            });
        let scopes_ok = self.scopes.is_empty()
            || self.scopes.iter().any(|requested| {
                device
                    .scopes
                    .iter()
                    .any(|advertised| self.match_by.scope_matches(requested, advertised))
            });
        types_ok && scopes_ok
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut probe = Element::new(WSD_NS, "Probe");
        if !self.types.is_empty() {
            probe
                .children
                .push(Element::new(WSD_NS, "Types").with_text(self.types.join(" ")));
        }
        if !self.scopes.is_empty() {
            let mut scopes = Element::new(WSD_NS, "Scopes").with_text(self.scopes.join(" "));
            if self.match_by != MatchBy::default() {
                scopes = scopes.with_attribute("MatchBy", self.match_by.uri());
            }
            probe.children.push(scopes);
        }

        Envelope::new(probe).with_header(Header {
            action: Some(PROBE_ACTION.to_string()),
            message_id: Some(self.message_id.clone()),
            to: Some(DISCOVERY_TO.to_string()),
            ..Default::default()
        })
    }

    /// Read a Probe. A missing MessageID is tolerated.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SoapError> {
        let body = envelope.clone().into_content()?;
        body.expect_name(WSD_NS, "Probe")?;

        let types = body
            .child(WSD_NS, "Types")
            .map(|t| split_list(&t.text))
            .unwrap_or_default();
        let scopes_element = body.child(WSD_NS, "Scopes");
        let scopes = scopes_element
            .map(|s| split_list(&s.text))
            .unwrap_or_default();
        let match_by = scopes_element
            .and_then(|s| s.attribute("MatchBy"))
            .map(MatchBy::from_uri)
            .unwrap_or_default();

        Ok(Self {
            message_id: envelope
                .header
                .as_ref()
                .and_then(|h| h.message_id.clone())
                .unwrap_or_default(),
            types,
            scopes,
            match_by,
        })
    }
}

/// One device answering a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeMatch {
    /// Stable device identity, usually `urn:uuid:...`
    pub endpoint_reference: String,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
    /// Service URLs
    pub xaddrs: Vec<String>,
    pub metadata_version: u32,
}

impl ProbeMatch {
    fn to_element(&self) -> Element {
        Element::new(WSD_NS, "ProbeMatch")
            .with_child(
                Element::new(WSA_NS, "EndpointReference").with_child(
                    Element::new(WSA_NS, "Address").with_text(self.endpoint_reference.as_str()),
                ),
            )
            .with_child(Element::new(WSD_NS, "Types").with_text(self.types.join(" ")))
            .with_child(Element::new(WSD_NS, "Scopes").with_text(self.scopes.join(" ")))
            .with_child(Element::new(WSD_NS, "XAddrs").with_text(self.xaddrs.join(" ")))
            .with_child(
                Element::new(WSD_NS, "MetadataVersion").with_text(self.metadata_version.to_string()),
            )
    }

    fn from_element(element: &Element) -> Result<Self, SoapError> {
        let endpoint_reference = element
            .child(WSA_NS, "EndpointReference")
            .and_then(|e| e.child(WSA_NS, "Address"))
            .map(|a| a.text_trimmed().to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SoapError::Decode("ProbeMatch has no EndpointReference".to_string()))?;

        let list = |name: &str| {
            element
                .child(WSD_NS, name)
                .map(|e| split_list(&e.text))
                .unwrap_or_default()
        };

        let metadata_version = match element.child(WSD_NS, "MetadataVersion") {
            Some(v) => v.text_trimmed().parse().map_err(|_| {
                SoapError::Decode(format!("invalid MetadataVersion '{}'", v.text_trimmed()))
            })?,
            None => 0,
        };

        Ok(Self {
            endpoint_reference,
            types: list("Types"),
            scopes: list("Scopes"),
            xaddrs: list("XAddrs"),
            metadata_version,
        })
    }
}

/// A ProbeMatches reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMatches {
    pub message_id: String,
    /// MessageID of the probe being answered
    pub relates_to: Option<String>,
    pub matches: Vec<ProbeMatch>,
}

impl ProbeMatches {
    pub fn reply_to(probe: &Probe, matches: Vec<ProbeMatch>) -> Self {
        Self {
            message_id: new_message_id(),
            relates_to: Some(probe.message_id.clone()).filter(|id| !id.is_empty()),
            matches,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut body = Element::new(WSD_NS, "ProbeMatches");
        body.children
            .extend(self.matches.iter().map(ProbeMatch::to_element));

        Envelope::new(body).with_header(Header {
            action: Some(PROBE_MATCHES_ACTION.to_string()),
            message_id: Some(self.message_id.clone()),
            relates_to: self.relates_to.clone(),
            to: Some(ANONYMOUS_ROLE.to_string()),
            ..Default::default()
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SoapError> {
        let body = envelope.clone().into_content()?;
        body.expect_name(WSD_NS, "ProbeMatches")?;

        let matches = body
            .children
            .iter()
            .filter(|c| c.is(WSD_NS, "ProbeMatch"))
            .filter_map(|c| match ProbeMatch::from_element(c) {
                Ok(m) => Some(m),
                Err(e) => {
                    trace!(error = %e, "Skipping malformed ProbeMatch");
                    None
                }
            })
            .collect();

        let header = envelope.header.as_ref();
        Ok(Self {
            message_id: header
                .and_then(|h| h.message_id.clone())
                .unwrap_or_default(),
            relates_to: header.and_then(|h| h.relates_to.clone()),
            matches,
        })
    }
}

fn new_message_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

/// Matches collected during one probe window, one entry per endpoint
/// reference in first-seen order.
#[derive(Debug, Default)]
pub struct MatchSet {
    order: Vec<String>,
    by_endpoint: HashMap<String, ProbeMatch>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a match. Returns true for a previously unseen endpoint.
    ///
    /// XAddrs are unioned. Types and scopes follow the highest metadata
    /// version seen.
    pub fn insert(&mut self, incoming: ProbeMatch) -> bool {
        match self.by_endpoint.get_mut(&incoming.endpoint_reference) {
            Some(existing) => {
                for xaddr in &incoming.xaddrs {
                    if !existing.xaddrs.contains(xaddr) {
                        existing.xaddrs.push(xaddr.clone());
                    }
                }
                if incoming.metadata_version > existing.metadata_version {
                    existing.metadata_version = incoming.metadata_version;
                    existing.types = incoming.types;
                    existing.scopes = incoming.scopes;
                }
                false
            }
            None => {
                self.order.push(incoming.endpoint_reference.clone());
                self.by_endpoint
                    .insert(incoming.endpoint_reference.clone(), incoming);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, endpoint_reference: &str) -> Option<&ProbeMatch> {
        self.by_endpoint.get(endpoint_reference)
    }

    pub fn into_vec(mut self) -> Vec<ProbeMatch> {
        self.order
            .iter()
            .filter_map(|id| self.by_endpoint.remove(id))
            .collect()
    }
}
