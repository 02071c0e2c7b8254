//! Minimal namespace-aware XML element tree.
//!
//! Parsing goes through quick-xml's `NsReader`, which never expands external
//! entities. DOCTYPE declarations are rejected outright so entity tricks never
//! reach the reader.

use crate::error::SoapError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

/// The namespace bound to the reserved `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// An XML element with its resolved namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Namespace URI (None for unqualified elements)
    pub namespace: Option<String>,
    /// Local name
    pub name: String,
    /// Attributes in document order, namespace declarations excluded
    pub attributes: Vec<Attribute>,
    /// Child elements in document order
    pub children: Vec<Element>,
    /// Concatenated text content
    pub text: String,
}

/// An attribute with its resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub namespace: Option<String>,
    pub name: String,
    pub value: String,
}

impl Element {
    /// Create an element in the given namespace.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Create an element without a namespace.
    pub fn unqualified(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            namespace: None,
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn with_ns_attribute(mut self, namespace: &str, name: &str, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    /// Check namespace and local name.
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// First child with the given namespace and local name.
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(namespace, name))
    }

    /// First child with the given local name, whatever its namespace.
    pub fn child_by_local_name(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Unqualified attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Namespaced attribute value.
    pub fn ns_attribute(&self, namespace: &str, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name && a.namespace.as_deref() == Some(namespace))
            .map(|a| a.value.as_str())
    }

    /// Trimmed text content.
    pub fn text_trimmed(&self) -> &str {
        self.text.trim()
    }

    /// Fail with a decode error unless this element has the expected name.
    pub fn expect_name(&self, namespace: &str, name: &str) -> Result<(), SoapError> {
        if self.is(namespace, name) {
            Ok(())
        } else {
            Err(SoapError::Decode(format!(
                "expected element {{{}}}{}, found {}",
                namespace,
                name,
                self.qualified_name()
            )))
        }
    }

    /// Text of a mandatory child, or a decode error.
    pub fn required_child_text(&self, namespace: &str, name: &str) -> Result<&str, SoapError> {
        self.child(namespace, name)
            .map(Element::text_trimmed)
            .ok_or_else(|| {
                SoapError::Decode(format!(
                    "{} is missing required child {{{}}}{}",
                    self.qualified_name(),
                    namespace,
                    name
                ))
            })
    }

    /// `{namespace}name` form used in diagnostics.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{{{}}}{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(data: &[u8], max_depth: usize) -> Result<Element, SoapError> {
        parse_document(data, max_depth)
    }

    /// Serialize this element as a document root.
    ///
    /// Every `(prefix, uri)` pair in `prefixes` is declared on the root and
    /// used for elements and attributes in that namespace. Elements in other
    /// namespaces get a default `xmlns` declaration. Namespaced attributes
    /// must use a registered namespace.
    pub fn write_document(&self, prefixes: &[(&str, &str)]) -> Result<String, SoapError> {
        let mut out = String::with_capacity(512);
        write_element(self, prefixes, None, true, &mut out)?;
        Ok(out)
    }
}

fn parse_document(data: &[u8], max_depth: usize) -> Result<Element, SoapError> {
    let xml = std::str::from_utf8(data)
        .map_err(|e| SoapError::Parse(format!("invalid UTF-8: {}", e)))?;

    let mut reader = NsReader::from_str(xml);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| SoapError::Parse(format!("XML parse error: {}", e)))?;
        let namespace = owned_namespace(resolved);

        match event {
            Event::Start(ref e) => {
                if root.is_some() {
                    return Err(SoapError::Parse("multiple root elements".to_string()));
                }
                let element = open_element(&reader, namespace?, e)?;
                stack.push(element);
                if stack.len() > max_depth {
                    return Err(SoapError::Parse(format!(
                        "element nesting exceeds maximum depth {}",
                        max_depth
                    )));
                }
            }
            Event::Empty(ref e) => {
                if root.is_some() {
                    return Err(SoapError::Parse("multiple root elements".to_string()));
                }
                let element = open_element(&reader, namespace?, e)?;
                close_element(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| SoapError::Parse("unbalanced end tag".to_string()))?;
                close_element(&mut stack, &mut root, element);
            }
            Event::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|e| SoapError::Parse(format!("invalid text content: {}", e)))?;
                append_text(&mut stack, &text)?;
            }
            Event::CData(e) => {
                let bytes = e.into_inner();
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| SoapError::Parse(format!("invalid CDATA content: {}", e)))?;
                append_text(&mut stack, text)?;
            }
            Event::DocType(_) => {
                return Err(SoapError::Parse(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry nothing we use
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(SoapError::Parse("unexpected end of document".to_string()));
    }

    root.ok_or_else(|| SoapError::Parse("document has no root element".to_string()))
}

fn owned_namespace(resolved: ResolveResult) -> Result<Option<String>, SoapError> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(Some(String::from_utf8_lossy(ns.as_ref()).into_owned())),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(SoapError::Parse(format!(
            "undeclared namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn open_element(
    reader: &NsReader<&[u8]>,
    namespace: Option<String>,
    start: &BytesStart,
) -> Result<Element, SoapError> {
    let name = utf8(start.local_name().as_ref())?;
    let mut element = Element {
        namespace,
        name,
        ..Default::default()
    };

    for attr in start.attributes() {
        let attr = attr.map_err(|e| SoapError::Parse(format!("invalid attribute: {}", e)))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }

        let (resolved, local) = reader.resolve_attribute(attr.key);
        let namespace = match resolved {
            ResolveResult::Unknown(ref prefix) if prefix.as_slice() == b"xml" => {
                Some(XML_NS.to_string())
            }
            other => owned_namespace(other)?,
        };
        let value = attr
            .unescape_value()
            .map_err(|e| SoapError::Parse(format!("invalid attribute value: {}", e)))?;

        element.attributes.push(Attribute {
            namespace,
            name: utf8(local.as_ref())?,
            value: value.into_owned(),
        });
    }

    Ok(element)
}

fn close_element(stack: &mut Vec<Element>, root: &mut Option<Element>, mut element: Element) {
    // Indentation between child elements is not content
    if !element.children.is_empty() && element.text.trim().is_empty() {
        element.text.clear();
    }
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn append_text(stack: &mut [Element], text: &str) -> Result<(), SoapError> {
    match stack.last_mut() {
        Some(element) => {
            element.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(SoapError::Parse("text outside of root element".to_string())),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, SoapError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| SoapError::Parse(format!("invalid UTF-8 in name: {}", e)))
}

fn write_element(
    element: &Element,
    prefixes: &[(&str, &str)],
    default_ns: Option<&str>,
    is_root: bool,
    out: &mut String,
) -> Result<(), SoapError> {
    check_name(&element.name)?;

    let prefix = element
        .namespace
        .as_deref()
        .and_then(|ns| prefix_for(prefixes, ns));

    let tag = match prefix {
        Some(p) => format!("{}:{}", p, element.name),
        None => element.name.clone(),
    };

    out.push('<');
    out.push_str(&tag);

    if is_root {
        for (p, uri) in prefixes {
            out.push_str(&format!(" xmlns:{}=\"{}\"", p, xml_escape(uri)));
        }
    }

    // Unprefixed elements control the default namespace for their subtree
    let child_default = match (prefix, element.namespace.as_deref()) {
        (Some(_), _) => default_ns,
        (None, ns) => {
            if ns != default_ns {
                out.push_str(&format!(" xmlns=\"{}\"", xml_escape(ns.unwrap_or(""))));
            }
            ns
        }
    };

    for attr in &element.attributes {
        check_name(&attr.name)?;
        check_text(&attr.value)?;
        let name = match attr.namespace.as_deref() {
            None => attr.name.clone(),
            Some(XML_NS) => format!("xml:{}", attr.name),
            Some(ns) => match prefix_for(prefixes, ns) {
                Some(p) => format!("{}:{}", p, attr.name),
                None => {
                    return Err(SoapError::Encode(format!(
                        "attribute '{}' uses unregistered namespace {}",
                        attr.name, ns
                    )))
                }
            },
        };
        out.push_str(&format!(" {}=\"{}\"", name, xml_escape(&attr.value)));
    }

    if element.children.is_empty() && element.text.is_empty() {
        out.push_str("/>");
        return Ok(());
    }

    out.push('>');
    check_text(&element.text)?;
    out.push_str(&xml_escape(&element.text));
    for child in &element.children {
        write_element(child, prefixes, child_default, false, out)?;
    }
    out.push_str("</");
    out.push_str(&tag);
    out.push('>');
    Ok(())
}

fn prefix_for<'a>(prefixes: &[(&'a str, &str)], namespace: &str) -> Option<&'a str> {
    prefixes
        .iter()
        .find(|(_, uri)| *uri == namespace)
        .map(|(p, _)| *p)
}

fn check_name(name: &str) -> Result<(), SoapError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SoapError::Encode(format!("'{}' is not a valid XML name", name)))
    }
}

/// Reject characters XML 1.0 cannot carry.
fn check_text(text: &str) -> Result<(), SoapError> {
    match text
        .chars()
        .find(|&c| (c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r')) || c == '\u{FFFE}' || c == '\u{FFFF}')
    {
        Some(c) => Err(SoapError::Encode(format!(
            "character U+{:04X} cannot be represented in XML",
            c as u32
        ))),
        None => Ok(()),
    }
}

/// Escape text for element content or attribute values.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
