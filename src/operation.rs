//! Typed request/response messages and the action they travel under.

use crate::error::SoapError;
use crate::xml::Element;
use std::fmt;

/// A value carried as the single child of a SOAP Body.
pub trait SoapMessage: Sized + Send + Sync + 'static {
    fn to_element(&self) -> Result<Element, SoapError>;

    /// Fails with `SoapError::Decode` when the element has the wrong shape.
    fn from_element(element: &Element) -> Result<Self, SoapError>;
}

/// A request/response pair bound to one action URI.
pub trait Operation: Send + Sync + 'static {
    const ACTION: &'static str;
    type Request: SoapMessage;
    type Response: SoapMessage;
}

/// Username and password used to build a Security header.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Failure reported by a server-side handler. Becomes a Receiver fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub reason: String,
    /// Optional fault subcode such as `ter:InvalidArgVal`
    pub subcode: Option<String>,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            subcode: None,
        }
    }

    pub fn with_subcode(mut self, subcode: impl Into<String>) -> Self {
        self.subcode = Some(subcode.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for HandlerError {}
