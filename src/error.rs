//! Error types for the ONVIF SOAP engine.

use crate::envelope::Fault;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error for envelope, security, transport and discovery failures.
#[derive(Error, Debug)]
pub enum SoapError {
    #[error("envelope encoding error: {0}")]
    Encode(String),

    #[error("XML parsing error: {0}")]
    Parse(String),

    #[error("WS-Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("SOAP fault ({}): {}", .0.code, .0.reason)]
    Fault(Fault),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("no discovery matches within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// WS-Security UsernameToken validation failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityError {
    /// No UsernameToken, or one without nonce/created
    #[error("missing credentials")]
    MissingCredentials,
    /// Password type not in the accepted list
    #[error("password type not accepted")]
    UnsupportedPasswordType,
    /// Created timestamp outside the allowed clock skew
    #[error("timestamp outside allowed clock skew")]
    StaleTimestamp,
    /// Nonce/created pair already seen inside the replay window
    #[error("nonce already used")]
    ReplayedNonce,
    /// Recomputed digest differs from the supplied one
    #[error("password digest mismatch")]
    DigestMismatch,
}

impl SecurityError {
    /// Get the string code for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::UnsupportedPasswordType => "UNSUPPORTED_PASSWORD_TYPE",
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::ReplayedNonce => "REPLAYED_NONCE",
            Self::DigestMismatch => "DIGEST_MISMATCH",
        }
    }

    /// Reason text carried by the Sender fault returned to the peer.
    pub fn fault_reason(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "Authentication failed: missing credentials",
            Self::UnsupportedPasswordType => "Authentication failed: password type not accepted",
            Self::StaleTimestamp => "Authentication failed: stale timestamp",
            Self::ReplayedNonce => "Authentication failed: replayed nonce",
            Self::DigestMismatch => "Authentication failed: invalid credentials",
        }
    }
}

/// HTTP exchange failures. Non-2xx statuses are not errors at this layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),
}
