//! ONVIF SOAP engine
//!
//! Protocol core shared by ONVIF clients and devices: SOAP 1.2 envelopes with
//! faults, WS-Security UsernameToken digests, typed action dispatch over HTTP
//! and WS-Discovery probe/match over UDP multicast.
//!
//! # Features
//!
//! - Envelope encode/parse with fault detection and XXE/depth limits
//! - UsernameToken generation and validation with replay protection
//! - Client dispatcher over a pluggable `Transport` (reqwest by default)
//! - Server dispatcher with authentication, routing and fault mapping
//! - WS-Discovery client with windowed collection and de-duplication
//! - WS-Discovery responder for a single advertised device
//!
//! # Example
//!
//! ```ignore
//! use onvif_soap::{ClientDispatcher, Credentials};
//!
//! let client = ClientDispatcher::from_config(&config.client)?;
//! let response = client
//!     .invoke::<GetSystemDateAndTime>(endpoint, Some(&Credentials::new("admin", "pw")), &request)
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod operation;
pub mod security;
pub mod server;
pub mod transport;
pub mod xml;

pub use client::ClientDispatcher;
pub use config::{OnvifConfig, PasswordType};
pub use discovery::{DeviceAdvertisement, DiscoveryClient, DiscoveryResponder, Probe, ProbeMatch};
pub use envelope::{Body, Envelope, Fault, FaultCode, Header};
pub use error::{SecurityError, SoapError, TransportError};
pub use operation::{Credentials, HandlerError, Operation, SoapMessage};
pub use security::{
    Clock, CredentialStore, OffsetClock, ReplayCache, Security, SecurityHeaderFactory,
    SecurityValidator, SystemClock, UsernameToken,
};
pub use server::{RequestContext, ServerDispatcher, ServerResponse};
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use xml::Element;
