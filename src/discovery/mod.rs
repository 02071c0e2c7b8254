//! WS-Discovery (2005/04) probe/match over UDP.
//!
//! The client sends one Probe and collects ProbeMatches until its window
//! closes, merging duplicates per endpoint reference. The responder answers
//! probes for a single advertised device with a unicast reply.

mod client;
mod message;
mod responder;

pub use client::DiscoveryClient;
pub use message::{
    local_name, MatchBy, MatchSet, Probe, ProbeMatch, ProbeMatches, ANONYMOUS_ROLE,
    DEVICE_TYPE, DISCOVERY_TO, MATCH_BY_RFC2396, MATCH_BY_STRCMP0, NETWORK_VIDEO_TRANSMITTER,
    PROBE_ACTION, PROBE_MATCHES_ACTION,
};
pub use responder::{DeviceAdvertisement, DiscoveryResponder};
