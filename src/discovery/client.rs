//! Probe sender and match collector.

use super::message::{MatchSet, Probe, ProbeMatch, ProbeMatches};
use crate::config::DiscoveryConfig;
use crate::envelope::Envelope;
use crate::error::SoapError;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Sends probes and collects matches until the window closes.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    config: DiscoveryConfig,
}

impl DiscoveryClient {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Probe for every device.
    pub async fn probe(&self) -> Result<Vec<ProbeMatch>, SoapError> {
        self.probe_for(&[], &[]).await
    }

    /// Probe with type and scope filters. An empty result is not an error.
    pub async fn probe_for(
        &self,
        types: &[String],
        scopes: &[String],
    ) -> Result<Vec<ProbeMatch>, SoapError> {
        self.run(Probe::new(types.to_vec(), scopes.to_vec())).await
    }

    /// Like `probe_for`, but no match at all is `SoapError::DiscoveryTimeout`.
    pub async fn probe_any(
        &self,
        types: &[String],
        scopes: &[String],
    ) -> Result<Vec<ProbeMatch>, SoapError> {
        let matches = self.probe_for(types, scopes).await?;
        if matches.is_empty() {
            return Err(SoapError::DiscoveryTimeout(self.config.window()));
        }
        Ok(matches)
    }

    /// Send `probe` and collect replies until the window deadline.
    pub async fn run(&self, probe: Probe) -> Result<Vec<ProbeMatch>, SoapError> {
        let payload = probe.to_envelope().to_xml()?;
        let socket = UdpSocket::bind(self.config.client_bind).await?;
        socket.set_multicast_ttl_v4(self.config.ttl)?;

        let deadline = Instant::now() + self.config.window();
        self.send_probe(&socket, &payload).await?;

        debug!(
            message_id = %probe.message_id,
            window_ms = self.config.window_ms,
            "Probe sent, collecting matches"
        );

        let mut matches = MatchSet::new();
        let mut buffer = vec![0u8; self.config.max_datagram_size];

        loop {
            match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                // Window closed
                Err(_) => break,
                Ok(Err(e)) => {
                    debug!(error = %e, "Discovery receive error");
                }
                Ok(Ok((len, from))) => match parse_reply(&buffer[..len], &probe.message_id) {
                    Some(reply) => {
                        for m in reply.matches {
                            if matches.insert(m) {
                                trace!(from = %from, "New device answered probe");
                            }
                        }
                    }
                    None => trace!(from = %from, bytes = len, "Ignoring datagram"),
                },
            }
        }

        info!(
            message_id = %probe.message_id,
            devices = matches.len(),
            "Discovery window closed"
        );
        Ok(matches.into_vec())
    }

    /// Fails only when no destination could be reached.
    async fn send_probe(&self, socket: &UdpSocket, payload: &[u8]) -> Result<(), SoapError> {
        let destinations: Vec<SocketAddr> = self.config.destinations();
        let mut last_error = None;
        let mut sent = 0usize;

        for destination in &destinations {
            match socket.send_to(payload, *destination).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Failed to send probe");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if sent == 0 => Err(SoapError::Io(e)),
            _ => Ok(()),
        }
    }
}

/// A ProbeMatches answering `message_id`, or None for anything else.
fn parse_reply(datagram: &[u8], message_id: &str) -> Option<ProbeMatches> {
    let envelope = Envelope::from_xml(datagram).ok()?;
    let reply = ProbeMatches::from_envelope(&envelope).ok()?;
    match reply.relates_to.as_deref() {
        Some(relates_to) if relates_to != message_id => None,
        // Some firmware omits RelatesTo on unicast replies
        _ => Some(reply),
    }
}
