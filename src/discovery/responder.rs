//! Device-side probe responder.

use super::message::{Probe, ProbeMatch, ProbeMatches};
use crate::config::DiscoveryConfig;
use crate::envelope::Envelope;
use crate::error::SoapError;
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// What a device advertises. Setters bump the metadata version.
#[derive(Debug)]
pub struct DeviceAdvertisement {
    state: RwLock<ProbeMatch>,
}

impl DeviceAdvertisement {
    pub fn new(
        endpoint_reference: impl Into<String>,
        types: Vec<String>,
        scopes: Vec<String>,
        xaddrs: Vec<String>,
    ) -> Self {
        Self {
            state: RwLock::new(ProbeMatch {
                endpoint_reference: endpoint_reference.into(),
                types,
                scopes,
                xaddrs,
                metadata_version: 1,
            }),
        }
    }

    /// Current advertisement.
    pub fn snapshot(&self) -> ProbeMatch {
        self.state.read().clone()
    }

    pub fn set_types(&self, types: Vec<String>) {
        let mut state = self.state.write();
        state.types = types;
        state.metadata_version += 1;
    }

    pub fn set_scopes(&self, scopes: Vec<String>) {
        let mut state = self.state.write();
        state.scopes = scopes;
        state.metadata_version += 1;
    }

    pub fn set_xaddrs(&self, xaddrs: Vec<String>) {
        let mut state = self.state.write();
        state.xaddrs = xaddrs;
        state.metadata_version += 1;
    }
}

/// Answers probes for one device.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    device: Arc<DeviceAdvertisement>,
    max_datagram_size: usize,
}

impl DiscoveryResponder {
    /// Bind `config.listen_addr`, joining the multicast group when configured.
    pub async fn bind(
        config: &DiscoveryConfig,
        device: Arc<DeviceAdvertisement>,
    ) -> Result<Self, SoapError> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        if config.join_multicast {
            socket.join_multicast_v4(config.multicast_group, config.interface)?;
        }

        info!(
            addr = %socket.local_addr()?,
            group = %config.multicast_group,
            joined = config.join_multicast,
            "Discovery responder listening"
        );

        Ok(Self {
            socket,
            device,
            max_datagram_size: config.max_datagram_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SoapError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn device(&self) -> &Arc<DeviceAdvertisement> {
        &self.device
    }

    /// Encoded ProbeMatches for a datagram, or None when it is not a probe
    /// this device should answer.
    pub fn respond(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let envelope = match Envelope::from_xml(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(error = %e, "Ignoring malformed datagram");
                return None;
            }
        };
        let probe = match Probe::from_envelope(&envelope) {
            Ok(probe) => probe,
            Err(e) => {
                trace!(error = %e, "Ignoring non-probe datagram");
                return None;
            }
        };

        let device = self.device.snapshot();
        if !probe.accepts(&device) {
            debug!(message_id = %probe.message_id, "Probe filters do not match");
            return None;
        }

        match ProbeMatches::reply_to(&probe, vec![device]).to_envelope().to_xml() {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "Failed to encode ProbeMatches");
                None
            }
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), SoapError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buffer = vec![0u8; self.max_datagram_size];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Discovery responder stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buffer) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(error = %e, "Discovery receive error");
                            continue;
                        }
                    };
                    if let Some(reply) = self.respond(&buffer[..len]) {
                        debug!(to = %from, "Answering probe");
                        if let Err(e) = self.socket.send_to(&reply, from).await {
                            warn!(to = %from, error = %e, "Failed to send ProbeMatches");
                        }
                    }
                }
            }
        }
    }

    /// Serve forever.
    pub async fn run(&self) -> Result<(), SoapError> {
        self.run_until(std::future::pending::<()>()).await
    }
}
