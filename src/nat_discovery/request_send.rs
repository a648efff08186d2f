/**
 * nat_discovery/request_send.rs
 *
 * Outbound discovery requests. Request numbers and slot bookkeeping are
 * assigned under the engine lock, the UDP write happens after it is released.
 */

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::protocol::{DiscoveryRequest, EndpointDetails, IpPortPair, Message};
use super::transport::{find_preferred_source_ip, DatagramSender};
use super::types::{AddressKind, ProbeStatus, ResolutionState};
use super::{NatDiscovery, State};
use crate::endpoint::Endpoint;
use crate::error::{NatDiscoveryError, SendError};

/// A request that has been numbered and recorded but not yet written
#[derive(Debug, Clone)]
pub(crate) struct PreparedProbe {
    pub kind: AddressKind,
    pub request_number: u64,
    pub target_ip: String,
    pub target_port: u16,
    pub remote: Arc<Endpoint>,
}

/// Number and record one probe per requested kind the remote advertises
pub(crate) fn prepare_probes(
    state: &mut State,
    cable_name: &str,
    kinds: &[AddressKind],
) -> Vec<PreparedProbe> {
    let Some(remote) = state.remotes.get_mut(cable_name) else {
        return Vec::new();
    };

    let now = Instant::now();
    let endpoint = remote.endpoint.clone();
    let mut probes = Vec::new();

    for kind in kinds {
        let slot = remote.slot_mut(*kind);
        if slot.status == ProbeStatus::Skipped {
            continue;
        }

        state.request_counter += 1;
        slot.request_id = state.request_counter;
        slot.sent_at = Some(now);
        slot.attempts += 1;
        slot.status = ProbeStatus::Probing;

        probes.push(PreparedProbe {
            kind: *kind,
            request_number: slot.request_id,
            target_ip: slot.target_ip.clone(),
            target_port: endpoint.nat_discovery_port(),
            remote: endpoint.clone(),
        });
    }

    if !probes.is_empty() && remote.state == ResolutionState::Unprobed {
        remote.state = ResolutionState::Probing;
    }

    probes
}

impl NatDiscovery {
    /// Probe every advertised address of a registered remote endpoint
    pub async fn send_check_request(&self, cable_name: &str) -> Result<(), NatDiscoveryError> {
        let probes = {
            let mut state = self.inner.state.lock().await;
            prepare_probes(
                &mut state,
                cable_name,
                &[AddressKind::Private, AddressKind::Public],
            )
        };

        self.dispatch_probes(cable_name, probes).await
    }

    /// Write prepared probes. Only a failure of every attempted address is an error.
    pub(crate) async fn dispatch_probes(
        &self,
        cable_name: &str,
        probes: Vec<PreparedProbe>,
    ) -> Result<(), NatDiscoveryError> {
        if probes.is_empty() {
            return Ok(());
        }

        let Some(sender) = self.datagram_sender().await else {
            self.release_probes(cable_name, &probes).await;
            return Err(NatDiscoveryError::NotStarted);
        };

        let mut sent = 0;
        let mut failures = Vec::new();

        for probe in &probes {
            match self.send_check_request_to_target_ip(sender.as_ref(), probe).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(
                        cable_name = %cable_name,
                        kind = %probe.kind,
                        target = %probe.target_ip,
                        error = %e,
                        "Failed to send NAT discovery request"
                    );
                    failures.push((probe.clone(), e));
                }
            }
        }

        let failed: Vec<PreparedProbe> = failures.iter().map(|(probe, _)| probe.clone()).collect();
        self.release_probes(cable_name, &failed).await;

        if sent > 0 {
            return Ok(());
        }

        let mut private = None;
        let mut public = None;
        for (probe, e) in failures {
            match probe.kind {
                AddressKind::Private => private = Some(e),
                AddressKind::Public => public = Some(e),
            }
        }

        let cable_name = cable_name.to_string();
        Err(match (private, public) {
            (Some(private), Some(public)) => NatDiscoveryError::Discovery {
                cable_name,
                public,
                private,
            },
            (Some(source), None) => NatDiscoveryError::Send {
                cable_name,
                kind: AddressKind::Private.as_str(),
                source,
            },
            (None, Some(source)) => NatDiscoveryError::Send {
                cable_name,
                kind: AddressKind::Public.as_str(),
                source,
            },
            (None, None) => return Ok(()),
        })
    }

    async fn send_check_request_to_target_ip(
        &self,
        sender: &dyn DatagramSender,
        probe: &PreparedProbe,
    ) -> Result<(), SendError> {
        let target_ip: IpAddr = probe
            .target_ip
            .parse()
            .map_err(|_| SendError::InvalidAddress(probe.target_ip.clone()))?;

        let local = &self.inner.local;
        let source_ip = match find_preferred_source_ip(target_ip) {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                warn!(
                    cable_name = %probe.remote.cable_name,
                    error = %e,
                    "Unable to determine source IP while preparing NAT discovery request"
                );
                String::new()
            }
        };

        let request = Message::Request(DiscoveryRequest {
            request_number: probe.request_number,
            sender: EndpointDetails::from(local.as_ref()),
            receiver: EndpointDetails::from(probe.remote.as_ref()),
            using_src: IpPortPair {
                ip: source_ip,
                port: local.nat_discovery_port(),
            },
            using_dst: IpPortPair {
                ip: probe.target_ip.clone(),
                port: probe.target_port,
            },
        });

        let buf = request.to_bytes()?;
        let target = SocketAddr::new(target_ip, probe.target_port);
        let length = sender.send_to(&buf, target).await?;
        if length != buf.len() {
            return Err(SendError::ShortWrite {
                sent: length,
                expected: buf.len(),
            });
        }

        debug!(
            cable_name = %probe.remote.cable_name,
            request_id = probe.request_number,
            kind = %probe.kind,
            %target,
            "Sent NAT discovery request"
        );

        Ok(())
    }

    /// Clear outstanding ids of probes that never left, so their responses cannot match
    async fn release_probes(&self, cable_name: &str, probes: &[PreparedProbe]) {
        if probes.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock().await;
        let Some(remote) = state.remotes.get_mut(cable_name) else {
            return;
        };

        for probe in probes {
            let slot = remote.slot_mut(probe.kind);
            if slot.request_id == probe.request_number {
                slot.request_id = 0;
            }
        }
    }
}
