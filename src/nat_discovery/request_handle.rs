/**
 * nat_discovery/request_handle.rs
 *
 * Inbound datagrams: answer requests with what we observed, correlate responses
 */

use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

use super::deliver_pending;
use super::protocol::{
    DiscoveryRequest, DiscoveryResponse, EndpointDetails, IpPortPair, Message, ResponseType,
};
use super::types::{AddressKind, NatEndpointInfo, NatOutcome, ProbeStatus, ResolutionState};
use super::{NatDiscovery, State};

const PREVIEW_BYTES: usize = 16;

impl NatDiscovery {
    /// Process one datagram received from `from`. Never fails; bad input is logged and dropped.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        match Message::from_bytes(data) {
            Ok(Message::Request(request)) => self.handle_request(request, from).await,
            Ok(Message::Response(response)) => self.handle_response(response, from).await,
            Err(e) => {
                debug!(
                    %from,
                    len = data.len(),
                    preview = %hex::encode(&data[..data.len().min(PREVIEW_BYTES)]),
                    error = %e,
                    "Dropping unparseable NAT discovery datagram"
                );
            }
        }
    }

    async fn handle_request(&self, request: DiscoveryRequest, from: SocketAddr) {
        let local = &self.inner.local;

        let src_ip_nat_detected = request
            .using_src
            .ip
            .parse::<IpAddr>()
            .map_or(false, |declared| declared != from.ip());
        let src_port_nat_detected = request.using_src.port != from.port();
        let dst_ip_nat_detected =
            request.using_dst.ip != local.public_ip && request.using_dst.ip != local.private_ip;

        let response_type = if request.receiver.cluster_id != local.cluster_id {
            ResponseType::UnknownDstCluster
        } else if request.receiver.endpoint_id != local.cable_name {
            ResponseType::UnknownDstEndpoint
        } else if src_ip_nat_detected || src_port_nat_detected || dst_ip_nat_detected {
            ResponseType::NatDetected
        } else {
            ResponseType::Ok
        };

        debug!(
            %from,
            request_id = request.request_number,
            sender = %request.sender.endpoint_id,
            response_type = ?response_type,
            "Answering NAT discovery request"
        );

        let response = Message::Response(DiscoveryResponse {
            request_number: request.request_number,
            response_type,
            sender: EndpointDetails::from(local.as_ref()),
            receiver: request.sender,
            src_ip_nat_detected,
            src_port_nat_detected,
            dst_ip_nat_detected,
            received_src: IpPortPair {
                ip: from.ip().to_string(),
                port: from.port(),
            },
        });

        let buf = match response.to_bytes() {
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "Error marshaling NAT discovery response");
                return;
            }
        };

        let Some(sender) = self.datagram_sender().await else {
            debug!(%from, "No datagram sender, dropping NAT discovery response");
            return;
        };

        match sender.send_to(&buf, from).await {
            Ok(length) if length != buf.len() => {
                warn!(%from, sent = length, expected = buf.len(), "Short write of NAT discovery response");
            }
            Ok(_) => {}
            Err(e) => warn!(%from, error = %e, "Error sending NAT discovery response"),
        }
    }

    async fn handle_response(&self, response: DiscoveryResponse, from: SocketAddr) {
        let cable_name = response.sender.endpoint_id.as_str();

        match response.response_type {
            ResponseType::Ok | ResponseType::NatDetected => {}
            other => {
                warn!(
                    cable_name,
                    request_id = response.request_number,
                    response_type = ?other,
                    "Remote endpoint rejected NAT discovery request"
                );
                return;
            }
        }

        if response.receiver.endpoint_id != self.inner.local.cable_name {
            debug!(
                receiver = %response.receiver.endpoint_id,
                "Dropping NAT discovery response addressed to another endpoint"
            );
            return;
        }

        let prefer_private = self.inner.config.prefer_private;
        let mut state = self.inner.state.lock().await;
        let State { remotes, sink, .. } = &mut *state;

        let Some(remote) = remotes.get_mut(cable_name) else {
            debug!(cable_name, "Dropping NAT discovery response from unknown endpoint");
            return;
        };

        let Some(kind) = remote.kind_for_request(response.request_number) else {
            debug!(
                cable_name,
                request_id = response.request_number,
                "Dropping stale NAT discovery response"
            );
            return;
        };

        let use_nat = response.uses_nat();
        let slot = remote.slot_mut(kind);
        slot.request_id = 0;
        slot.status = ProbeStatus::Resolved;

        let use_ip: IpAddr = match slot.target_ip.parse() {
            Ok(ip) => ip,
            Err(_) => return,
        };

        let republish = match remote.published_kind {
            None => true,
            Some(AddressKind::Public) => kind == AddressKind::Private && prefer_private,
            Some(AddressKind::Private) => false,
        };

        if !republish {
            debug!(cable_name, kind = %kind, "Endpoint already resolved, recording only");
            return;
        }

        info!(
            cable_name,
            kind = %kind,
            %use_ip,
            use_port = from.port(),
            use_nat,
            "NAT discovery resolved endpoint"
        );

        remote.state = ResolutionState::Resolved { use_ip, use_nat };
        remote.published_kind = Some(kind);
        remote.pending = Some(NatEndpointInfo {
            endpoint: remote.endpoint.clone(),
            outcome: NatOutcome::Reachable {
                use_ip,
                use_port: from.port(),
                use_nat,
                via: kind,
            },
        });

        deliver_pending(sink, remote);
    }
}
