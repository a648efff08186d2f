/**
 * nat_discovery/protocol.rs
 *
 * NAT discovery wire messages, one JSON document per UDP datagram
 */

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::ProtocolError;

/// Protocol version carried in every envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Identity of one side of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDetails {
    pub endpoint_id: String,
    pub cluster_id: String,
}

impl From<&Endpoint> for EndpointDetails {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            endpoint_id: endpoint.cable_name.clone(),
            cluster_id: endpoint.cluster_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPortPair {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    pub request_number: u64,
    pub sender: EndpointDetails,
    pub receiver: EndpointDetails,
    pub using_src: IpPortPair,
    pub using_dst: IpPortPair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    Ok,
    NatDetected,
    UnknownDstCluster,
    UnknownDstEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub request_number: u64,
    pub response_type: ResponseType,
    pub sender: EndpointDetails,
    pub receiver: EndpointDetails,
    pub src_ip_nat_detected: bool,
    pub src_port_nat_detected: bool,
    pub dst_ip_nat_detected: bool,
    /// Address and port the responder saw the request arrive from
    pub received_src: IpPortPair,
}

impl DiscoveryResponse {
    pub fn uses_nat(&self) -> bool {
        self.src_ip_nat_detected || self.src_port_nat_detected || self.dst_ip_nat_detected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(DiscoveryRequest),
    Response(DiscoveryResponse),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    version: u32,
    message: Message,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&EnvelopeRef {
            version: PROTOCOL_VERSION,
            message: self,
        })
    }

    /// Parse a datagram, rejecting other protocol versions
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                received: envelope.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(envelope.message)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    message: &'a Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(id: &str) -> EndpointDetails {
        EndpointDetails {
            endpoint_id: id.to_string(),
            cluster_id: "cluster".to_string(),
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::Request(DiscoveryRequest {
            request_number: 7,
            sender: details("a"),
            receiver: details("b"),
            using_src: IpPortPair { ip: "2.2.2.2".into(), port: 1234 },
            using_dst: IpPortPair { ip: "4.4.4.4".into(), port: 4321 },
        });

        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["message"]["type"], "request");
        assert_eq!(value["message"]["requestNumber"], 7);
        assert_eq!(value["message"]["usingDst"]["ip"], "4.4.4.4");

        assert_eq!(Message::from_bytes(&msg.to_bytes().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let data = br#"{"version":99,"message":{"type":"request","requestNumber":1,
            "sender":{"endpointId":"a","clusterId":"c"},
            "receiver":{"endpointId":"b","clusterId":"c"},
            "usingSrc":{"ip":"","port":1},"usingDst":{"ip":"1.1.1.1","port":2}}}"#;

        assert!(matches!(
            Message::from_bytes(data),
            Err(ProtocolError::VersionMismatch { received: 99, .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Message::from_bytes(b"\x00\x01PNPL"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_uses_nat() {
        let mut response = DiscoveryResponse {
            request_number: 1,
            response_type: ResponseType::Ok,
            sender: details("b"),
            receiver: details("a"),
            src_ip_nat_detected: false,
            src_port_nat_detected: false,
            dst_ip_nat_detected: false,
            received_src: IpPortPair { ip: "2.2.2.2".into(), port: 1234 },
        };
        assert!(!response.uses_nat());

        response.src_port_nat_detected = true;
        assert!(response.uses_nat());
    }
}
