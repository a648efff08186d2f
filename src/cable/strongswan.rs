/**
 * cable/strongswan.rs
 *
 * StrongSwan IPsec driver: per-cable connection table and handshake role
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use super::operation_mode::{decide_mode, OperationMode};
use super::{Driver, STRONGSWAN};
use crate::endpoint::Endpoint;
use crate::error::DriverError;
use crate::nat_discovery::{NatEndpointInfo, NatOutcome};

/// One IPsec connection to a remote gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    pub cluster_id: String,
    pub local_address: String,
    pub local_subnets: Vec<String>,
    pub remote_address: IpAddr,
    pub remote_subnets: Vec<String>,
    pub mode: OperationMode,
    /// UDP encapsulation, needed when the path is translated
    pub encapsulate: bool,
}

impl Connection {
    /// Whether this side starts the IKE exchange or waits for the peer
    pub fn initiates(&self) -> bool {
        self.mode.initiates()
    }
}

pub struct StrongSwan {
    local: Arc<Endpoint>,
    local_subnets: Vec<String>,
    initialized: bool,
    connections: HashMap<String, Connection>,
}

impl StrongSwan {
    pub fn new(local_subnets: Vec<String>, local: Arc<Endpoint>) -> Self {
        Self {
            local,
            local_subnets,
            initialized: false,
            connections: HashMap::new(),
        }
    }

    pub fn connection(&self, cable_name: &str) -> Option<&Connection> {
        self.connections.get(cable_name)
    }

    fn ensure_initialized(&self) -> Result<(), DriverError> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    fn local_address(&self) -> &str {
        if self.local.private_ip.is_empty() {
            &self.local.public_ip
        } else {
            &self.local.private_ip
        }
    }
}

#[async_trait]
impl Driver for StrongSwan {
    async fn init(&mut self) -> Result<(), DriverError> {
        info!(
            cable_name = %self.local.cable_name,
            subnets = ?self.local_subnets,
            "Initializing StrongSwan driver"
        );
        self.initialized = true;
        Ok(())
    }

    async fn get_active_connections(&self, cluster_id: &str) -> Result<Vec<String>, DriverError> {
        self.ensure_initialized()?;

        let mut names: Vec<String> = self
            .connections
            .values()
            .filter(|connection| connection.cluster_id == cluster_id)
            .map(|connection| connection.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn connect_to_endpoint(&mut self, remote: &NatEndpointInfo) -> Result<String, DriverError> {
        self.ensure_initialized()?;

        let endpoint = &remote.endpoint;
        let NatOutcome::Reachable {
            use_ip, use_nat, ..
        } = remote.outcome
        else {
            return Err(DriverError::Unreachable(endpoint.cable_name.clone()));
        };

        let mode = decide_mode(&self.local, endpoint);
        let connection = Connection {
            name: endpoint.cable_name.clone(),
            cluster_id: endpoint.cluster_id.clone(),
            local_address: self.local_address().to_string(),
            local_subnets: self.local_subnets.clone(),
            remote_address: use_ip,
            remote_subnets: endpoint.subnets.clone(),
            mode,
            encapsulate: use_nat,
        };

        info!(
            cable_name = %connection.name,
            remote = %use_ip,
            mode = %mode,
            action = if connection.initiates() { "initiate" } else { "await" },
            encapsulate = use_nat,
            "Connecting to endpoint"
        );

        self.connections.insert(connection.name.clone(), connection);
        Ok(use_ip.to_string())
    }

    async fn disconnect_from_endpoint(&mut self, remote: &Endpoint) -> Result<(), DriverError> {
        self.ensure_initialized()?;

        match self.connections.remove(&remote.cable_name) {
            Some(_) => info!(cable_name = %remote.cable_name, "Disconnected from endpoint"),
            None => debug!(cable_name = %remote.cable_name, "No connection to disconnect"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STRONGSWAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PREFERRED_SERVER_CONFIG;
    use crate::nat_discovery::AddressKind;
    use tokio_test::{assert_err, assert_ok};

    fn local() -> Arc<Endpoint> {
        Arc::new(
            Endpoint::new("cluster-b-ep-1", "cluster-b", "10.3.3.3", "4.4.4.4")
                .with_backend("ipsec")
                .with_backend_config(PREFERRED_SERVER_CONFIG, "true"),
        )
    }

    fn resolved(endpoint: Endpoint, use_nat: bool) -> NatEndpointInfo {
        NatEndpointInfo {
            outcome: NatOutcome::Reachable {
                use_ip: endpoint.public_ip.parse().unwrap(),
                use_port: endpoint.nat_discovery_port(),
                use_nat,
                via: AddressKind::Public,
            },
            endpoint: Arc::new(endpoint),
        }
    }

    fn remote(preferred: &str) -> Endpoint {
        Endpoint::new("cluster-a-ep-1", "cluster-a", "10.1.1.1", "2.2.2.2")
            .with_backend_config(PREFERRED_SERVER_CONFIG, preferred)
    }

    #[tokio::test]
    async fn test_calls_before_init_fail() {
        let mut driver = StrongSwan::new(vec![], local());
        assert!(matches!(
            driver.get_active_connections("cluster-a").await,
            Err(DriverError::NotInitialized)
        ));
        assert_err!(driver.connect_to_endpoint(&resolved(remote("false"), false)).await);
    }

    #[tokio::test]
    async fn test_connect_records_role_and_encapsulation() {
        let mut driver = StrongSwan::new(vec!["10.96.0.0/16".to_string()], local());
        assert_ok!(driver.init().await);

        let ip = assert_ok!(driver.connect_to_endpoint(&resolved(remote("true"), true)).await);
        assert_eq!(ip, "10.1.1.1");

        let connection = driver.connection("cluster-a-ep-1").unwrap();
        // both prefer server, "cluster-b-ep-1" is the greater name
        assert_eq!(connection.mode, OperationMode::Server);
        assert!(!connection.initiates());
        assert!(connection.encapsulate);
        assert_eq!(connection.local_address, "4.4.4.4");
        assert_eq!(connection.local_subnets, vec!["10.96.0.0/16".to_string()]);
    }

    #[tokio::test]
    async fn test_client_side_initiates() {
        let mut client_local = (*local()).clone();
        client_local.backend_config.clear();
        let mut driver_client = StrongSwan::new(vec![], Arc::new(client_local));
        assert_ok!(driver_client.init().await);

        assert_ok!(driver_client.connect_to_endpoint(&resolved(remote("true"), false)).await);
        assert!(driver_client.connection("cluster-a-ep-1").unwrap().initiates());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_rejected() {
        let mut driver = StrongSwan::new(vec![], local());
        assert_ok!(driver.init().await);

        let info = NatEndpointInfo {
            endpoint: Arc::new(remote("false")),
            outcome: NatOutcome::Unreachable,
        };
        match driver.connect_to_endpoint(&info).await {
            Err(DriverError::Unreachable(name)) => assert_eq!(name, "cluster-a-ep-1"),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_active_connections_and_disconnect() {
        let mut driver = StrongSwan::new(vec![], local());
        assert_ok!(driver.init().await);

        let remote_a = remote("false");
        assert_ok!(driver.connect_to_endpoint(&resolved(remote_a.clone(), false)).await);

        let other = Endpoint::new("cluster-c-ep-1", "cluster-c", "10.5.5.5", "");
        assert_ok!(driver.connect_to_endpoint(&resolved(other, false)).await);

        assert_eq!(
            driver.get_active_connections("cluster-a").await.unwrap(),
            vec!["cluster-a-ep-1".to_string()]
        );

        assert_ok!(driver.disconnect_from_endpoint(&remote_a).await);
        assert!(driver.get_active_connections("cluster-a").await.unwrap().is_empty());
        assert_eq!(driver.get_active_connections("cluster-c").await.unwrap().len(), 1);

        // disconnecting twice is fine
        assert_ok!(driver.disconnect_from_endpoint(&remote_a).await);
    }
}
