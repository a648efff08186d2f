/**
 * cable/mod.rs
 *
 * Cable drivers: the tunnel lifecycle contract and backend selection
 */

mod operation_mode;
mod strongswan;

pub use operation_mode::{decide_mode, OperationMode};
pub use strongswan::{Connection, StrongSwan};

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::endpoint::{Endpoint, DRIVER_IMPL_CONFIG};
use crate::error::DriverError;
use crate::nat_discovery::NatEndpointInfo;

pub const IPSEC: &str = "ipsec";
pub const WIREGUARD: &str = "wireguard";
pub const STRONGSWAN: &str = "strongswan";
pub const LIBRESWAN: &str = "libreswan";

/// Tunnel lifecycle implemented by every backend
#[async_trait]
pub trait Driver: Send + Sync {
    /// Initialize the driver with any state it needs
    async fn init(&mut self) -> Result<(), DriverError>;

    /// Names of the active connections to the given cluster
    async fn get_active_connections(&self, cluster_id: &str) -> Result<Vec<String>, DriverError>;

    /// Establish a connection to a NAT-resolved endpoint, returning the remote IP used
    async fn connect_to_endpoint(&mut self, remote: &NatEndpointInfo) -> Result<String, DriverError>;

    /// Tear down the connection to the given endpoint
    async fn disconnect_from_endpoint(&mut self, remote: &Endpoint) -> Result<(), DriverError>;

    fn name(&self) -> &'static str;
}

/// Tunnel technology family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ipsec,
    WireGuard,
}

impl FromStr for BackendKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            IPSEC => Ok(BackendKind::Ipsec),
            WIREGUARD => Ok(BackendKind::WireGuard),
            other => Err(DriverError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Build the driver selected by the local endpoint's backend and `driver` config
pub fn new_driver(
    local_subnets: Vec<String>,
    local: Arc<Endpoint>,
) -> Result<Box<dyn Driver>, DriverError> {
    match local.backend.parse::<BackendKind>()? {
        BackendKind::Ipsec => {
            let driver = local
                .backend_config_value(DRIVER_IMPL_CONFIG)
                .unwrap_or(STRONGSWAN)
                .to_string();

            match driver.as_str() {
                STRONGSWAN => {
                    info!(backend = IPSEC, driver = STRONGSWAN, "Using cable driver");
                    Ok(Box::new(StrongSwan::new(local_subnets, local)))
                }
                LIBRESWAN => Err(DriverError::NotYetSupported(LIBRESWAN)),
                _ => Err(DriverError::UnsupportedDriver {
                    driver,
                    backend: IPSEC.to_string(),
                }),
            }
        }
        BackendKind::WireGuard => Err(DriverError::NotYetSupported(WIREGUARD)),
    }
}
