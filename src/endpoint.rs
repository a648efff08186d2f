/**
 * endpoint.rs
 *
 * Gateway endpoint description shared by NAT discovery and the cable drivers
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EndpointConfigError;

/// Well-known UDP port for NAT discovery when an endpoint does not override it
pub const DEFAULT_NAT_DISCOVERY_PORT: u16 = 4490;

/// Backend config key selecting the driver implementation within a backend family
pub const DRIVER_IMPL_CONFIG: &str = "driver";

/// Backend config key expressing a preference for the server (responder) role
pub const PREFERRED_SERVER_CONFIG: &str = "preferred-server";

/// A cluster gateway taking part in cross-cluster tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Globally unique, also the tie-break key for role negotiation
    pub cable_name: String,
    pub cluster_id: String,
    #[serde(default, rename = "publicIP")]
    pub public_ip: String,
    #[serde(default, rename = "privateIP")]
    pub private_ip: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub backend_config: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_discovery_port: Option<u16>,
}

impl Endpoint {
    /// Create an endpoint with no backend configuration
    pub fn new(
        cable_name: impl Into<String>,
        cluster_id: impl Into<String>,
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
    ) -> Self {
        Self {
            cable_name: cable_name.into(),
            cluster_id: cluster_id.into(),
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            subnets: Vec::new(),
            backend: String::new(),
            backend_config: HashMap::new(),
            nat_discovery_port: None,
        }
    }

    pub fn with_nat_discovery_port(mut self, port: u16) -> Self {
        self.nat_discovery_port = Some(port);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_backend_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.backend_config.insert(key.into(), value.into());
        self
    }

    /// Port on which this endpoint listens for NAT discovery requests
    pub fn nat_discovery_port(&self) -> u16 {
        self.nat_discovery_port.unwrap_or(DEFAULT_NAT_DISCOVERY_PORT)
    }

    pub fn backend_config_value(&self, key: &str) -> Option<&str> {
        self.backend_config.get(key).map(String::as_str)
    }

    /// Read a boolean from the backend configuration.
    ///
    /// An absent key yields `default`. Accepted spellings are `1`, `t`,
    /// `T`, `true`, `TRUE`, `True` and their false counterparts; anything
    /// else is an error and the caller decides how to degrade.
    pub fn backend_bool(
        &self,
        key: &str,
        default: Option<bool>,
    ) -> Result<Option<bool>, EndpointConfigError> {
        let Some(value) = self.backend_config.get(key) else {
            return Ok(default);
        };

        match value.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(Some(true)),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(Some(false)),
            _ => Err(EndpointConfigError::InvalidBool {
                key: key.to_string(),
                value: value.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_nat_discovery_port() {
        let ep = Endpoint::new("ep", "cluster", "10.0.0.1", "");
        assert_eq!(ep.nat_discovery_port(), DEFAULT_NAT_DISCOVERY_PORT);
        assert_eq!(ep.with_nat_discovery_port(1234).nat_discovery_port(), 1234);
    }

    #[test]
    fn test_backend_bool() {
        let ep = Endpoint::new("ep", "cluster", "", "")
            .with_backend_config(PREFERRED_SERVER_CONFIG, "True")
            .with_backend_config("broken", "maybe");

        assert_eq!(ep.backend_bool(PREFERRED_SERVER_CONFIG, None).unwrap(), Some(true));
        assert_eq!(ep.backend_bool("missing", Some(false)).unwrap(), Some(false));
        assert_eq!(ep.backend_bool("missing", None).unwrap(), None);
        assert!(ep.backend_bool("broken", Some(false)).is_err());
    }

    #[test]
    fn test_backend_bool_accepted_spellings() {
        for value in ["1", "t", "T", "true", "TRUE", "True"] {
            let ep = Endpoint::new("ep", "cluster", "", "").with_backend_config("flag", value);
            assert_eq!(ep.backend_bool("flag", None).unwrap(), Some(true), "{value}");
        }
        for value in ["0", "f", "F", "false", "FALSE", "False"] {
            let ep = Endpoint::new("ep", "cluster", "", "").with_backend_config("flag", value);
            assert_eq!(ep.backend_bool("flag", None).unwrap(), Some(false), "{value}");
        }
        for value in ["yes", "no", "tRuE", " true", "true ", ""] {
            let ep = Endpoint::new("ep", "cluster", "", "").with_backend_config("flag", value);
            assert!(ep.backend_bool("flag", None).is_err(), "{value:?} should not parse");
        }
    }

    #[test]
    fn test_deserialize_endpoint_json() {
        let json = r#"{
            "cableName": "submariner-cable-cluster-b-4-4-4-4",
            "clusterId": "cluster-b",
            "publicIP": "10.3.3.3",
            "privateIP": "4.4.4.4",
            "backend": "ipsec",
            "backendConfig": {"preferred-server": "true"},
            "natDiscoveryPort": 4321
        }"#;

        let ep: Endpoint = serde_json::from_str(json).unwrap();
        assert_eq!(ep.cluster_id, "cluster-b");
        assert_eq!(ep.private_ip, "4.4.4.4");
        assert_eq!(ep.nat_discovery_port(), 4321);
        assert_eq!(ep.backend_config_value(PREFERRED_SERVER_CONFIG), Some("true"));
    }
}
