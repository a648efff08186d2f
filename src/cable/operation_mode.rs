/**
 * cable/operation_mode.rs
 *
 * Initiator/responder negotiation between two gateways. Both sides run the
 * same computation on the same pair of endpoints, no messages are exchanged.
 */

use tracing::warn;

use crate::endpoint::{Endpoint, PREFERRED_SERVER_CONFIG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Bidirectional,
    Server,
    Client,
}

impl OperationMode {
    /// Role the peer ends up with when we take this one
    pub fn complement(self) -> Self {
        match self {
            OperationMode::Bidirectional => OperationMode::Bidirectional,
            OperationMode::Server => OperationMode::Client,
            OperationMode::Client => OperationMode::Server,
        }
    }

    /// Whether this side starts the handshake
    pub fn initiates(self) -> bool {
        !matches!(self, OperationMode::Server)
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Bidirectional => write!(f, "bi-directional"),
            OperationMode::Server => write!(f, "server"),
            OperationMode::Client => write!(f, "client"),
        }
    }
}

/// Role `local` takes towards `remote`
pub fn decide_mode(local: &Endpoint, remote: &Endpoint) -> OperationMode {
    let local_preferred = match local.backend_bool(PREFERRED_SERVER_CONFIG, Some(false)) {
        Ok(value) => value.unwrap_or(false),
        Err(e) => {
            warn!(cable_name = %local.cable_name, error = %e, "Error parsing local endpoint config");
            false
        }
    };

    let remote_preferred = match remote.backend_bool(PREFERRED_SERVER_CONFIG, None) {
        Ok(value) => value,
        Err(e) => {
            warn!(cable_name = %remote.cable_name, error = %e, "Error parsing remote endpoint config");
            None
        }
    };

    let Some(remote_preferred) = remote_preferred else {
        return OperationMode::Bidirectional;
    };

    match (local_preferred, remote_preferred) {
        (false, false) => OperationMode::Bidirectional,
        (true, false) => OperationMode::Server,
        (false, true) => OperationMode::Client,
        // both want to be server, the greater cable name wins
        (true, true) if local.cable_name > remote.cable_name => OperationMode::Server,
        (true, true) => OperationMode::Client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(cable_name: &str, preferred: Option<&str>) -> Endpoint {
        let ep = Endpoint::new(cable_name, "cluster", "10.0.0.1", "192.168.0.1");
        match preferred {
            Some(value) => ep.with_backend_config(PREFERRED_SERVER_CONFIG, value),
            None => ep,
        }
    }

    fn flag(value: bool) -> Option<&'static str> {
        Some(if value { "true" } else { "false" })
    }

    #[test]
    fn test_negotiation_is_symmetric() {
        for a_pref in [false, true] {
            for b_pref in [false, true] {
                let a = endpoint("cluster-a-ep-1", flag(a_pref));
                let b = endpoint("cluster-b-ep-1", flag(b_pref));

                let a_mode = decide_mode(&a, &b);
                let b_mode = decide_mode(&b, &a);
                assert_eq!(a_mode.complement(), b_mode, "a={} b={}", a_pref, b_pref);
            }
        }
    }

    #[test]
    fn test_single_preference_wins() {
        let a = endpoint("cluster-a-ep-1", flag(true));
        let b = endpoint("cluster-b-ep-1", flag(false));

        assert_eq!(decide_mode(&a, &b), OperationMode::Server);
        assert_eq!(decide_mode(&b, &a), OperationMode::Client);
    }

    #[test]
    fn test_tie_break_on_cable_name() {
        let a = endpoint("cluster-a-ep-1", flag(true));
        let b = endpoint("cluster-b-ep-1", flag(true));

        assert_eq!(decide_mode(&b, &a), OperationMode::Server);
        assert_eq!(decide_mode(&a, &b), OperationMode::Client);
    }

    #[test]
    fn test_remote_without_preference_is_bidirectional() {
        let a = endpoint("cluster-a-ep-1", flag(true));
        let b = endpoint("cluster-b-ep-1", None);

        assert_eq!(decide_mode(&a, &b), OperationMode::Bidirectional);
    }

    #[test]
    fn test_malformed_flags_degrade() {
        let broken = endpoint("cluster-a-ep-1", Some("sometimes"));
        let server = endpoint("cluster-b-ep-1", flag(true));

        // local parse error reads as false
        assert_eq!(decide_mode(&broken, &server), OperationMode::Client);
        // remote parse error reads as no preference
        assert_eq!(decide_mode(&server, &broken), OperationMode::Bidirectional);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(OperationMode::Bidirectional.to_string(), "bi-directional");
        assert_eq!(OperationMode::Server.to_string(), "server");
        assert_eq!(OperationMode::Client.to_string(), "client");
    }
}
