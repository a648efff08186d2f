/**
 * nat_discovery/types.rs
 *
 * Core types for NAT discovery
 */

use anyhow::{Context, Result};
use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::endpoint::Endpoint;

/// NAT discovery configuration
#[derive(Debug, Clone)]
pub struct NatDiscoveryConfig {
    /// How long a probe may stay unanswered before it is resent
    pub response_timeout: Duration,

    /// Sends per address kind before that kind is given up
    pub max_attempts: u32,

    /// Period of the retry/timeout scan
    pub scan_interval: Duration,

    /// Republish when the private IP resolves after the public one did
    pub prefer_private: bool,
}

impl Default for NatDiscoveryConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            max_attempts: 5,
            scan_interval: Duration::from_secs(1),
            prefer_private: true,
        }
    }
}

impl NatDiscoveryConfig {
    /// Defaults overridden by `GATELINK_NAT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var("GATELINK_NAT_TIMEOUT_SECS") {
            let secs: u64 = value
                .parse()
                .context("GATELINK_NAT_TIMEOUT_SECS must be a number of seconds")?;
            config.response_timeout = Duration::from_secs(secs);
        }

        if let Ok(value) = env::var("GATELINK_NAT_MAX_ATTEMPTS") {
            config.max_attempts = value
                .parse()
                .context("GATELINK_NAT_MAX_ATTEMPTS must be a positive integer")?;
        }

        if let Ok(value) = env::var("GATELINK_NAT_SCAN_INTERVAL_MS") {
            let millis: u64 = value
                .parse()
                .context("GATELINK_NAT_SCAN_INTERVAL_MS must be a number of milliseconds")?;
            config.scan_interval = Duration::from_millis(millis);
        }

        if let Ok(value) = env::var("GATELINK_NAT_PREFER_PRIVATE") {
            config.prefer_private = value
                .parse()
                .context("GATELINK_NAT_PREFER_PRIVATE must be true or false")?;
        }

        anyhow::ensure!(config.max_attempts > 0, "GATELINK_NAT_MAX_ATTEMPTS must be at least 1");

        Ok(config)
    }
}

/// Which of a remote's advertised addresses a probe targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Private,
    Public,
}

impl AddressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Private => "private",
            AddressKind::Public => "public",
        }
    }
}

impl std::fmt::Display for AddressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall discovery state of a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionState {
    Unprobed,
    Probing,
    Resolved { use_ip: IpAddr, use_nat: bool },
    Failed,
}

/// Per address kind probe bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeStatus {
    /// Remote does not advertise this address
    Skipped,
    Unprobed,
    Probing,
    Resolved,
    Failed,
}

#[derive(Debug, Clone)]
pub(crate) struct ProbeSlot {
    pub target_ip: String,
    /// Outstanding request, 0 when none
    pub request_id: u64,
    pub sent_at: Option<Instant>,
    pub attempts: u32,
    pub status: ProbeStatus,
}

impl ProbeSlot {
    pub fn new(target_ip: &str) -> Self {
        let status = if target_ip.is_empty() {
            ProbeStatus::Skipped
        } else {
            ProbeStatus::Unprobed
        };

        Self {
            target_ip: target_ip.to_string(),
            request_id: 0,
            sent_at: None,
            attempts: 0,
            status,
        }
    }

    /// Whether the retry scan should resend at `now`
    pub fn is_due(&self, now: Instant, timeout: Duration) -> bool {
        match (&self.status, self.sent_at) {
            (ProbeStatus::Unprobed, _) => true,
            (ProbeStatus::Probing, Some(sent_at)) => now.duration_since(sent_at) >= timeout,
            (ProbeStatus::Probing, None) => true,
            _ => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, ProbeStatus::Skipped | ProbeStatus::Failed)
    }
}

/// Probe state of one remote endpoint, keyed by cable name
#[derive(Debug)]
pub(crate) struct RemoteEndpointNat {
    pub endpoint: Arc<Endpoint>,
    pub private: ProbeSlot,
    pub public: ProbeSlot,
    pub state: ResolutionState,
    /// Kind that produced the last published result
    pub published_kind: Option<AddressKind>,
    /// Result awaiting delivery to the sink
    pub pending: Option<NatEndpointInfo>,
}

impl RemoteEndpointNat {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            private: ProbeSlot::new(&endpoint.private_ip),
            public: ProbeSlot::new(&endpoint.public_ip),
            endpoint,
            state: ResolutionState::Unprobed,
            published_kind: None,
            pending: None,
        }
    }

    pub fn slot(&self, kind: AddressKind) -> &ProbeSlot {
        match kind {
            AddressKind::Private => &self.private,
            AddressKind::Public => &self.public,
        }
    }

    pub fn slot_mut(&mut self, kind: AddressKind) -> &mut ProbeSlot {
        match kind {
            AddressKind::Private => &mut self.private,
            AddressKind::Public => &mut self.public,
        }
    }

    /// Probe kind whose outstanding request matches `request_id`
    pub fn kind_for_request(&self, request_id: u64) -> Option<AddressKind> {
        if request_id == 0 {
            return None;
        }
        [AddressKind::Private, AddressKind::Public]
            .into_iter()
            .find(|kind| self.slot(*kind).request_id == request_id)
    }
}

/// Outcome of discovery for one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatOutcome {
    Reachable {
        use_ip: IpAddr,
        use_port: u16,
        use_nat: bool,
        via: AddressKind,
    },
    Unreachable,
}

/// Resolved address of a remote endpoint, delivered to the result sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEndpointInfo {
    pub endpoint: Arc<Endpoint>,
    pub outcome: NatOutcome,
}

impl NatEndpointInfo {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, NatOutcome::Reachable { .. })
    }

    pub fn use_ip(&self) -> Option<IpAddr> {
        match self.outcome {
            NatOutcome::Reachable { use_ip, .. } => Some(use_ip),
            NatOutcome::Unreachable => None,
        }
    }

    pub fn use_nat(&self) -> bool {
        matches!(self.outcome, NatOutcome::Reachable { use_nat: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_address_is_skipped() {
        let remote = RemoteEndpointNat::new(Arc::new(Endpoint::new("ep", "c", "10.3.3.3", "")));
        assert_eq!(remote.private.status, ProbeStatus::Skipped);
        assert!(remote.private.is_settled());
        assert_eq!(remote.public.status, ProbeStatus::Unprobed);
    }

    #[test]
    fn test_zero_request_id_never_matches() {
        let remote = RemoteEndpointNat::new(Arc::new(Endpoint::new("ep", "c", "10.3.3.3", "4.4.4.4")));
        assert_eq!(remote.kind_for_request(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_slot_due_after_timeout() {
        let mut slot = ProbeSlot::new("4.4.4.4");
        let timeout = Duration::from_secs(5);
        assert!(slot.is_due(Instant::now(), timeout));

        slot.status = ProbeStatus::Probing;
        slot.sent_at = Some(Instant::now());
        assert!(!slot.is_due(Instant::now(), timeout));

        tokio::time::advance(timeout).await;
        assert!(slot.is_due(Instant::now(), timeout));
    }
}
