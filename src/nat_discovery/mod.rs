/**
 * nat_discovery/mod.rs
 *
 * NAT discovery engine:
 * - UDP listener answering discovery requests from remote gateways
 * - probes of each remote's private and public IP, correlated by request number
 * - retry/timeout scan that gives up on unanswered addresses
 * - one result per remote endpoint on the result sink
 */

mod protocol;
mod request_handle;
mod request_send;
mod transport;
mod types;


pub use protocol::{
    DiscoveryRequest, DiscoveryResponse, EndpointDetails, IpPortPair, Message, ResponseType,
    PROTOCOL_VERSION,
};
pub use transport::{bind_listener, find_preferred_source_ip, DatagramSender};
pub use types::{AddressKind, NatDiscoveryConfig, NatEndpointInfo, NatOutcome, ResolutionState};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::NatDiscoveryError;
use request_send::prepare_probes;
use types::{ProbeStatus, RemoteEndpointNat};

const MAX_DATAGRAM_SIZE: usize = 2048;

/// State shared by the receive loop, the retry loop and the public API
struct State {
    /// Last issued request number, never reused
    request_counter: u64,
    remotes: HashMap<String, RemoteEndpointNat>,
    sender: Option<Arc<dyn DatagramSender>>,
    sink: Option<mpsc::Sender<NatEndpointInfo>>,
}

struct Inner {
    local: Arc<Endpoint>,
    config: NatDiscoveryConfig,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a NAT discovery engine; clones share the same engine
#[derive(Clone)]
pub struct NatDiscovery {
    inner: Arc<Inner>,
}

impl NatDiscovery {
    /// Create an engine for `local`. Nothing is bound until `start()`.
    pub fn new(local: Arc<Endpoint>, config: NatDiscoveryConfig) -> Self {
        Self::build(local, config, None)
    }

    /// Create an engine that writes datagrams through `sender` instead of its own socket
    pub fn with_sender(
        local: Arc<Endpoint>,
        config: NatDiscoveryConfig,
        sender: Arc<dyn DatagramSender>,
    ) -> Self {
        Self::build(local, config, Some(sender))
    }

    fn build(
        local: Arc<Endpoint>,
        config: NatDiscoveryConfig,
        sender: Option<Arc<dyn DatagramSender>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                local,
                config,
                state: Mutex::new(State {
                    request_counter: 0,
                    remotes: HashMap::new(),
                    sender,
                    sink: None,
                }),
                shutdown,
            }),
        }
    }

    pub fn local_endpoint(&self) -> &Arc<Endpoint> {
        &self.inner.local
    }

    /// Bind the listener and spawn the receive and retry loops
    pub async fn start(&self) -> Result<(), NatDiscoveryError> {
        let port = self.inner.local.nat_discovery_port();
        let socket = match bind_listener(port) {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                error!(port, error = %source, "Failed to bind NAT discovery listener");
                return Err(NatDiscoveryError::Bind { port, source });
            }
        };

        info!(
            port,
            cable_name = %self.inner.local.cable_name,
            "NAT discovery listening"
        );

        self.inner.state.lock().await.sender = Some(socket.clone());

        tokio::spawn(self.clone().run_receiver(socket));
        tokio::spawn(self.clone().run_retry_loop());

        Ok(())
    }

    /// Stop both loops and release the listener
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.state.lock().await.sender = None;
        debug!(cable_name = %self.inner.local.cable_name, "NAT discovery stopped");
    }

    /// Register where resolved endpoints are delivered
    pub async fn set_result_sink(&self, sink: mpsc::Sender<NatEndpointInfo>) {
        let mut state = self.inner.state.lock().await;
        state.sink = Some(sink);
        let State { remotes, sink, .. } = &mut *state;
        for remote in remotes.values_mut() {
            deliver_pending(sink, remote);
        }
    }

    /// Start probing `endpoint`. Re-adding a known cable name restarts discovery.
    pub async fn add_remote_endpoint(&self, endpoint: Arc<Endpoint>) {
        let cable_name = endpoint.cable_name.clone();

        let probes = {
            let mut state = self.inner.state.lock().await;
            if state
                .remotes
                .insert(cable_name.clone(), RemoteEndpointNat::new(endpoint))
                .is_some()
            {
                debug!(cable_name = %cable_name, "Restarting NAT discovery for known endpoint");
            }
            let kinds = [AddressKind::Private, AddressKind::Public];
            prepare_probes(&mut state, &cable_name, &kinds)
        };

        info!(cable_name = %cable_name, probes = probes.len(), "Starting NAT discovery for endpoint");

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.dispatch_probes(&cable_name, probes).await {
                warn!(cable_name = %cable_name, error = %e, "NAT discovery request failed");
            }
        });
    }

    /// Forget `cable_name`; late responses for it are dropped
    pub async fn remove_remote_endpoint(&self, cable_name: &str) {
        if self.inner.state.lock().await.remotes.remove(cable_name).is_some() {
            info!(cable_name = %cable_name, "Stopped NAT discovery for endpoint");
        }
    }

    pub async fn resolution_state(&self, cable_name: &str) -> Option<ResolutionState> {
        self.inner
            .state
            .lock()
            .await
            .remotes
            .get(cable_name)
            .map(|remote| remote.state.clone())
    }

    async fn datagram_sender(&self) -> Option<Arc<dyn DatagramSender>> {
        self.inner.state.lock().await.sender.clone()
    }

    async fn run_receiver(self, socket: Arc<UdpSocket>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                    Err(e) => warn!(error = %e, "Error receiving NAT discovery datagram"),
                },
            }
        }

        debug!("NAT discovery receive loop finished");
    }

    async fn run_retry_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.scan_interval);

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => self.check_timeouts().await,
            }
        }

        debug!("NAT discovery retry loop finished");
    }

    /// Resend overdue probes, fail exhausted ones and flush undelivered results
    pub(crate) async fn check_timeouts(&self) {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut resend = Vec::new();

        {
            let mut state = self.inner.state.lock().await;
            let mut due = Vec::new();

            for (cable_name, remote) in state.remotes.iter_mut() {
                let mut kinds = Vec::new();

                for kind in [AddressKind::Private, AddressKind::Public] {
                    let slot = remote.slot_mut(kind);
                    if !slot.is_due(now, config.response_timeout) {
                        continue;
                    }

                    if slot.attempts >= config.max_attempts {
                        debug!(
                            cable_name = %cable_name,
                            kind = %kind,
                            attempts = slot.attempts,
                            "Giving up on NAT discovery of address"
                        );
                        slot.status = ProbeStatus::Failed;
                        slot.request_id = 0;
                    } else {
                        kinds.push(kind);
                    }
                }

                let unresolved = matches!(
                    remote.state,
                    ResolutionState::Unprobed | ResolutionState::Probing
                );
                if unresolved && remote.private.is_settled() && remote.public.is_settled() {
                    warn!(cable_name = %cable_name, "Endpoint unreachable by NAT discovery");
                    remote.state = ResolutionState::Failed;
                    remote.pending = Some(NatEndpointInfo {
                        endpoint: remote.endpoint.clone(),
                        outcome: NatOutcome::Unreachable,
                    });
                }

                if !kinds.is_empty() {
                    due.push((cable_name.clone(), kinds));
                }
            }

            for (cable_name, kinds) in due {
                let probes = prepare_probes(&mut state, &cable_name, &kinds);
                resend.push((cable_name, probes));
            }

            let State { remotes, sink, .. } = &mut *state;
            for remote in remotes.values_mut() {
                deliver_pending(sink, remote);
            }
        }

        for (cable_name, probes) in resend {
            if let Err(e) = self.dispatch_probes(&cable_name, probes).await {
                warn!(cable_name = %cable_name, error = %e, "NAT discovery retry failed");
            }
        }
    }
}

/// Hand a pending result to the sink; keep it for the next scan if the sink is full or unset
/// Resolves once the engine is told to stop; the watch guard ends here.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

fn deliver_pending(sink: &Option<mpsc::Sender<NatEndpointInfo>>, remote: &mut RemoteEndpointNat) {
    let Some(info) = remote.pending.take() else {
        return;
    };

    let Some(sink) = sink else {
        remote.pending = Some(info);
        return;
    };

    match sink.try_send(info) {
        Ok(()) => {}
        Err(TrySendError::Full(info)) => {
            debug!(cable_name = %info.endpoint.cable_name, "Result sink full, delaying delivery");
            remote.pending = Some(info);
        }
        Err(TrySendError::Closed(info)) => {
            warn!(cable_name = %info.endpoint.cable_name, "Result sink closed, dropping NAT discovery result");
        }
    }
}

impl std::fmt::Debug for NatDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatDiscovery")
            .field("local", &self.inner.local.cable_name)
            .field("config", &self.inner.config)
            .finish()
    }
}
