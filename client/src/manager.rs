//! Tunnel session manager
//!
//! Drives one tunnel through `Disconnected → Connecting → Active → Closing →
//! Closed` (or `Failed`). While active, the dispatch loop, the heartbeat and
//! any number of relays run side by side; none of them waits on another.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use outpost_shared::protocol::{
    ControlMessage, CreateTunnel, CreateTunnelReply, ForwardRequest,
};
use outpost_shared::{Error, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::heartbeat::HeartbeatKeeper;
use crate::relay::RequestRelay;
use crate::session::Session;
use crate::tunnel::{Tunnel, TunnelSnapshot, TunnelStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Requests a graceful close from outside the task running the session
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Stop accepting forward requests and wind the session down. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct TunnelSessionManager {
    config: Arc<TunnelConfig>,
    state: watch::Sender<SessionState>,
    close_tx: Arc<watch::Sender<bool>>,
    session: Option<Session>,
    tunnel: Option<Arc<Tunnel>>,
}

impl TunnelSessionManager {
    pub fn new(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            state,
            close_tx: Arc::new(close_tx),
            session: None,
            tunnel: None,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            tx: self.close_tx.clone(),
        }
    }

    /// Read-only view of the tunnel, once the broker has assigned one
    pub fn tunnel(&self) -> Option<TunnelSnapshot> {
        self.tunnel.as_ref().map(|t| t.snapshot())
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Tunnel session {:?} -> {:?}", prev, next);
        }
    }

    /// Open the control channel and register the tunnel.
    pub async fn open(&mut self) -> Result<TunnelSnapshot> {
        if self.state() != SessionState::Disconnected {
            return Err(Error::InvalidState(format!(
                "cannot open a session in state {:?}",
                self.state()
            )));
        }
        self.set_state(SessionState::Connecting);

        let mut session = match Session::connect_with_retry(&self.config).await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(SessionState::Failed);
                return Err(e);
            }
        };

        let tunnel = match self.create_tunnel(&mut session).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Tunnel creation failed: {}", e);
                session.close().await;
                self.set_state(SessionState::Failed);
                return Err(e);
            }
        };

        tunnel.set_status(TunnelStatus::Active);
        info!(
            "Tunnel created: {} -> {}",
            tunnel.public_url(),
            self.config.local_addr()
        );

        let snapshot = tunnel.snapshot();
        self.tunnel = Some(Arc::new(tunnel));
        self.session = Some(session);
        self.set_state(SessionState::Active);
        Ok(snapshot)
    }

    async fn create_tunnel(&self, session: &mut Session) -> Result<Tunnel> {
        let request = ControlMessage::CreateTunnel(CreateTunnel {
            subdomain: self.config.subdomain.clone(),
            local_host: self.config.local_host.clone(),
            local_port: self.config.local_port,
            protocol: self.config.protocol,
        });
        session.send(&request).await?;

        let text = timeout(self.config.connect_timeout, session.receive())
            .await
            .map_err(|_| Error::Protocol("timed out waiting for create_tunnel reply".to_string()))??;

        let assignment = CreateTunnelReply::decode(&text)?.into_assignment()?;
        Ok(Tunnel::new(assignment, &self.config))
    }

    /// Relay traffic until the tunnel is closed or the channel fails.
    ///
    /// Returns `Ok` after a local close or a broker `tunnel_closed`, and
    /// `Err(ConnectionClosed)` when the control channel is lost. Either way
    /// in-flight relays get `shutdown_timeout` to finish and the connection
    /// is released before this returns.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() != SessionState::Active {
            return Err(Error::InvalidState(format!(
                "cannot run a session in state {:?}",
                self.state()
            )));
        }
        let (mut session, tunnel) = match (self.session.take(), self.tunnel.clone()) {
            (Some(session), Some(tunnel)) => (session, tunnel),
            _ => return Err(Error::InvalidState("session is not open".to_string())),
        };

        let sender = session.sender();
        let mut heartbeat =
            HeartbeatKeeper::new(sender.clone(), tunnel.id(), self.config.heartbeat_interval).spawn();
        let relay = RequestRelay::new(&self.config, tunnel.clone(), sender);
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();
        let mut relays: JoinSet<()> = JoinSet::new();
        let mut close_rx = self.close_tx.subscribe();

        let outcome = loop {
            if *close_rx.borrow_and_update() {
                info!("Close requested");
                break Ok(());
            }

            tokio::select! {
                _ = close_rx.changed() => {}
                beat = &mut heartbeat => {
                    break Err(match beat {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => Error::ConnectionClosed("heartbeat stopped".to_string()),
                        Err(e) => Error::ConnectionClosed(format!("heartbeat task ended: {}", e)),
                    });
                }
                Some(done) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = done {
                        warn!("Relay task ended abnormally: {}", e);
                    }
                }
                received = session.receive() => match received {
                    Ok(text) => match ControlMessage::decode(&text) {
                        Ok(ControlMessage::ForwardRequest(request)) => {
                            spawn_relay(&mut relays, &in_flight, &relay, request);
                        }
                        Ok(ControlMessage::TunnelClosed(closed)) => {
                            info!(
                                "Tunnel closed by broker{}",
                                closed.reason.map(|r| format!(": {}", r)).unwrap_or_default()
                            );
                            break Ok(());
                        }
                        Ok(other) => debug!("Ignoring {} message", other.action()),
                        Err(e) => warn!("Skipping message: {}", e),
                    },
                    Err(e) => {
                        warn!("Control channel lost: {}", e);
                        break Err(e);
                    }
                },
            }
        };

        heartbeat.abort();
        self.set_state(SessionState::Closing);
        drain(&mut relays, &self.config).await;
        session.close().await;
        tunnel.set_status(TunnelStatus::Closed);

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Closed);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Open the tunnel and relay until it ends.
    pub async fn serve(&mut self) -> Result<()> {
        self.open().await?;
        self.run().await
    }

    /// Close the session. Safe to call repeatedly; a failed session stays failed.
    pub async fn close(&mut self) -> Result<()> {
        self.close_tx.send_replace(true);

        match self.state() {
            SessionState::Closed | SessionState::Failed => {}
            _ => {
                self.set_state(SessionState::Closing);
                if let Some(mut session) = self.session.take() {
                    session.close().await;
                }
                if let Some(tunnel) = &self.tunnel {
                    tunnel.set_status(TunnelStatus::Closed);
                }
                self.set_state(SessionState::Closed);
            }
        }
        Ok(())
    }
}

/// Keeps a request id reserved until its relay finishes, however it finishes
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlight {
    fn claim(ids: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut set = ids.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            ids: ids.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

fn spawn_relay(
    relays: &mut JoinSet<()>,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    relay: &RequestRelay,
    request: ForwardRequest,
) {
    let Some(claim) = InFlight::claim(in_flight, &request.request_id) else {
        warn!(
            "Dropping forward_request {}: id already in flight",
            request.request_id
        );
        return;
    };

    let relay = relay.clone();
    relays.spawn(async move {
        let _claim = claim;
        relay.handle(request).await;
    });
}

/// Give in-flight relays the shutdown grace period, then abort the rest.
async fn drain(relays: &mut JoinSet<()>, config: &TunnelConfig) {
    if relays.is_empty() {
        return;
    }

    info!(
        "Waiting up to {:?} for {} in-flight request(s)",
        config.shutdown_timeout,
        relays.len()
    );
    let finished = timeout(config.shutdown_timeout, async {
        while relays.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            "Aborting {} request(s) still running after {:?}",
            relays.len(),
            config.shutdown_timeout
        );
        relays.shutdown().await;
    }
}
