/**
 * SESSION SERVER - Operator and edge-source sessions over WebSocket
 *
 * ROLE :
 * Owns the set of connected peers. Decodes inbound commands, drives the
 * actuator backend, feeds the watchdog, and fans out telemetry.
 *
 * FUNCTIONING :
 * - one reader loop per session (its own task), replies only to the sender
 * - one writer task per session draining a bounded outbox
 * - one broadcast task: weight-update at a fixed rate + kernel notices
 * - a full or closed outbox removes the session (slow peer = disconnected peer);
 *   its writer then ends, which ends the reader, and nothing it sent afterwards runs
 *
 * ROLES (fixed by the upgrade path) :
 * - operator    : panels, every valid message except a button edge is a heartbeat
 * - edge source : button nodes, never a heartbeat, may publish button edges and
 *   read status; actuation requests are dropped
 */

use crate::protocol::{decode, encode, validate_button, weight_update, ClientMessage, Notices, ServerMessage};
use crate::relays::SharedBackend;
use crate::safety::SafetySupervisor;
use crate::state::{new_state, Shared};
use crate::weights::WeightTable;
use axum::extract::ws::{Message, WebSocket};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const OUTBOX_CAPACITY: usize = 32;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const WRITER_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Operator,
    EdgeSource,
}

struct SessionEntry {
    role: Role,
    peer: SocketAddr,
    outbox: mpsc::Sender<String>,
}

pub struct SessionHub {
    sessions: Shared<BTreeMap<u64, SessionEntry>>,
    next_id: AtomicU64,
    backend: SharedBackend,
    safety: Arc<SafetySupervisor>,
    weights: WeightTable,
    notices: Notices,
    shutdown: watch::Sender<bool>,
}

impl SessionHub {
    pub fn new(
        backend: SharedBackend,
        safety: Arc<SafetySupervisor>,
        weights: WeightTable,
        notices: Notices,
    ) -> Self {
        Self {
            sessions: new_state(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            backend,
            safety,
            weights,
            notices,
            shutdown: watch::channel(false).0,
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn safety(&self) -> &Arc<SafetySupervisor> {
        &self.safety
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.sessions.lock().values().filter(|s| s.role == role).count()
    }

    pub fn role_of(&self, id: u64) -> Option<Role> {
        self.sessions.lock().get(&id).map(|s| s.role)
    }

    pub fn register(&self, role: Role, peer: SocketAddr) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.sessions.lock().insert(id, SessionEntry { role, peer, outbox });
        info!(session = id, %peer, ?role, "session opened");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if let Some(entry) = self.sessions.lock().remove(&id) {
            info!(session = id, peer = %entry.peer, "session closed");
        }
    }

    /// Reply to one session.
    fn deliver(&self, id: u64, msg: &ServerMessage) {
        let text = match encode(msg) {
            Ok(t) => t,
            Err(e) => {
                error!("cannot encode reply: {e}");
                return;
            }
        };
        let mut sessions = self.sessions.lock();
        let failed = match sessions.get(&id) {
            Some(entry) => entry.outbox.try_send(text).is_err(),
            None => false,
        };
        if failed {
            sessions.remove(&id);
            warn!(session = id, "outbox full or closed, dropping session");
        }
    }

    /// Fan-out to every session except `except`. Sessions that cannot take it are dropped.
    pub fn broadcast(&self, msg: &ServerMessage, except: Option<u64>) {
        let mut sessions = self.sessions.lock();
        if sessions.is_empty() {
            return;
        }
        let text = match encode(msg) {
            Ok(t) => t,
            Err(e) => {
                error!("cannot encode broadcast: {e}");
                return;
            }
        };
        let dead: Vec<u64> = sessions
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, entry)| entry.outbox.try_send(text.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(entry) = sessions.remove(&id) {
                warn!(session = id, peer = %entry.peer, "send failed, dropping session");
            }
        }
    }

    /// Handles one inbound text frame from session `id`.
    pub async fn handle_text(&self, id: u64, text: &str) {
        let msg = match decode(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(session = id, "discarding message: {e}");
                return;
            }
        };

        let Some(role) = self.role_of(id) else {
            debug!(session = id, "discarding message from a dropped session");
            return;
        };

        if let ClientMessage::PhysicalButtonState { relay, state, timestamp } = msg {
            match validate_button(&relay, state, timestamp) {
                Ok(event) => {
                    debug!(session = id, relay = %event.relay, pressed = event.pressed, "button edge");
                    self.broadcast(&event.into_update(), Some(id));
                }
                Err(e) => debug!(session = id, "discarding button event: {e}"),
            }
            return;
        }

        match (role, &msg) {
            (Role::Operator, _) => self.safety.heartbeat(),
            (Role::EdgeSource, ClientMessage::RelayControl { .. } | ClientMessage::EmergencyStop {}) => {
                warn!(session = id, "edge source may not actuate, dropping request");
                return;
            }
            (Role::EdgeSource, _) => {}
        }

        let reply = match msg {
            ClientMessage::RelayControl { relay, state, address } => {
                Some(self.relay_control(relay, state, address).await)
            }
            ClientMessage::GetStatus {} => Some(ServerMessage::Status { relays: self.backend.status().await }),
            ClientMessage::EmergencyStop {} => Some(self.emergency_stop(id).await),
            ClientMessage::Heartbeat {} => None,
            ClientMessage::PhysicalButtonState { .. } => None,
        };
        if let Some(reply) = reply {
            self.deliver(id, &reply);
        }
    }

    async fn relay_control(&self, relay: Option<String>, state: bool, address: Option<i64>) -> ServerMessage {
        let resolved = self.backend.relays().resolve(relay.as_deref(), address);
        let success = match resolved.as_deref() {
            Some(name) => self.backend.set(name, state).await,
            None => false,
        };
        let label = resolved
            .or(relay)
            .unwrap_or_else(|| format!("unknown_{}", address.unwrap_or_default()));
        if success {
            info!(relay = %label, state, "relay commanded");
        } else {
            warn!(relay = %label, state, ?address, "relay command rejected or failed");
        }
        ServerMessage::RelayAck { relay: label, state, success }
    }

    async fn emergency_stop(&self, id: u64) -> ServerMessage {
        warn!(session = id, "EMERGENCY STOP requested");
        let success = self.backend.set_all(false).await;
        let message = if success {
            "All relays turned OFF".to_string()
        } else {
            "Emergency stop incomplete, some relays did not confirm OFF".to_string()
        };
        ServerMessage::EmergencyAck { message, success }
    }

    /// Runs one upgraded connection until close, error or server shutdown.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket, peer: SocketAddr, role: Role) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        let (id, mut outbox) = self.register(role, peer);
        let (mut sink, mut stream) = socket.split();

        let mut writer = tokio::spawn(async move {
            while let Some(text) = outbox.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut writer_done = false;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(id, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = id, "transport error: {e}");
                        break;
                    }
                },
                // outbox sender gone: the hub dropped this session
                _ = &mut writer => {
                    writer_done = true;
                    debug!(session = id, "outbox closed, ending session");
                    break;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.unregister(id);
        if !writer_done && tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            debug!(session = id, "writer did not drain in time");
        }
    }
}

/// Periodic weight-update plus forwarding of kernel notices.
pub fn spawn_broadcaster(hub: Arc<SessionHub>, period: Duration) -> JoinHandle<()> {
    let mut notices = hub.notices.subscribe();
    let mut shutdown = hub.shutdown.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if hub.session_count() > 0 {
                        hub.broadcast(&weight_update(hub.weights.values()), None);
                    }
                }
                notice = notices.recv() => match notice {
                    Ok(msg) => hub.broadcast(&msg, None),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "notice backlog overflow"),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("broadcaster exited");
    })
}

pub struct SessionServer {
    hub: Arc<SessionHub>,
    local_addr: SocketAddr,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionServer {
    /// Serves `router` on `listener` and starts the broadcaster.
    pub fn start(
        hub: Arc<SessionHub>,
        listener: TcpListener,
        router: Router,
        period: Duration,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let mut shutdown = hub.shutdown.subscribe();
        let server = tokio::spawn(async move {
            let app = router.into_make_service_with_connect_info::<SocketAddr>();
            let graceful = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
                error!("session server failed: {e}");
            }
        });
        let broadcaster = spawn_broadcaster(hub.clone(), period);
        info!(%local_addr, "session server listening");
        Ok(Self { hub, local_addr, tasks: parking_lot::Mutex::new(vec![server, broadcaster]) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Idempotent. Closes every session and waits, bounded, for the loops.
    pub async fn stop(&self) {
        self.hub.shutdown.send_replace(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        for task in tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("session server task did not stop in time");
            }
        }
        // upgraded sockets live outside the server task
        while self.hub.session_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!(remaining = self.hub.session_count(), "session server stopped");
    }
}
