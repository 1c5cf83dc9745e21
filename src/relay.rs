//! Presence tracker and room router: the real-time relay.
//!
//! One WebSocket per connection (`GET /ws/{user_id}`); every connection is
//! a member of its own user's private room, plus any group rooms it joins
//! explicitly.  The relay is a best-effort fan-out — it performs no
//! retries, keeps no queues, and sends no receipts of its own beyond the
//! transport-level `ack` for accepted sends.  A disconnected recipient
//! simply misses the event; durability comes from the client's
//! fetch-and-reconcile path, not from here.
//!
//! The connection/room/presence table is a single owned arena keyed by
//! connection id, with secondary indexes by user and by group.  All
//! mutation goes through one command channel into the table's owner task,
//! so there is no shared lock and nothing is ever held across network I/O;
//! fan-out happens over per-connection unbounded senders registered in the
//! table.
//!
//! Presence coalesces multiple connections per user: a user is online
//! while their connection refcount is above zero.  Only the first
//! connection broadcasts `online`; only the last disconnect broadcasts
//! `offline` and stamps `last_seen`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ClientEvent, Message, PresenceRecord, PresenceStatus, ServerEvent};

#[derive(Clone)]
pub struct RelayConfig {
    /// How often the periodic presence summary is logged.  Zero disables it.
    pub peer_log_interval: Duration,
    pub log_sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer_log_interval: Duration::from_secs(60),
            log_sink: None,
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    router: RouterHandle,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let router = spawn_router(config.clone());
        Self { config, router }
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn start_peer_log_task(&self, mut shutdown_rx: oneshot::Receiver<()>) {
        if self.config.peer_log_interval.is_zero() {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.peer_log_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = state.router.online_count().await;
                        log_message(
                            &state.config,
                            format!("relay: {count} user(s) online"),
                        );
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/presence/:user_id", get(presence_handler))
        .route("/ws/:user_id", get(ws_handler))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "relay is running" }))
}

/// Non-blocking presence query; unknown users read as offline.
async fn presence_handler(
    Path(user_id): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    Json(state.router.presence(&user_id).await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, user_id, state))
}

async fn handle_ws_connection(mut socket: WebSocket, user_id: String, state: RelayState) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let Some(conn_id) = state.router.connect(user_id.clone(), event_tx).await else {
        return;
    };

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(t) => t,
                            Err(_) => continue,
                        };
                        if socket.send(WsFrame::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Router dropped us (shutdown).
                    None => break,
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => state.router.client_event(conn_id, event),
                            Err(e) => {
                                log_message(
                                    &state.config,
                                    format!(
                                        "relay: unparseable event from {}: {e}",
                                        crate::logging::user_id(&user_id)
                                    ),
                                );
                            }
                        }
                    }
                    Some(Ok(WsFrame::Ping(data))) => {
                        if socket.send(WsFrame::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.router.disconnect(conn_id);
}

// ---------------------------------------------------------------------------
// Router table and command channel
// ---------------------------------------------------------------------------

enum RouterCommand {
    Connect {
        user_id: String,
        tx: mpsc::UnboundedSender<ServerEvent>,
        reply: oneshot::Sender<u64>,
    },
    Disconnect {
        conn_id: u64,
    },
    Client {
        conn_id: u64,
        event: ClientEvent,
    },
    Presence {
        user_id: String,
        reply: oneshot::Sender<PresenceRecord>,
    },
    OnlineCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap clonable handle to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    /// Register a connection; returns its id, or `None` if the router is
    /// gone.
    pub async fn connect(
        &self,
        user_id: String,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Option<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Connect { user_id, tx, reply })
            .ok()?;
        rx.await.ok()
    }

    pub fn disconnect(&self, conn_id: u64) {
        let _ = self.tx.send(RouterCommand::Disconnect { conn_id });
    }

    pub fn client_event(&self, conn_id: u64, event: ClientEvent) {
        let _ = self.tx.send(RouterCommand::Client { conn_id, event });
    }

    /// Presence record for `user_id`; unknown users read as offline.
    pub async fn presence(&self, user_id: &str) -> PresenceRecord {
        let (reply, rx) = oneshot::channel();
        let offline = PresenceRecord {
            user_id: user_id.to_string(),
            online: false,
            last_seen: None,
        };
        if self
            .tx
            .send(RouterCommand::Presence {
                user_id: user_id.to_string(),
                reply,
            })
            .is_err()
        {
            return offline;
        }
        rx.await.unwrap_or(offline)
    }

    pub async fn online_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RouterCommand::OnlineCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn spawn_router(config: RelayConfig) -> RouterHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut table = RouterTable::new(config);
        while let Some(command) = rx.recv().await {
            match command {
                RouterCommand::Connect { user_id, tx, reply } => {
                    let conn_id = table.connect(user_id, tx);
                    let _ = reply.send(conn_id);
                }
                RouterCommand::Disconnect { conn_id } => table.disconnect(conn_id),
                RouterCommand::Client { conn_id, event } => table.handle_event(conn_id, event),
                RouterCommand::Presence { user_id, reply } => {
                    let _ = reply.send(table.presence(&user_id));
                }
                RouterCommand::OnlineCount { reply } => {
                    let _ = reply.send(table.online_count());
                }
            }
        }
    });
    RouterHandle { tx }
}

struct ConnEntry {
    user_id: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// The owned connection arena plus its secondary indexes.  Only the router
/// task touches this.
struct RouterTable {
    config: RelayConfig,
    conns: HashMap<u64, ConnEntry>,
    by_user: HashMap<String, HashSet<u64>>,
    groups: HashMap<String, HashSet<u64>>,
    presence: HashMap<String, PresenceRecord>,
    next_conn_id: u64,
}

impl RouterTable {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            conns: HashMap::new(),
            by_user: HashMap::new(),
            groups: HashMap::new(),
            presence: HashMap::new(),
            next_conn_id: 0,
        }
    }

    fn connect(&mut self, user_id: String, tx: mpsc::UnboundedSender<ServerEvent>) -> u64 {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        self.conns.insert(
            conn_id,
            ConnEntry {
                user_id: user_id.clone(),
                tx,
            },
        );
        let user_conns = self.by_user.entry(user_id.clone()).or_default();
        user_conns.insert(conn_id);
        let first_connection = user_conns.len() == 1;

        let record = self
            .presence
            .entry(user_id.clone())
            .or_insert_with(|| PresenceRecord {
                user_id: user_id.clone(),
                online: false,
                last_seen: None,
            });
        record.online = true;

        if first_connection {
            self.broadcast_except_user(
                &user_id,
                ServerEvent::UserStatusUpdate {
                    user_id: user_id.clone(),
                    status: PresenceStatus::Online,
                    last_seen: None,
                },
            );
        }

        log_message(
            &self.config,
            format!(
                "relay: connected {} ({} connection(s))",
                crate::logging::user_id(&user_id),
                self.by_user.get(&user_id).map(|s| s.len()).unwrap_or(0)
            ),
        );
        conn_id
    }

    fn disconnect(&mut self, conn_id: u64) {
        let Some(entry) = self.conns.remove(&conn_id) else {
            return;
        };
        let user_id = entry.user_id;

        for members in self.groups.values_mut() {
            members.remove(&conn_id);
        }

        let last_connection = if let Some(user_conns) = self.by_user.get_mut(&user_id) {
            user_conns.remove(&conn_id);
            user_conns.is_empty()
        } else {
            true
        };
        if last_connection {
            self.by_user.remove(&user_id);
            let last_seen = now_ms();
            if let Some(record) = self.presence.get_mut(&user_id) {
                record.online = false;
                record.last_seen = Some(last_seen);
            }
            self.broadcast_except_user(
                &user_id,
                ServerEvent::UserStatusUpdate {
                    user_id: user_id.clone(),
                    status: PresenceStatus::Offline,
                    last_seen: Some(last_seen),
                },
            );
        }

        log_message(
            &self.config,
            format!("relay: disconnected {}", crate::logging::user_id(&user_id)),
        );
    }

    fn handle_event(&mut self, conn_id: u64, event: ClientEvent) {
        match event {
            ClientEvent::ChatMessage { message } => self.route_direct(conn_id, message),
            ClientEvent::GroupMessage { message } => self.route_group(conn_id, message),
            ClientEvent::JoinGroup { group_id, user_id } => {
                self.groups.entry(group_id.clone()).or_default().insert(conn_id);
                log_message(
                    &self.config,
                    format!(
                        "relay: {} joined group {}",
                        crate::logging::user_id(&user_id),
                        group_id
                    ),
                );
            }
            ClientEvent::TypingPrivate { from, to } => {
                self.send_to_user(&to, &ServerEvent::TypingPrivate { from });
            }
            ClientEvent::Typing { group_id, user_id } => {
                let room = group_id.clone();
                self.send_to_group_except(
                    &room,
                    conn_id,
                    &ServerEvent::UserTyping { group_id, user_id },
                );
            }
            ClientEvent::SeenPrivate {
                from,
                to,
                message_id,
            } => {
                self.send_to_user(&to, &ServerEvent::SeenPrivate { from, message_id });
            }
            ClientEvent::Seen {
                group_id,
                user_id,
                message_id,
            } => {
                let room = group_id.clone();
                self.send_to_group_except(
                    &room,
                    conn_id,
                    &ServerEvent::MessageSeen {
                        group_id,
                        user_id,
                        message_id,
                    },
                );
            }
            ClientEvent::DeleteMessage {
                message_id,
                user_id_a,
                user_id_b,
            } => {
                // Both participants' private rooms, regardless of who is
                // currently viewing the conversation.
                let event = ServerEvent::MessageDeleted {
                    message_id: message_id.clone(),
                    user_id_a: user_id_a.clone(),
                    user_id_b: user_id_b.clone(),
                };
                self.send_to_user(&user_id_a, &event);
                if user_id_b != user_id_a {
                    self.send_to_user(&user_id_b, &event);
                }
                log_message(
                    &self.config,
                    format!(
                        "relay: deletion of {} fanned to {} and {}",
                        crate::logging::msg_id(&message_id),
                        crate::logging::user_id(&user_id_a),
                        crate::logging::user_id(&user_id_b)
                    ),
                );
            }
            ClientEvent::Received {
                message_id,
                from,
                to,
                group_id,
            } => {
                self.send_to_user(
                    &to,
                    &ServerEvent::Received {
                        message_id,
                        from,
                        group_id,
                    },
                );
            }
        }
    }

    fn route_direct(&mut self, conn_id: u64, message: Message) {
        if message.validate().is_err() || message.to.is_none() {
            log_message(
                &self.config,
                format!(
                    "relay: dropping invalid direct message from {}",
                    crate::logging::user_id(&message.from)
                ),
            );
            return;
        }
        let to = message.to.clone().unwrap_or_default();
        let message_id = message.id.clone();
        let from = message.from.clone();

        // Recipient's private room plus the sender's own connections (the
        // echo keeps multiple tabs consistent).  A self-chat collapses to
        // one set, so nobody is hit twice.
        let mut targets: HashSet<u64> = HashSet::new();
        if let Some(conns) = self.by_user.get(&to) {
            targets.extend(conns);
        }
        if let Some(conns) = self.by_user.get(&from) {
            targets.extend(conns);
        }

        let event = ServerEvent::ChatMessage { message };
        for target in targets {
            self.send_to_conn(target, &event);
        }

        // If the recipient is offline the message was NOT queued: the
        // sender's cache plus fetch-and-reconcile carry durability.
        self.send_to_conn(conn_id, &ServerEvent::Ack { message_id: message_id.clone() });

        log_message(
            &self.config,
            format!(
                "relay: direct {} -> {} ({})",
                crate::logging::user_id(&from),
                crate::logging::user_id(&to),
                crate::logging::msg_id(&message_id)
            ),
        );
    }

    fn route_group(&mut self, conn_id: u64, message: Message) {
        if message.validate().is_err() || message.group_id.is_none() {
            log_message(
                &self.config,
                format!(
                    "relay: dropping invalid group message from {}",
                    crate::logging::user_id(&message.from)
                ),
            );
            return;
        }
        let group_id = message.group_id.clone().unwrap_or_default();
        let message_id = message.id.clone();
        let from = message.from.clone();

        // Everyone in the room, sender included — the sender deduplicates
        // its own echo by message id.
        let members: Vec<u64> = self
            .groups
            .get(&group_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let count = members.len();

        let event = ServerEvent::NewGroupMessage { message };
        for member in members {
            self.send_to_conn(member, &event);
        }

        self.send_to_conn(conn_id, &ServerEvent::Ack { message_id: message_id.clone() });

        log_message(
            &self.config,
            format!(
                "relay: group {} -> {} member(s) of {} ({})",
                crate::logging::user_id(&from),
                count,
                group_id,
                crate::logging::msg_id(&message_id)
            ),
        );
    }

    fn presence(&self, user_id: &str) -> PresenceRecord {
        self.presence
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| PresenceRecord {
                user_id: user_id.to_string(),
                online: false,
                last_seen: None,
            })
    }

    fn online_count(&self) -> usize {
        self.by_user.len()
    }

    /// Deliver to every connection of `user_id`'s private room.  A closed
    /// or missing connection just misses the event.
    fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        if let Some(conns) = self.by_user.get(user_id) {
            for conn_id in conns {
                self.send_to_conn(*conn_id, event);
            }
        }
    }

    fn send_to_conn(&self, conn_id: u64, event: &ServerEvent) {
        if let Some(entry) = self.conns.get(&conn_id) {
            let _ = entry.tx.send(event.clone());
        }
    }

    fn send_to_group_except(&self, group_id: &str, exclude: u64, event: &ServerEvent) {
        if let Some(members) = self.groups.get(group_id) {
            for conn_id in members {
                if *conn_id != exclude {
                    self.send_to_conn(*conn_id, event);
                }
            }
        }
    }

    /// Presence transitions go to every connection that is not the
    /// affected user's own.
    fn broadcast_except_user(&self, user_id: &str, event: ServerEvent) {
        for entry in self.conns.values() {
            if entry.user_id != user_id {
                let _ = entry.tx.send(event.clone());
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn log_message(config: &RelayConfig, message: String) {
    if let Some(log_sink) = &config.log_sink {
        log_sink(message);
    } else {
        let ts = crate::logging::format_timestamp();
        if crate::logging::colour_enabled() {
            eprintln!("\x1b[2m{ts}\x1b[0m {message}");
        } else {
            eprintln!("{ts} - {message}");
        }
    }
}
