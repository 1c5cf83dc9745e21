//! End-to-end delivery tests: two [`ChatClient`]s wired through a live
//! relay, walking a message through sending -> sent -> delivered -> read
//! and driving the unread count to zero with the read-receipt round trip.

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use palaver::client::ChatClient;
use palaver::protocol::{Attachment, ClientEvent, ConversationKey, MessageStatus, ServerEvent};
use palaver::relay::{app, RelayConfig, RelayState};
use palaver::storage::{
    AttachmentUpload, AttachmentUploader, HttpHistory, RemoteHistory, SqliteCache, UploadError,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

async fn start_relay() -> (String, oneshot::Sender<()>) {
    let state = RelayState::new(RelayConfig {
        peer_log_interval: Duration::ZERO,
        log_sink: None,
    });
    let router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_tx)
}

async fn connect(addr: &str, user_id: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws/{user_id}"))
        .await
        .expect("ws connect");
    tokio::time::sleep(SETTLE).await;
    ws
}

async fn transmit(ws: &mut WsClient, event: &ClientEvent) {
    let text = serde_json::to_string(event).expect("serialize event");
    ws.send(WsMessage::Text(text)).await.expect("send event");
}

async fn transmit_all(ws: &mut WsClient, events: &[ClientEvent]) {
    for event in events {
        transmit(ws, event).await;
    }
}

async fn recv_matching(
    ws: &mut WsClient,
    keep: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws frame");
        if let WsMessage::Text(text) = frame {
            let event: ServerEvent = serde_json::from_str(&text).expect("parse server event");
            if keep(&event) {
                return event;
            }
        }
    }
}

struct NoUploads;

impl AttachmentUploader for NoUploads {
    fn upload(&self, upload: &AttachmentUpload) -> Result<Attachment, UploadError> {
        Ok(Attachment {
            name: upload.name.clone(),
            url: format!("https://files/{}", upload.name),
            content_type: upload.content_type.clone(),
            size: upload.data.len() as u64,
        })
    }
}

struct EmptyHistory;

impl RemoteHistory for EmptyHistory {
    fn fetch_history(
        &self,
        _key: &ConversationKey,
    ) -> Result<Vec<palaver::protocol::Message>, palaver::storage::HistoryError> {
        Ok(Vec::new())
    }
}

fn new_client(self_id: &str) -> ChatClient<SqliteCache> {
    ChatClient::new(self_id, SqliteCache::open_in_memory().expect("cache"))
}

#[tokio::test]
async fn direct_message_walks_sending_sent_delivered_read() {
    let (addr, shutdown_tx) = start_relay().await;

    let mut alice = new_client("alice");
    let mut bob = new_client("bob");
    let mut alice_ws = connect(&addr, "alice").await;
    let mut bob_ws = connect(&addr, "bob").await;

    // Optimistic append, then transmit.
    let outcome = alice
        .send_direct("bob", "hello bob", &[], &NoUploads)
        .expect("send");
    let message_id = outcome.message.id.clone();
    let key = ConversationKey::direct("alice", "bob");
    assert_eq!(
        alice.conversation(&key).expect("load")[0].status,
        MessageStatus::Sending
    );
    transmit(&mut alice_ws, &outcome.event.expect("event")).await;

    // Relay ack: sending -> sent.
    let ack = recv_matching(&mut alice_ws, |e| matches!(e, ServerEvent::Ack { .. })).await;
    alice.handle_event(ack).expect("ack");
    assert_eq!(
        alice.conversation(&key).expect("load")[0].status,
        MessageStatus::Sent
    );

    // Bob receives the message, caches it, and answers with a receipt.
    let delivery =
        recv_matching(&mut bob_ws, |e| matches!(e, ServerEvent::ChatMessage { .. })).await;
    let replies = bob.handle_event(delivery).expect("incoming");
    assert_eq!(replies.len(), 1);
    assert_eq!(bob.unread_from("alice").expect("unread"), 1);
    transmit_all(&mut bob_ws, &replies).await;

    // The receipt reaches alice: sent -> delivered.
    let receipt =
        recv_matching(&mut alice_ws, |e| matches!(e, ServerEvent::Received { .. })).await;
    alice.handle_event(receipt).expect("received");
    assert_eq!(
        alice.conversation(&key).expect("load")[0].status,
        MessageStatus::Delivered
    );

    // Bob opens the conversation: unread drops to zero and a read receipt
    // goes out.
    let opened = bob.open_conversation(&key, &EmptyHistory).expect("open");
    assert_eq!(opened.events.len(), 1);
    assert_eq!(bob.unread_from("alice").expect("unread"), 0);
    transmit_all(&mut bob_ws, &opened.events).await;

    // The read receipt reaches alice: delivered -> read.
    let seen =
        recv_matching(&mut alice_ws, |e| matches!(e, ServerEvent::SeenPrivate { .. })).await;
    alice.handle_event(seen).expect("seen");
    let cached = alice.conversation(&key).expect("load");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, message_id);
    assert_eq!(cached[0].status, MessageStatus::Read);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn group_echo_through_the_relay_stays_a_single_entry() {
    let (addr, shutdown_tx) = start_relay().await;

    let mut alice = new_client("alice");
    let mut alice_ws = connect(&addr, "alice").await;

    transmit(
        &mut alice_ws,
        &ClientEvent::JoinGroup {
            group_id: "grp1".to_string(),
            user_id: "alice".to_string(),
        },
    )
    .await;
    tokio::time::sleep(SETTLE).await;

    let outcome = alice
        .send_group("grp1", "hello group", &[], &NoUploads)
        .expect("send");
    transmit(&mut alice_ws, &outcome.event.expect("event")).await;

    // The relay broadcasts back to the sender; applying the echo must not
    // duplicate the optimistic append.
    let echo = recv_matching(&mut alice_ws, |e| {
        matches!(e, ServerEvent::NewGroupMessage { .. })
    })
    .await;
    let replies = alice.handle_event(echo).expect("echo");
    assert!(replies.is_empty());

    let key = ConversationKey::group("grp1");
    let cached = alice.conversation(&key).expect("load");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, outcome.message.id);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn open_conversation_pulls_live_remote_history() {
    use axum::{extract::Path, routing::get, Json, Router};
    use palaver::protocol::Message;

    fn server_copy(id: &str, timestamp: u64) -> Message {
        Message {
            id: id.to_string(),
            from: "alice".to_string(),
            to: Some("bob".to_string()),
            group_id: None,
            text: format!("archived {id}"),
            attachments: Vec::new(),
            timestamp,
            status: MessageStatus::Delivered,
            is_deleted: false,
            deleted_at: None,
        }
    }

    let payload = vec![server_copy("m0", 50), server_copy("m1", 100)];
    let history_app = Router::new().route(
        "/history/:key",
        get(move |_key: Path<String>| {
            let payload = payload.clone();
            async move { Json(payload) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind history");
    let addr = listener.local_addr().expect("history addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, history_app).await;
    });

    // ureq is blocking, so the whole open runs off the async runtime.
    let (messages, unread) = tokio::task::spawn_blocking(move || {
        let mut bob = new_client("bob");
        let key = ConversationKey::direct("alice", "bob");
        let history = HttpHistory::new(format!("http://{addr}"));
        let outcome = bob.open_conversation(&key, &history).expect("open");
        (outcome.messages, bob.unread_from("alice").expect("unread"))
    })
    .await
    .expect("open task");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "m0");
    assert_eq!(messages[1].id, "m1");
    // Opening read everything the fetch brought in.
    assert!(messages.iter().all(|m| m.status == MessageStatus::Read));
    assert_eq!(unread, 0);
}

#[tokio::test]
async fn deletion_round_trip_soft_deletes_on_the_peer() {
    let (addr, shutdown_tx) = start_relay().await;

    let mut alice = new_client("alice");
    let mut bob = new_client("bob");
    let mut alice_ws = connect(&addr, "alice").await;
    let mut bob_ws = connect(&addr, "bob").await;

    let outcome = alice
        .send_direct("bob", "take this back", &[], &NoUploads)
        .expect("send");
    let message_id = outcome.message.id.clone();
    transmit(&mut alice_ws, &outcome.event.expect("event")).await;

    let delivery =
        recv_matching(&mut bob_ws, |e| matches!(e, ServerEvent::ChatMessage { .. })).await;
    bob.handle_event(delivery).expect("incoming");

    // Alice deletes; the relay fans the event to both private rooms.
    transmit(
        &mut alice_ws,
        &ClientEvent::DeleteMessage {
            message_id: message_id.clone(),
            user_id_a: "alice".to_string(),
            user_id_b: "bob".to_string(),
        },
    )
    .await;
    let deleted = recv_matching(&mut bob_ws, |e| {
        matches!(e, ServerEvent::MessageDeleted { .. })
    })
    .await;
    bob.handle_event(deleted).expect("deletion");

    let key = ConversationKey::direct("alice", "bob");
    let cached = bob.conversation(&key).expect("load");
    assert_eq!(cached.len(), 1);
    assert!(cached[0].is_deleted);
    assert_eq!(cached[0].visible_text(), "");

    shutdown_tx.send(()).ok();
}
