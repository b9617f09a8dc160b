//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real sessions,
//! verifying the full sync pipeline: optimistic local edits, server
//! reconciliation, acknowledgments, replay after reconnect, and
//! presence relay.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_collab::persist::{DocumentPersistence, FixedIdentity, MemoryPersistence};
use tandem_collab::protocol::{MessageType, Participant, SyncMessage};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::{CollaborationSession, SessionUpdate};
use tandem_collab::transport::{ConnectionState, ReconnectPolicy, SyncEvent, SyncTransport};
use tandem_ot::Operation;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 1,
    }
}

/// Start an in-memory server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = SyncServer::new(test_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Start a server that loads and saves through the given store.
async fn start_persistent_server(store: Arc<MemoryPersistence>, port: u16) {
    let server = SyncServer::with_persistence(test_config(port), store);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn test_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(400),
        max_attempts: 50,
    }
}

async fn open_session(
    url: &str,
    project_id: Uuid,
    file_id: Uuid,
    name: &str,
    store: &MemoryPersistence,
) -> (CollaborationSession, mpsc::Receiver<SyncEvent>) {
    let mut session = CollaborationSession::open(
        url,
        project_id,
        file_id,
        &FixedIdentity::new(name),
        store,
        test_policy(),
    )
    .await
    .unwrap();
    let events = session.take_events().unwrap();
    (session, events)
}

/// Drive the session until the transport reports `Connected`.
async fn wait_connected(
    session: &mut CollaborationSession,
    events: &mut mpsc::Receiver<SyncEvent>,
) {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event before timeout")
            .expect("event channel closed");
        let connected = matches!(event, SyncEvent::Status(ConnectionState::Connected));
        session.handle_event(event).unwrap();
        if connected {
            return;
        }
    }
}

/// Feed events through the session until it goes quiet, collecting
/// the updates it produced.
async fn collect_updates(
    session: &mut CollaborationSession,
    events: &mut mpsc::Receiver<SyncEvent>,
    quiet: Duration,
) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    while let Ok(Some(event)) = timeout(quiet, events.recv()).await {
        if let Some(update) = session.handle_event(event).unwrap() {
            updates.push(update);
        }
    }
    updates
}

async fn settle(session: &mut CollaborationSession, events: &mut mpsc::Receiver<SyncEvent>) {
    let _ = collect_updates(session, events, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_session_connects_and_loads_buffer() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let file_id = Uuid::new_v4();
    let store = MemoryPersistence::new().with_document(file_id, "fn main() {}", 3);

    let (mut session, mut events) =
        open_session(&url, Uuid::new_v4(), file_id, "Alice", &store).await;
    wait_connected(&mut session, &mut events).await;

    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert_eq!(session.buffer(), "fn main() {}");
    assert_eq!(session.revision(), 3);
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let server_store = Arc::new(MemoryPersistence::new());
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    server_store.save_document(file_id, "hello", 0).await.unwrap();

    let port = free_port().await;
    start_persistent_server(server_store, port).await;
    let url = format!("ws://127.0.0.1:{port}");

    let store_a = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let store_b = MemoryPersistence::new().with_document(file_id, "hello", 0);

    let (mut alice, mut events_a) =
        open_session(&url, project_id, file_id, "Alice", &store_a).await;
    wait_connected(&mut alice, &mut events_a).await;

    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store_b).await;
    wait_connected(&mut bob, &mut events_b).await;

    // Both insert at the same index before seeing each other's edit.
    alice.insert(5, " world");
    bob.insert(5, "!!");

    settle(&mut alice, &mut events_a).await;
    settle(&mut bob, &mut events_b).await;

    assert_eq!(alice.buffer(), bob.buffer(), "replicas must agree");
    assert_eq!(alice.checksum(), bob.checksum());
    assert!(alice.buffer().contains(" world"));
    assert!(alice.buffer().contains("!!"));
    assert_eq!(alice.pending_len(), 0);
    assert_eq!(bob.pending_len(), 0);
}

#[tokio::test]
async fn test_concurrent_deletes_converge() {
    let server_store = Arc::new(MemoryPersistence::new());
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    server_store.save_document(file_id, "abcdef", 0).await.unwrap();

    let port = free_port().await;
    start_persistent_server(server_store, port).await;
    let url = format!("ws://127.0.0.1:{port}");

    let store_a = MemoryPersistence::new().with_document(file_id, "abcdef", 0);
    let store_b = MemoryPersistence::new().with_document(file_id, "abcdef", 0);

    let (mut alice, mut events_a) =
        open_session(&url, project_id, file_id, "Alice", &store_a).await;
    wait_connected(&mut alice, &mut events_a).await;

    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store_b).await;
    wait_connected(&mut bob, &mut events_b).await;

    // Disjoint ranges: "bc" and "de" go away whichever order the
    // server takes them in.
    alice.delete(1, 2);
    bob.delete(3, 2);

    settle(&mut alice, &mut events_a).await;
    settle(&mut bob, &mut events_b).await;

    assert_eq!(alice.buffer(), "af");
    assert_eq!(bob.buffer(), "af");
    assert_eq!(alice.checksum(), bob.checksum());
}

#[tokio::test]
async fn test_ack_clears_pending() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let store = MemoryPersistence::new();

    let (mut session, mut events) =
        open_session(&url, Uuid::new_v4(), Uuid::new_v4(), "Alice", &store).await;
    wait_connected(&mut session, &mut events).await;

    session.insert(0, "hello");
    assert_eq!(session.pending_len(), 1);

    settle(&mut session, &mut events).await;

    assert_eq!(session.pending_len(), 0);
    assert_eq!(session.buffer(), "hello");
    assert_eq!(session.revision(), 1);
}

#[tokio::test]
async fn test_reconnect_replays_offline_edits() {
    let server_store = Arc::new(MemoryPersistence::new());
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    server_store.save_document(file_id, "hello", 0).await.unwrap();

    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");

    // Alice opens before the server is up and edits offline.
    let store_a = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let (mut alice, mut events_a) =
        open_session(&url, project_id, file_id, "Alice", &store_a).await;

    alice.insert(5, " world");
    alice.insert(11, "!");
    assert_eq!(alice.buffer(), "hello world!");
    assert_eq!(alice.pending_len(), 2);

    // The server comes up; the supervisor reconnects and the session
    // replays both pending operations unchanged.
    start_persistent_server(server_store, port).await;
    wait_connected(&mut alice, &mut events_a).await;
    settle(&mut alice, &mut events_a).await;

    assert_eq!(alice.pending_len(), 0, "replayed edits must be acked");
    assert_eq!(alice.buffer(), "hello world!");

    // A late joiner adopts the authoritative snapshot and matches the
    // replica that never disconnected.
    let store_b = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store_b).await;
    wait_connected(&mut bob, &mut events_b).await;

    while let Ok(Some(event)) = timeout(Duration::from_millis(500), events_b.recv()).await {
        if let Some(SessionUpdate::FileChanged(snap)) = bob.handle_event(event).unwrap() {
            store_b
                .save_document(snap.file_id, &snap.content, snap.revision)
                .await
                .unwrap();
            bob.resync(&store_b).await.unwrap();
        }
    }

    assert_eq!(bob.buffer(), "hello world!");
    assert_eq!(bob.buffer(), alice.buffer());
}

#[tokio::test]
async fn test_duplicate_operation_applies_once_and_reacks() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();

    // Observer session sees what the room actually applies.
    let store = MemoryPersistence::new();
    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store).await;
    wait_connected(&mut bob, &mut events_b).await;

    // Raw author connection so we can resend the exact same frame.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/{project_id}"))
        .await
        .unwrap();
    let author = Uuid::new_v4();
    let me = Participant::with_id(author, "Raw");
    let join = SyncMessage::user_joined(author, project_id, &me);
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();

    let op = Operation::insert(0, "dup", author, 0);
    let op_id = op.id;
    let frame = SyncMessage::operation(author, project_id, file_id, &op)
        .encode()
        .unwrap();
    ws.send(Message::Binary(frame.clone().into())).await.unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    // The author gets two acks for the same id.
    let mut acks = 0;
    while acks < 2 {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no ack before timeout")
            .expect("connection closed")
            .unwrap();
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            let decoded = SyncMessage::decode(&bytes).unwrap();
            if decoded.msg_type == MessageType::OperationAck {
                assert_eq!(decoded.ack_id().unwrap(), op_id);
                acks += 1;
            }
        }
    }

    // The observer applies it exactly once.
    let updates = collect_updates(&mut bob, &mut events_b, Duration::from_millis(300)).await;
    let buffer_updates = updates
        .iter()
        .filter(|u| matches!(u, SessionUpdate::Buffer { .. }))
        .count();
    assert_eq!(buffer_updates, 1, "duplicate must not re-apply");
    assert_eq!(bob.buffer(), "dup");
}

#[tokio::test]
async fn test_cursor_updates_reach_peers() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();

    let store_a = MemoryPersistence::new();
    let store_b = MemoryPersistence::new();

    let (mut alice, mut events_a) =
        open_session(&url, project_id, file_id, "Alice", &store_a).await;
    wait_connected(&mut alice, &mut events_a).await;

    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store_b).await;
    wait_connected(&mut bob, &mut events_b).await;

    alice.cursor_moved(3, 7, None);

    let updates = collect_updates(&mut bob, &mut events_b, Duration::from_millis(500)).await;
    assert!(
        updates
            .iter()
            .any(|u| matches!(u, SessionUpdate::PresenceChanged)),
        "bob should see alice's cursor"
    );

    let cursors = bob.cursors();
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0].user_name, "Alice");
    assert_eq!(cursors[0].line, 3);
    assert_eq!(cursors[0].column, 7);
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let server_store = Arc::new(MemoryPersistence::new());
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    server_store.save_document(file_id, "hello", 0).await.unwrap();

    let port = free_port().await;
    start_persistent_server(server_store, port).await;
    let url = format!("ws://127.0.0.1:{port}");

    let store_a = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let (mut alice, mut events_a) =
        open_session(&url, project_id, file_id, "Alice", &store_a).await;
    wait_connected(&mut alice, &mut events_a).await;

    alice.insert(5, " world");
    settle(&mut alice, &mut events_a).await;

    // Bob joins a room that already has state; the server hands him
    // the authoritative snapshot, which the session passes through
    // without adopting.
    let store_b = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let (mut bob, mut events_b) = open_session(&url, project_id, file_id, "Bob", &store_b).await;
    wait_connected(&mut bob, &mut events_b).await;

    let updates = collect_updates(&mut bob, &mut events_b, Duration::from_millis(500)).await;
    let snap = updates
        .iter()
        .find_map(|u| match u {
            SessionUpdate::FileChanged(snap) => Some(snap),
            _ => None,
        })
        .expect("late joiner should receive a snapshot");

    assert_eq!(snap.content, alice.buffer());
    assert_eq!(snap.revision, alice.revision());
    assert_eq!(bob.buffer(), "hello", "the core leaves adoption to the app");
}

#[tokio::test]
async fn test_room_close_saves_to_persistence() {
    let server_store = Arc::new(MemoryPersistence::new());
    let project_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    server_store.save_document(file_id, "hello", 0).await.unwrap();

    let port = free_port().await;
    start_persistent_server(server_store.clone(), port).await;
    let url = format!("ws://127.0.0.1:{port}");

    let store = MemoryPersistence::new().with_document(file_id, "hello", 0);
    let (mut session, mut events) =
        open_session(&url, project_id, file_id, "Alice", &store).await;
    wait_connected(&mut session, &mut events).await;

    session.insert(5, " world");
    settle(&mut session, &mut events).await;
    session.close();

    // The last peer leaving closes the room and flushes its files.
    let mut saved = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(doc) = server_store.load_document(file_id).await {
            if doc.revision == 1 {
                saved = Some(doc);
                break;
            }
        }
    }
    let saved = saved.expect("room close should persist the file");
    assert_eq!(saved.content, "hello world");
}

#[tokio::test]
async fn test_transport_ping() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut transport = SyncTransport::new(
        url,
        Uuid::new_v4(),
        Participant::new("PingUser"),
        test_policy(),
    );
    let mut events = transport.take_events().unwrap();
    transport.connect();

    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event before timeout")
            .expect("event channel closed");
        if matches!(event, SyncEvent::Status(ConnectionState::Connected)) {
            break;
        }
    }

    transport.send_ping().unwrap();
}
