//! End to end sync tests
//!
//! The client runs against an in-process server: the connection provider
//! hands the server end of every connection to the test, which plays the
//! Simperium side of the protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use simperium_client::auth::{AuthError, UserDetails};
use simperium_client::storage::GhostStore;
use simperium_client::websocket::Connection;
use simperium_client::{
    AuthProvider, Bucket, BucketListener, ChangeType, ConnectionProvider, Credentials, Simperium, SimperiumConfig,
    Stores,
};
use tokio::sync::mpsc;
use url::Url;

const TOKEN: &str = "test-token";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Server end of a client connection
struct ServerConnection {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl ServerConnection {
    /// Next frame, including heartbeats
    async fn recv_frame(&mut self) -> String {
        tokio::time::timeout(TIMEOUT, self.from_client.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the connection")
    }

    /// Next channel frame, skipping heartbeats
    async fn recv(&mut self) -> String {
        loop {
            let frame = self.recv_frame().await;
            if !frame.starts_with("h:") {
                return frame;
            }
        }
    }

    fn send(&self, frame: &str) {
        self.to_client.send(frame.to_string()).unwrap();
    }
}

struct TestServer {
    accepted: mpsc::UnboundedSender<ServerConnection>,
}

#[async_trait]
impl ConnectionProvider for TestServer {
    async fn connect(&self, url: &Url, session_id: &str) -> simperium_client::Result<Connection> {
        assert_eq!(url.as_str(), "wss://api.simperium.com/sock/1/test-app/websocket");
        assert!(session_id.starts_with("rust-"));

        let (sender, from_client) = mpsc::unbounded_channel();
        let (to_client, receiver) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerConnection { from_client, to_client });
        Ok(Connection { sender, receiver })
    }
}

struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn create_user(&self, _details: UserDetails) -> Result<Credentials, AuthError> {
        Err(AuthError::generic())
    }

    async fn authorize_user(&self, _details: UserDetails) -> Result<Credentials, AuthError> {
        Err(AuthError::generic())
    }
}

struct Connections {
    accepted: mpsc::UnboundedReceiver<ServerConnection>,
}

impl Connections {
    async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("provider dropped")
    }
}

fn test_config() -> SimperiumConfig {
    SimperiumConfig::new("test-app", "test-secret")
}

fn signed_in_stores() -> Stores {
    let stores = Stores::memory();
    stores
        .user_store
        .save(&Credentials::new("user@example.com", "user-1", TOKEN))
        .unwrap();
    stores
}

fn create_client(config: SimperiumConfig, stores: Stores) -> (Simperium, Connections) {
    let (accepted, receiver) = mpsc::unbounded_channel();
    let simperium =
        Simperium::with_providers(config, stores, Arc::new(NoAuth), Arc::new(TestServer { accepted })).unwrap();
    (simperium, Connections { accepted: receiver })
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

/// Splits `0:c:{...}` into the command name and body
fn channel_command(frame: &str) -> (&str, &str) {
    let message = frame.strip_prefix("0:").expect("frame for channel 0");
    message.split_once(':').unwrap_or((message, ""))
}

async fn expect_init(conn: &mut ServerConnection) -> Value {
    let frame = conn.recv().await;
    let (name, body) = channel_command(&frame);
    assert_eq!(name, "init");
    serde_json::from_str(body).unwrap()
}

async fn expect_change(conn: &mut ServerConnection) -> Value {
    let frame = conn.recv().await;
    let (name, body) = channel_command(&frame);
    assert_eq!(name, "c");
    serde_json::from_str(body).unwrap()
}

fn ack(session_id: &str, change: &Value, ev: u64, cv: &str) -> String {
    let ack = json!([{
        "clientid": session_id,
        "id": change["id"],
        "o": change["o"],
        "ev": ev,
        "cv": cv,
        "ccids": [change["ccid"]],
        "v": change["v"],
    }]);
    format!("0:c:{ack}")
}

#[derive(Default)]
struct NetworkChanges {
    index: AtomicUsize,
    modify: AtomicUsize,
    remove: AtomicUsize,
}

impl BucketListener for NetworkChanges {
    fn on_network_change(&self, _bucket: &Bucket, change_type: ChangeType, _key: Option<&str>) {
        let counter = match change_type {
            ChangeType::Index => &self.index,
            ChangeType::Modify | ChangeType::Insert => &self.modify,
            ChangeType::Remove => &self.remove,
            ChangeType::Reset => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

// ============== Index Tests ==============

#[tokio::test]
async fn test_index_download() {
    let (simperium, mut connections) = create_client(test_config(), signed_in_stores());
    let bucket = simperium.bucket("notes").unwrap();
    let listener = Arc::new(NetworkChanges::default());
    bucket.add_listener(listener.clone());

    let mut conn = connections.accept().await;
    bucket.start();

    let init = expect_init(&mut conn).await;
    assert_eq!(init["app_id"], json!("test-app"));
    assert_eq!(init["token"], json!(TOKEN));
    assert_eq!(init["name"], json!("notes"));
    assert_eq!(init["cmd"], json!("i::::50"));
    assert_eq!(init["clientid"], json!(simperium.session_id()));

    conn.send("0:auth:user@example.com");
    conn.send(r#"0:i:{"current":"cv-1","index":[{"id":"a","v":2},{"id":"b","v":1}],"mark":"page-2"}"#);
    assert_eq!(conn.recv().await, "0:e:a.2");
    conn.send("0:e:a.2\n{\"data\":{\"title\":\"First\"}}");
    assert_eq!(conn.recv().await, "0:e:b.1");
    conn.send("0:e:b.1\n{\"data\":{\"title\":\"Second\"}}");
    assert_eq!(conn.recv().await, "0:i::page-2::50");
    conn.send(r#"0:i:{"current":"cv-1","index":[{"id":"c","v":1}]}"#);
    assert_eq!(conn.recv().await, "0:e:c.1");
    conn.send("0:e:c.1\n{\"data\":{\"title\":\"Third\"}}");

    wait_for(|| bucket.get_change_version() == "cv-1").await;
    assert_eq!(bucket.all_objects().len(), 3);
    assert_eq!(bucket.get("a").unwrap().get("title"), Some(&json!("First")));
    assert_eq!(bucket.get_key_version("a").unwrap(), 2);
    assert!(listener.index.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_known_change_version_skips_index() {
    let stores = signed_in_stores();
    stores.ghost_store.set_change_version("notes", "cv-9").unwrap();
    let (simperium, mut connections) = create_client(test_config(), stores);
    let bucket = simperium.bucket("notes").unwrap();

    let mut conn = connections.accept().await;
    bucket.start();
    let init = expect_init(&mut conn).await;
    assert_eq!(init["cmd"], json!("cv:cv-9"));

    // the server no longer knows the version
    conn.send("0:cv:?");
    assert_eq!(conn.recv().await, "0:i::::50");
}

// ============== Change Tests ==============

#[tokio::test]
async fn test_local_change_round_trip() {
    let stores = signed_in_stores();
    stores.ghost_store.set_change_version("notes", "cv-1").unwrap();
    let (simperium, mut connections) = create_client(test_config(), stores);
    let bucket = simperium.bucket("notes").unwrap();

    let mut conn = connections.accept().await;
    bucket.start();
    expect_init(&mut conn).await;

    let mut note = bucket.new_object_with_key("note").unwrap();
    note.set("title", "Draft").unwrap();
    bucket.sync(&note).unwrap();

    let change = expect_change(&mut conn).await;
    assert_eq!(change["id"], json!("note"));
    assert_eq!(change["o"], json!("M"));
    assert_eq!(change["v"]["title"], json!({"o": "+", "v": "Draft"}));
    conn.send(&ack(simperium.session_id(), &change, 1, "cv-2"));
    wait_for(|| bucket.get_key_version("note").is_ok_and(|version| version == 1)).await;
    assert_eq!(bucket.get_change_version(), "cv-2");

    // a second edit diffs against the acknowledged ghost
    let mut note = bucket.get("note").unwrap();
    note.set("title", "Final").unwrap();
    bucket.sync(&note).unwrap();

    let change = expect_change(&mut conn).await;
    assert_eq!(change["sv"], json!(1));
    assert_eq!(change["v"]["title"]["o"], json!("d"));
    conn.send(&ack(simperium.session_id(), &change, 2, "cv-3"));
    wait_for(|| bucket.get_key_version("note").is_ok_and(|version| version == 2)).await;

    bucket.remove(&bucket.get("note").unwrap()).unwrap();
    let change = expect_change(&mut conn).await;
    assert_eq!(change["o"], json!("-"));
    assert_eq!(change["id"], json!("note"));
    assert!(change.get("v").is_none());
}

#[tokio::test]
async fn test_remote_changes_applied() {
    let stores = signed_in_stores();
    stores.ghost_store.set_change_version("notes", "cv-1").unwrap();
    let (simperium, mut connections) = create_client(test_config(), stores);
    let bucket = simperium.bucket("notes").unwrap();
    let listener = Arc::new(NetworkChanges::default());
    bucket.add_listener(listener.clone());

    let mut conn = connections.accept().await;
    bucket.start();
    expect_init(&mut conn).await;

    conn.send(
        r#"0:c:[{"clientid":"web-1","id":"shared","o":"M","ev":1,"cv":"cv-2","ccids":["x1"],"v":{"title":{"o":"+","v":"From web"}}}]"#,
    );
    wait_for(|| bucket.contains_key("shared")).await;
    assert_eq!(bucket.get("shared").unwrap().get("title"), Some(&json!("From web")));
    assert_eq!(bucket.get_change_version(), "cv-2");

    conn.send(r#"0:c:[{"clientid":"web-1","id":"shared","o":"-","ev":2,"cv":"cv-3","ccids":["x2"]}]"#);
    wait_for(|| !bucket.contains_key("shared")).await;
    assert_eq!(listener.modify.load(Ordering::SeqCst), 1);
    assert_eq!(listener.remove.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_source_version_requests_object() {
    let stores = signed_in_stores();
    stores.ghost_store.set_change_version("notes", "cv-1").unwrap();
    let (simperium, mut connections) = create_client(test_config(), stores);
    let bucket = simperium.bucket("notes").unwrap();

    let mut conn = connections.accept().await;
    bucket.start();
    expect_init(&mut conn).await;

    conn.send(
        r#"0:c:[{"clientid":"web-1","id":"missing","o":"M","sv":4,"ev":5,"cv":"cv-2","ccids":["x1"],"v":{"title":{"o":"+","v":"x"}}}]"#,
    );
    assert_eq!(conn.recv().await, "0:e:missing.5");
    conn.send("0:e:missing.5\n{\"data\":{\"title\":\"Recovered\"}}");
    wait_for(|| bucket.get_key_version("missing").is_ok_and(|version| version == 5)).await;
    assert_eq!(bucket.get("missing").unwrap().get("title"), Some(&json!("Recovered")));
}

// ============== Connection Tests ==============

#[tokio::test]
async fn test_heartbeat_and_remote_log_level() {
    let config = test_config().with_heartbeat_interval(100);
    let (simperium, mut connections) = create_client(config, signed_in_stores());
    let _bucket = simperium.bucket("notes").unwrap();

    let mut conn = connections.accept().await;
    assert_eq!(conn.recv_frame().await, "h:1");
    conn.send("h:5");
    assert_eq!(conn.recv_frame().await, "h:6");

    conn.send("log:2");
    wait_for(|| simperium.log_level() == 2).await;
}

#[tokio::test]
async fn test_reconnect_restarts_channel() {
    let stores = signed_in_stores();
    stores.ghost_store.set_change_version("notes", "cv-1").unwrap();
    let (simperium, mut connections) = create_client(test_config(), stores);
    let bucket = simperium.bucket("notes").unwrap();

    let mut conn = connections.accept().await;
    bucket.start();
    expect_init(&mut conn).await;
    assert!(simperium.is_connected());

    drop(conn);
    wait_for(|| !simperium.is_connected()).await;

    let mut conn = connections.accept().await;
    let init = expect_init(&mut conn).await;
    assert_eq!(init["cmd"], json!("cv:cv-1"));
    assert!(simperium.is_connected());
}

#[tokio::test]
async fn test_signed_out_client_does_not_connect() {
    let (simperium, mut connections) = create_client(test_config(), Stores::memory());
    let _bucket = simperium.bucket("notes").unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connections.accepted.try_recv().is_err());
    assert!(simperium.is_disconnected());
}

// ============== Persistence Tests ==============

#[tokio::test]
async fn test_pending_change_resent_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config().with_data_dir(dir.path()).with_retry_delay(200);

    let first_ccid = {
        let stores = Stores::from_config(&config).unwrap();
        stores
            .user_store
            .save(&Credentials::new("user@example.com", "user-1", TOKEN))
            .unwrap();
        stores.ghost_store.set_change_version("notes", "cv-1").unwrap();
        let (simperium, mut connections) = create_client(config.clone(), stores);
        let bucket = simperium.bucket("notes").unwrap();
        let mut conn = connections.accept().await;
        bucket.start();
        expect_init(&mut conn).await;

        let mut note = bucket.new_object_with_key("offline").unwrap();
        note.set("title", "Unsent").unwrap();
        bucket.sync(&note).unwrap();
        let change = expect_change(&mut conn).await;
        simperium.disconnect();
        change["ccid"].clone()
    };

    let (simperium, mut connections) = create_client(config.clone(), Stores::from_config(&config).unwrap());
    let bucket = simperium.bucket("notes").unwrap();
    assert_eq!(bucket.get("offline").unwrap().get("title"), Some(&json!("Unsent")));
    assert_eq!(bucket.get_change_version(), "cv-1");

    let mut conn = connections.accept().await;
    bucket.start();
    let init = expect_init(&mut conn).await;
    assert_eq!(init["cmd"], json!("cv:cv-1"));

    let change = expect_change(&mut conn).await;
    assert_eq!(change["ccid"], first_ccid);
    assert_eq!(change["id"], json!("offline"));
}
