// Integration tests for the chat relay

use chatrelay::chat::message::USERNAME_PROMPT;
use chatrelay::chat::*;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf, ReadHalf, WriteHalf,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of a session, speaking the line protocol
struct TestClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> TestClient<S> {
    async fn new(stream: S) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut prompt = vec![0u8; USERNAME_PROMPT.len()];
        tokio::time::timeout(RECV_TIMEOUT, reader.read_exact(&mut prompt))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prompt, USERNAME_PROMPT.as_bytes());

        Self { reader, writer }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next line, or `None` once the server closed the stream
    async fn try_recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn recv(&mut self) -> String {
        self.try_recv().await.expect("connection closed")
    }

    /// Skip lines until one contains `needle`
    async fn recv_until(&mut self, needle: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.contains(needle) {
                return line;
            }
        }
    }
}

/// Server end of a pipe whose writes can be made to fail
///
/// Raises `dropped` once the session has released every half of it.
struct ControlledStream {
    inner: DuplexStream,
    fail_writes: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl ControlledStream {
    fn new(inner: DuplexStream) -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
        let fail_writes = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let stream = Self {
            inner,
            fail_writes: fail_writes.clone(),
            dropped: dropped.clone(),
        };
        (stream, fail_writes, dropped)
    }
}

impl AsyncRead for ControlledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ControlledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer went away",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for ControlledStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

struct Relay {
    router: Arc<Router>,
    config: Arc<ServerConfig>,
}

impl Relay {
    fn new(dir: &Path) -> Self {
        Self::with_config(ServerConfig::in_dir(dir))
    }

    fn with_config(config: ServerConfig) -> Self {
        let history =
            Arc::new(HistoryLog::open(&config.history_path, config.history_policy).unwrap());
        let store = Arc::new(StatusStore::new(&config.status_path));
        let registry = Arc::new(Registry::with_store(
            store,
            config.outbound_capacity,
            config.typing_window,
        ));
        let router = Arc::new(Router::new(registry, Some(history), config.replay_limit));

        Self {
            router,
            config: Arc::new(config),
        }
    }

    fn spawn_session<S>(&self, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tokio::spawn(serve_connection(
            stream,
            "in-memory".to_string(),
            self.router.clone(),
            self.config.clone(),
        ))
    }

    async fn connect(&self) -> TestClient<DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.spawn_session(server);
        TestClient::new(client).await
    }

    /// Connect, pick a username and wait for the own join announcement
    async fn login(&self, username: &str) -> TestClient<DuplexStream> {
        let mut client = self.connect().await;
        client.send(username).await;
        client
            .recv_until(&format!("{} has joined", username))
            .await;
        client
    }
}

#[tokio::test]
async fn test_join_and_public_broadcast() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let mut alice = relay.connect().await;
    alice.send("alice").await;
    let joined = alice.recv().await;
    assert!(joined.ends_with("[Server] #1: alice has joined (available)."));

    let mut bob = relay.connect().await;
    bob.send("bob").await;
    let replayed = bob.recv().await;
    assert!(replayed.starts_with("[History] ["));
    assert!(replayed.ends_with("#1: alice has joined (available)."));
    assert!(bob.recv().await.ends_with("#2: bob has joined (available)."));
    assert!(alice.recv().await.ends_with("#2: bob has joined (available)."));

    alice.send("hello everyone").await;
    assert!(alice.recv().await.ends_with("[alice] #3: hello everyone"));
    assert!(bob.recv().await.ends_with("[alice] #3: hello everyone"));

    let logged = std::fs::read_to_string(dir.path().join("history.log")).unwrap();
    assert_eq!(logged.lines().count(), 3);
}

#[tokio::test]
async fn test_duplicate_username_rejected() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let _alice = relay.login("alice").await;
    let before = relay.router.registry().lookup("alice").await.unwrap();

    let mut impostor = relay.connect().await;
    impostor.send("alice").await;
    assert_eq!(impostor.recv().await, "[x] User already online");
    assert_eq!(impostor.try_recv().await, None);

    let after = relay.router.registry().lookup("alice").await.unwrap();
    assert_eq!(after.connection_id, before.connection_id);
    assert!(after.connected);
    assert_eq!(relay.router.next_sequence_id().await, 2);
}

#[tokio::test]
async fn test_invalid_usernames_rejected() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    for (name, reason) in [
        ("", "[x] Username must not be empty"),
        ("two words", "[x] Username must not contain spaces"),
        ("Server", "[x] Username Server is reserved"),
    ] {
        let mut client = relay.connect().await;
        client.send(name).await;
        assert_eq!(client.recv().await, reason);
        assert_eq!(client.try_recv().await, None);
    }

    assert!(relay.router.registry().is_empty().await);
}

#[tokio::test]
async fn test_private_messages() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    let mut carol = relay.login("carol").await;
    alice.recv_until("carol has joined").await;
    bob.recv_until("carol has joined").await;

    let next_id = relay.router.next_sequence_id().await;

    alice.send("/msg bob hello").await;
    let to_bob = bob.recv().await;
    assert!(to_bob.starts_with("[PM] ["));
    assert!(to_bob.ends_with(&format!("[alice] #{}: hello", next_id)));
    let echo = alice.recv().await;
    assert!(echo.starts_with("[PM to bob] ["));
    assert!(echo.ends_with(&format!("#{}: hello", next_id)));

    alice.send("/msg ghost are you there").await;
    assert_eq!(alice.recv().await, "[x] User not found or offline");

    alice.send("/msg bob").await;
    assert_eq!(alice.recv().await, "[x] Usage: /msg username message");

    assert_eq!(relay.router.next_sequence_id().await, next_id);

    // carol saw none of it; her next line is the next public message
    carol.send("public again").await;
    let line = carol.recv().await;
    assert!(line.ends_with(&format!("[carol] #{}: public again", next_id)));
}

#[tokio::test]
async fn test_disconnect_and_reattach() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    alice.send("/status away").await;
    alice.send("/who").await;
    assert_eq!(alice.recv().await, "Online: bob (available), alice (away)");

    let next_id = relay.router.next_sequence_id().await;
    drop(alice);

    let left = bob.recv_until("has disconnected").await;
    assert!(left.ends_with(&format!("[Server] #{}: alice has disconnected.", next_id)));

    let info = relay.router.registry().lookup("alice").await.unwrap();
    assert!(!info.connected);
    assert_eq!(info.effective_status, Status::Disconnected);

    bob.send("/users").await;
    assert_eq!(
        bob.recv().await,
        "All users: bob [available], alice [disconnected]"
    );

    let mut alice = relay.connect().await;
    alice.send("alice").await;
    alice.recv_until("alice has joined (away).").await;
    bob.recv_until("alice has joined (away).").await;

    bob.send("/users").await;
    assert_eq!(bob.recv().await, "All users: bob [available], alice [away]");
}

#[tokio::test]
async fn test_stale_typing_scenario() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    alice.send("/status typing").await;
    alice.send("/help").await;
    assert_eq!(
        alice.recv().await,
        "/msg <user> <msg>, /who, /users, /status <status>, /help"
    );

    bob.send("/users").await;
    assert_eq!(bob.recv().await, "All users: bob [available], alice [typing]");

    tokio::time::sleep(Duration::from_secs(3)).await;

    bob.send("/users").await;
    assert_eq!(bob.recv().await, "All users: bob [available], alice [available]");
    bob.send("/who").await;
    assert_eq!(bob.recv().await, "Online: alice (available), bob (available)");
}

#[tokio::test]
async fn test_synthetic_typing_after_send() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::in_dir(dir.path());
    config.typing_delay = Duration::from_millis(100);
    let relay = Relay::with_config(config);

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    alice.send("hi bob").await;
    bob.recv_until("[alice]").await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    bob.send("/users").await;
    assert_eq!(bob.recv().await, "All users: bob [available], alice [typing]");
}

#[tokio::test]
async fn test_status_restored_after_restart() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("status.json"), r#"{ "alice": "away" }"#).unwrap();

    let relay = Relay::new(dir.path());

    let mut bob = relay.login("bob").await;
    let _alice = relay.login("alice").await;

    let joined = bob.recv_until("alice has joined").await;
    assert!(joined.ends_with("alice has joined (away)."));

    bob.send("/who").await;
    assert_eq!(bob.recv().await, "Online: bob (available), alice (away)");

    let saved = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved["alice"], "away");
    assert_eq!(saved["bob"], "available");
}

#[tokio::test]
async fn test_idle_timeout_disconnects() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::in_dir(dir.path());
    config.idle_timeout = Some(Duration::from_millis(200));
    let relay = Relay::with_config(config);

    let mut alice = relay.login("alice").await;
    assert_eq!(alice.try_recv().await, None);

    let info = relay.router.registry().lookup("alice").await.unwrap();
    assert!(!info.connected);
}

#[tokio::test]
async fn test_blank_line_is_published() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    alice.send("").await;
    assert!(bob.recv().await.ends_with("[alice] #3: "));
    assert!(alice.recv().await.ends_with("[alice] #3: "));
}

#[tokio::test]
async fn test_over_long_line_closes_session() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::in_dir(dir.path());
    config.max_line_length = 32;
    let relay = Relay::with_config(config);

    let mut alice = relay.login("alice").await;
    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    alice.send(&"x".repeat(100)).await;
    assert_eq!(alice.recv().await, "[x] Line too long");
    assert_eq!(alice.try_recv().await, None);

    bob.recv_until("alice has disconnected.").await;
    assert!(!relay.router.registry().lookup("alice").await.unwrap().connected);
    assert_eq!(relay.router.next_sequence_id().await, 4);
}

#[tokio::test]
async fn test_over_long_username_rejected() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::in_dir(dir.path());
    config.max_line_length = 32;
    let relay = Relay::with_config(config);

    let mut client = relay.connect().await;
    client.send(&"a".repeat(100)).await;
    assert_eq!(client.recv().await, "[x] Line too long");
    assert_eq!(client.try_recv().await, None);

    assert!(relay.router.registry().is_empty().await);
}

#[tokio::test]
async fn test_write_error_disconnects_session() {
    let dir = tempdir().unwrap();
    let relay = Relay::new(dir.path());

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (stream, fail_writes, dropped) = ControlledStream::new(server);
    relay.spawn_session(stream);
    let mut alice = TestClient::new(client).await;
    alice.send("alice").await;
    alice.recv_until("alice has joined").await;

    let mut bob = relay.login("bob").await;
    alice.recv_until("bob has joined").await;

    fail_writes.store(true, Ordering::SeqCst);
    bob.send("are you still there").await;

    let left = bob.recv_until("has disconnected").await;
    assert!(left.ends_with("[Server] #4: alice has disconnected."));

    let info = relay.router.registry().lookup("alice").await.unwrap();
    assert!(!info.connected);
    assert_eq!(info.effective_status, Status::Disconnected);

    tokio::time::timeout(RECV_TIMEOUT, async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session kept the failed stream open");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_writer_aborted_after_drain_timeout() {
    let dir = tempdir().unwrap();
    let history: String = (1..=100)
        .map(|i| format!("[12:00:00] [bob] #{}: earlier chatter\n", i))
        .collect();
    std::fs::write(dir.path().join("history.log"), history).unwrap();

    let mut config = ServerConfig::in_dir(dir.path());
    config.history_policy = HistoryPolicy::Preserve;
    let relay = Relay::with_config(config);

    // A tiny pipe the client never reads from, so the writer blocks
    let (mut client, server) = tokio::io::duplex(64);
    let (stream, _fail_writes, dropped) = ControlledStream::new(server);
    let session = relay.spawn_session(stream);

    client.write_all(b"alice\n").await.unwrap();
    client.shutdown().await.unwrap();

    session.await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(dropped.load(Ordering::SeqCst));
    assert!(!relay.router.registry().lookup("alice").await.unwrap().connected);
}

#[tokio::test]
async fn test_tls_end_to_end() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::in_dir(dir.path());
    config.bind_addr = "127.0.0.1:0".parse().unwrap();

    let server = ChatServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let connector = chatrelay::chat::tls::connector(&dir.path().join("tls/cert.pem")).unwrap();
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let stream = connector
        .connect(chatrelay::chat::tls::server_name("localhost").unwrap(), tcp)
        .await
        .unwrap();

    let mut alice = TestClient::new(stream).await;
    alice.send("alice").await;
    assert!(alice.recv().await.ends_with("[Server] #1: alice has joined (available)."));

    alice.send("over tls").await;
    assert!(alice.recv().await.ends_with("[alice] #2: over tls"));

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}
