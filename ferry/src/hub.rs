//! Rendezvous hub pairing spawned processes with their parent-side contexts.
//!
//! The hub listens on one local endpoint. Before a spawn, the parent registers a
//! fresh random key; the child connects and writes the raw key bytes as the first
//! thing on the connection. A connection presenting a registered key within the
//! receive timeout is handed to the waiting registration; anything else is closed.
//!
//! Platform-specific endpoints:
//! - **Abstract** (Linux): abstract socket namespace, no filesystem entry
//! - **Named** (macOS, BSD, Linux fallback): `{temp_dir}/ferry-{pid}-{id}/hub.sock`

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::env_duration_ms;

pub const KEY_LENGTH: usize = 32;

const NAMED_SCHEME: &str = "unix:";
#[cfg(target_os = "linux")]
const ABSTRACT_SCHEME: &str = "unix-abstract:";

/// One-time key identifying a pending spawn.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HubKey([u8; KEY_LENGTH]);

impl HubKey {
    /// Fresh key from the OS CSPRNG (two v4 UUIDs' worth of random bytes).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for HubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines, not enough to replay.
        write!(f, "HubKey({:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2])
    }
}

/// Hub endpoint address, passed to children as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubUri {
    Named(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl fmt::Display for HubUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(path) => write!(f, "{NAMED_SCHEME}{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => write!(f, "{ABSTRACT_SCHEME}{name}"),
        }
    }
}

impl FromStr for HubUri {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        #[cfg(target_os = "linux")]
        if let Some(name) = s.strip_prefix(ABSTRACT_SCHEME) {
            return Ok(Self::Abstract(name.to_string()));
        }
        if let Some(path) = s.strip_prefix(NAMED_SCHEME) {
            return Ok(Self::Named(PathBuf::from(path)));
        }
        Err(HubError::InvalidUri(s.to_string()))
    }
}

impl HubUri {
    async fn connect_stream(&self) -> io::Result<UnixStream> {
        match self {
            Self::Named(path) => UnixStream::connect(path).await,
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                // tokio doesn't support abstract sockets directly, and the std
                // connect blocks while the listener's backlog is full.
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                let std_stream = tokio::task::spawn_blocking(move || {
                    std::os::unix::net::UnixStream::connect_addr(&addr)
                })
                .await
                .map_err(io::Error::other)??;
                std_stream.set_nonblocking(true)?;
                UnixStream::from_std(std_stream)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid hub uri: {0}")]
    InvalidUri(String),
    #[error("key is already registered")]
    KeyInUse,
    #[error("accept cancelled")]
    Cancelled,
    #[error("hub closed")]
    Closed,
    #[error("timed out connecting to hub")]
    ConnectTimeout,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long an inbound connection has to present its key.
    pub key_receive_timeout: Duration,
    /// Force a filesystem socket even where abstract sockets exist.
    pub named_socket: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            key_receive_timeout: Duration::from_secs(5),
            named_socket: false,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_duration_ms("FERRY_KEY_TIMEOUT_MS") {
            config.key_receive_timeout = timeout;
        }
        config
    }

    pub fn with_key_receive_timeout(mut self, timeout: Duration) -> Self {
        self.key_receive_timeout = timeout;
        self
    }

    pub fn with_named_socket(mut self, named: bool) -> Self {
        self.named_socket = named;
        self
    }
}

type Pending = Arc<DashMap<HubKey, oneshot::Sender<UnixStream>>>;

/// Listening rendezvous endpoint. Dropping it stops accepting and removes any
/// socket file it created.
pub struct Hub {
    uri: HubUri,
    pending: Pending,
    accept_loop: JoinHandle<()>,
    dir: Option<PathBuf>,
}

impl Hub {
    /// Bind a new hub and start its accept loop. Must be called inside a runtime.
    pub async fn bind(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let (listener, uri, dir) = Self::listen(config.named_socket)?;
        let pending: Pending = Arc::new(DashMap::new());

        tracing::debug!(%uri, "Hub listening");

        let accept_loop = tokio::spawn(run_accept_loop(
            listener,
            Arc::clone(&pending),
            config.key_receive_timeout,
        ));

        Ok(Arc::new(Self {
            uri,
            pending,
            accept_loop,
            dir,
        }))
    }

    #[cfg(target_os = "linux")]
    fn listen(named: bool) -> io::Result<(UnixListener, HubUri, Option<PathBuf>)> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        if named {
            return Self::listen_named();
        }

        let name = format!("ferry-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        Ok((listener, HubUri::Abstract(name), None))
    }

    #[cfg(not(target_os = "linux"))]
    fn listen(_named: bool) -> io::Result<(UnixListener, HubUri, Option<PathBuf>)> {
        Self::listen_named()
    }

    fn listen_named() -> io::Result<(UnixListener, HubUri, Option<PathBuf>)> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = std::env::temp_dir().join(format!("ferry-{}-{}", std::process::id(), &id[..8]));
        std::fs::create_dir_all(&dir)?;

        let path = dir.join("hub.sock");
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;

        Ok((listener, HubUri::Named(path), Some(dir)))
    }

    pub fn uri(&self) -> &HubUri {
        &self.uri
    }

    pub fn generate_key(&self) -> HubKey {
        HubKey::generate()
    }

    /// Register intent to accept the connection presenting `key`.
    ///
    /// Registration happens immediately, so the child may be spawned right after
    /// this returns without racing the hub.
    pub fn expect(&self, key: HubKey) -> Result<PendingConnection, HubError> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key) {
            Entry::Occupied(_) => return Err(HubError::KeyInUse),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        tracing::trace!(?key, "Registered pending accept");

        Ok(PendingConnection {
            key,
            rx: Some(rx),
            pending: Arc::clone(&self.pending),
        })
    }

    /// Wait for the connection presenting `key`.
    pub async fn accept(
        &self,
        key: HubKey,
        cancel: &CancellationToken,
    ) -> Result<UnixStream, HubError> {
        self.expect(key)?.wait(cancel).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.accept_loop.abort();
        if let Some(dir) = self.dir.take()
            && dir.exists()
        {
            tracing::debug!(dir = %dir.display(), "Cleaning up hub socket directory");
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(error = %e, "Failed to cleanup hub socket directory");
            }
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("uri", &self.uri)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A registered key awaiting its connection. Dropping it unregisters the key.
pub struct PendingConnection {
    key: HubKey,
    rx: Option<oneshot::Receiver<UnixStream>>,
    pending: Pending,
}

impl PendingConnection {
    pub fn key(&self) -> HubKey {
        self.key
    }

    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<UnixStream, HubError> {
        let Some(rx) = self.rx.take() else {
            return Err(HubError::Closed);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            stream = rx => stream.map_err(|_| HubError::Closed),
        }
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if self.pending.remove(&self.key).is_some() {
            tracing::trace!(key = ?self.key, "Pending accept withdrawn");
        }
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

async fn run_accept_loop(listener: UnixListener, pending: Pending, key_timeout: Duration) {
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) if accept_error_is_fatal(&e) => {
                tracing::error!(error = %e, "Hub accept failed permanently, no longer accepting");
                // Waiters see `Closed` instead of hanging until their deadline.
                pending.clear();
                return;
            }
            Err(e) => {
                // EMFILE and friends persist until something else lets go.
                tracing::warn!(error = %e, ?backoff, "Hub accept failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = ACCEPT_BACKOFF_MIN;
        tokio::spawn(pair_connection(stream, Arc::clone(&pending), key_timeout));
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_MAX)
}

/// Errors that mean the listening socket itself is unusable.
fn accept_error_is_fatal(e: &io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EBADF | Errno::EINVAL | Errno::ENOTSOCK | Errno::EOPNOTSUPP)
    )
}

async fn pair_connection(mut stream: UnixStream, pending: Pending, key_timeout: Duration) {
    let mut bytes = [0u8; KEY_LENGTH];
    match tokio::time::timeout(key_timeout, stream.read_exact(&mut bytes)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Dropping hub connection: key read failed");
            return;
        }
        Err(_) => {
            tracing::warn!(
                timeout = ?key_timeout,
                "Dropping hub connection: key not received in time"
            );
            return;
        }
    }

    let key = HubKey::from_bytes(bytes);
    match pending.remove(&key) {
        Some((_, tx)) => {
            tracing::trace!(?key, "Hub connection paired");
            if tx.send(stream).is_err() {
                tracing::debug!(?key, "Accept abandoned before pairing completed");
            }
        }
        None => {
            tracing::warn!("Dropping hub connection: unknown key");
        }
    }
}

/// Child side: connect to the hub and present `key`.
pub async fn connect(
    uri: &HubUri,
    key: &HubKey,
    timeout: Duration,
) -> Result<UnixStream, HubError> {
    let connect = async {
        let mut stream = uri.connect_stream().await?;
        stream.write_all(key.as_bytes()).await?;
        stream.flush().await?;
        Ok::<_, io::Error>(stream)
    };
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HubError::ConnectTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT: Duration = Duration::from_secs(2);

    #[test]
    fn keys_are_distinct() {
        assert_ne!(HubKey::generate(), HubKey::generate());
    }

    #[test]
    fn accept_backoff_doubles_up_to_a_cap() {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        let mut steps = vec![backoff];
        while backoff < ACCEPT_BACKOFF_MAX {
            backoff = next_backoff(backoff);
            steps.push(backoff);
        }
        assert_eq!(steps[1], Duration::from_millis(20));
        assert_eq!(next_backoff(ACCEPT_BACKOFF_MAX), ACCEPT_BACKOFF_MAX);
        assert!(steps.len() < 10, "{steps:?}");
    }

    #[test]
    fn descriptor_exhaustion_is_retried_bad_socket_is_not() {
        use nix::errno::Errno;

        for retried in [Errno::EMFILE, Errno::ENFILE, Errno::ENOBUFS, Errno::ECONNABORTED] {
            let err = io::Error::from_raw_os_error(retried as i32);
            assert!(!accept_error_is_fatal(&err), "{retried}");
        }
        for fatal in [Errno::EBADF, Errno::EINVAL, Errno::ENOTSOCK] {
            let err = io::Error::from_raw_os_error(fatal as i32);
            assert!(accept_error_is_fatal(&err), "{fatal}");
        }
        assert!(!accept_error_is_fatal(&io::Error::other("no errno")));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn connect_to_missing_abstract_endpoint_fails_fast() {
        let uri = HubUri::Abstract(format!("ferry-missing-{}", uuid::Uuid::new_v4()));
        let err = connect(&uri, &HubKey::generate(), CONNECT)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Io(_)), "{err}");
    }

    #[test]
    fn named_uri_roundtrips() {
        let uri = HubUri::Named(PathBuf::from("/tmp/ferry-1/hub.sock"));
        let parsed: HubUri = uri.to_string().parse().unwrap();
        assert_eq!(parsed, uri);
        assert!("tcp://127.0.0.1:1".parse::<HubUri>().is_err());
    }

    #[tokio::test]
    async fn pairs_connection_by_key() {
        let hub = Hub::bind(HubConfig::default()).await.unwrap();
        let key = hub.generate_key();
        let pending = hub.expect(key).unwrap();

        let uri = hub.uri().clone();
        let client = tokio::spawn(async move {
            let mut stream = connect(&uri, &key, CONNECT).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream
        });

        let mut accepted = pending.wait(&CancellationToken::new()).await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(hub.pending_count(), 0);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_accepts_are_demultiplexed() {
        let hub = Hub::bind(HubConfig::default()).await.unwrap();
        let k1 = hub.generate_key();
        let k2 = hub.generate_key();
        let p1 = hub.expect(k1).unwrap();
        let p2 = hub.expect(k2).unwrap();

        let uri = hub.uri().clone();
        // Connect in reverse order.
        let mut c2 = connect(&uri, &k2, CONNECT).await.unwrap();
        let mut c1 = connect(&uri, &k1, CONNECT).await.unwrap();
        c1.write_all(&[1]).await.unwrap();
        c2.write_all(&[2]).await.unwrap();

        let never = CancellationToken::new();
        let mut s1 = p1.wait(&never).await.unwrap();
        let mut s2 = p2.wait(&never).await.unwrap();
        assert_eq!(s1.read_u8().await.unwrap(), 1);
        assert_eq!(s2.read_u8().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_key_is_dropped() {
        let hub = Hub::bind(HubConfig::default()).await.unwrap();
        let registered = hub.expect(hub.generate_key()).unwrap();

        let mut stranger = connect(hub.uri(), &HubKey::generate(), CONNECT)
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let n = stranger.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "hub should close connections with unknown keys");
        assert_eq!(hub.pending_count(), 1);
        drop(registered);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let config = HubConfig::default().with_key_receive_timeout(Duration::from_millis(50));
        let hub = Hub::bind(config).await.unwrap();

        let mut silent = hub.uri().connect_stream().await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), silent.read(&mut buf))
            .await
            .expect("hub should hang up")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancelled_accept_unregisters_only_itself() {
        let hub = Hub::bind(HubConfig::default()).await.unwrap();
        let keep = hub.expect(hub.generate_key()).unwrap();
        let key = hub.generate_key();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = hub.accept(key, &cancel).await.unwrap_err();
        assert!(matches!(err, HubError::Cancelled));
        assert_eq!(hub.pending_count(), 1);
        drop(keep);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let hub = Hub::bind(HubConfig::default()).await.unwrap();
        let key = hub.generate_key();
        let _first = hub.expect(key).unwrap();
        assert!(matches!(hub.expect(key), Err(HubError::KeyInUse)));
    }

    #[tokio::test]
    async fn named_socket_is_cleaned_up() {
        let hub = Hub::bind(HubConfig::default().with_named_socket(true))
            .await
            .unwrap();
        let HubUri::Named(path) = hub.uri().clone() else {
            panic!("expected a named socket");
        };
        assert!(path.exists());
        drop(hub);
        assert!(!path.exists());
    }
}
