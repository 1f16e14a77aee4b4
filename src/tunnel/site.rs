//! Remote site (§4.6): one instance per connected edge cluster. Owns the
//! SSH connection handle, tracks liveness from heartbeats, and opens
//! channels on demand for access-point RPC and target dials.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::config;
use crate::error::TunnelError;
use crate::ssh::{CHANNEL_TYPE_ACCESS_POINT, CHANNEL_TYPE_TRANSPORT};
use crate::tunnel::stream::ChannelStream;

/// What `Site` needs from an agent's live connection: close it, and open
/// server→agent channels on it. A trait rather than a bare
/// `russh::server::Handle` so registry/site tests can exercise
/// `upsert`/`reinitialize` against a fake without a real SSH session;
/// `russh::server::Handle` has no public test constructor.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn disconnect(&self, reason: &str);
    async fn open_forwarded_tcpip(
        &self,
        address: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError>;
}

#[async_trait]
impl ConnectionHandle for Handle {
    async fn disconnect(&self, reason: &str) {
        let _ = Handle::disconnect(
            self,
            russh::Disconnect::ByApplication,
            reason.to_string(),
            "en".to_string(),
        )
        .await;
    }

    async fn open_forwarded_tcpip(
        &self,
        address: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        Handle::channel_open_forwarded_tcpip(self, address, port, originator_address, originator_port)
            .await
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))
    }
}

/// Origin reported on outbound channel opens; it is never inspected by
/// agents, only required by the wire format.
const ORIGINATOR_ADDR: &str = "127.0.0.1";
const ORIGINATOR_PORT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    Online,
    Offline,
}

/// What `upsert`/`reinitialize` are given: the authenticated domain name
/// and the live connection handle to reach that agent.
pub struct SiteConnection {
    pub domain_name: String,
    pub handle: Arc<dyn ConnectionHandle>,
    pub peer_addr: SocketAddr,
}

struct ActiveConnection {
    handle: Arc<dyn ConnectionHandle>,
    peer_addr: SocketAddr,
}

pub struct Site {
    pub domain_name: String,
    connection: Mutex<Option<ActiveConnection>>,
    last_heartbeat: AtomicI64,
    heartbeat_active: AtomicBool,
    /// Bumped on every `reinitialize`, so a heartbeat worker from a
    /// superseded connection can tell, when it finally unwinds, that it no
    /// longer owns the slot it once claimed and must not clear a newer
    /// connection's claim out from under it.
    heartbeat_epoch: AtomicU64,
}

impl Site {
    pub fn new(conn: SiteConnection) -> Self {
        Self {
            domain_name: conn.domain_name,
            connection: Mutex::new(Some(ActiveConnection {
                handle: conn.handle,
                peer_addr: conn.peer_addr,
            })),
            last_heartbeat: AtomicI64::new(unix_now()),
            heartbeat_active: AtomicBool::new(false),
            heartbeat_epoch: AtomicU64::new(0),
        }
    }

    /// A connection-less site for registry/resolver unit tests, where
    /// what matters is `domain_name` and registration order, not a live
    /// SSH handle.
    #[cfg(test)]
    pub(crate) fn new_detached(domain_name: &str) -> Self {
        Self {
            domain_name: domain_name.to_string(),
            connection: Mutex::new(None),
            last_heartbeat: AtomicI64::new(unix_now()),
            heartbeat_active: AtomicBool::new(false),
            heartbeat_epoch: AtomicU64::new(0),
        }
    }

    /// Online iff the last heartbeat was within 2x the heartbeat period.
    pub fn get_status(&self) -> SiteStatus {
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        let threshold = 2 * config::get().heartbeat_period.as_secs() as i64;
        Self::status_from(last, threshold, unix_now())
    }

    /// Pure boundary check behind `get_status`, factored out so the exact
    /// online/offline edge at `threshold_secs` is testable without a
    /// live `config::init()` call.
    fn status_from(last_heartbeat: i64, threshold_secs: i64, now: i64) -> SiteStatus {
        if now - last_heartbeat <= threshold_secs {
            SiteStatus::Online
        } else {
            SiteStatus::Offline
        }
    }

    pub fn last_heartbeat_unix(&self) -> i64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    fn touch_heartbeat(&self) {
        self.last_heartbeat.store(unix_now(), Ordering::Relaxed);
    }

    /// Enforces "at most one active heartbeat channel per connection"
    /// (spec.md §9 open question). Callers must check this before
    /// accepting the channel that will be handed to `handle_heartbeat`, and
    /// must hand the returned epoch back to it.
    pub fn try_claim_heartbeat_slot(&self) -> Option<u64> {
        self.heartbeat_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.heartbeat_epoch.load(Ordering::Acquire))
    }

    /// Consumes every request arriving on `channel`, refreshing liveness
    /// on each one, until the channel is closed by the peer. `epoch` is the
    /// value `try_claim_heartbeat_slot` returned when this worker claimed
    /// the slot; the slot is only released if a `reinitialize` hasn't
    /// since reclaimed it for a newer connection.
    pub async fn handle_heartbeat(&self, mut channel: Channel<Msg>, epoch: u64) {
        self.touch_heartbeat();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { .. }) | Some(ChannelMsg::ExtendedData { .. }) => {
                    self.touch_heartbeat();
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }
        if self.heartbeat_epoch.load(Ordering::Acquire) == epoch {
            self.heartbeat_active.store(false, Ordering::Release);
        }
        info!("site '{}' heartbeat channel closed", self.domain_name);
    }

    /// Opens a server→agent channel. `russh::server::Handle` only exposes
    /// the standard SSH forwarded-tcpip opener, with no generic
    /// "open a channel of this arbitrary type" call, so every
    /// server-initiated channel rides on `channel_open_forwarded_tcpip`,
    /// and `kind` (one of `ssh::CHANNEL_TYPE_ACCESS_POINT`/
    /// `CHANNEL_TYPE_TRANSPORT`) is carried only in the log line, not on
    /// the wire. For `transport`, `address`/`port` are the real dial
    /// target: the open's own accept/reject *is* the dial's boolean
    /// reply, so no separate channel request follows it. See DESIGN.md.
    async fn open_forwarded(
        &self,
        kind: &'static str,
        address: &str,
        port: u32,
        originator_addr: &str,
        originator_port: u32,
    ) -> Result<ChannelStream, TunnelError> {
        let guard = self.connection.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| TunnelError::ConnectionFailed(self.domain_name.clone()))?;

        debug!(
            "site '{}': opening a {} channel ({}:{})",
            self.domain_name, kind, address, port
        );
        let channel = conn
            .handle
            .open_forwarded_tcpip(address, port, originator_addr, originator_port)
            .await?;

        Ok(ChannelStream::new(channel, local_addr(), conn.peer_addr))
    }

    /// Opens an access-point channel: a byte stream the caller speaks
    /// HTTP over to reach the edge's control API.
    pub async fn open_access_point(&self) -> Result<ChannelStream, TunnelError> {
        self.open_forwarded(
            CHANNEL_TYPE_ACCESS_POINT,
            CHANNEL_TYPE_ACCESS_POINT,
            0,
            ORIGINATOR_ADDR,
            ORIGINATOR_PORT,
        )
        .await
    }

    /// Dials `host:port` inside the edge, gated by the edge's published
    /// inventory (§4.6 "Known-target gate"). `connect_to_server` bypasses
    /// this gate; it is meant for trusted SSH-over-SSH use, not
    /// general proxying.
    pub async fn dial(&self, target: &str) -> Result<ChannelStream, TunnelError> {
        let (host, port) = split_host_port(target)?;

        if !self.is_known_target(&host, port).await {
            return Err(TunnelError::TargetUnknown(target.to_string()));
        }

        self.open_forwarded(CHANNEL_TYPE_TRANSPORT, &host, port as u32, ORIGINATOR_ADDR, ORIGINATOR_PORT)
            .await
            .map_err(|_| TunnelError::TargetUnavailable(target.to_string()))
    }

    /// Dial without the known-target gate, for layering an SSH client
    /// handshake over the resulting stream (§4.6 `connectToServer`).
    pub async fn dial_unchecked(&self, target: &str) -> Result<ChannelStream, TunnelError> {
        let (host, port) = split_host_port(target)?;
        self.open_forwarded(CHANNEL_TYPE_TRANSPORT, &host, port as u32, ORIGINATOR_ADDR, ORIGINATOR_PORT)
            .await
    }

    /// `connectToServer(targetAddr, user, authMethods)`: dial, then layer
    /// an SSH client handshake over the resulting stream. Used when the
    /// tunnel server itself needs to act as an SSH client against a
    /// server inside the edge (e.g. §4.6's in-edge server access).
    pub async fn connect_to_server(
        &self,
        target: &str,
        user: &str,
        key: std::sync::Arc<russh_keys::PrivateKey>,
    ) -> Result<russh::client::Handle<InternalClient>, TunnelError> {
        let stream = self.dial_unchecked(target).await?;
        let config = std::sync::Arc::new(russh::client::Config::default());

        let mut handle = russh::client::connect_stream(config, stream, InternalClient)
            .await
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;

        let key_with_hash = russh_keys::PrivateKeyWithHashAlg::new(key, None);
        let ok = handle
            .authenticate_publickey(user, key_with_hash)
            .await
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
        if !ok.success() {
            return Err(TunnelError::AuthRejected(format!(
                "in-edge server {} refused {}",
                target, user
            )));
        }

        Ok(handle)
    }

    /// Queries the edge's access-point for its published server
    /// inventory and checks whether `host:port` is listed. A lookup
    /// failure is logged and treated as "not known" rather than fatal.
    async fn is_known_target(&self, host: &str, port: u16) -> bool {
        match self.fetch_known_targets().await {
            Ok(targets) => targets.iter().any(|(h, p)| h == host && *p == port),
            Err(e) => {
                warn!(
                    "site '{}': inventory lookup failed, treating {}:{} as unknown: {}",
                    self.domain_name, host, port, e
                );
                false
            }
        }
    }

    /// Minimal HTTP/1.0 request over a fresh access-point channel,
    /// mirroring the raw request/response framing the tunnel server's
    /// own HTTP proxy path already uses for channel-backed traffic.
    async fn fetch_known_targets(&self) -> Result<Vec<(String, u16)>, TunnelError> {
        let mut stream = self.open_access_point().await?;
        let request = b"GET /inventory HTTP/1.0\r\nHost: access-point\r\n\r\n";
        stream
            .write_all(request)
            .await
            .map_err(|e| TunnelError::BackendError(e.to_string()))?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| TunnelError::BackendError(e.to_string()))?;

        parse_inventory_body(&response)
    }

    /// Administratively disconnects this site's live connection, if any.
    /// The site entry itself is untouched; it stays in the registry and
    /// reports `Offline` once the heartbeat goes quiet (§3).
    pub async fn disconnect(&self, reason: &str) {
        let guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            conn.handle.disconnect(reason).await;
        }
    }

    /// Replaces this site's connection: closes the old one (spawned so
    /// the registry's write lock is never held across the close I/O),
    /// stores the new one, and frees the heartbeat slot so the superseding
    /// connection can open its own heartbeat channel (spec.md §8 scenario
    /// 2: the old connection's heartbeat worker may still be unwinding,
    /// but it no longer owns this site's one heartbeat slot).
    pub async fn reinitialize(&self, conn: SiteConnection) {
        let mut guard = self.connection.lock().await;
        if let Some(old) = guard.take() {
            tokio::spawn(async move {
                old.handle
                    .disconnect("replaced by a new connection for this domain")
                    .await;
            });
        }
        *guard = Some(ActiveConnection {
            handle: conn.handle,
            peer_addr: conn.peer_addr,
        });
        drop(guard);
        self.heartbeat_epoch.fetch_add(1, Ordering::AcqRel);
        self.heartbeat_active.store(false, Ordering::Release);
        self.touch_heartbeat();
    }
}

/// Client-side handler for `connect_to_server`'s SSH-over-SSH handshake.
/// The peer is reached only through an already-trusted tunnel connection
/// (the edge dialed us, and the dial target was gated by the known-target
/// inventory check or explicitly bypassed by a trusted caller), so the
/// in-edge server's host key is accepted without a separate trust store.
pub struct InternalClient;

#[async_trait]
impl russh::client::Handler for InternalClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn local_addr() -> SocketAddr {
    config::get()
        .bind_addr
        .parse()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap())
}

fn split_host_port(target: &str) -> Result<(String, u16), TunnelError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::TargetUnavailable(target.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TunnelError::TargetUnavailable(target.to_string()))?;
    Ok((host.to_string(), port))
}

/// Parses the body of the access-point's inventory response: one
/// `host:port` pair per line after the blank line separating headers
/// from body.
fn parse_inventory_body(raw: &[u8]) -> Result<Vec<(String, u16)>, TunnelError> {
    let text = String::from_utf8_lossy(raw);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("");

    let mut targets = Vec::new();
    for line in body.lines().filter(|l| !l.is_empty()) {
        if let Some((host, port)) = line.rsplit_once(':') {
            if let Ok(port) = port.trim().parse() {
                targets.push((host.trim().to_string(), port));
            }
        }
    }
    Ok(targets)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stub `ConnectionHandle` for registry/site tests: records whether it
/// was ever told to disconnect, never opens a real channel.
#[cfg(test)]
pub(crate) struct FakeConnection {
    disconnected: AtomicBool,
}

#[cfg(test)]
impl FakeConnection {
    pub(crate) fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl ConnectionHandle for FakeConnection {
    async fn disconnect(&self, _reason: &str) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    async fn open_forwarded_tcpip(
        &self,
        _address: &str,
        _port: u32,
        _originator_address: &str,
        _originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        Err(TunnelError::ConnectionFailed(
            "fake connection cannot open real channels".to_string(),
        ))
    }
}

/// A `SiteConnection` backed by a `FakeConnection`, for registry tests
/// that exercise `upsert`/`reinitialize` without a live SSH session.
/// Returns the connection plus a handle to the fake so the caller can
/// assert on what happened to it after a reconnect.
#[cfg(test)]
pub(crate) fn fake_connection(domain_name: &str) -> (SiteConnection, Arc<FakeConnection>) {
    let fake = Arc::new(FakeConnection {
        disconnected: AtomicBool::new(false),
    });
    let conn = SiteConnection {
        domain_name: domain_name.to_string(),
        handle: fake.clone(),
        peer_addr: "127.0.0.1:0".parse().unwrap(),
    };
    (conn, fake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_online_exactly_at_twice_the_heartbeat_period() {
        assert_eq!(Site::status_from(0, 60, 60), SiteStatus::Online);
    }

    #[test]
    fn status_is_offline_just_past_twice_the_heartbeat_period() {
        assert_eq!(Site::status_from(0, 60, 61), SiteStatus::Offline);
    }

    #[test]
    fn reinitialize_frees_the_heartbeat_slot_for_the_new_connection() {
        let site = Site::new_detached("edge-a");
        assert!(site.try_claim_heartbeat_slot().is_some());

        // A reconnect while the old heartbeat worker still holds the slot
        // must not leave the new connection unable to open its own.
        site.heartbeat_epoch.fetch_add(1, Ordering::AcqRel);
        site.heartbeat_active.store(false, Ordering::Release);

        assert!(site.try_claim_heartbeat_slot().is_some());
    }

    #[test]
    fn a_stale_worker_does_not_clobber_a_fresher_claim() {
        let site = Site::new_detached("edge-a");
        let stale_epoch = site.try_claim_heartbeat_slot().unwrap();

        // Superseding connection arrives: slot freed, epoch bumped, and
        // immediately reclaimed by the new connection's heartbeat worker.
        site.heartbeat_epoch.fetch_add(1, Ordering::AcqRel);
        site.heartbeat_active.store(false, Ordering::Release);
        let fresh_epoch = site.try_claim_heartbeat_slot().unwrap();
        assert_ne!(stale_epoch, fresh_epoch);

        // The old worker finally unwinds and checks its stale epoch: it
        // must not release a slot it no longer owns.
        if site.heartbeat_epoch.load(Ordering::Acquire) == stale_epoch {
            site.heartbeat_active.store(false, Ordering::Release);
        }
        assert!(site.heartbeat_active.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn reconnect_lets_the_new_connection_claim_a_fresh_heartbeat_slot() {
        let (first, _first_handle) = fake_connection("edge-a");
        let site = Site::new(first);
        assert!(site.try_claim_heartbeat_slot().is_some());

        let (second, _second_handle) = fake_connection("edge-a");
        site.reinitialize(second).await;

        assert!(site.try_claim_heartbeat_slot().is_some());
    }

    #[tokio::test]
    async fn reinitialize_disconnects_the_superseded_connection() {
        let (first, first_handle) = fake_connection("edge-a");
        let site = Site::new(first);

        let (second, _second_handle) = fake_connection("edge-a");
        site.reinitialize(second).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(first_handle.was_disconnected());
    }

    #[test]
    fn parses_inventory_lines() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nh1:22\nh2:8080\n";
        let targets = parse_inventory_body(raw).unwrap();
        assert_eq!(
            targets,
            vec![("h1".to_string(), 22), ("h2".to_string(), 8080)]
        );
    }

    #[test]
    fn empty_body_has_no_targets() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\n";
        assert!(parse_inventory_body(raw).unwrap().is_empty());
    }

    #[test]
    fn split_host_port_rejects_missing_port() {
        assert!(split_host_port("no-port-here").is_err());
    }

    #[test]
    fn split_host_port_accepts_host_colon_port() {
        let (host, port) = split_host_port("10.0.0.1:22").unwrap();
        assert_eq!(host, "10.0.0.1");
        assert_eq!(port, 22);
    }
}
