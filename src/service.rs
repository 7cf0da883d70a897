//! Relay service: the accept side of the transport.
//!
//! `Service::start` derives the rendezvous identity from the host key,
//! publishes a destination token, and keeps one authenticated session to a
//! rendezvous node. Inbound dials become relay sessions: created on
//! dial-init, promoted into the listener on first data, reaped when idle,
//! removed on close.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, sleep, timeout, Instant};

use crate::conn::{ConnHandle, DerpSender, RelayConn, SignalLink};
use crate::derp::client::DerpClient;
use crate::derp::map::{fetch_derp_map, DerpNode};
use crate::derp::select::pick_derp_node;
use crate::error::{RelayError, RelayResult};
use crate::keys::derive_derp_identity;
use crate::listener::RelayListener;
use crate::signal::{
    SignalCipher, SignalMessage, SIGNAL_CLOSE, SIGNAL_DATA, SIGNAL_DIAL_ACK, SIGNAL_DIAL_INIT,
};
use crate::token::{Token, TOKEN_VERSION_V1};

/// Cap on sessions that have never carried data.
pub(crate) const MAX_PENDING_RELAY_SESSIONS: usize = 256;

/// Pending sessions idle longer than this are reaped.
const PENDING_SESSION_TTL: Duration = Duration::from_secs(30);

const SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(10);
const MAP_FETCH_DEADLINE: Duration = Duration::from_secs(10);
const DERP_CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration for [`Service::start`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// `host:port` the host application advertises; informational, the
    /// relay listener never binds it.
    pub listen_addr: String,

    /// Host identity bytes the rendezvous keypair is derived from.
    pub host_private_key: Vec<u8>,

    /// Optional rendezvous map URL override.
    pub derp_map_url: String,

    /// Region hint baked into the token; 0 means no preference.
    pub preferred_region: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    peer: [u8; 32],
    session_id: [u8; 16],
}

struct RelaySession {
    /// Parked here until the first data payload promotes it into the
    /// listener; the application owns it afterwards.
    conn: Option<RelayConn>,
    handle: ConnHandle,
    accepted: bool,
    last_activity: Instant,
}

type SessionMap = Arc<Mutex<HashMap<SessionKey, RelaySession>>>;

struct ServiceInner {
    token: String,
    listener: Arc<RelayListener>,
    derp_node: DerpNode,
    derp_private: [u8; 32],
    derp: Arc<RwLock<Option<Arc<DerpClient>>>>,
    sessions: SessionMap,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Server half of the relay transport.
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish()
    }
}

impl Service {
    /// Derive the identity, pick a rendezvous node, connect, and start the
    /// receive and sweep tasks.
    pub async fn start(config: ServiceConfig) -> RelayResult<Service> {
        if config.host_private_key.is_empty() {
            return Err(RelayError::Config(
                "host private key bytes cannot be empty".into(),
            ));
        }

        let map = match timeout(MAP_FETCH_DEADLINE, fetch_derp_map(&config.derp_map_url)).await {
            Ok(Ok(map)) => map,
            Ok(Err(err)) => {
                warn!("derp map fetch failed: {}", err);
                return Err(err);
            }
            Err(_) => return Err(RelayError::Timeout("derp map fetch".into())),
        };

        let (derp_private, derp_public) = derive_derp_identity(&config.host_private_key)?;

        let (listen_host, listen_port) = split_listen_addr(&config.listen_addr)?;

        let (region_id, derp_node) = pick_derp_node(&map, config.preferred_region)?;

        let token = Token {
            version: TOKEN_VERSION_V1,
            server_derp_public_key: derp_public,
            preferred_region: region_id,
        }
        .encode()?;

        let listener_ip = listen_host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ServiceInner {
            token,
            listener: Arc::new(RelayListener::new(SocketAddr::new(listener_ip, listen_port))),
            derp_node,
            derp_private,
            derp: Arc::new(RwLock::new(None)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        let service = Service { inner };
        if let Err(err) = service.inner.connect_derp().await {
            let _ = service.close().await;
            return Err(err);
        }

        tokio::spawn(recv_loop(service.inner.clone()));
        tokio::spawn(sweep_loop(service.inner.clone()));

        Ok(service)
    }

    /// The accept handle yielding relayed byte streams.
    pub fn listener(&self) -> Arc<RelayListener> {
        self.inner.listener.clone()
    }

    /// The encoded destination token (without the `ts://` scheme).
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Idempotently stop the service: close the listener and rendezvous
    /// client, then close every live session.
    pub async fn close(&self) -> RelayResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.closed_tx.send(true);
        let _ = self.inner.listener.close();

        let client = self.inner.derp.write().await.take();
        if let Some(client) = client {
            client.close();
        }

        let all: Vec<RelaySession> = {
            let mut sessions = self.inner.sessions.lock().expect("session map poisoned");
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in all {
            session.handle.mark_remote_closed();
            let _ = session.handle.close().await;
        }
        Ok(())
    }
}

impl ServiceInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect_derp(&self) -> RelayResult<()> {
        let client = match timeout(
            DERP_CONNECT_DEADLINE,
            DerpClient::connect(&self.derp_node, self.derp_private),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RelayError::Timeout("derp connect".into())),
        };

        let old = self.derp.write().await.replace(client);
        if let Some(old) = old {
            old.close();
        }
        Ok(())
    }

    async fn retry_derp_connect(&self) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            match self.connect_derp().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!("derp reconnect failed: {}", err);
                    sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    fn link_for(&self, peer: [u8; 32]) -> SignalLink {
        SignalLink::new(
            peer,
            SignalCipher::new(&self.derp_private, &peer),
            DerpSender::Shared(self.derp.clone()),
        )
    }

    async fn send_signal(&self, destination: [u8; 32], message: SignalMessage) -> RelayResult<()> {
        self.link_for(destination).send(&message).await
    }

    async fn handle_dial_init(&self, source: [u8; 32], message: SignalMessage) {
        let key = SessionKey {
            peer: source,
            session_id: message.session_id,
        };

        // The dial-init body is ignored; only the session id matters.
        let capped = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let existing = sessions
                .get_mut(&key)
                .map(|session| session.last_activity = Instant::now())
                .is_some();

            if existing {
                false
            } else if pending_session_count(&sessions) >= MAX_PENDING_RELAY_SESSIONS {
                true
            } else {
                let link = self.link_for(source);
                let hook_sessions = self.sessions.clone();
                let (conn, handle) = RelayConn::pair(
                    message.session_id,
                    source,
                    link,
                    Some(Box::new(move || {
                        let removed = {
                            let mut sessions =
                                hook_sessions.lock().expect("session map poisoned");
                            sessions.remove(&key)
                        };
                        drop(removed);
                    })),
                );
                sessions.insert(
                    key,
                    RelaySession {
                        conn: Some(conn),
                        handle,
                        accepted: false,
                        last_activity: Instant::now(),
                    },
                );
                false
            }
        };

        if capped {
            warn!(
                "dropping session {}, pending relay session limit reached",
                session_tag(&message.session_id)
            );
            let _ = self
                .send_signal(
                    source,
                    SignalMessage {
                        typ: SIGNAL_CLOSE,
                        session_id: message.session_id,
                        payload: Vec::new(),
                    },
                )
                .await;
            return;
        }

        // Re-acking an existing session is safe; the dialer treats
        // duplicate acks as a no-op.
        let _ = self
            .send_signal(
                source,
                SignalMessage {
                    typ: SIGNAL_DIAL_ACK,
                    session_id: message.session_id,
                    payload: Vec::new(),
                },
            )
            .await;
    }

    async fn route_relay_data(&self, source: [u8; 32], session_id: [u8; 16], payload: Vec<u8>) {
        let key = SessionKey {
            peer: source,
            session_id,
        };

        let (handle, promoted) = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let Some(session) = sessions.get_mut(&key) else {
                return;
            };
            session.last_activity = Instant::now();
            let promoted = if !session.accepted {
                session.accepted = true;
                session.conn.take()
            } else {
                None
            };
            (session.handle.clone(), promoted)
        };

        if let Some(conn) = promoted {
            if let Err((err, conn)) = self.listener.push(conn).await {
                debug!(
                    "failed to queue relay session {}: {}",
                    session_tag(&session_id),
                    err
                );
                handle.mark_remote_closed();
                let _ = handle.close().await;
                drop(conn);
                return;
            }
        }

        handle.push_incoming(payload).await;
    }

    async fn route_relay_close(&self, source: [u8; 32], session_id: [u8; 16]) {
        let key = SessionKey {
            peer: source,
            session_id,
        };

        let removed = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            sessions.remove(&key)
        };
        let Some(session) = removed else {
            return;
        };

        session.handle.mark_remote_closed();
        if !session.accepted {
            // Never surfaced to the application, so it is ours to close.
            let _ = session.handle.close().await;
        }
    }

    async fn prune_pending_sessions(&self) {
        let Some(cutoff) = Instant::now().checked_sub(PENDING_SESSION_TTL) else {
            return;
        };

        let stale: Vec<RelaySession> = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let stale_keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, session)| !session.accepted && session.last_activity < cutoff)
                .map(|(key, _)| *key)
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| sessions.remove(&key))
                .collect()
        };

        for session in stale {
            session.handle.mark_remote_closed();
            let _ = session.handle.close().await;
        }
    }
}

async fn recv_loop(inner: Arc<ServiceInner>) {
    loop {
        if inner.is_closed() {
            return;
        }

        let client = inner.derp.read().await.clone();
        let Some(client) = client else {
            if !inner.retry_derp_connect().await {
                return;
            }
            continue;
        };

        let packet = match client.recv().await {
            Ok(packet) => packet,
            Err(err) => {
                if inner.is_closed() {
                    return;
                }
                warn!("derp receive failed: {}", err);
                {
                    let mut slot = inner.derp.write().await;
                    if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &client)) {
                        *slot = None;
                    }
                }
                client.close();
                continue;
            }
        };

        let cipher = SignalCipher::new(&inner.derp_private, &packet.source);
        let message = match cipher.decode(&packet.payload) {
            Ok(message) => message,
            // May be stale or adversarial traffic.
            Err(_) => continue,
        };

        match message.typ {
            SIGNAL_DIAL_INIT => inner.handle_dial_init(packet.source, message).await,
            SIGNAL_DATA => {
                inner
                    .route_relay_data(packet.source, message.session_id, message.payload)
                    .await
            }
            SIGNAL_CLOSE => inner.route_relay_close(packet.source, message.session_id).await,
            _ => {}
        }
    }
}

async fn sweep_loop(inner: Arc<ServiceInner>) {
    let mut closed_rx = inner.closed_tx.subscribe();
    let mut ticker = interval_at(Instant::now() + SESSION_SWEEP_PERIOD, SESSION_SWEEP_PERIOD);

    loop {
        if *closed_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = closed_rx.changed() => return,
            _ = ticker.tick() => inner.prune_pending_sessions().await,
        }
    }
}

fn pending_session_count(sessions: &HashMap<SessionKey, RelaySession>) -> usize {
    sessions.values().filter(|s| !s.accepted).count()
}

fn session_tag(session_id: &[u8; 16]) -> String {
    session_id[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

fn split_listen_addr(addr: &str) -> RelayResult<(String, u16)> {
    let addr = addr.trim();
    let (host, port_raw) = addr
        .rsplit_once(':')
        .ok_or_else(|| RelayError::Config(format!("invalid listen address {:?}", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port_raw
        .parse::<u16>()
        .map_err(|_| RelayError::Config(format!("invalid listen port {:?}", port_raw)))?;
    if port == 0 {
        return Err(RelayError::Config("listen port cannot be zero".into()));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::dial::dial;
    use crate::keys::random_derp_identity;
    use crate::test_support::{env_lock, pick_listen_addr, FakeDerpServer, MapServer};
    use crate::token::DESTINATION_PREFIX;

    fn test_inner() -> Arc<ServiceInner> {
        let (closed_tx, _) = watch::channel(false);
        let (derp_private, _) = random_derp_identity();
        Arc::new(ServiceInner {
            token: String::new(),
            listener: Arc::new(RelayListener::new(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            ))),
            derp_node: DerpNode::default(),
            derp_private,
            derp: Arc::new(RwLock::new(None)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            closed_tx,
        })
    }

    fn session_id_for(index: u32) -> [u8; 16] {
        let mut session_id = [0u8; 16];
        session_id[12..].copy_from_slice(&index.to_be_bytes());
        session_id
    }

    fn dial_init(session_id: [u8; 16]) -> SignalMessage {
        SignalMessage {
            typ: SIGNAL_DIAL_INIT,
            session_id,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn dial_init_caps_pending_sessions() {
        let inner = test_inner();
        let source = [1u8; 32];

        for i in 0..(MAX_PENDING_RELAY_SESSIONS as u32 + 32) {
            inner.handle_dial_init(source, dial_init(session_id_for(i))).await;
        }

        let count = inner.sessions.lock().unwrap().len();
        assert_eq!(count, MAX_PENDING_RELAY_SESSIONS);
    }

    #[tokio::test]
    async fn dial_init_is_idempotent_per_session() {
        let inner = test_inner();
        let source = [4u8; 32];

        inner.handle_dial_init(source, dial_init(session_id_for(1))).await;
        inner.handle_dial_init(source, dial_init(session_id_for(1))).await;

        assert_eq!(inner.sessions.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_stale_pending_sessions() {
        let inner = test_inner();
        let source = [2u8; 32];

        inner.handle_dial_init(source, dial_init(session_id_for(1))).await;
        tokio::time::advance(PENDING_SESSION_TTL + Duration::from_secs(1)).await;
        inner.handle_dial_init(source, dial_init(session_id_for(2))).await;

        inner.prune_pending_sessions().await;

        let sessions = inner.sessions.lock().unwrap();
        assert!(!sessions.contains_key(&SessionKey {
            peer: source,
            session_id: session_id_for(1)
        }));
        assert!(sessions.contains_key(&SessionKey {
            peer: source,
            session_id: session_id_for(2)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_keeps_accepted_sessions() {
        let inner = test_inner();
        let source = [5u8; 32];

        inner.handle_dial_init(source, dial_init(session_id_for(1))).await;
        inner
            .route_relay_data(source, session_id_for(1), b"payload".to_vec())
            .await;

        tokio::time::advance(PENDING_SESSION_TTL + Duration::from_secs(1)).await;
        inner.prune_pending_sessions().await;

        assert_eq!(inner.sessions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_close_removes_session() {
        let inner = test_inner();
        let source = [3u8; 32];

        inner.handle_dial_init(source, dial_init(session_id_for(9))).await;
        assert_eq!(inner.sessions.lock().unwrap().len(), 1);

        inner.route_relay_close(source, session_id_for(9)).await;
        assert!(inner.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_data_promotes_session_into_listener() {
        let inner = test_inner();
        let source = [6u8; 32];

        inner.handle_dial_init(source, dial_init(session_id_for(1))).await;
        inner
            .route_relay_data(source, session_id_for(1), b"hello".to_vec())
            .await;

        let mut conn = inner.listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Data for unknown sessions is silently ignored.
        inner
            .route_relay_data(source, session_id_for(99), b"stray".to_vec())
            .await;
    }

    #[test]
    fn split_listen_addr_accepts_host_port() {
        assert_eq!(
            split_listen_addr("127.0.0.1:2200").unwrap(),
            ("127.0.0.1".to_string(), 2200)
        );
        assert_eq!(
            split_listen_addr("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(split_listen_addr("no-port").is_err());
        assert!(split_listen_addr("host:0").is_err());
        assert!(split_listen_addr("host:90000").is_err());
    }

    #[tokio::test]
    async fn start_fails_without_host_private_key() {
        let err = Service::start(ServiceConfig {
            listen_addr: "127.0.0.1:42000".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn start_fails_when_derp_map_unavailable() {
        let _env = env_lock();
        std::env::set_var(
            crate::derp::map::DERP_MAP_URL_ENV_VAR,
            "http://127.0.0.1:1/unreachable",
        );

        let result = Service::start(ServiceConfig {
            listen_addr: "127.0.0.1:42000".into(),
            host_private_key: b"test-key".to_vec(),
            ..Default::default()
        })
        .await;

        std::env::remove_var(crate::derp::map::DERP_MAP_URL_ENV_VAR);
        assert!(result.is_err());
    }

    async fn echo_first_accepted(listener: Arc<RelayListener>) {
        if let Ok(conn) = listener.accept().await {
            let (mut reader, mut writer) = tokio::io::split(conn);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    }

    #[tokio::test]
    async fn relay_echo_end_to_end() {
        let _env = env_lock();
        let derp = FakeDerpServer::start().await;
        let map = MapServer::start(derp.node()).await;
        std::env::set_var(crate::derp::map::DERP_MAP_URL_ENV_VAR, map.url());

        let service = Service::start(ServiceConfig {
            listen_addr: pick_listen_addr().await,
            host_private_key: b"test-key-relay".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

        tokio::spawn(echo_first_accepted(service.listener()));

        let destination = format!("{}{}", DESTINATION_PREFIX, service.token());
        let mut conn = dial(&destination, Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.path(), "relay");

        conn.write_all(b"hello-relay").await.unwrap();
        let mut buf = [0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-relay");

        conn.shutdown().await.unwrap();
        service.close().await.unwrap();
        std::env::remove_var(crate::derp::map::DERP_MAP_URL_ENV_VAR);
    }

    #[tokio::test]
    async fn dial_old_destination_after_restart() {
        let _env = env_lock();
        let derp = FakeDerpServer::start().await;
        let map = MapServer::start(derp.node()).await;
        std::env::set_var(crate::derp::map::DERP_MAP_URL_ENV_VAR, map.url());

        let listen_addr = pick_listen_addr().await;
        let host_key = b"test-key-restart".to_vec();

        let first = Service::start(ServiceConfig {
            listen_addr: listen_addr.clone(),
            host_private_key: host_key.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        let old_destination = format!("{}{}", DESTINATION_PREFIX, first.token());
        first.close().await.unwrap();

        let second = Service::start(ServiceConfig {
            listen_addr,
            host_private_key: host_key,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            format!("{}{}", DESTINATION_PREFIX, second.token()),
            old_destination,
            "token must be stable across restarts"
        );

        tokio::spawn(echo_first_accepted(second.listener()));

        let mut conn = dial(&old_destination, Duration::from_secs(5)).await.unwrap();
        conn.write_all(b"hello-restart").await.unwrap();
        let mut buf = [0u8; 13];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-restart");

        conn.shutdown().await.unwrap();
        second.close().await.unwrap();
        std::env::remove_var(crate::derp::map::DERP_MAP_URL_ENV_VAR);
    }
}
