//! Relay pseudo-connections.
//!
//! A `RelayConn` mimics a stream socket without an OS socket behind it:
//! reads drain payloads queued by the routing side, writes are fragmented
//! into signal envelopes shipped over the rendezvous link. The routing side
//! (service receive loop or dial receive task) keeps a `ConnHandle` to feed
//! the connection and to observe or force closure.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep_until, Instant, Sleep};

use crate::derp::client::DerpClient;
use crate::error::{RelayError, RelayResult};
use crate::signal::{SignalCipher, SignalMessage, SIGNAL_CLOSE, SIGNAL_DATA};

/// Network name reported by relay peer addresses.
pub const RELAY_ADDR_NETWORK: &str = "ts_relay";

/// Each write chunk travels as one signal envelope and must fit the
/// rendezvous packet limit with envelope overhead to spare.
const MAX_WRITE_CHUNK: usize = 65000;

const INCOMING_QUEUE_SIZE: usize = 256;

/// Where outbound envelopes go: a dedicated rendezvous client (dial side)
/// or the service's reconnectable client slot.
#[derive(Clone)]
pub(crate) enum DerpSender {
    Fixed(Arc<DerpClient>),
    Shared(Arc<RwLock<Option<Arc<DerpClient>>>>),
    /// Records outbound messages instead of sending them.
    #[cfg(test)]
    Capture(mpsc::UnboundedSender<SignalMessage>),
}

/// Outbound signal path for one peer: sealing cipher plus the rendezvous
/// client used to ship the envelope.
#[derive(Clone)]
pub(crate) struct SignalLink {
    peer: [u8; 32],
    cipher: SignalCipher,
    derp: DerpSender,
}

impl SignalLink {
    pub(crate) fn new(peer: [u8; 32], cipher: SignalCipher, derp: DerpSender) -> Self {
        Self { peer, cipher, derp }
    }

    pub(crate) async fn send(&self, message: &SignalMessage) -> RelayResult<()> {
        let client = match &self.derp {
            DerpSender::Fixed(client) => client.clone(),
            DerpSender::Shared(slot) => slot.read().await.clone().ok_or_else(|| {
                RelayError::Rendezvous("derp client unavailable".into())
            })?,
            #[cfg(test)]
            DerpSender::Capture(tx) => {
                let _ = tx.send(message.clone());
                return Ok(());
            }
        };

        let raw = self
            .cipher
            .encode(message)
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        client.send(&self.peer, &raw).await
    }
}

/// Synthetic peer address formed from the remote endpoint's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPeerAddr {
    source: [u8; 32],
}

impl RelayPeerAddr {
    pub fn network(&self) -> &'static str {
        RELAY_ADDR_NETWORK
    }
}

impl fmt::Display for RelayPeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", RELAY_ADDR_NETWORK)?;
        for b in &self.source[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnState {
    remote_closed: bool,
    closed: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_waker: Option<Waker>,
}

pub(crate) struct ConnShared {
    session_id: [u8; 16],
    state: Mutex<ConnState>,
    close_started: AtomicBool,
    closed_tx: watch::Sender<bool>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().expect("conn state poisoned")
    }

    /// Transition to locally-closed exactly once; runs the on-closed hook.
    /// Returns true for the caller that performed the transition.
    fn begin_close(&self) -> bool {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let waker = {
            let mut state = self.lock_state();
            state.closed = true;
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        let _ = self.closed_tx.send(true);
        let hook = self.on_closed.lock().expect("on_closed poisoned").take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    fn mark_remote_closed(&self) {
        let waker = {
            let mut state = self.lock_state();
            if state.remote_closed {
                return;
            }
            state.remote_closed = true;
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Routing-side handle to one relay connection.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    shared: Arc<ConnShared>,
    incoming_tx: mpsc::Sender<Vec<u8>>,
    link: SignalLink,
}

impl ConnHandle {
    /// Queue one inbound payload. Blocks while the queue is full; returns
    /// false once the connection is closed.
    pub(crate) async fn push_incoming(&self, payload: Vec<u8>) -> bool {
        if self.shared.lock_state().closed {
            return false;
        }
        let mut closed_rx = self.shared.closed_tx.subscribe();
        tokio::select! {
            result = self.incoming_tx.send(payload) => result.is_ok(),
            _ = closed_rx.wait_for(|closed| *closed) => false,
        }
    }

    /// Record that the peer closed its end; readers drain buffered data and
    /// then observe EOF.
    pub(crate) fn mark_remote_closed(&self) {
        self.shared.mark_remote_closed();
    }

    /// Close the connection from the routing side: same once-guard as the
    /// application's shutdown, emits one close envelope.
    pub(crate) async fn close(&self) -> RelayResult<()> {
        if !self.shared.begin_close() {
            return Ok(());
        }
        let result = self
            .link
            .send(&SignalMessage {
                typ: SIGNAL_CLOSE,
                session_id: self.shared.session_id,
                payload: Vec::new(),
            })
            .await;
        match result {
            Err(err) if !err.is_closed() => Err(err),
            _ => Ok(()),
        }
    }
}

type ConnFuture = Pin<Box<dyn Future<Output = RelayResult<()>> + Send>>;

/// A bidirectional byte stream relayed through a rendezvous node.
///
/// Implements `AsyncRead`/`AsyncWrite`. Writes larger than one envelope are
/// accepted in chunks (standard partial-write contract). Deadlines apply
/// per direction; `None` disables them.
pub struct RelayConn {
    shared: Arc<ConnShared>,
    link: SignalLink,
    peer: RelayPeerAddr,
    path: &'static str,
    incoming: mpsc::Receiver<Vec<u8>>,
    read_buf: BytesMut,
    read_timer: Option<(Instant, Pin<Box<Sleep>>)>,
    write_fut: Option<(usize, ConnFuture)>,
    shutdown_fut: Option<ConnFuture>,
}

impl RelayConn {
    pub(crate) fn pair(
        session_id: [u8; 16],
        source: [u8; 32],
        link: SignalLink,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) -> (RelayConn, ConnHandle) {
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_QUEUE_SIZE);
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(ConnShared {
            session_id,
            state: Mutex::new(ConnState::default()),
            close_started: AtomicBool::new(false),
            closed_tx,
            on_closed: Mutex::new(on_closed),
        });

        let conn = RelayConn {
            shared: shared.clone(),
            link: link.clone(),
            peer: RelayPeerAddr { source },
            path: "relay",
            incoming,
            read_buf: BytesMut::new(),
            read_timer: None,
            write_fut: None,
            shutdown_fut: None,
        };
        let handle = ConnHandle {
            shared,
            incoming_tx,
            link,
        };
        (conn, handle)
    }

    /// Transport path label; the relay core only ever produces `"relay"`.
    pub fn path(&self) -> &str {
        self.path
    }

    /// Placeholder local address; relay connections do not bind a socket.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn remote_addr(&self) -> RelayPeerAddr {
        self.peer
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let waker = {
            let mut state = self.shared.lock_state();
            state.read_deadline = deadline;
            state.read_waker.take()
        };
        // Re-arm a parked reader against the new deadline.
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.lock_state().write_deadline = deadline;
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

fn remote_closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed by peer")
}

fn timeout_error(direction: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timeout", direction))
}

impl AsyncRead for RelayConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // Park the waker and snapshot flags under one lock so a
            // concurrent close cannot slip between check and park.
            let (closed, remote_closed, deadline) = {
                let mut state = this.shared.lock_state();
                state.read_waker = Some(cx.waker().clone());
                (state.closed, state.remote_closed, state.read_deadline)
            };

            if closed {
                return Poll::Ready(Err(closed_error()));
            }
            if remote_closed {
                return Poll::Ready(Ok(())); // EOF
            }

            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    this.read_buf.extend_from_slice(&payload);
                    continue;
                }
                Poll::Ready(None) => {
                    this.shared.mark_remote_closed();
                    continue;
                }
                Poll::Pending => {}
            }

            if let Some(deadline) = deadline {
                let rearm = !matches!(&this.read_timer, Some((cached, _)) if *cached == deadline);
                if rearm {
                    this.read_timer = Some((deadline, Box::pin(sleep_until(deadline))));
                }
                if let Some((_, timer)) = &mut this.read_timer {
                    if timer.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(timeout_error("read")));
                    }
                }
            } else {
                this.read_timer = None;
            }

            return Poll::Pending;
        }
    }
}

impl AsyncWrite for RelayConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some((len, fut)) = this.write_fut.as_mut() {
                let n = *len;
                let polled = fut.as_mut().poll(cx);
                return match polled {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        this.write_fut = None;
                        Poll::Ready(Ok(n))
                    }
                    Poll::Ready(Err(err)) => {
                        this.write_fut = None;
                        Poll::Ready(Err(err.into()))
                    }
                };
            }

            let (closed, remote_closed, deadline) = {
                let state = this.shared.lock_state();
                (state.closed, state.remote_closed, state.write_deadline)
            };
            if closed {
                return Poll::Ready(Err(closed_error()));
            }
            if remote_closed {
                return Poll::Ready(Err(remote_closed_error()));
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Poll::Ready(Err(timeout_error("write")));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let limit = buf.len().min(MAX_WRITE_CHUNK);
            let payload = buf[..limit].to_vec();
            let link = this.link.clone();
            let session_id = this.shared.session_id;
            this.write_fut = Some((
                limit,
                Box::pin(async move {
                    link.send(&SignalMessage {
                        typ: SIGNAL_DATA,
                        session_id,
                        payload,
                    })
                    .await
                }),
            ));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are shipped synchronously inside poll_write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.shutdown_fut.as_mut() {
                let polled = fut.as_mut().poll(cx);
                return match polled {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        this.shutdown_fut = None;
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(err)) if err.is_closed() => {
                        this.shutdown_fut = None;
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(err)) => {
                        this.shutdown_fut = None;
                        Poll::Ready(Err(err.into()))
                    }
                };
            }

            if !this.shared.begin_close() {
                return Poll::Ready(Ok(()));
            }
            let link = this.link.clone();
            let session_id = this.shared.session_id;
            this.shutdown_fut = Some(Box::pin(async move {
                link.send(&SignalMessage {
                    typ: SIGNAL_CLOSE,
                    session_id,
                    payload: Vec::new(),
                })
                .await
            }));
        }
    }
}

impl Drop for RelayConn {
    fn drop(&mut self) {
        // Runs the flag-and-hook half of close; the close envelope needs an
        // async context and is only sent by explicit shutdown.
        self.shared.begin_close();
    }
}

impl fmt::Debug for RelayConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConn")
            .field("peer", &self.peer.to_string())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
