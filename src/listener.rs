//! Accept queue for relayed connections.
//!
//! The listener does not bind a socket; its address is informational. The
//! service receive loop pushes promoted sessions into a bounded queue that
//! the host application drains through `accept`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::conn::RelayConn;
use crate::error::{RelayError, RelayResult};

const ACCEPT_QUEUE_SIZE: usize = 128;

/// How long the routing side waits on a full accept queue before giving up
/// on the connection.
const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Yields relayed connections as peers complete their dials.
pub struct RelayListener {
    addr: SocketAddr,
    conn_rx: Mutex<mpsc::Receiver<RelayConn>>,
    conn_tx: mpsc::Sender<RelayConn>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl RelayListener {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (closed_tx, _) = watch::channel(false);
        Self {
            addr,
            conn_rx: Mutex::new(conn_rx),
            conn_tx,
            closed: AtomicBool::new(false),
            closed_tx,
        }
    }

    /// Wait for the next accepted connection.
    ///
    /// A close signal takes precedence over queued connections and surfaces
    /// as `RelayError::Closed`.
    pub async fn accept(&self) -> RelayResult<RelayConn> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let mut conn_rx = self.conn_rx.lock().await;

        tokio::select! {
            biased;
            _ = closed_rx.wait_for(|closed| *closed) => Err(RelayError::Closed),
            conn = conn_rx.recv() => conn.ok_or(RelayError::Closed),
        }
    }

    /// The configured listen address. Informational only; nothing is bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Idempotently close the listener; pending and future accepts fail
    /// with `RelayError::Closed`.
    pub fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let _ = self.closed_tx.send(true);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue an accepted connection, waiting briefly when the queue is
    /// full. On failure the connection is handed back so the caller can
    /// close it properly.
    pub(crate) async fn push(&self, conn: RelayConn) -> Result<(), (RelayError, RelayConn)> {
        if self.is_closed() {
            return Err((RelayError::Closed, conn));
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let permit = tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => return Err((RelayError::Closed, conn)),
            reserved = timeout(PUSH_TIMEOUT, self.conn_tx.reserve()) => match reserved {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err((RelayError::Closed, conn)),
                Err(_) => return Err((RelayError::Overloaded, conn)),
            },
        };
        permit.send(conn);
        Ok(())
    }
}
