//! Rendezvous (DERP) client.
//!
//! Maintains one framed, authenticated session with a public relay node:
//! TCP (optionally TLS), an HTTP/1.1 `Upgrade: DERP` request, then the
//! key-exchange greeting. After the handshake the connection carries
//! length-prefixed frames; packets are addressed by 32-byte static public
//! keys.
//!
//! Writes go through a large buffer: small frames are batched and flushed
//! by a short-interval background task, big frames flush immediately.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crypto_box::aead::rand_core::RngCore;
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use log::debug;
use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout};

use crate::derp::framing::{
    read_frame_header, read_frame_payload, write_frame, write_frame_header, FRAME_CLIENT_INFO,
    FRAME_KEEP_ALIVE, FRAME_PING, FRAME_PONG, FRAME_RECV_PACKET, FRAME_SEND_PACKET,
    FRAME_SERVER_KEY, FRAME_SERVER_INFO,
};
use crate::derp::map::DerpNode;
use crate::error::{RelayError, RelayResult};
use crate::keys::public_for;

/// Magic prefix of the server greeting frame: "DERP" + the key emoji.
pub(crate) const DERP_MAGIC: &[u8] = b"DERP\xf0\x9f\x94\x91";

/// Maximum payload of one relayed packet.
const MAX_PACKET_SIZE: usize = 64 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_BUFFER_SIZE: usize = 128 * 1024;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Payloads at least this large flush the write buffer immediately.
const FLUSH_NOW_SIZE: usize = 16 * 1024;
/// Buffered bytes beyond this flush regardless of payload size.
const FLUSH_THRESHOLD: usize = 64 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(2);

/// One packet relayed from another endpoint.
#[derive(Debug, Clone)]
pub(crate) struct DerpPacket {
    pub source: [u8; 32],
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct DerpClientInfo {
    version: u32,
    #[serde(rename = "CanAckPings")]
    can_ack_pings: bool,
}

/// A TCP stream, possibly wrapped in TLS.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type FrameReader = BufReader<ReadHalf<MaybeTlsStream>>;
type FrameWriter = BufWriter<WriteHalf<MaybeTlsStream>>;

/// Persistent framed session with one rendezvous node.
pub(crate) struct DerpClient {
    reader: Mutex<FrameReader>,
    writer: Arc<Mutex<FrameWriter>>,
    public_key: [u8; 32],
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl DerpClient {
    /// Connect to `node`, upgrade the connection, and complete the
    /// key-exchange handshake.
    pub(crate) async fn connect(node: &DerpNode, private_key: [u8; 32]) -> RelayResult<Arc<Self>> {
        let host = node.host_name.trim();
        if host.is_empty() {
            return Err(RelayError::Rendezvous("derp node hostname is empty".into()));
        }
        let port = if node.derp_port == 0 { 443 } else { node.derp_port };
        let address = format!("{}:{}", host, port);

        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| RelayError::Timeout(format!("derp connect to {}", address)))??;

        let stream = if node.insecure_for_tests {
            MaybeTlsStream::Plain(tcp)
        } else {
            let server_name =
                tokio_rustls::rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| RelayError::Rendezvous(format!("invalid SNI host: {}", e)))?;
            let tls = tls_connector().connect(server_name, tcp).await?;
            MaybeTlsStream::Tls(Box::new(tls))
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half);

        upgrade_http(&mut reader, &mut writer, &address).await?;
        handshake(&mut reader, &mut writer, &private_key).await?;

        let (closed_tx, _) = watch::channel(false);
        let client = Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
            public_key: public_for(&private_key),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(flush_loop(client.clone()));

        Ok(client)
    }

    /// The client's own static public key on this session.
    #[allow(dead_code)]
    pub(crate) fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Send one packet to the endpoint identified by `dst`.
    pub(crate) async fn send(&self, dst: &[u8; 32], payload: &[u8]) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        if payload.len() > MAX_PACKET_SIZE {
            return Err(RelayError::Transport(format!(
                "derp payload too large: {}",
                payload.len()
            )));
        }

        let mut writer = self.writer.lock().await;
        write_frame_header(&mut *writer, FRAME_SEND_PACKET, (32 + payload.len()) as u32).await?;
        writer.write_all(dst).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        if payload.len() >= FLUSH_NOW_SIZE || writer.buffer().len() >= FLUSH_THRESHOLD {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Receive the next relayed packet.
    ///
    /// Pings are answered inline; keep-alives, server-info, and unknown
    /// frames are skipped. Returns `Closed` once `close` has been called.
    pub(crate) async fn recv(&self) -> RelayResult<DerpPacket> {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut reader = self.reader.lock().await;

        loop {
            if *closed_rx.borrow() {
                return Err(RelayError::Closed);
            }
            let frame = tokio::select! {
                _ = closed_rx.changed() => return Err(RelayError::Closed),
                header = read_frame_header(&mut *reader) => {
                    let (typ, len) = header?;
                    let payload = read_frame_payload(&mut *reader, len).await?;
                    (typ, payload)
                }
            };

            match frame {
                (FRAME_RECV_PACKET, payload) => {
                    if payload.len() < 32 {
                        continue;
                    }
                    let mut source = [0u8; 32];
                    source.copy_from_slice(&payload[..32]);
                    return Ok(DerpPacket {
                        source,
                        payload: payload[32..].to_vec(),
                    });
                }
                (FRAME_PING, payload) => {
                    if payload.len() < 8 {
                        continue;
                    }
                    let _ = self.send_pong(&payload[..8]).await;
                }
                (FRAME_KEEP_ALIVE, _) | (FRAME_SERVER_INFO, _) => continue,
                (typ, _) => {
                    debug!("skipping unknown derp frame type {:#04x}", typ);
                    continue;
                }
            }
        }
    }

    async fn send_pong(&self, token: &[u8]) -> RelayResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, FRAME_PONG, token).await
    }

    /// Idempotently shut the session down.
    ///
    /// Unblocks pending `recv` calls; the background flush task performs
    /// the final flush and closes the socket.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.closed_tx.send(true);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Periodically flush buffered frames; on close, flush once more and shut
/// the write half down.
async fn flush_loop(client: Arc<DerpClient>) {
    let mut closed_rx = client.closed_tx.subscribe();
    let mut ticker = interval(FLUSH_INTERVAL);

    loop {
        if *closed_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = closed_rx.changed() => break,
            _ = ticker.tick() => {
                let mut writer = client.writer.lock().await;
                if !writer.buffer().is_empty() {
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let mut writer = client.writer.lock().await;
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Issue the `GET /derp` upgrade request and require `101 Switching
/// Protocols` back.
async fn upgrade_http<R, W>(reader: &mut R, writer: &mut W, host: &str) -> RelayResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = format!(
        "GET /derp HTTP/1.1\r\nHost: {}\r\nUpgrade: DERP\r\nConnection: Upgrade\r\n\r\n",
        host
    );
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    read_upgrade_response(reader).await
}

async fn read_upgrade_response<R>(reader: &mut R) -> RelayResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if status_line.is_empty() {
        return Err(RelayError::Transport(
            "connection closed during derp upgrade".into(),
        ));
    }

    let status = status_line.split_whitespace().nth(1);
    if status != Some("101") {
        return Err(RelayError::Rendezvous(format!(
            "derp upgrade failed: {}",
            status_line.trim()
        )));
    }

    // Discard response headers up to the blank line.
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RelayError::Transport(
                "connection closed during derp upgrade".into(),
            ));
        }
        if line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

/// Consume the server greeting and answer with our sealed client info.
async fn handshake<R, W>(reader: &mut R, writer: &mut W, private_key: &[u8; 32]) -> RelayResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (typ, len) = read_frame_header(reader).await?;
    if typ != FRAME_SERVER_KEY {
        return Err(RelayError::Rendezvous(format!(
            "unexpected derp greeting frame {:#04x}",
            typ
        )));
    }
    let payload = read_frame_payload(reader, len).await?;
    if payload.len() < DERP_MAGIC.len() + 32 {
        return Err(RelayError::Rendezvous("short derp server key frame".into()));
    }
    if &payload[..DERP_MAGIC.len()] != DERP_MAGIC {
        return Err(RelayError::Rendezvous("invalid derp magic".into()));
    }
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&payload[DERP_MAGIC.len()..DERP_MAGIC.len() + 32]);

    let info = serde_json::to_vec(&DerpClientInfo {
        version: 2,
        can_ack_pings: true,
    })
    .map_err(|e| RelayError::Transport(format!("client info encode: {}", e)))?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = crypto_box::Nonce::clone_from_slice(&nonce_bytes);

    let secret = SecretKey::from(*private_key);
    let salsa = SalsaBox::new(&PublicKey::from(server_public), &secret);
    let sealed = salsa
        .encrypt(&nonce, info.as_slice())
        .map_err(|_| RelayError::Transport("client info seal failed".into()))?;

    let mut client_info = Vec::with_capacity(32 + nonce_bytes.len() + sealed.len());
    client_info.extend_from_slice(&public_for(private_key));
    client_info.extend_from_slice(&nonce_bytes);
    client_info.extend_from_slice(&sealed);

    write_frame(writer, FRAME_CLIENT_INFO, &client_info).await
}
