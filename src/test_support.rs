//! In-process rendezvous and map servers for end-to-end tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::derp::client::DERP_MAGIC;
use crate::derp::framing::{
    read_frame_header, read_frame_payload, write_frame, FRAME_CLIENT_INFO, FRAME_PING, FRAME_PONG,
    FRAME_RECV_PACKET, FRAME_SEND_PACKET, FRAME_SERVER_KEY,
};
use crate::derp::map::DerpNode;
use crate::error::RelayResult;
use crate::keys::random_derp_identity;

/// Serialises tests that touch the map URL environment variable.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<StdMutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| StdMutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Allocate a plausible `host:port` listen address for a test service.
pub(crate) async fn pick_listen_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind temp port");
    let addr = listener.local_addr().expect("temp port addr");
    addr.to_string()
}

type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

struct RegisteredClient {
    id: u64,
    writer: ClientWriter,
}

type ClientMap = Arc<StdMutex<HashMap<[u8; 32], RegisteredClient>>>;

/// Minimal relay node: speaks the upgrade, greeting, and packet-forwarding
/// subset of the rendezvous protocol over plain TCP.
pub(crate) struct FakeDerpServer {
    node: DerpNode,
}

impl FakeDerpServer {
    pub(crate) async fn start() -> FakeDerpServer {
        let (_, public) = random_derp_identity();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake derp");
        let addr = listener.local_addr().expect("fake derp addr");
        let clients: ClientMap = Arc::new(StdMutex::new(HashMap::new()));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let clients = clients.clone();
                tokio::spawn(async move {
                    let _ = serve_derp_client(stream, public, clients).await;
                });
            }
        });

        FakeDerpServer {
            node: DerpNode {
                name: "fake-derp".into(),
                region_id: 1,
                host_name: "127.0.0.1".into(),
                derp_port: addr.port(),
                insecure_for_tests: true,
                ..Default::default()
            },
        }
    }

    pub(crate) fn node(&self) -> DerpNode {
        self.node.clone()
    }
}

fn next_client_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

async fn serve_derp_client(
    stream: TcpStream,
    server_public: [u8; 32],
    clients: ClientMap,
) -> RelayResult<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    if !consume_upgrade_request(&mut reader).await? {
        writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
            .await?;
        writer.flush().await?;
        return Ok(());
    }
    writer
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: DERP\r\n\r\n")
        .await?;
    writer.flush().await?;

    let mut greeting = DERP_MAGIC.to_vec();
    greeting.extend_from_slice(&server_public);
    write_frame(&mut writer, FRAME_SERVER_KEY, &greeting).await?;

    let (typ, len) = read_frame_header(&mut reader).await?;
    if typ != FRAME_CLIENT_INFO {
        return Ok(());
    }
    let payload = read_frame_payload(&mut reader, len).await?;
    if payload.len() < 32 {
        return Ok(());
    }
    let mut client_key = [0u8; 32];
    client_key.copy_from_slice(&payload[..32]);

    let id = next_client_id();
    let writer: ClientWriter = Arc::new(Mutex::new(writer));
    clients
        .lock()
        .expect("fake derp clients poisoned")
        .insert(
            client_key,
            RegisteredClient {
                id,
                writer: writer.clone(),
            },
        );

    let result = forward_frames(&mut reader, &writer, client_key, &clients).await;

    // A reconnecting client may have replaced this registration already.
    let mut map = clients.lock().expect("fake derp clients poisoned");
    if map.get(&client_key).map(|c| c.id) == Some(id) {
        map.remove(&client_key);
    }
    result
}

async fn consume_upgrade_request<R>(reader: &mut R) -> RelayResult<bool>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(false);
    }
    if !request_line.starts_with("GET /derp") {
        return Ok(false);
    }

    let mut saw_upgrade = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(false);
        }
        if line == "\r\n" || line == "\n" {
            return Ok(saw_upgrade);
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("upgrade:") && lower.contains("derp") {
            saw_upgrade = true;
        }
    }
}

async fn forward_frames<R>(
    reader: &mut R,
    own_writer: &ClientWriter,
    client_key: [u8; 32],
    clients: &ClientMap,
) -> RelayResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (typ, len) = read_frame_header(reader).await?;
        let payload = read_frame_payload(reader, len).await?;

        match typ {
            FRAME_SEND_PACKET if payload.len() >= 32 => {
                let mut dst = [0u8; 32];
                dst.copy_from_slice(&payload[..32]);

                let target = {
                    let map = clients.lock().expect("fake derp clients poisoned");
                    map.get(&dst).map(|c| c.writer.clone())
                };
                let Some(target) = target else {
                    continue;
                };

                let mut frame = Vec::with_capacity(32 + payload.len() - 32);
                frame.extend_from_slice(&client_key);
                frame.extend_from_slice(&payload[32..]);
                let mut target_writer = target.lock().await;
                let _ = write_frame(&mut *target_writer, FRAME_RECV_PACKET, &frame).await;
            }
            FRAME_PING if payload.len() >= 8 => {
                let mut writer = own_writer.lock().await;
                let _ = write_frame(&mut *writer, FRAME_PONG, &payload[..8]).await;
            }
            _ => {}
        }
    }
}

/// One-endpoint HTTP server publishing a rendezvous map that contains only
/// the given node.
pub(crate) struct MapServer {
    url: String,
}

impl MapServer {
    pub(crate) async fn start(node: DerpNode) -> MapServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind map server");
        let addr = listener.local_addr().expect("map server addr");

        let body = serde_json::json!({
            "Regions": {
                "1": {
                    "RegionID": 1,
                    "RegionCode": "test",
                    "RegionName": "test",
                    "Nodes": [{
                        "Name": node.name,
                        "RegionID": 1,
                        "HostName": node.host_name,
                        "DERPPort": node.derp_port,
                        "InsecureForTests": true,
                    }],
                }
            }
        })
        .to_string();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let _ = serve_map_request(stream, &body).await;
                });
            }
        });

        MapServer {
            url: format!("http://{}/derpmap", addr),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }
}

async fn serve_map_request(stream: TcpStream, body: &str) -> RelayResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    write_half.write_all(response.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}
