//! Client dial path.
//!
//! Resolves a `ts://` destination to a live relay connection: pick the
//! nearest rendezvous node, connect with a per-process ephemeral identity,
//! then run the dial-init / dial-ack exchange against the server key from
//! the token.

use std::sync::OnceLock;
use std::time::Duration;

use log::info;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::conn::{DerpSender, RelayConn, SignalLink};
use crate::derp::client::DerpClient;
use crate::derp::map::fetch_derp_map;
use crate::derp::select::pick_nearest_derp_node;
use crate::error::{RelayError, RelayResult};
use crate::keys::random_derp_identity;
use crate::signal::{
    SignalCipher, SignalMessage, SIGNAL_CLOSE, SIGNAL_DATA, SIGNAL_DIAL_ACK, SIGNAL_DIAL_INIT,
};
use crate::token::parse_destination;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Hard cap on waiting for the server's dial acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The dialer's rendezvous identity: random, generated once per process.
fn global_dial_identity() -> [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    *KEY.get_or_init(|| random_derp_identity().0)
}

/// Dial a `ts://` destination and return the relayed byte stream.
///
/// A zero `dial_timeout` selects the 8 s default. The returned connection
/// reports `path() == "relay"`.
pub async fn dial(destination: &str, dial_timeout: Duration) -> RelayResult<RelayConn> {
    let token = parse_destination(destination)?;

    let dial_timeout = if dial_timeout.is_zero() {
        DEFAULT_DIAL_TIMEOUT
    } else {
        dial_timeout
    };

    let setup = async {
        let map = fetch_derp_map("")
            .await
            .map_err(|e| RelayError::Rendezvous(format!("derp map fetch failed: {}", e)))?;
        let (_, node) = pick_nearest_derp_node(&map).await?;
        let private = global_dial_identity();
        let client = DerpClient::connect(&node, private).await?;
        Ok::<_, RelayError>((private, client))
    };
    let (private, client) = match timeout(dial_timeout, setup).await {
        Ok(result) => result?,
        Err(_) => return Err(RelayError::Timeout("relay dial".into())),
    };

    let mut session_id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut session_id);

    let server_key = token.server_derp_public_key;
    let cipher = SignalCipher::new(&private, &server_key);
    let link = SignalLink::new(server_key, cipher.clone(), DerpSender::Fixed(client.clone()));

    let close_client = client.clone();
    let (conn, handle) = RelayConn::pair(
        session_id,
        server_key,
        link.clone(),
        Some(Box::new(move || close_client.close())),
    );

    let (ack_tx, mut ack_rx) = mpsc::channel::<()>(1);
    let (err_tx, mut err_rx) = mpsc::channel::<RelayError>(1);

    let recv_client = client.clone();
    tokio::spawn(async move {
        loop {
            let packet = match recv_client.recv().await {
                Ok(packet) => packet,
                Err(err) => {
                    handle.mark_remote_closed();
                    let _ = err_tx.try_send(err);
                    return;
                }
            };
            // Only the dialed server may speak on this link.
            if packet.source != server_key {
                continue;
            }
            let Ok(message) = cipher.decode(&packet.payload) else {
                continue;
            };
            if message.session_id != session_id {
                continue;
            }

            match message.typ {
                SIGNAL_DIAL_ACK => {
                    let _ = ack_tx.try_send(());
                }
                SIGNAL_DATA => {
                    handle.push_incoming(message.payload).await;
                }
                SIGNAL_CLOSE => {
                    handle.mark_remote_closed();
                }
                _ => {}
            }
        }
    });

    if let Err(err) = link
        .send(&SignalMessage {
            typ: SIGNAL_DIAL_INIT,
            session_id,
            payload: Vec::new(),
        })
        .await
    {
        client.close();
        return Err(err);
    }

    tokio::select! {
        Some(()) = ack_rx.recv() => {
            info!("relay session established");
            Ok(conn)
        }
        Some(err) = err_rx.recv() => {
            client.close();
            Err(RelayError::Rendezvous(format!(
                "relay session failed before ack: {}",
                err
            )))
        }
        _ = tokio::time::sleep(ACK_TIMEOUT) => {
            client.close();
            Err(RelayError::Timeout("relay session acknowledgement".into()))
        }
    }
}
