//! Authenticated-encrypted signal envelopes.
//!
//! Control and data messages between a dialing client and the service are
//! carried as single rendezvous packets framed to look like WireGuard
//! "transport data" packets: a 4-byte type header, a fake receiver index
//! (the first 4 bytes of the session id), and a little-endian send counter
//! that doubles as the NaCl box nonce prefix. The counter provides nonce
//! uniqueness per keypair, not replay protection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use thiserror::Error;

pub(crate) const SIGNAL_DIAL_INIT: u8 = 1;
pub(crate) const SIGNAL_DIAL_ACK: u8 = 2;
pub(crate) const SIGNAL_DATA: u8 = 3;
pub(crate) const SIGNAL_CLOSE: u8 = 4;

/// WireGuard type 4 (transport data), reserved bytes zero.
const WG_TRANSPORT_HEADER: [u8; 4] = [0x04, 0x00, 0x00, 0x00];

/// 16 (header) + 16 (box MAC) + 2 (inner length) + 17 (minimum inner).
const MIN_ENVELOPE_LEN: usize = 51;

/// Minimum inner record: type(1) + session id(16).
const MIN_INNER_LEN: usize = 17;

static SIGNAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One decoded control or data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignalMessage {
    pub typ: u8,
    pub session_id: [u8; 16],
    pub payload: Vec<u8>,
}

/// Why an inbound envelope was rejected.
///
/// Receive loops drop these silently; they may be stale or adversarial.
#[derive(Debug, Error)]
pub(crate) enum SignalError {
    #[error("signal message too short")]
    TooShort,

    #[error("invalid signal message type")]
    BadHeader,

    #[error("signal message decryption failed")]
    Decrypt,

    #[error("invalid signal inner length")]
    BadInnerLength,

    #[error("signal message encryption failed")]
    Seal,
}

/// Precomputed NaCl box state for one (local secret, peer public) pair.
#[derive(Clone)]
pub(crate) struct SignalCipher {
    salsa: Arc<SalsaBox>,
}

impl SignalCipher {
    pub(crate) fn new(private_key: &[u8; 32], peer_public_key: &[u8; 32]) -> Self {
        let secret = SecretKey::from(*private_key);
        let peer = PublicKey::from(*peer_public_key);
        Self {
            salsa: Arc::new(SalsaBox::new(&peer, &secret)),
        }
    }

    /// Encode one message into a sealed envelope.
    pub(crate) fn encode(&self, message: &SignalMessage) -> Result<Vec<u8>, SignalError> {
        let inner_len = 1 + 16 + message.payload.len();
        // Pad the plaintext (including the 2-byte length) to a 16-byte boundary.
        let mut inner_pad = 16 - ((inner_len + 2) % 16);
        if inner_pad == 16 {
            inner_pad = 0;
        }

        let mut inner = Vec::with_capacity(2 + inner_len + inner_pad);
        inner.extend_from_slice(&(inner_len as u16).to_le_bytes());
        inner.push(message.typ);
        inner.extend_from_slice(&message.session_id);
        inner.extend_from_slice(&message.payload);
        inner.resize(2 + inner_len + inner_pad, 0);

        let counter = SIGNAL_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let counter_bytes = counter.to_le_bytes();

        let mut nonce_bytes = [0u8; 24];
        nonce_bytes[..8].copy_from_slice(&counter_bytes);
        let nonce = crypto_box::Nonce::clone_from_slice(&nonce_bytes);

        let encrypted = self
            .salsa
            .encrypt(&nonce, inner.as_slice())
            .map_err(|_| SignalError::Seal)?;

        let mut out = Vec::with_capacity(16 + encrypted.len());
        out.extend_from_slice(&WG_TRANSPORT_HEADER);
        out.extend_from_slice(&message.session_id[..4]);
        out.extend_from_slice(&counter_bytes);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    /// Decode and authenticate one envelope.
    pub(crate) fn decode(&self, raw: &[u8]) -> Result<SignalMessage, SignalError> {
        if raw.len() < MIN_ENVELOPE_LEN {
            return Err(SignalError::TooShort);
        }
        if raw[..4] != WG_TRANSPORT_HEADER {
            return Err(SignalError::BadHeader);
        }

        let mut nonce_bytes = [0u8; 24];
        nonce_bytes[..8].copy_from_slice(&raw[8..16]);
        let nonce = crypto_box::Nonce::clone_from_slice(&nonce_bytes);

        let inner = self
            .salsa
            .decrypt(&nonce, &raw[16..])
            .map_err(|_| SignalError::Decrypt)?;

        if inner.len() < 2 + MIN_INNER_LEN {
            return Err(SignalError::BadInnerLength);
        }
        let inner_len = u16::from_le_bytes([inner[0], inner[1]]) as usize;
        if inner_len < MIN_INNER_LEN || 2 + inner_len > inner.len() {
            return Err(SignalError::BadInnerLength);
        }

        let record = &inner[2..2 + inner_len];
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&record[1..17]);

        Ok(SignalMessage {
            typ: record[0],
            session_id,
            payload: record[17..].to_vec(),
        })
    }
}
