//! Rendezvous identity derivation.
//!
//! The server's rendezvous identity is a Curve25519 keypair derived
//! deterministically from the host's private key bytes, so a restarted
//! server keeps answering for destination tokens issued before the restart.

use crypto_box::SecretKey;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{RelayError, RelayResult};

/// HKDF info string binding derived keys to this protocol version.
const DERP_KEY_DERIVATION_CONTEXT: &[u8] = b"reverse_ssh/nat/v1/derp_identity";

/// Derive the rendezvous Curve25519 keypair from host private key bytes.
///
/// The same input bytes always yield the same keypair.
pub fn derive_derp_identity(host_private_key: &[u8]) -> RelayResult<([u8; 32], [u8; 32])> {
    if host_private_key.is_empty() {
        return Err(RelayError::Config(
            "host private key bytes cannot be empty".into(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(None, host_private_key);
    let mut private = [0u8; 32];
    hk.expand(DERP_KEY_DERIVATION_CONTEXT, &mut private)
        .map_err(|e| RelayError::Config(format!("failed to derive rendezvous key seed: {}", e)))?;

    clamp_curve25519_private(&mut private);
    let public = public_for(&private);
    Ok((private, public))
}

/// Generate a random rendezvous identity (used by dialing clients).
pub fn random_derp_identity() -> ([u8; 32], [u8; 32]) {
    use rand::RngCore;

    let mut private = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut private);
    clamp_curve25519_private(&mut private);
    let public = public_for(&private);
    (private, public)
}

/// X25519 scalar base multiplication.
pub(crate) fn public_for(private: &[u8; 32]) -> [u8; 32] {
    let secret = SecretKey::from(*private);
    *secret.public_key().as_bytes()
}

fn clamp_curve25519_private(k: &mut [u8; 32]) {
    k[0] &= 248;
    k[31] &= 127;
    k[31] |= 64;
}
