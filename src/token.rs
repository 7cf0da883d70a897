//! Destination tokens.
//!
//! A destination token is the versioned binary descriptor baked into
//! `ts://` addresses: it carries the server's rendezvous public key and an
//! optional preferred relay region. The encoded form is base64 (URL-safe,
//! no padding) and must stay opaque: a destination with path, query, or
//! fragment characters is rejected.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{RelayError, RelayResult};

/// URI scheme for relay destinations.
pub const SCHEME: &str = "ts";

/// Full destination prefix, including the scheme separator.
pub const DESTINATION_PREFIX: &str = "ts://";

/// Only supported token version.
pub const TOKEN_VERSION_V1: u8 = 1;

/// version(1) + derp public key(32) + preferred region(2)
const TOKEN_ENCODED_LEN: usize = 35;

/// The payload of a `ts://` destination.
///
/// Tokens are created once at service start and stay valid for as long as
/// the host identity bytes behind the derived key are unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub version: u8,
    pub server_derp_public_key: [u8; 32],
    /// Region hint for relay selection; 0 means unspecified.
    pub preferred_region: u16,
}

impl Token {
    /// Check structural validity: supported version, non-zero server key.
    pub fn validate(&self) -> RelayResult<()> {
        if self.version != TOKEN_VERSION_V1 {
            return Err(RelayError::Token(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.server_derp_public_key == [0u8; 32] {
            return Err(RelayError::Token("missing relay server key".into()));
        }
        Ok(())
    }

    /// Encode the token to its base64 textual form (without the scheme).
    pub fn encode(&self) -> RelayResult<String> {
        self.validate()?;

        let mut buf = Vec::with_capacity(TOKEN_ENCODED_LEN);
        buf.push(self.version);
        buf.extend_from_slice(&self.server_derp_public_key);
        buf.extend_from_slice(&self.preferred_region.to_be_bytes());

        Ok(URL_SAFE_NO_PAD.encode(buf))
    }

    /// Decode a base64 token payload.
    pub fn decode(encoded: &str) -> RelayResult<Token> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| RelayError::Token(format!("decode failed: {}", e)))?;

        if raw.len() != TOKEN_ENCODED_LEN {
            return Err(RelayError::Token(format!(
                "payload length {} (want {})",
                raw.len(),
                TOKEN_ENCODED_LEN
            )));
        }

        let mut server_derp_public_key = [0u8; 32];
        server_derp_public_key.copy_from_slice(&raw[1..33]);

        let token = Token {
            version: raw[0],
            server_derp_public_key,
            preferred_region: u16::from_be_bytes([raw[33], raw[34]]),
        };
        token.validate()?;
        Ok(token)
    }
}

/// Parse a full `ts://...` destination string into a token.
pub fn parse_destination(destination: &str) -> RelayResult<Token> {
    let destination = destination.trim();
    let payload = destination
        .strip_prefix(DESTINATION_PREFIX)
        .ok_or_else(|| {
            RelayError::Destination(format!("expected {:?} prefix", DESTINATION_PREFIX))
        })?
        .trim();

    if payload.is_empty() {
        return Err(RelayError::Destination("missing token payload".into()));
    }
    if payload.contains(['/', '?', '#']) {
        return Err(RelayError::Destination(
            "token payload must be opaque".into(),
        ));
    }

    Token::decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> Token {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_add(7);
        }
        Token {
            version: TOKEN_VERSION_V1,
            server_derp_public_key: key,
            preferred_region: 42,
        }
    }

    #[test]
    fn token_round_trip() {
        let token = sample_token();
        let encoded = token.encode().unwrap();
        let decoded = Token::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn encoded_token_is_47_chars() {
        let encoded = sample_token().encode().unwrap();
        assert_eq!(encoded.len(), 47);
    }

    #[test]
    fn encode_rejects_zero_server_key() {
        let token = Token {
            version: TOKEN_VERSION_V1,
            server_derp_public_key: [0u8; 32],
            preferred_region: 0,
        };
        assert!(token.encode().is_err());
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut token = sample_token();
        token.version = 2;
        // Encode manually; encode() would refuse the version itself.
        let mut buf = vec![token.version];
        buf.extend_from_slice(&token.server_derp_public_key);
        buf.extend_from_slice(&token.preferred_region.to_be_bytes());
        let encoded = URL_SAFE_NO_PAD.encode(buf);
        assert!(Token::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let encoded = URL_SAFE_NO_PAD.encode([1u8; 20]);
        assert!(Token::decode(&encoded).is_err());
    }

    #[test]
    fn parse_destination_round_trip() {
        let token = sample_token();
        let destination = format!("{}{}", DESTINATION_PREFIX, token.encode().unwrap());
        let parsed = parse_destination(&destination).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn parse_destination_rejects_non_opaque_payload() {
        assert!(parse_destination("ts://abc/def").is_err());
        assert!(parse_destination("ts://abc?x=1").is_err());
        assert!(parse_destination("ts://abc#frag").is_err());
    }

    #[test]
    fn parse_destination_rejects_missing_prefix_or_payload() {
        assert!(parse_destination("tcp://abc").is_err());
        assert!(parse_destination("ts://").is_err());
        assert!(parse_destination("").is_err());
    }
}
