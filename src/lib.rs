//! NAT-traversing relay transport.
//!
//! Neither endpoint of a reverse shell can usually be dialed directly, so
//! both sides meet at a public rendezvous (DERP) node and exchange
//! authenticated-encrypted signal envelopes addressed by static Curve25519
//! keys. The relay mechanism hides behind an address-like token: a server
//! publishes a compact `ts://` destination, a client resolves it to a live
//! byte stream.
//!
//! ```text
//! ┌──────────┐   ts:// token    ┌────────────┐   framed TLS    ┌──────────┐
//! │  dialer  │ ───────────────► │ rendezvous │ ◄────────────── │  service │
//! │          │  dial-init/ack   │    node    │  data / close   │ listener │
//! └──────────┘                  └────────────┘                 └──────────┘
//! ```
//!
//! Servers call [`Service::start`] and accept streams from the returned
//! listener; clients call [`dial()`] with the published destination.

pub mod conn;
pub mod derp;
pub mod dial;
pub mod error;
pub mod keys;
pub mod listener;
pub mod service;
mod signal;
pub mod token;

#[cfg(test)]
mod test_support;

pub use conn::{RelayConn, RelayPeerAddr, RELAY_ADDR_NETWORK};
pub use dial::dial;
pub use error::{RelayError, RelayResult};
pub use listener::RelayListener;
pub use service::{Service, ServiceConfig};
pub use token::{parse_destination, Token, DESTINATION_PREFIX, TOKEN_VERSION_V1};
