//! The remsign authenticated encrypted transport.
//!
//! Layering, bottom to top:
//!
//! - [`session`]: per-direction AEAD sub-sessions and the rekey policy.
//! - [`handshake`]: the sans-I/O mutual-authentication state machine.
//! - [`conn`]: the async driver tying both to an ordered byte stream.
//! - [`peers`] / [`cookie`]: the two ways an acceptable peer identity key
//!   can be pinned.
//!
//! All errors here are connection-fatal ([`Error`]); once a connection
//! surfaces one it is gone and the consumer reconnects if it cares to.

pub mod conn;
pub mod cookie;
pub mod error;
pub mod handshake;
pub mod peers;
pub mod session;

pub use conn::{accept, connect, Config, Connection, KeyPromptRequest};
pub use cookie::CookieMode;
pub use error::Error;
pub use handshake::KeyPrompt;
pub use peers::{AddOutcome, PeerStore};
