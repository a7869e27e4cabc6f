//! Wire formats for the remsign transport.
//!
//! Two layers live here:
//!
//! - [`frame`]: the typed, length-prefixed packets that cross the socket,
//!   both during the handshake (plaintext) and after (sealed by the AEAD
//!   session in `remsign-net`).
//! - [`envelope`]: the request/reply envelope carried inside established
//!   `SinglePacket` frames between terminal and signer.
//!
//! All integers are little-endian.

pub mod envelope;
pub mod frame;

pub use envelope::Envelope;
pub use frame::{Frame, PacketType};
