//! Connection-fatal error kinds.
//!
//! Every error in this enum tears down the connection; there is no partial
//! trust state and no retry below the connection level. Dispatcher-level
//! errors (which are reply-level and never close the connection) live in
//! `remsign-signer`.

use remsign_wire::frame;
use thiserror::Error;

use crate::handshake::State;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// A frame whose length prefix disagrees with its body, is zero, or
    /// exceeds the 16 MiB bound.
    #[error("malformed frame")]
    MalformedFrame,

    /// A packet type outside the protocol table.
    #[error("unknown packet type {0}")]
    UnknownType(u8),

    /// A packet type that is valid in general but not in the current state,
    /// e.g. a `SinglePacket` before the handshake finished.
    #[error("unexpected packet in handshake state {0:?}")]
    UnexpectedState(State),

    /// The underlying stream closed or errored.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session establishment took longer than the configured limit.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Tag mismatch, implausible decrypted length, or truncated ciphertext.
    /// Indistinguishable cases by design; the connection is simply dead.
    #[error("AEAD decryption failure")]
    AeadFailure,

    /// The peer presented (or proposed) an identity key we do not accept.
    #[error("unknown peer identity key")]
    UnknownPeerKey,

    /// An auth signature failed to verify, or a challenge hash was not the
    /// expected construction.
    #[error("invalid auth signature")]
    SignatureInvalid,

    /// Cookie mode was requested but the cookie file is absent or not a
    /// valid 33-byte key.
    #[error("cookie file missing or malformed")]
    CookieMissing,
}

impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Self {
        match err {
            frame::Error::Malformed => Self::MalformedFrame,
            frame::Error::UnknownType(code) => Self::UnknownType(code),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_err: std::io::Error) -> Self {
        Self::ConnectionClosed
    }
}
