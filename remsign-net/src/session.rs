//! Per-direction AEAD sub-sessions and the rekey policy.
//!
//! A connection holds one [`Session`], which is nothing more than two
//! independent [`SubSession`]s: one sealing outbound frames, one opening
//! inbound frames. The two directions share lineage (both derive from the
//! same ECDH agreement) but nothing else; rekeying one never affects the
//! other.
//!
//! A sub-session MUST be rekeyed before any of these thresholds is crossed:
//!
//! - [`REKEY_BYTES`] of payload sealed under the current key,
//! - [`REKEY_INTERVAL`] of wall-clock time since the last rekey,
//! - an explicit `AeadRekey` frame from the peer (inbound only).
//!
//! The sequence number doubles as the AEAD nonce, so the byte/time bounds
//! also guarantee a (key, nonce) pair is never reused.

use std::time::{Duration, Instant};

use remsign_crypto::{
    cipher,
    kdf::{Direction, SessionKeys, SESSION_ID_LEN},
};

pub use remsign_crypto::cipher::{LEN_PREFIX_LEN, SEAL_OVERHEAD, TAG_LEN};

/// Rekey after this many payload bytes under one key (1 GiB).
pub const REKEY_BYTES: u64 = 1024 * 1024 * 1024;

/// Rekey after this much wall-clock time under one key.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(600);

/// Which end of the connection this process is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn outbound(self) -> Direction {
        match self {
            Self::Initiator => Direction::InitiatorToResponder,
            Self::Responder => Direction::ResponderToInitiator,
        }
    }

    fn inbound(self) -> Direction {
        match self {
            Self::Initiator => Direction::ResponderToInitiator,
            Self::Responder => Direction::InitiatorToResponder,
        }
    }
}

/// One direction of an established session.
#[derive(Debug)]
pub struct SubSession {
    keys: SessionKeys,
    seq: u32,
    bytes_since_rekey: u64,
    last_rekey_at: Instant,
}

impl SubSession {
    fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            seq: 0,
            bytes_since_rekey: 0,
            last_rekey_at: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.keys.session_id
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Whether the rekey policy requires a rekey before the next frame is
    /// sealed (or after the current inbound frame was opened).
    pub fn needs_rekey(&self) -> bool {
        self.bytes_since_rekey >= REKEY_BYTES
            || self.last_rekey_at.elapsed() >= REKEY_INTERVAL
    }

    /// Replace the symmetric keys and reset the nonce counter. `context` is
    /// empty for periodic rekeys; the post-handshake rekey passes the two
    /// authenticated identity keys.
    pub fn rekey(&mut self, context: &[&[u8]]) {
        self.keys.rekey(context);
        self.seq = 0;
        self.bytes_since_rekey = 0;
        self.last_rekey_at = Instant::now();
    }

    /// Seal one frame body, consuming the current sequence number.
    pub fn seal(&mut self, body: &[u8]) -> Vec<u8> {
        let sealed = cipher::seal(&self.keys, self.seq, body);
        self.advance(body.len());
        sealed
    }

    /// Decrypt a length prefix without consuming the sequence number; used
    /// by stream readers to size the pending read.
    pub fn open_len(&self, prefix: &[u8; LEN_PREFIX_LEN]) -> u32 {
        cipher::open_len(&self.keys, self.seq, prefix)
    }

    /// Open one sealed frame body, consuming the current sequence number on
    /// success. Failure poisons nothing because the connection dies with it.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, cipher::Error> {
        let body = cipher::open(&self.keys, self.seq, sealed)?;
        self.advance(body.len());
        Ok(body)
    }

    fn advance(&mut self, payload_len: usize) {
        // The rekey policy bounds seq well below u32::MAX; wrapping_add
        // avoids a debug-overflow panic on a misbehaving peer.
        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_rekey += payload_len as u64;
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_bytes_since_rekey(&mut self, bytes: u64) {
        self.bytes_since_rekey = bytes;
    }
}

/// Both directions of an established session.
#[derive(Debug)]
pub struct Session {
    pub inbound: SubSession,
    pub outbound: SubSession,
}

impl Session {
    /// Derive both sub-sessions from an ECDH shared secret. Initiator and
    /// responder call this with the same secret and their own role; the
    /// derived directions cross-match.
    pub fn derive(shared_secret: &[u8; 32], role: Role) -> Self {
        Self {
            inbound: SubSession::new(SessionKeys::derive(
                shared_secret,
                role.inbound(),
            )),
            outbound: SubSession::new(SessionKeys::derive(
                shared_secret,
                role.outbound(),
            )),
        }
    }

    /// Rekey both directions at once; only used at handshake completion so
    /// established-phase traffic runs under keys bound to the authenticated
    /// identities.
    pub fn rekey_both(&mut self, context: &[&[u8]]) {
        self.inbound.rekey(context);
        self.outbound.rekey(context);
    }
}
