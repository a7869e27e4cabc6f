//! ChaCha20-Poly1305 sealing in the OpenSSH variant.
//!
//! This is the construction from OpenSSH's `chacha20-poly1305@openssh.com`,
//! which predates RFC 8439 and differs from it in two load-bearing ways:
//!
//! - Nonces are 64 bits (the packet sequence number), not 96.
//! - The 4-byte length prefix is encrypted under its own dedicated key
//!   (`size_key`), so a passive observer cannot learn message boundaries
//!   without first breaking the cipher.
//!
//! Layout of one sealed frame body:
//!
//! ```text
//! [ 4  bytes: length prefix, encrypted under size_key            ]
//! [ N  bytes: body ciphertext, encrypted under body_key, block 1+ ]
//! [ 16 bytes: Poly1305 tag over both ciphertext fields           ]
//! ```
//!
//! The Poly1305 one-time key is the first 32 bytes of the `body_key`
//! keystream at block 0; body encryption starts at block 1. Tags are
//! compared in constant time. The two RFC/OpenSSH variants are NOT
//! interoperable; do not swap this module for the `chacha20poly1305` crate.

use chacha20::{
    cipher::{KeyIvInit, StreamCipher, StreamCipherSeek},
    ChaCha20Legacy,
};
use poly1305::{universal_hash::KeyInit, Poly1305};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

use crate::kdf::SessionKeys;

pub const TAG_LEN: usize = 16;
pub const LEN_PREFIX_LEN: usize = 4;

/// Added wire overhead of a sealed frame body vs. its plaintext.
pub const SEAL_OVERHEAD: usize = LEN_PREFIX_LEN + TAG_LEN;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    #[error("sealed frame is too short to contain a prefix and tag")]
    ShortInput,

    #[error("poly1305 tag mismatch")]
    BadTag,

    #[error("decrypted length prefix disagrees with the frame size")]
    LengthMismatch,
}

fn nonce(seq: u32) -> [u8; 8] {
    u64::from(seq).to_le_bytes()
}

fn size_cipher(keys: &SessionKeys, seq: u32) -> ChaCha20Legacy {
    ChaCha20Legacy::new(&keys.size_key.into(), &nonce(seq).into())
}

fn body_cipher(keys: &SessionKeys, seq: u32) -> ChaCha20Legacy {
    ChaCha20Legacy::new(&keys.body_key.into(), &nonce(seq).into())
}

/// The Poly1305 key for this (key, seq) pair: keystream block 0 of the body
/// cipher.
fn poly_key(keys: &SessionKeys, seq: u32) -> Poly1305 {
    let mut block = [0u8; 32];
    body_cipher(keys, seq).apply_keystream(&mut block);
    let mac = Poly1305::new(poly1305::Key::from_slice(&block));
    block.zeroize();
    mac
}

/// Seal a plaintext frame body. Returns
/// `enc(len) || enc(body) || tag`, ready for the wire.
pub fn seal(keys: &SessionKeys, seq: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEAL_OVERHEAD + body.len());

    let mut len_field = (body.len() as u32).to_le_bytes();
    size_cipher(keys, seq).apply_keystream(&mut len_field);
    out.extend_from_slice(&len_field);

    out.extend_from_slice(body);
    let mut cipher = body_cipher(keys, seq);
    // block 0 is reserved for the Poly1305 key
    cipher.seek(64u64);
    cipher.apply_keystream(&mut out[LEN_PREFIX_LEN..]);

    let tag = poly_key(keys, seq).compute_unpadded(&out);
    out.extend_from_slice(&tag);
    out
}

/// Decrypt just the 4-byte length prefix. Used by stream readers to learn how
/// many more bytes the current frame occupies before the tag can be checked.
pub fn open_len(keys: &SessionKeys, seq: u32, prefix: &[u8; 4]) -> u32 {
    let mut field = *prefix;
    size_cipher(keys, seq).apply_keystream(&mut field);
    u32::from_le_bytes(field)
}

/// Open a full sealed frame (`enc(len) || enc(body) || tag`), verifying the
/// tag before any plaintext is produced.
pub fn open(
    keys: &SessionKeys,
    seq: u32,
    sealed: &[u8],
) -> Result<Vec<u8>, Error> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(Error::ShortInput);
    }
    let (msg, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let expected = poly_key(keys, seq).compute_unpadded(msg);
    if !bool::from(expected.ct_eq(poly1305::Tag::from_slice(tag))) {
        return Err(Error::BadTag);
    }

    let mut prefix = [0u8; LEN_PREFIX_LEN];
    prefix.copy_from_slice(&msg[..LEN_PREFIX_LEN]);
    let body_len = open_len(keys, seq, &prefix) as usize;
    if body_len != msg.len() - LEN_PREFIX_LEN {
        return Err(Error::LengthMismatch);
    }

    let mut body = msg[LEN_PREFIX_LEN..].to_vec();
    let mut cipher = body_cipher(keys, seq);
    cipher.seek(64u64);
    cipher.apply_keystream(&mut body);
    Ok(body)
}
