//! Cryptographic primitives for the remsign transport and signer.
//!
//! This crate contains everything below the wire layer:
//!
//! - [`rng`]: CSPRNG plumbing shared by all crates.
//! - [`identity`]: long-lived secp256k1 identity keys and the Schnorr
//!   signatures used to prove possession of them during the handshake.
//! - [`kdf`]: HKDF-SHA256 derivation of per-direction session key material,
//!   including rekeys.
//! - [`cipher`]: the ChaCha20-Poly1305 AEAD in its OpenSSH variant (64-bit
//!   nonces, separately-keyed length prefix). This is NOT the IETF variant
//!   and the two do not interoperate.
//! - [`secret`]: zeroizing containers for passwords and seed material.

pub mod cipher;
pub mod identity;
pub mod kdf;
pub mod rng;
pub mod secret;
