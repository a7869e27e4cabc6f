//! Long-lived secp256k1 identity keys and handshake auth signatures.
//!
//! Each endpoint owns exactly one identity key pair for its process lifetime
//! (longer, if persisted). The public half is a 33-byte compressed point; it
//! is what peer stores pin and what the handshake proves possession of, via
//! BIP 340-style Schnorr signatures over 32-byte challenge hashes.

use std::fmt;

use secp256k1::{
    schnorr, All, Keypair, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{kdf::SESSION_ID_LEN, rng::Crng};

pub const PUBLIC_KEY_LEN: usize = 33;
pub const SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    #[error("identity public key must be a valid 33-byte compressed point")]
    InvalidPublicKey,

    #[error("identity secret key is out of range")]
    InvalidSecretKey,

    #[error("auth signature must be exactly 64 bytes")]
    InvalidSignatureLength,

    #[error("auth signature does not verify under the expected key")]
    BadSignature,
}

/// A secp256k1 identity key pair. Sign with the pair rather than the raw
/// secret so the public key used for verification can never be attacker
/// supplied.
pub struct IdentityKeyPair {
    secp: Secp256k1<All>,
    keypair: Keypair,
    public: IdentityPubKey,
}

/// A 33-byte compressed secp256k1 public key. Validated on-curve at
/// construction, so a held value is always a usable point.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct IdentityPubKey(PublicKey);

/// A 64-byte Schnorr signature over a 32-byte challenge hash.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct AuthSignature(schnorr::Signature);

impl IdentityKeyPair {
    pub fn from_rng(rng: &mut impl Crng) -> Self {
        let secp = Secp256k1::new();
        loop {
            // from_slice rejects 0 and >= the curve order; resampling is the
            // standard rejection loop and terminates essentially immediately.
            let candidate: [u8; SECRET_KEY_LEN] = rng.gen_bytes();
            if let Ok(secret) = SecretKey::from_slice(&candidate) {
                return Self::from_secret(secp, secret);
            }
        }
    }

    pub fn from_secret_bytes(
        bytes: &[u8; SECRET_KEY_LEN],
    ) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| Error::InvalidSecretKey)?;
        Ok(Self::from_secret(secp, secret))
    }

    fn from_secret(secp: Secp256k1<All>, secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let public = IdentityPubKey(PublicKey::from_secret_key(&secp, &secret));
        Self {
            secp,
            keypair,
            public,
        }
    }

    pub fn public(&self) -> IdentityPubKey {
        self.public
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.keypair.secret_bytes()
    }

    /// Sign a 32-byte challenge hash.
    ///
    /// Deterministic (no auxiliary randomness) so a given (key, challenge)
    /// pair always produces the same signature; the challenge itself binds
    /// the fresh session id.
    pub fn sign_challenge(&self, challenge: &[u8; 32]) -> AuthSignature {
        let msg = Message::from_digest(*challenge);
        AuthSignature(self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl IdentityPubKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(Error::InvalidPublicKey);
        }
        PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidPublicKey)
    }

    pub fn serialize(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.serialize()
    }

    pub(crate) fn inner(&self) -> &PublicKey {
        &self.0
    }

    /// Verify a Schnorr auth signature over a 32-byte challenge hash.
    pub fn verify_challenge(
        &self,
        challenge: &[u8; 32],
        sig: &AuthSignature,
    ) -> Result<(), Error> {
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest(*challenge);
        let (xonly, _parity) = self.0.x_only_public_key();
        secp.verify_schnorr(&sig.0, &msg, &xonly)
            .map_err(|_| Error::BadSignature)
    }

    /// A short human-readable digest of the key, shown to users when an
    /// unknown peer key must be accepted or rejected.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.serialize());
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for IdentityPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPubKey({})", self.fingerprint())
    }
}

impl fmt::Display for IdentityPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.serialize()))
    }
}

impl Serialize for IdentityPubKey {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(IdentityPubKey::serialize(self)))
    }
}

impl<'de> Deserialize<'de> for IdentityPubKey {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(de)?;
        let bytes = hex::decode(s).map_err(de::Error::custom)?;
        IdentityPubKey::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

impl AuthSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        schnorr::Signature::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidSignatureLength)
    }

    pub fn serialize(&self) -> [u8; SIGNATURE_LEN] {
        self.0.serialize()
    }
}

impl fmt::Debug for AuthSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthSignature({})", hex::encode(self.serialize()))
    }
}

/// The challenge hash construction used by both handshake challenges:
/// `SHA256(tag || session_id || pinned_pubkey)`, where `tag` is `b"i"` for a
/// challenge and `b"p"` for a propose, and `session_id` belongs to the
/// direction the message is transmitted on.
pub fn challenge_hash(
    tag: u8,
    session_id: &[u8; SESSION_ID_LEN],
    key: &IdentityPubKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(session_id);
    hasher.update(key.serialize());
    hasher.finalize().into()
}
