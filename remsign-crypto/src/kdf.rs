//! HKDF-SHA256 derivation of per-direction session key material.
//!
//! Session establishment runs ECDH between one side's ephemeral scalar and
//! the other side's declared ephemeral public key; the shared secret is then
//! expanded into the full key material for one direction:
//!
//! ```text
//! okm := HKDF-SHA256(salt=DOMAIN_SALT, ikm=ecdh_secret, info=direction_label)
//! okm[ 0..32] -> body_key    (ChaCha20-Poly1305 payload key)
//! okm[32..64] -> size_key    (ChaCha20 length-prefix key)
//! okm[64..88] -> session_id
//! ```
//!
//! Both directions derive from the same ECDH secret but with distinct info
//! labels, so the two sub-sessions share nothing but their lineage. Rekeying
//! feeds the current keys back through HKDF (optionally mixing in extra
//! context such as the authenticated identity keys) and leaves the session id
//! untouched.

use hkdf::Hkdf;
use secp256k1::{ecdh::SharedSecret, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::rng::Crng;

pub const BODY_KEY_LEN: usize = 32;
pub const SIZE_KEY_LEN: usize = 32;
pub const SESSION_ID_LEN: usize = 24;

const OKM_LEN: usize = BODY_KEY_LEN + SIZE_KEY_LEN + SESSION_ID_LEN;

const DOMAIN_SALT: &[u8] = b"REMSIGN::AeadSession";
const REKEY_INFO: &[u8] = b"REMSIGN::Rekey";

/// Which sub-session a set of keys belongs to, named from the initiator's
/// point of view. The initiator's outbound direction is the responder's
/// inbound one and vice versa; both ends derive both directions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    fn label(self) -> &'static [u8] {
        match self {
            Self::InitiatorToResponder => b"initiator->responder",
            Self::ResponderToInitiator => b"responder->initiator",
        }
    }
}

/// The symmetric key material of one sub-session. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub body_key: [u8; BODY_KEY_LEN],
    pub size_key: [u8; SIZE_KEY_LEN],
    pub session_id: [u8; SESSION_ID_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("body_key", &"..")
            .field("size_key", &"..")
            .field("session_id", &"..")
            .finish()
    }
}

impl SessionKeys {
    /// Derive the key material for one direction from an ECDH shared secret.
    pub fn derive(shared_secret: &[u8; 32], direction: Direction) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(DOMAIN_SALT), shared_secret);
        let mut okm = [0u8; OKM_LEN];
        hk.expand(direction.label(), &mut okm)
            .expect("88 bytes is far below the HKDF-SHA256 output limit");
        let keys = Self::split(&okm);
        okm.zeroize();
        keys
    }

    /// Replace the symmetric keys in place, deriving the next generation from
    /// the current one. `context` is mixed into the info parameter; the
    /// post-authentication rekey passes both identity public keys here so
    /// that established-phase traffic keys depend on who was authenticated.
    /// The session id is unchanged by rekeying.
    pub fn rekey(&mut self, context: &[&[u8]]) {
        let mut ikm = [0u8; BODY_KEY_LEN + SIZE_KEY_LEN];
        ikm[..BODY_KEY_LEN].copy_from_slice(&self.body_key);
        ikm[BODY_KEY_LEN..].copy_from_slice(&self.size_key);

        let mut info = Vec::with_capacity(
            REKEY_INFO.len() + context.iter().map(|c| c.len()).sum::<usize>(),
        );
        info.extend_from_slice(REKEY_INFO);
        for part in context {
            info.extend_from_slice(part);
        }

        let hk = Hkdf::<Sha256>::new(Some(&self.session_id), &ikm);
        let mut okm = [0u8; BODY_KEY_LEN + SIZE_KEY_LEN];
        hk.expand(&info, &mut okm)
            .expect("64 bytes is far below the HKDF-SHA256 output limit");

        self.body_key.copy_from_slice(&okm[..BODY_KEY_LEN]);
        self.size_key.copy_from_slice(&okm[BODY_KEY_LEN..]);

        ikm.zeroize();
        okm.zeroize();
    }

    fn split(okm: &[u8; OKM_LEN]) -> Self {
        let mut keys = Self {
            body_key: [0u8; BODY_KEY_LEN],
            size_key: [0u8; SIZE_KEY_LEN],
            session_id: [0u8; SESSION_ID_LEN],
        };
        keys.body_key.copy_from_slice(&okm[..BODY_KEY_LEN]);
        keys.size_key
            .copy_from_slice(&okm[BODY_KEY_LEN..BODY_KEY_LEN + SIZE_KEY_LEN]);
        keys.session_id
            .copy_from_slice(&okm[BODY_KEY_LEN + SIZE_KEY_LEN..]);
        keys
    }
}

/// An ephemeral ECDH key, generated per handshake and consumed by the single
/// key agreement it exists for.
pub struct EphemeralKey {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKey {
    pub fn from_rng(rng: &mut impl Crng) -> Self {
        let secp = Secp256k1::new();
        let secret = loop {
            let candidate: [u8; 32] = rng.gen_bytes();
            if let Ok(secret) = SecretKey::from_slice(&candidate) {
                break secret;
            }
        };
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 33] {
        self.public.serialize()
    }

    /// Run the key agreement against the peer's declared ephemeral public
    /// key, consuming the scalar.
    pub fn agree(self, remote_public: &PublicKey) -> [u8; 32] {
        SharedSecret::new(remote_public, &self.secret).secret_bytes()
    }
}
