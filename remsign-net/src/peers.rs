//! The authorised-peer store.
//!
//! A set of `(name, identity key)` pairs with unique names, plus optional
//! persistence to a single flat file. By convention the name is `host:port`
//! for servers so initiators can look up the expected key by endpoint.
//!
//! File format (all integers little-endian):
//!
//! ```text
//! [ 4 bytes: magic "PRS1"     ]
//! [ 4 bytes: version (1)      ]
//! repeated:
//!   [ 2 bytes: name length    ]
//!   [ N bytes: name, utf-8    ]
//!   [ 33 bytes: identity key  ]
//! ```
//!
//! Every mutation rewrites the whole file via write-to-temp + rename, so a
//! crash can never leave a torn file behind. A missing file at load time is
//! an empty store; a malformed one fails fast. Ephemeral stores never touch
//! disk.

use std::{collections::BTreeMap, fs, io, path::PathBuf, sync::Mutex};

use remsign_crypto::identity::{IdentityPubKey, PUBLIC_KEY_LEN};
use thiserror::Error;
use tracing::info;

pub const FILE_MAGIC: [u8; 4] = *b"PRS1";
pub const FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("peer store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer store file is malformed")]
    Malformed,

    #[error("peer store file has unsupported version {0}")]
    UnsupportedVersion(u32),
}

/// Result of [`PeerStore::add`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddOutcome {
    /// The name was new.
    Inserted,
    /// The name already mapped to this exact key; nothing happened.
    Unchanged,
    /// The name existed under a different key, which has been replaced and
    /// forgotten. Surfaced to the caller as the `KeyRotated` event.
    Rotated { old: IdentityPubKey },
}

struct Inner {
    peers: BTreeMap<String, IdentityPubKey>,
    /// `None` in ephemeral mode: all mutations stay in memory.
    path: Option<PathBuf>,
}

/// Thread-safe authorised-peer set. A single mutex serializes all access;
/// the store is small and reads happen about once per connection, so a
/// reader/writer split would buy nothing.
pub struct PeerStore {
    inner: Mutex<Inner>,
}

impl PeerStore {
    /// An in-memory store that never persists.
    pub fn ephemeral() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: BTreeMap::new(),
                path: None,
            }),
        }
    }

    /// Load the store from `path`, treating a missing file as empty. Any
    /// other read or parse problem is fatal.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PeerStoreError> {
        let path = path.into();
        let peers = match fs::read(&path) {
            Ok(bytes) => parse_file(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound =>
                BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        info!(path = %path.display(), peers = peers.len(), "loaded peer store");
        Ok(Self {
            inner: Mutex::new(Inner {
                peers,
                path: Some(path),
            }),
        })
    }

    /// Add or replace the key pinned under `name`. Key validity was already
    /// enforced when the [`IdentityPubKey`] was constructed, so insertion
    /// cannot fail on the key itself.
    pub fn add(
        &self,
        name: &str,
        key: IdentityPubKey,
    ) -> Result<AddOutcome, PeerStoreError> {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        let outcome = match inner.peers.insert(name.to_owned(), key) {
            None => AddOutcome::Inserted,
            Some(old) if old == key => AddOutcome::Unchanged,
            Some(old) => AddOutcome::Rotated { old },
        };
        if outcome != AddOutcome::Unchanged {
            inner.persist()?;
        }
        Ok(outcome)
    }

    /// Remove the peer pinned under `name`. Idempotent.
    pub fn remove(&self, name: &str) -> Result<bool, PeerStoreError> {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        let removed = inner.peers.remove(name).is_some();
        if removed {
            inner.persist()?;
        }
        Ok(removed)
    }

    /// Atomically swap the whole set; peers absent from `peers` are dropped.
    pub fn replace_all(
        &self,
        peers: BTreeMap<String, IdentityPubKey>,
    ) -> Result<(), PeerStoreError> {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        inner.peers = peers;
        inner.persist()
    }

    pub fn lookup(&self, name: &str) -> Option<IdentityPubKey> {
        let inner = self.inner.lock().expect("peer store lock poisoned");
        inner.peers.get(name).copied()
    }

    pub fn peers(&self) -> BTreeMap<String, IdentityPubKey> {
        let inner = self.inner.lock().expect("peer store lock poisoned");
        inner.peers.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("peer store lock poisoned");
        inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn persist(&self) -> Result<(), PeerStoreError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let bytes = encode_file(&self.peers);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn encode_file(peers: &BTreeMap<String, IdentityPubKey>) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        8 + peers
            .iter()
            .map(|(name, _)| 2 + name.len() + PUBLIC_KEY_LEN)
            .sum::<usize>(),
    );
    out.extend_from_slice(&FILE_MAGIC);
    out.extend_from_slice(&FILE_VERSION.to_le_bytes());
    for (name, key) in peers {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&key.serialize());
    }
    out
}

fn parse_file(
    bytes: &[u8],
) -> Result<BTreeMap<String, IdentityPubKey>, PeerStoreError> {
    if bytes.len() < 8 {
        return Err(PeerStoreError::Malformed);
    }
    let (header, mut rest) = bytes.split_at(8);
    if header[..4] != FILE_MAGIC {
        return Err(PeerStoreError::Malformed);
    }
    let version = u32::from_le_bytes(
        header[4..8].try_into().expect("split_at returned 8 bytes"),
    );
    if version != FILE_VERSION {
        return Err(PeerStoreError::UnsupportedVersion(version));
    }

    let mut peers = BTreeMap::new();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(PeerStoreError::Malformed);
        }
        let name_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];

        if rest.len() < name_len + PUBLIC_KEY_LEN {
            return Err(PeerStoreError::Malformed);
        }
        let (name_bytes, tail) = rest.split_at(name_len);
        let (key_bytes, tail) = tail.split_at(PUBLIC_KEY_LEN);
        rest = tail;

        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| PeerStoreError::Malformed)?
            .to_owned();
        let key = IdentityPubKey::from_bytes(key_bytes)
            .map_err(|_| PeerStoreError::Malformed)?;
        peers.insert(name, key);
    }
    Ok(peers)
}
