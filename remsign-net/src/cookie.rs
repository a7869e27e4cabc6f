//! Cookie-based key pinning for same-host pairings.
//!
//! When signer and terminal run on the same machine, a file containing the
//! signer's identity public key (the "cookie") replaces interactive key
//! pinning: the reading side treats the cookie key as the only acceptable
//! responder key and never prompts. Cookies are not secrets; the filesystem
//! is the trust boundary.

use std::{fs, io, path::{Path, PathBuf}};

use remsign_crypto::identity::{IdentityPubKey, PUBLIC_KEY_LEN};
use tracing::info;

use crate::error::Error;

/// How this endpoint participates in cookie pinning.
#[derive(Clone, Debug, Default)]
pub enum CookieMode {
    /// Normal peer-store lookup only.
    #[default]
    NotUsed,
    /// Write our identity public key to this path on startup for a same-host
    /// peer to read.
    MakeCookie(PathBuf),
    /// Read the cookie at connect time and pin it as the only acceptable
    /// responder key, ignoring the peer store.
    ReadServerCookie(PathBuf),
}

/// Write the raw 33-byte identity key. The file is world-readable by intent.
pub fn write_cookie(path: &Path, key: &IdentityPubKey) -> io::Result<()> {
    fs::write(path, key.serialize())?;
    info!(path = %path.display(), key = %key.fingerprint(), "wrote cookie");
    Ok(())
}

/// Read a cookie. An absent file, a file of the wrong length, or bytes that
/// are not a valid compressed point all yield [`Error::CookieMissing`].
pub fn read_cookie(path: &Path) -> Result<IdentityPubKey, Error> {
    let bytes = fs::read(path).map_err(|_| Error::CookieMissing)?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(Error::CookieMissing);
    }
    IdentityPubKey::from_bytes(&bytes).map_err(|_| Error::CookieMissing)
}
