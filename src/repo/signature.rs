//! Repository and package signature verification: fingerprinting, a
//! trusted-key store, and detached RSA-SHA256 verification.
//!
//! Grounded on spec.md §4.4 "Signature verification" and §6's
//! `metadir/keys/<fingerprint>.plist` layout; uses `rsa`+`sha2` the way the
//! rest of the crate leans on `sha2` for content hashing.

use std::fs;
use std::path::{Path, PathBuf};

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::plist::{self, Mapping, Value};

/// Computes the trusted-key fingerprint for a DER-encoded RSA public key:
/// lowercase hex SHA-256 of the key bytes.
#[must_use]
pub fn fingerprint(public_key_der: &[u8]) -> String {
    let digest = Sha256::digest(public_key_der);
    hex::encode(digest)
}

/// Verifies a detached RSA-SHA256 signature over `data` using a PKCS#1 DER
/// public key.
///
/// # Errors
/// Returns [`Error::IntegrityFailure`] if the key or signature is malformed,
/// or if verification fails.
pub fn verify_detached(public_key_der: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
        .map_err(|e| Error::IntegrityFailure(format!("malformed public key: {e}")))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = Signature::try_from(signature)
        .map_err(|e| Error::IntegrityFailure(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(data, &sig)
        .map_err(|e| Error::IntegrityFailure(format!("signature verification failed: {e}")))
}

/// The trusted-key store: `metadir/keys/<fingerprint>.plist`.
#[derive(Debug, Clone)]
pub struct KeyStore {
    keydir: PathBuf,
}

impl KeyStore {
    /// Opens a key store rooted at `keydir` (created lazily on first trust).
    #[must_use]
    pub fn new(keydir: impl Into<PathBuf>) -> Self {
        Self { keydir: keydir.into() }
    }

    fn key_path(&self, fp: &str) -> PathBuf {
        self.keydir.join(format!("{fp}.plist"))
    }

    /// Whether `fingerprint` has previously been accepted.
    #[must_use]
    pub fn is_trusted(&self, fp: &str) -> bool {
        self.key_path(fp).is_file()
    }

    /// Persists acceptance of a signer's public key.
    ///
    /// # Errors
    /// Returns [`Error::IoFailure`] if the key directory cannot be created
    /// or written to.
    pub fn trust(&self, fp: &str, signer: &str, public_key_der: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.keydir)?;
        let mut map = Mapping::new();
        let _ = map.insert("signature-by", Value::str(signer));
        let _ = map.insert("public-key", Value::Bytes(public_key_der.to_vec()));
        plist::externalize_to_file(&Value::Map(map), &self.key_path(fp))?;
        Ok(())
    }

    /// Loads a previously trusted key's raw bytes, if present.
    ///
    /// # Errors
    /// Returns [`Error::IoFailure`]/[`Error::Plist`] if the stored file
    /// exists but cannot be read or parsed.
    pub fn load(&self, fp: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(fp);
        if !path.is_file() {
            return Ok(None);
        }
        let value = plist::internalize_from_file(&path)?;
        let map = value
            .as_map()
            .ok_or_else(|| Error::CorruptDatabase(format!("malformed key file: {}", path.display())))?;
        Ok(map.get("public-key").and_then(Value::as_bytes).map(<[u8]>::to_vec))
    }
}

/// Resolves a repository slug for cache-directory placement: the URL with
/// non-alphanumeric runs collapsed to `_` (spec.md §6,
/// `metadir/<slug>/<arch>-repodata`).
#[must_use]
pub fn slug_for_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut last_was_sep = false;
    for c in url.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Repodata cache path for a given `metadir`, repository `url`, and arch.
#[must_use]
pub fn repodata_cache_path(metadir: &Path, url: &str, arch: &str) -> PathBuf {
    metadir.join(slug_for_url(url)).join(format!("{arch}-repodata"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slug_for_url("https://repo.example.com/path"), "https_repo_example_com_path");
    }

    #[test]
    fn key_store_round_trips_trust() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys"));
        assert!(!store.is_trusted("deadbeef"));
        store.trust("deadbeef", "releng@example", b"fake-der-bytes").unwrap();
        assert!(store.is_trusted("deadbeef"));
        assert_eq!(store.load("deadbeef").unwrap().unwrap(), b"fake-der-bytes");
    }
}
