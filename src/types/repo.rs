//! Repository artifact: the `index` / `index-meta` / `stage` triple read
//! from a repodata archive.

use crate::plist::{Mapping, Value};
use crate::types::Descriptor;

/// Signing metadata for a repository (the `index-meta` section).
#[derive(Debug, Clone, Default)]
pub struct SigningMeta {
    /// Signer identity string, empty if unsigned.
    pub signature_by: String,
    /// Raw public key bytes (DER), empty if unsigned.
    pub public_key: Vec<u8>,
    /// Advertised key size in bits.
    pub public_key_size: u64,
}

impl SigningMeta {
    /// Whether this repository carries a signing identity at all.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        !self.signature_by.is_empty() && !self.public_key.is_empty()
    }

    fn from_mapping(map: &Mapping) -> Self {
        Self {
            signature_by: map.get_str("signature-by").unwrap_or_default().to_string(),
            public_key: map
                .get("public-key")
                .and_then(Value::as_bytes)
                .unwrap_or_default()
                .to_vec(),
            public_key_size: map.get_uint("public-key-size").unwrap_or(0),
        }
    }
}

/// A fully-opened repository: its real index, signing metadata, and pending
/// stage, plus the effective merged index used by lookups.
#[derive(Debug, Clone)]
pub struct RepoArtifact {
    /// The repository's URL, as configured.
    pub url: String,
    /// `pkgname -> Descriptor` from `index.plist`.
    pub index: Mapping,
    /// Signing metadata from `index-meta.plist`.
    pub meta: SigningMeta,
    /// `pkgname -> Descriptor` pending promotion from `stage.plist`.
    pub stage: Mapping,
    /// The effective, immutable lookup index: `index` unless `stage` is
    /// non-empty and stage-use is enabled for this repository, in which
    /// case `stage` entries overlay `index`.
    pub idx: Mapping,
}

impl RepoArtifact {
    /// Builds a repo artifact from the three raw plist mappings read from a
    /// repodata archive, computing the effective `idx` per spec.md §4.4:
    /// `idx = index` unless `stage` is non-empty and stage use is allowed
    /// (`use_stage || !remote`), in which case `idx` is `index` overlaid by
    /// `stage`. The result is always made immutable.
    #[must_use]
    pub fn new(url: &str, index: Mapping, meta_map: &Mapping, stage: Mapping, remote: bool, use_stage: bool) -> Self {
        let meta = SigningMeta::from_mapping(meta_map);
        let mut idx = if stage.is_empty() || (remote && !use_stage) {
            index.clone()
        } else {
            let mut merged = index.copy_mutable();
            for (name, desc) in stage.iter() {
                let _ = merged.insert(name, desc.deep_copy());
            }
            merged
        };
        idx.make_immutable();
        Self { url: url.to_string(), index, meta, stage, idx }
    }

    /// Looks up a real (non-virtual) package by name in the effective index.
    #[must_use]
    pub fn get(&self, pkgname: &str) -> Option<Descriptor> {
        self.idx
            .get_map(pkgname)
            .map(|m| Descriptor::from_mapping(m.clone()))
    }

    /// Iterates every descriptor in the effective index.
    pub fn iter(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.idx
            .iter()
            .filter_map(|(_, v)| v.as_map())
            .map(|m| Descriptor::from_mapping(m.clone()))
    }
}
