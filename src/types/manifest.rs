//! Per-package files manifest: the `files.plist` artifact contract.

use crate::plist::{Mapping, Sequence, Value};

/// A single regular-file entry: relative path, sha256 hex digest, and
/// whether it is allowed to diverge from that digest (a "mutable" file,
/// e.g. a log or cache file shipped inside the package).
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to `rootdir`.
    pub path: String,
    /// Lowercase hex sha256 digest recorded at packaging time.
    pub sha256: String,
    /// Whether hash mismatches on this file are tolerated.
    pub mutable: bool,
}

/// A configuration-file entry: relative path plus the digest recorded at
/// packaging time (used for the three-way merge rule).
#[derive(Debug, Clone)]
pub struct ConfFileEntry {
    /// Path relative to `rootdir`.
    pub path: String,
    /// Lowercase hex sha256 digest recorded at packaging time.
    pub sha256: String,
}

/// A symlink entry: relative path and recorded target.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    /// Path relative to `rootdir`.
    pub path: String,
    /// Target the symlink pointed to at packaging time.
    pub target: String,
}

/// The files manifest for one installed (or about-to-be-installed) package.
#[derive(Debug, Clone, Default)]
pub struct FilesManifest {
    /// Regular files.
    pub files: Vec<FileEntry>,
    /// Configuration files subject to the three-way merge rule.
    pub conf_files: Vec<ConfFileEntry>,
    /// Symbolic links.
    pub links: Vec<LinkEntry>,
    /// Plain directories owned by the package.
    pub dirs: Vec<String>,
}

impl FilesManifest {
    /// Builds a manifest from its property-tree mapping representation.
    #[must_use]
    pub fn from_mapping(map: &Mapping) -> Self {
        let files = map
            .get_seq("files")
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_map)
                    .map(|m| FileEntry {
                        path: m.get_str("file").unwrap_or_default().to_string(),
                        sha256: m.get_str("sha256").unwrap_or_default().to_string(),
                        mutable: m.get_bool("mutable"),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let conf_files = map
            .get_seq("conf_files")
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_map)
                    .map(|m| ConfFileEntry {
                        path: m.get_str("file").unwrap_or_default().to_string(),
                        sha256: m.get_str("sha256").unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let links = map
            .get_seq("links")
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_map)
                    .map(|m| LinkEntry {
                        path: m.get_str("file").unwrap_or_default().to_string(),
                        target: m.get_str("target").unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let dirs = map
            .get_seq("dirs")
            .map(|seq| seq.strings().map(str::to_string).collect())
            .unwrap_or_default();
        Self { files, conf_files, links, dirs }
    }

    /// Serializes this manifest into its property-tree mapping representation.
    #[must_use]
    pub fn to_mapping(&self) -> Mapping {
        let mut map = Mapping::new();
        let files: Sequence = self
            .files
            .iter()
            .map(|f| {
                let mut m = Mapping::new();
                let _ = m.insert("file", Value::str(&f.path));
                let _ = m.insert("sha256", Value::str(&f.sha256));
                let _ = m.insert("mutable", Value::Bool(f.mutable));
                Value::Map(m)
            })
            .collect();
        let _ = map.insert("files", Value::Seq(files));

        let conf_files: Sequence = self
            .conf_files
            .iter()
            .map(|f| {
                let mut m = Mapping::new();
                let _ = m.insert("file", Value::str(&f.path));
                let _ = m.insert("sha256", Value::str(&f.sha256));
                Value::Map(m)
            })
            .collect();
        let _ = map.insert("conf_files", Value::Seq(conf_files));

        let links: Sequence = self
            .links
            .iter()
            .map(|l| {
                let mut m = Mapping::new();
                let _ = m.insert("file", Value::str(&l.path));
                let _ = m.insert("target", Value::str(&l.target));
                Value::Map(m)
            })
            .collect();
        let _ = map.insert("links", Value::Seq(links));

        let dirs: Sequence = self.dirs.iter().map(Value::str).collect();
        let _ = map.insert("dirs", Value::Seq(dirs));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_mapping() {
        let manifest = FilesManifest {
            files: vec![FileEntry {
                path: "usr/bin/foo".into(),
                sha256: "ab".repeat(32),
                mutable: false,
            }],
            conf_files: vec![ConfFileEntry {
                path: "etc/foo.conf".into(),
                sha256: "cd".repeat(32),
            }],
            links: vec![LinkEntry {
                path: "usr/bin/foo-link".into(),
                target: "foo".into(),
            }],
            dirs: vec!["usr/share/foo".into()],
        };
        let map = manifest.to_mapping();
        let back = FilesManifest::from_mapping(&map);
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.files[0].path, "usr/bin/foo");
        assert_eq!(back.conf_files[0].sha256, "cd".repeat(32));
        assert_eq!(back.links[0].target, "foo");
        assert_eq!(back.dirs, vec!["usr/share/foo".to_string()]);
    }
}
