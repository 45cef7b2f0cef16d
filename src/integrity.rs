//! Integrity checker: validates an installed package's on-disk files
//! against its stored manifest (spec.md §4.12).

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::path_is_preserved;
use crate::error::Result;
use crate::types::FilesManifest;

/// A single diagnostic produced while checking one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A regular or conf file recorded in the manifest is absent on disk.
    MissingFile(String),
    /// An immutable file's on-disk hash no longer matches the manifest.
    HashMismatch(String),
    /// A symlink's resolved target no longer matches the manifest's record.
    LinkTargetMismatch(String),
    /// A symlink is present in the manifest but broken on disk.
    BrokenLink(String),
}

/// Per-package pass/fail summary produced by [`check_package`].
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Diagnostics collected for this package, empty when fully consistent.
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    /// Whether no diagnostics were recorded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Validates every entry in `manifest` against the files under `rootdir`
/// (spec.md §4.12): regular files by hash, conf files by existence only,
/// and symlinks by resolved-target comparison. Entries matching one of
/// `preserved` (the configured noextract/preserved-file patterns) are
/// skipped outright.
///
/// # Errors
/// This function does not itself fail on inconsistency — every problem is
/// reported as a [`Diagnostic`]; it returns `Err` only for unexpected I/O
/// failures unrelated to the files being checked (e.g. `rootdir` itself is
/// unreadable).
pub fn check_package(rootdir: &Path, manifest: &FilesManifest, preserved: &[String]) -> Result<Report> {
    let mut report = Report::default();

    for file in &manifest.files {
        if path_is_preserved(preserved, &file.path) {
            continue;
        }
        let path = rootdir.join(&file.path);
        match sha256_hex(&path) {
            Ok(actual) if actual == file.sha256 => {}
            Ok(_) if file.mutable => {}
            Ok(_) => report.diagnostics.push(Diagnostic::HashMismatch(file.path.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.diagnostics.push(Diagnostic::MissingFile(file.path.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    for conf in &manifest.conf_files {
        let path = rootdir.join(&conf.path);
        if !path.exists() {
            report.diagnostics.push(Diagnostic::MissingFile(conf.path.clone()));
        }
    }

    for link in &manifest.links {
        let path = rootdir.join(&link.path);
        match fs::read_link(&path) {
            Ok(actual_target) => {
                if actual_target.to_string_lossy() != link.target {
                    report.diagnostics.push(Diagnostic::LinkTargetMismatch(link.path.clone()));
                } else if fs::metadata(&path).is_err() {
                    report.diagnostics.push(Diagnostic::BrokenLink(link.path.clone()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.diagnostics.push(Diagnostic::BrokenLink(link.path.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::manifest::{ConfFileEntry, FileEntry, LinkEntry};

    #[test]
    fn detects_missing_and_mismatched_and_ok_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.txt"), b"hello").unwrap();
        fs::write(dir.path().join("changed.txt"), b"tampered").unwrap();

        let manifest = FilesManifest {
            files: vec![
                FileEntry { path: "ok.txt".into(), sha256: hex::encode(Sha256::digest(b"hello")), mutable: false },
                FileEntry { path: "changed.txt".into(), sha256: hex::encode(Sha256::digest(b"original")), mutable: false },
                FileEntry { path: "gone.txt".into(), sha256: "00".repeat(32), mutable: false },
            ],
            conf_files: vec![],
            links: vec![],
            dirs: vec![],
        };
        let report = check_package(dir.path(), &manifest, &[]).unwrap();
        assert!(report.diagnostics.contains(&Diagnostic::HashMismatch("changed.txt".into())));
        assert!(report.diagnostics.contains(&Diagnostic::MissingFile("gone.txt".into())));
        assert!(!report.diagnostics.iter().any(|d| matches!(d, Diagnostic::HashMismatch(p) if p == "ok.txt")));
    }

    #[test]
    fn mutable_file_tolerates_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("log.txt"), b"grew").unwrap();
        let manifest = FilesManifest {
            files: vec![FileEntry { path: "log.txt".into(), sha256: "00".repeat(32), mutable: true }],
            conf_files: vec![],
            links: vec![],
            dirs: vec![],
        };
        let report = check_package(dir.path(), &manifest, &[]).unwrap();
        assert!(report.is_ok());
    }

    #[test]
    fn missing_conf_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = FilesManifest {
            files: vec![],
            conf_files: vec![ConfFileEntry { path: "etc/app.conf".into(), sha256: "00".repeat(32) }],
            links: vec![],
            dirs: vec![],
        };
        let report = check_package(dir.path(), &manifest, &[]).unwrap();
        assert_eq!(report.diagnostics, vec![Diagnostic::MissingFile("etc/app.conf".into())]);
    }

    #[test]
    fn broken_symlink_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("nonexistent"), dir.path().join("dangling")).unwrap();
        let manifest = FilesManifest {
            files: vec![],
            conf_files: vec![],
            links: vec![LinkEntry { path: "dangling".into(), target: dir.path().join("nonexistent").to_string_lossy().into_owned() }],
            dirs: vec![],
        };
        let report = check_package(dir.path(), &manifest, &[]).unwrap();
        assert_eq!(report.diagnostics, vec![Diagnostic::BrokenLink("dangling".into())]);
    }

    #[test]
    fn noextract_pattern_matched_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // File is missing on disk entirely; it would normally be reported.
        let manifest = FilesManifest {
            files: vec![FileEntry { path: "etc/generated.state".into(), sha256: "00".repeat(32), mutable: false }],
            conf_files: vec![],
            links: vec![],
            dirs: vec![],
        };
        let report = check_package(dir.path(), &manifest, &["etc/generated.state".to_string()]).unwrap();
        assert!(report.is_ok());
    }
}
