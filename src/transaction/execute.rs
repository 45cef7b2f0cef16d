//! Transaction executor: the six ordered phases that turn a prepared
//! transaction into on-disk reality (spec.md §4.11).
//!
//! Grounded on [`crate::archive`] for the tar/gzip|zstd payload format,
//! [`crate::repo::signature`] for detached-signature verification, and
//! [`crate::alternatives`] for the register/unregister calls each
//! install/remove makes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::alternatives;
use crate::archive::{self, ArchiveError, Codec};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::plist;
use crate::repo::signature::{self, KeyStore};
use crate::types::transaction::{Entry, TransactionType};
use crate::types::{Descriptor, FilesManifest, State};

fn archive_error(e: ArchiveError) -> Error {
    Error::IntegrityFailure(e.to_string())
}

fn manifest_path(metadir: &Path, pkgname: &str) -> PathBuf {
    metadir.join("files").join(format!("{pkgname}.plist"))
}

fn cache_path_for(cachedir: &Path, descriptor: &Descriptor) -> PathBuf {
    cachedir.join(format!("{}.archive", descriptor.pkgver()))
}

fn sig_path_for(archive_path: &Path) -> PathBuf {
    let mut p = archive_path.as_os_str().to_os_string();
    p.push(".sig");
    PathBuf::from(p)
}

fn load_manifest(metadir: &Path, pkgname: &str) -> Result<Option<FilesManifest>> {
    let path = manifest_path(metadir, pkgname);
    if !path.is_file() {
        return Ok(None);
    }
    let value = plist::internalize_from_file(&path)?;
    let Some(map) = value.as_map() else {
        return Ok(None);
    };
    Ok(Some(FilesManifest::from_mapping(map)))
}

fn save_manifest(metadir: &Path, pkgname: &str, manifest: &FilesManifest) -> Result<()> {
    let path = manifest_path(metadir, pkgname);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    plist::externalize_to_file(&plist::Value::Map(manifest.to_mapping()), &path)?;
    Ok(())
}

fn sha256_hex_file(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|bytes| hex::encode(Sha256::digest(bytes)))
}

/// Runs all six executor phases against the handle's in-flight, prepared
/// transaction, assuming any remote archive has already been fetched into
/// the cache directory (see the `net`-gated download helper).
///
/// # Errors
/// Propagates the first phase failure; a failure during unpack/configure
/// leaves the affected package in `unpacked` state for a later resume.
pub fn execute(handle: &mut Handle) -> Result<()> {
    verify_phase(handle)?;
    remove_phase(handle)?;
    unpack_phase(handle)?;
    configure_phase(handle)?;
    flush_phase(handle)
}

/// Phase 2: verifies every to-be-installed archive's sha256 and, for
/// signed repositories, its detached signature.
///
/// # Errors
/// Returns [`Error::IntegrityFailure`] on any hash or signature mismatch.
pub fn verify_phase(handle: &mut Handle) -> Result<()> {
    let cachedir = handle.config().cachedir.clone();
    let entries: Vec<Entry> = handle.transaction().map(|t| t.packages.clone()).unwrap_or_default();

    for entry in &entries {
        if !matches!(entry.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall) {
            continue;
        }
        let archive_path = cache_path_for(&cachedir, &entry.descriptor);
        let actual = sha256_hex_file(&archive_path)
            .ok_or_else(|| Error::IntegrityFailure(format!("{}: archive not in cache", entry.descriptor.pkgver())))?;
        if let Some(expected) = entry.descriptor.filename_sha256()
            && !expected.is_empty()
            && expected != actual
        {
            return Err(Error::IntegrityFailure(format!("{}: archive sha256 mismatch", entry.descriptor.pkgver())));
        }

        let Some(repo_url) = entry.descriptor.repository() else { continue };
        let repo_url = repo_url.to_string();
        let meta = handle.pool().get_repo(&repo_url)?.meta.clone();
        if !meta.is_signed() {
            continue;
        }
        let fingerprint = signature::fingerprint(&meta.public_key);
        if !KeyStore::new(&handle.config().keydir).is_trusted(&fingerprint) {
            return Err(Error::PermissionDenied(format!(
                "{}: signing key {fingerprint} is not trusted",
                entry.descriptor.pkgver()
            )));
        }
        let sig_path = sig_path_for(&archive_path);
        let signature_bytes = fs::read(&sig_path)
            .map_err(|_| Error::IntegrityFailure(format!("{}: missing detached signature", entry.descriptor.pkgver())))?;
        let archive_bytes = fs::read(&archive_path)?;
        signature::verify_detached(&meta.public_key, &archive_bytes, &signature_bytes)?;
    }
    Ok(())
}

/// Phase 3: unregisters alternatives, removes the manifest's files and the
/// per-package manifest itself, then purges the database entry for each
/// `Remove` entry.
///
/// # Errors
/// Returns [`Error::PermissionDenied`] if a pre-check finds a file this
/// process does not own; propagates other I/O failures.
pub fn remove_phase(handle: &mut Handle) -> Result<()> {
    let rootdir = handle.config().rootdir.clone();
    let entries: Vec<Entry> = handle
        .transaction()
        .map(|t| t.packages.iter().filter(|e| e.transaction == TransactionType::Remove).cloned().collect())
        .unwrap_or_default();

    let metadir = handle.db().metadir().to_path_buf();
    // Snapshot the installed set up front: `unregister`'s `descriptor_of`
    // callback needs read access to other packages' descriptors (to
    // re-materialize the next alternatives head) while `handle.db()` is
    // otherwise mutably borrowed for this entry's own removal.
    let snapshot: HashMap<String, Descriptor> = handle.db().iter().map(|d| (d.pkgname().to_string(), d)).collect();

    for entry in &entries {
        let pkgname = entry.descriptor.pkgname();
        let Some(manifest) = load_manifest(&metadir, pkgname)? else {
            handle.db().purge(pkgname)?;
            continue;
        };
        precheck_ownership(&rootdir, &manifest)?;

        let mut registry = handle.db().alternatives();
        alternatives::unregister(
            &mut registry,
            &rootdir,
            pkgname,
            &entry.descriptor,
            false,
            manifest.files.is_empty(),
            |name| snapshot.get(name).cloned(),
            handle.events(),
        )?;
        handle.db().save_alternatives(&registry);

        for link in &manifest.links {
            let _ = fs::remove_file(rootdir.join(&link.path));
        }
        for file in &manifest.files {
            remove_tolerant(&rootdir.join(&file.path));
        }
        for conf in &manifest.conf_files {
            remove_tolerant(&rootdir.join(&conf.path));
        }
        for dir in manifest.dirs.iter().rev() {
            let _ = fs::remove_dir(rootdir.join(dir));
        }

        let manifest_file = manifest_path(&metadir, pkgname);
        let _ = fs::remove_file(manifest_file);

        let mut half_removed = entry.descriptor.clone();
        half_removed.set_state(State::HalfRemoved);
        handle.db().put(&half_removed)?;
        handle.db().purge(pkgname)?;
    }
    Ok(())
}

fn precheck_ownership(rootdir: &Path, manifest: &FilesManifest) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let euid = nix::unistd::geteuid();
        if euid.is_root() {
            return Ok(());
        }
        for file in manifest.files.iter().map(|f| &f.path).chain(manifest.conf_files.iter().map(|f| &f.path)) {
            let path = rootdir.join(file);
            if let Ok(meta) = fs::symlink_metadata(&path)
                && meta.uid() != euid.as_raw()
            {
                return Err(Error::PermissionDenied(format!("not owner of {}", path.display())));
            }
        }
    }
    Ok(())
}

fn remove_tolerant(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => {}
    }
}

/// Phase 4: extracts each install/update/reinstall entry's archive in
/// transaction order, applying the three-way config-file merge rule, and
/// transitions the entry to `unpacked`.
///
/// # Errors
/// Propagates archive-read and filesystem failures.
pub fn unpack_phase(handle: &mut Handle) -> Result<()> {
    let rootdir = handle.config().rootdir.clone();
    let cachedir = handle.config().cachedir.clone();
    let keep_config = handle.config().flags.keep_config;
    let preserved_files = handle.config().preserved_files.clone();
    let metadir = handle.db().metadir().to_path_buf();

    let entries: Vec<Entry> = handle
        .transaction()
        .map(|t| {
            t.packages
                .iter()
                .filter(|e| matches!(e.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    for entry in &entries {
        let pkgname = entry.descriptor.pkgname();
        let old_manifest = load_manifest(&metadir, pkgname)?;
        let archive_path = cache_path_for(&cachedir, &entry.descriptor);
        let bytes = fs::read(&archive_path)?;
        let codec = Codec::from_filename(archive_path.to_string_lossy().as_ref());

        let manifest_value = archive::fetch_plist(Cursor::new(&bytes), codec, "files.plist").map_err(archive_error)?;
        let Some(manifest_map) = manifest_value.as_map() else {
            return Err(Error::CorruptDatabase(format!("{pkgname}: malformed files.plist")));
        };
        let manifest = FilesManifest::from_mapping(manifest_map);

        for dir in &manifest.dirs {
            fs::create_dir_all(rootdir.join(dir))?;
        }

        let conf_paths: HashSet<&str> = manifest.conf_files.iter().map(|f| f.path.as_str()).collect();
        let skip_members = ["files.plist", "props.plist"];

        archive::for_each_entry(Cursor::new(&bytes), codec, |name, tar_entry| {
            if skip_members.contains(&name) {
                return Ok(false);
            }
            if conf_paths.contains(name) {
                if crate::config::path_is_preserved(&preserved_files, name) {
                    return Ok(false);
                }
                let mut contents = Vec::new();
                std::io::Read::read_to_end(tar_entry, &mut contents)?;
                let new_sha = hex::encode(Sha256::digest(&contents));
                let orig_sha = old_manifest
                    .as_ref()
                    .and_then(|m| m.conf_files.iter().find(|f| f.path == name))
                    .map(|f| f.sha256.clone());
                apply_conf_file(&rootdir, name, orig_sha.as_deref(), &new_sha, &contents, keep_config, entry.descriptor.pkgver())?;
            } else {
                let dest = rootdir.join(name);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                tar_entry.unpack(&dest)?;
            }
            Ok(false)
        })
        .map_err(archive_error)?;

        save_manifest(&metadir, pkgname, &manifest)?;

        let mut unpacked = entry.descriptor.clone();
        unpacked.set_state(State::Unpacked);
        handle.db().put(&unpacked)?;
    }
    Ok(())
}

fn apply_conf_file(
    rootdir: &Path,
    rel_path: &str,
    orig_sha: Option<&str>,
    new_sha: &str,
    new_bytes: &[u8],
    keep_config: bool,
    new_pkgver: &str,
) -> std::io::Result<()> {
    let dest = rootdir.join(rel_path);
    let cur_sha = sha256_hex_file(&dest);

    enum Action {
        KeepCurrent,
        InstallFresh,
        SaveNew,
    }

    let action = match (orig_sha, cur_sha.as_deref()) {
        (None, None) => Action::InstallFresh,
        (None, Some(_)) => {
            // A pre-existing symlink at this path isn't "managed elsewhere" in
            // the sense this row guards against; `sha256_hex_file` follows
            // symlinks transparently, so re-check via `symlink_metadata`.
            let is_symlink = fs::symlink_metadata(&dest).is_ok_and(|m| m.file_type().is_symlink());
            if is_symlink { Action::InstallFresh } else { Action::SaveNew }
        }
        (Some(orig), None) => {
            let _ = orig;
            Action::InstallFresh
        }
        (Some(orig), Some(cur)) if cur == orig => {
            if new_sha == orig {
                Action::KeepCurrent
            } else if keep_config {
                Action::SaveNew
            } else {
                Action::InstallFresh
            }
        }
        (Some(orig), Some(cur)) => {
            if new_sha == orig || new_sha == cur {
                Action::KeepCurrent
            } else {
                Action::SaveNew
            }
        }
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match action {
        Action::KeepCurrent => {}
        Action::InstallFresh => fs::write(&dest, new_bytes)?,
        Action::SaveNew => {
            let mut new_path = dest.into_os_string();
            new_path.push(format!(".new-{new_pkgver}"));
            fs::write(PathBuf::from(new_path), new_bytes)?;
        }
    }
    Ok(())
}

/// Phase 5: registers alternatives and transitions every freshly-unpacked
/// entry to `installed`.
///
/// # Errors
/// Propagates [`alternatives::register`] failures.
pub fn configure_phase(handle: &mut Handle) -> Result<()> {
    let rootdir = handle.config().rootdir.clone();
    let entries: Vec<Entry> = handle
        .transaction()
        .map(|t| {
            t.packages
                .iter()
                .filter(|e| matches!(e.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    for entry in &entries {
        let mut registry = handle.db().alternatives();
        alternatives::register(&mut registry, &rootdir, entry.descriptor.pkgname(), &entry.descriptor, handle.events())?;
        handle.db().save_alternatives(&registry);

        let mut installed = entry.descriptor.clone();
        installed.set_state(State::Installed);
        handle.db().put(&installed)?;
    }
    Ok(())
}

/// Phase 6: flushes the database and discards the completed transaction.
///
/// # Errors
/// Propagates [`crate::pkgdb::PkgDb::update`] failures.
pub fn flush_phase(handle: &mut Handle) -> Result<()> {
    handle.db().update(true)?;
    handle.discard_transaction();
    Ok(())
}

#[cfg(feature = "net")]
/// Downloads every pending install/update/reinstall archive not already
/// present (by sha256) in the cache directory (spec.md §4.11 phase 1).
///
/// # Errors
/// Propagates [`crate::fetch::fetch_to_file`] failures after retry.
pub async fn download_phase(handle: &mut Handle, client: &reqwest::Client) -> Result<()> {
    use crate::fetch::{CachedMeta, CancelFlag, RetryPolicy, fetch_to_file, read_local};
    use crate::repo::pool::is_local;

    let cachedir = handle.config().cachedir.clone();
    fs::create_dir_all(&cachedir)?;
    let events = handle.events().clone();
    let entries: Vec<Entry> = handle.transaction().map(|t| t.packages.clone()).unwrap_or_default();

    for entry in &entries {
        if !matches!(entry.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall) {
            continue;
        }
        let archive_path = cache_path_for(&cachedir, &entry.descriptor);
        let up_to_date = entry
            .descriptor
            .filename_sha256()
            .is_some_and(|expected| sha256_hex_file(&archive_path).as_deref() == Some(expected));
        if up_to_date {
            continue;
        }
        let Some(base_url) = entry.descriptor.repository() else { continue };
        let archive_url = format!("{}/{}.archive", base_url.trim_end_matches('/'), entry.descriptor.pkgver());

        if is_local(&archive_url) {
            let bytes = read_local(&archive_url)?;
            fs::write(&archive_path, bytes)?;
        } else {
            fetch_to_file(
                client,
                &archive_url,
                &archive_path,
                CachedMeta::default(),
                RetryPolicy::default(),
                &CancelFlag::new(),
                &events,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write as _;

    fn write_confdir(dir: &Path, rootdir: &Path) {
        fs::write(
            dir.join("00-base.toml"),
            format!(
                "rootdir = \"{}\"\narchitecture = \"x86_64\"\ncachedir = \"{}\"\nkeydir = \"{}\"\n",
                rootdir.display(),
                rootdir.join("var/cache/pkgcore").display(),
                rootdir.join("var/db/pkgcore/keys").display(),
            ),
        )
        .unwrap();
    }

    fn build_pkg_archive(payload_path: &str, payload: &[u8], conf_path: Option<(&str, &[u8])>) -> (Vec<u8>, FilesManifest) {
        let mut manifest = FilesManifest::default();
        manifest.files.push(crate::types::manifest::FileEntry {
            path: payload_path.to_string(),
            sha256: hex::encode(Sha256::digest(payload)),
            mutable: false,
        });
        let mut tar_entries: Vec<(String, Vec<u8>)> = vec![(payload_path.to_string(), payload.to_vec())];
        if let Some((conf_rel, conf_bytes)) = conf_path {
            manifest.conf_files.push(crate::types::manifest::ConfFileEntry {
                path: conf_rel.to_string(),
                sha256: hex::encode(Sha256::digest(conf_bytes)),
            });
            tar_entries.push((conf_rel.to_string(), conf_bytes.to_vec()));
        }
        let manifest_text = plist::externalize(&plist::Value::Map(manifest.to_mapping()));
        tar_entries.push(("files.plist".to_string(), manifest_text.into_bytes()));

        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, contents) in &tar_entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, contents.as_slice()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        (gz.finish().unwrap(), manifest)
    }

    #[test]
    fn unpack_and_configure_install_payload_and_register_state() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();

        let (archive_bytes, _manifest) = build_pkg_archive("usr/bin/foo", b"binary-contents", None);
        let cachedir = handle.config().cachedir.clone();
        fs::create_dir_all(&cachedir).unwrap();

        let mut descriptor = Descriptor::new("foo", "1.0", "1", "x86_64");
        descriptor.set_string_list("run_depends", Vec::<String>::new());
        let archive_path = cache_path_for(&cachedir, &descriptor);
        fs::write(&archive_path, &archive_bytes).unwrap();
        descriptor.as_mapping_mut().insert("filename-sha256", plist::Value::str(hex::encode(Sha256::digest(&archive_bytes)))).unwrap();

        let txn = handle.begin_transaction();
        txn.upsert(
            Entry {
                descriptor,
                transaction: TransactionType::Install,
                replaced: false,
            },
            false,
        );

        verify_phase(&mut handle).unwrap();
        unpack_phase(&mut handle).unwrap();
        assert_eq!(handle.db().get("foo").unwrap().state(), State::Unpacked);
        assert_eq!(fs::read(rootdir.path().join("usr/bin/foo")).unwrap(), b"binary-contents");

        configure_phase(&mut handle).unwrap();
        assert_eq!(handle.db().get("foo").unwrap().state(), State::Installed);

        flush_phase(&mut handle).unwrap();
        assert!(handle.transaction().is_none());
    }

    #[test]
    fn conf_file_user_edit_is_preserved_on_update() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();
        let cachedir = handle.config().cachedir.clone();
        fs::create_dir_all(&cachedir).unwrap();
        let metadir = handle.db().metadir().to_path_buf();

        // Install v1 with conf file "orig".
        let (v1_bytes, _v1_manifest) = build_pkg_archive("usr/bin/foo", b"v1-bin", Some(("etc/foo.conf", b"orig")));
        let v1 = Descriptor::new("foo", "1.0", "1", "x86_64");
        fs::write(cache_path_for(&cachedir, &v1), &v1_bytes).unwrap();
        {
            let txn = handle.begin_transaction();
            txn.upsert(Entry { descriptor: v1, transaction: TransactionType::Install, replaced: false }, false);
        }
        unpack_phase(&mut handle).unwrap();
        configure_phase(&mut handle).unwrap();
        flush_phase(&mut handle).unwrap();

        // User edits the conf file.
        fs::write(rootdir.path().join("etc/foo.conf"), b"user-edited").unwrap();

        // Update to v2 with a different upstream conf file.
        let (v2_bytes, _v2_manifest) = build_pkg_archive("usr/bin/foo", b"v2-bin", Some(("etc/foo.conf", b"new-upstream")));
        let v2 = Descriptor::new("foo", "2.0", "1", "x86_64");
        fs::write(cache_path_for(&cachedir, &v2), &v2_bytes).unwrap();
        let v2_pkgver = v2.pkgver().to_string();
        {
            let txn = handle.begin_transaction();
            txn.upsert(Entry { descriptor: v2, transaction: TransactionType::Update, replaced: false }, false);
        }
        unpack_phase(&mut handle).unwrap();

        assert_eq!(fs::read(rootdir.path().join("etc/foo.conf")).unwrap(), b"user-edited");
        let saved_new = rootdir.path().join(format!("etc/foo.conf.new-{v2_pkgver}"));
        assert_eq!(fs::read(saved_new).unwrap(), b"new-upstream");
    }

    #[test]
    fn conf_file_with_no_orig_but_preexisting_symlink_installs_fresh() {
        let rootdir = tempfile::tempdir().unwrap();
        let target = rootdir.path().join("foo.conf.actual");
        fs::write(&target, b"elsewhere").unwrap();
        std::os::unix::fs::symlink(&target, rootdir.path().join("foo.conf")).unwrap();

        apply_conf_file(rootdir.path(), "foo.conf", None, &hex::encode(Sha256::digest(b"new-upstream")), b"new-upstream", false, "1.0_1").unwrap();

        assert_eq!(fs::read(rootdir.path().join("foo.conf")).unwrap(), b"new-upstream");
        assert!(fs::symlink_metadata(rootdir.path().join("foo.conf")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn conf_file_with_no_orig_but_preexisting_regular_file_saves_as_new() {
        let rootdir = tempfile::tempdir().unwrap();
        fs::write(rootdir.path().join("foo.conf"), b"unmanaged").unwrap();

        apply_conf_file(rootdir.path(), "foo.conf", None, &hex::encode(Sha256::digest(b"new-upstream")), b"new-upstream", false, "1.0_1").unwrap();

        assert_eq!(fs::read(rootdir.path().join("foo.conf")).unwrap(), b"unmanaged");
        assert_eq!(fs::read(rootdir.path().join("foo.conf.new-1.0_1")).unwrap(), b"new-upstream");
    }
}
