//! Transaction builder: the five entry points that accumulate package
//! actions into a handle's in-flight transaction (spec.md §4.9).
//!
//! Grounded on spec.md §4.9's decision table, using the same cmpver+reverts
//! comparison [`crate::version`] already implements for the resolver.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::types::transaction::{Entry, TransactionType};
use crate::types::Descriptor;
use crate::version;

use super::SELF_PKGNAME;

fn ensure_transaction(handle: &mut Handle) -> &mut crate::types::Transaction {
    if handle.transaction().is_none() {
        handle.begin_transaction();
    }
    handle.transaction_mut().expect("just ensured")
}

/// Looks up a repository candidate satisfying `pattern`'s name (and, if
/// present, its version bounds) via the user's virtual preferences and the
/// pool's usual priority order.
///
/// # Errors
/// Returns [`Error::NotFound`] if no repository package satisfies `pattern`.
fn find_candidate(handle: &mut Handle, pattern: &str) -> Result<Descriptor> {
    let vpkg_prefs = handle.vpkg_prefs();
    let name = version::pattern_name(pattern);
    let candidate = handle
        .pool()
        .lookup(&name, &vpkg_prefs)?
        .ok_or_else(|| Error::NotFound(format!("no package satisfies {pattern}")))?;
    let pv = version::parse_pkgver(candidate.pkgver())?;
    if !version::matches(pattern, &pv.name, &pv.version) {
        return Err(Error::NotFound(format!("no package satisfies {pattern}")));
    }
    Ok(candidate)
}

/// Self-update gate (spec.md §4.9 preamble): returns the relaxation flag to
/// set on the transaction if a self-update is underway.
///
/// # Errors
/// Returns [`Error::Busy`] if a newer self-update is available in the pool
/// and `targets_self` is false.
fn self_update_check(handle: &mut Handle, targets_self: bool) -> Result<bool> {
    let Some(installed_self) = handle.db().get(SELF_PKGNAME) else {
        return Ok(false);
    };
    let vpkg_prefs = handle.vpkg_prefs();
    let Some(candidate_self) = handle.pool().lookup(SELF_PKGNAME, &vpkg_prefs)? else {
        return Ok(false);
    };
    if version::cmpver(candidate_self.pkgver(), installed_self.pkgver())? != Ordering::Greater {
        return Ok(false);
    }
    if targets_self {
        Ok(true)
    } else {
        Err(Error::Busy(format!(
            "self-update to {} is required before other actions",
            candidate_self.pkgver()
        )))
    }
}

fn decide_install_update(handle: &mut Handle, pattern: &str, force: bool, relax: bool) -> Result<()> {
    let mut candidate = find_candidate(handle, pattern)?;
    let pkgname = candidate.pkgname().to_string();
    let installed = handle.db().get(&pkgname);

    if let Some(installed) = &installed
        && installed.repolock()
        && installed.repository() != candidate.repository()
    {
        return Err(Error::AlreadyPresent(format!(
            "{pkgname} is repository-locked to {:?}",
            installed.repository()
        )));
    }

    let ttype = match &installed {
        None => TransactionType::Install,
        Some(installed) => {
            let cmp = version::cmpver(candidate.pkgver(), installed.pkgver())?;
            let reverts = version::reverts_wins(candidate.reverts(), installed.pkgver());
            match cmp {
                Ordering::Less if !reverts => {
                    return Err(Error::AlreadyPresent(format!("{} is already up to date", installed.pkgver())));
                }
                Ordering::Equal if !reverts => {
                    if !force {
                        return Err(Error::AlreadyPresent(format!("{} is already up to date", installed.pkgver())));
                    }
                    TransactionType::Reinstall
                }
                _ => TransactionType::Update,
            }
        }
    };

    if let Some(installed) = &installed {
        candidate.set_automatic_install(installed.automatic_install());
        candidate.set_hold(installed.hold());
        candidate.set_repolock(installed.repolock());
    }
    let ttype = if candidate.hold() { TransactionType::Hold } else { ttype };

    let txn = ensure_transaction(handle);
    txn.self_update_relaxation = txn.self_update_relaxation || relax;
    txn.upsert(
        Entry {
            descriptor: candidate,
            transaction: ttype,
            replaced: false,
        },
        false,
    );
    Ok(())
}

/// Installs (or decides the appropriate action for) the package satisfying
/// `pattern` (spec.md §4.9).
///
/// # Errors
/// Returns [`Error::Busy`] if a pending self-update blocks this action,
/// [`Error::NotFound`] if no candidate satisfies `pattern`, or
/// [`Error::AlreadyPresent`] if the installed version already satisfies it.
pub fn install_pkg(handle: &mut Handle, pattern: &str, force: bool) -> Result<()> {
    let targets_self = version::pattern_name(pattern) == SELF_PKGNAME;
    let relax = self_update_check(handle, targets_self)?;
    decide_install_update(handle, pattern, force, relax)
}

/// Updates the package satisfying `pattern`, following the same decision
/// table as [`install_pkg`].
///
/// # Errors
/// See [`install_pkg`].
pub fn update_pkg(handle: &mut Handle, pattern: &str, force: bool) -> Result<()> {
    let targets_self = version::pattern_name(pattern) == SELF_PKGNAME;
    let relax = self_update_check(handle, targets_self)?;
    decide_install_update(handle, pattern, force, relax)
}

/// Queues an update decision for every currently-installed package,
/// skipping any that are already up to date or no longer present in the
/// pool.
///
/// # Errors
/// Propagates any failure other than [`Error::AlreadyPresent`] or
/// [`Error::NotFound`] from the per-package decision.
pub fn update_all(handle: &mut Handle) -> Result<()> {
    let relax = self_update_check(handle, true)?;
    let names: Vec<String> = handle.db().iter().map(|d| d.pkgname().to_string()).collect();
    for name in names {
        match decide_install_update(handle, &name, false, relax) {
            Ok(()) | Err(Error::AlreadyPresent(_)) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn compute_orphans(handle: &mut Handle, seed: &[String]) -> Vec<String> {
    let vpkg_prefs = handle.vpkg_prefs();
    let mut orphan_set: HashSet<String> = seed.iter().cloned().collect();
    let mut discovered: Vec<String> = Vec::new();
    loop {
        let candidates: Vec<String> = handle
            .db()
            .iter()
            .filter(|d| d.automatic_install() && !orphan_set.contains(d.pkgname()))
            .map(|d| d.pkgname().to_string())
            .collect();

        let mut added_this_round = Vec::new();
        for name in candidates {
            let revdeps = handle.db().reverse_deps_of(&name, &vpkg_prefs);
            if revdeps.iter().all(|r| orphan_set.contains(r)) {
                added_this_round.push(name);
            }
        }
        if added_this_round.is_empty() {
            break;
        }
        for name in &added_this_round {
            orphan_set.insert(name.clone());
        }
        discovered.extend(added_this_round);
    }
    discovered
}

/// Tags `name` for removal; with `recursive`, also computes and tags the
/// orphan set that would result (spec.md §4.9/§4.10 "Orphan computation").
///
/// # Errors
/// Returns [`Error::NotFound`] if `name` is not installed.
pub fn remove_pkg(handle: &mut Handle, name: &str, recursive: bool) -> Result<()> {
    let Some(target) = handle.db().get(name) else {
        return Err(Error::NotFound(format!("{name} is not installed")));
    };
    let orphans = if recursive { compute_orphans(handle, &[name.to_string()]) } else { Vec::new() };
    let orphan_descs: Vec<Descriptor> = orphans.iter().filter_map(|n| handle.db().get(n)).collect();

    let txn = ensure_transaction(handle);
    txn.upsert(
        Entry {
            descriptor: target,
            transaction: TransactionType::Remove,
            replaced: false,
        },
        false,
    );
    for d in orphan_descs {
        txn.upsert(
            Entry {
                descriptor: d,
                transaction: TransactionType::Remove,
                replaced: false,
            },
            true,
        );
    }
    Ok(())
}

/// Scans the whole database for orphaned automatic packages (fixpoint rule,
/// spec.md §4.10) and tags each Remove, dependents ahead of their
/// dependencies.
pub fn autoremove_orphans(handle: &mut Handle) -> Result<()> {
    let discovered = compute_orphans(handle, &[]);
    let descriptors: Vec<Descriptor> = discovered.iter().filter_map(|n| handle.db().get(n)).collect();
    let txn = ensure_transaction(handle);
    for d in descriptors {
        txn.upsert(
            Entry {
                descriptor: d,
                transaction: TransactionType::Remove,
                replaced: false,
            },
            true,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::silent_sink;
    use crate::plist::{Mapping, Value};
    use crate::types::State;
    use std::io::Write as _;

    fn build_repodata_archive(index: &Mapping) -> Vec<u8> {
        let index_text = crate::plist::externalize(&Value::Map(index.clone()));
        let empty = crate::plist::externalize(&Value::empty_map());
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, contents) in [("index.plist", index_text.as_str()), ("index-meta.plist", empty.as_str()), ("stage.plist", empty.as_str())] {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    fn repo_descriptor(pkgname: &str, version: &str, run_depends: &[&str]) -> Descriptor {
        let mut d = Descriptor::new(pkgname, version, "1", "x86_64");
        d.set_string_list("run_depends", run_depends.iter().copied());
        d
    }

    fn make_handle_with_pool(rootdir: &std::path::Path, index: &Mapping) -> Handle {
        let confdir = tempfile::tempdir().unwrap();
        std::fs::write(
            confdir.path().join("00-base.toml"),
            format!("rootdir = \"{}\"\narchitecture = \"x86_64\"\n", rootdir.display()),
        )
        .unwrap();
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = archive_dir.path().join("repodata.tar.gz");
        std::fs::write(&archive_path, build_repodata_archive(index)).unwrap();
        std::mem::forget(archive_dir); // keep the tempdir alive for the handle's lifetime
        handle.pool().store(&archive_path.to_string_lossy());
        handle
    }

    fn installed(handle: &mut Handle, pkgname: &str, version: &str, automatic: bool) {
        let mut d = Descriptor::new(pkgname, version, "1", "x86_64");
        d.set_state(State::Installed);
        d.set_automatic_install(automatic);
        handle.db().put(&d).unwrap();
    }

    #[test]
    fn s1_first_install_pulls_in_dependency() {
        let rootdir = tempfile::tempdir().unwrap();
        let mut index = Mapping::new();
        let _ = index.insert("foo", Value::Map(repo_descriptor("foo", "1.0", &[]).into_mapping()));
        let _ = index.insert("bar", Value::Map(repo_descriptor("bar", "1.0", &["foo>=1.0"]).into_mapping()));
        let mut handle = make_handle_with_pool(rootdir.path(), &index);

        install_pkg(&mut handle, "bar", false).unwrap();
        let txn = handle.transaction().unwrap();
        assert_eq!(txn.packages.len(), 1);
        assert_eq!(txn.packages[0].descriptor.pkgname(), "bar");
        assert_eq!(txn.packages[0].transaction, TransactionType::Install);
    }

    #[test]
    fn already_up_to_date_is_rejected() {
        let rootdir = tempfile::tempdir().unwrap();
        let mut index = Mapping::new();
        let _ = index.insert("foo", Value::Map(repo_descriptor("foo", "1.0", &[]).into_mapping()));
        let mut handle = make_handle_with_pool(rootdir.path(), &index);
        installed(&mut handle, "foo", "1.0", false);

        let err = install_pkg(&mut handle, "foo", false).unwrap_err();
        assert!(matches!(err, Error::AlreadyPresent(_)));
    }

    #[test]
    fn forced_reinstall_of_same_version_is_reinstall() {
        let rootdir = tempfile::tempdir().unwrap();
        let mut index = Mapping::new();
        let _ = index.insert("foo", Value::Map(repo_descriptor("foo", "1.0", &[]).into_mapping()));
        let mut handle = make_handle_with_pool(rootdir.path(), &index);
        installed(&mut handle, "foo", "1.0", false);

        install_pkg(&mut handle, "foo", true).unwrap();
        let txn = handle.transaction().unwrap();
        assert_eq!(txn.packages[0].transaction, TransactionType::Reinstall);
    }

    #[test]
    fn s4_self_update_gate_blocks_other_installs() {
        let rootdir = tempfile::tempdir().unwrap();
        let mut index = Mapping::new();
        let _ = index.insert(SELF_PKGNAME, Value::Map(repo_descriptor(SELF_PKGNAME, "2.0", &[]).into_mapping()));
        let _ = index.insert("foo", Value::Map(repo_descriptor("foo", "1.1", &[]).into_mapping()));
        let mut handle = make_handle_with_pool(rootdir.path(), &index);
        installed(&mut handle, SELF_PKGNAME, "1.0", false);

        let err = install_pkg(&mut handle, "foo", false).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        install_pkg(&mut handle, SELF_PKGNAME, false).unwrap();
        let txn = handle.transaction().unwrap();
        assert_eq!(txn.packages.len(), 1);
        assert_eq!(txn.packages[0].descriptor.pkgname(), SELF_PKGNAME);
        assert!(txn.self_update_relaxation);
    }

    #[test]
    fn s6_autoremove_orders_dependents_before_dependencies() {
        let rootdir = tempfile::tempdir().unwrap();
        let index = Mapping::new();
        let mut handle = make_handle_with_pool(rootdir.path(), &index);

        // a (manual) depends on b; b depends on c; d is a standalone auto orphan.
        let mut a = Descriptor::new("a", "1.0", "1", "x86_64");
        a.set_state(State::Installed);
        a.set_string_list("run_depends", ["b>=1.0"]);
        handle.db().put(&a).unwrap();

        let mut b = Descriptor::new("b", "1.0", "1", "x86_64");
        b.set_state(State::Installed);
        b.set_automatic_install(true);
        b.set_string_list("run_depends", ["c>=1.0"]);
        handle.db().put(&b).unwrap();

        let mut c = Descriptor::new("c", "1.0", "1", "x86_64");
        c.set_state(State::Installed);
        c.set_automatic_install(true);
        handle.db().put(&c).unwrap();

        installed(&mut handle, "d", "1.0", true);

        remove_pkg(&mut handle, "a", false).unwrap();
        handle.db().purge("a").unwrap();

        autoremove_orphans(&mut handle).unwrap();
        let txn = handle.transaction().unwrap();
        let pos = |name: &str| txn.packages.iter().position(|e| e.descriptor.pkgname() == name).unwrap();
        assert!(pos("c") < pos("b"), "c (dependent) must be queued before b (its dependency)");
    }
}
