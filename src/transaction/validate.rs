//! Transaction validators: the six-phase `prepare()` pipeline that expands,
//! cross-checks, and freezes a transaction before execution (spec.md
//! §4.10).
//!
//! Grounded on [`crate::resolve`] for dependency expansion and
//! [`crate::pkgdb::PkgDb::reverse_deps_of`] for the reverse-dependency walk.

use std::collections::HashMap;

use nix::sys::statvfs::statvfs;

use crate::error::{DependencyError, Error, Result};
use crate::handle::Handle;
use crate::resolve::{self, MissingPolicy, PackageSource};
use crate::types::transaction::{Entry, TransactionType};
use crate::types::Descriptor;
use crate::version;

/// Runs the six validator phases against the handle's in-flight transaction
/// and, on success, freezes it (spec.md §4.10).
///
/// # Errors
/// Returns [`Error::DependencyBroken`] for an unresolvable hard dependency
/// during expansion, or for an unrelaxed reverse-dependency/shlib
/// diagnostic; [`Error::Conflict`] for any conflicts diagnostic;
/// [`Error::ResourceExhausted`] if the rootdir's free space is insufficient.
pub fn prepare(handle: &mut Handle) -> Result<()> {
    let Some(mut txn) = handle.take_transaction() else {
        return Err(Error::InvalidArgument("no in-flight transaction to prepare".into()));
    };

    let result = (|| -> Result<()> {
        expand_dependencies(handle, &mut txn)?;
        apply_replaces(handle, &mut txn);
        check_reverse_deps(handle, &mut txn);
        check_shared_libraries(handle, &mut txn);
        check_conflicts(handle, &mut txn);
        check_disk_space(handle, &txn)?;

        if !txn.conflicts.is_empty() {
            return Err(Error::Conflict(txn.conflicts.join("; ")));
        }
        if !txn.self_update_relaxation {
            if let Some(desc) = txn.missing_deps.first() {
                return Err(Error::DependencyBroken(DependencyError::MissingReverseDependency {
                    description: desc.clone(),
                }));
            }
            if let Some(entry) = txn.missing_shlibs.first() {
                let (pkgver, soname) = split_shlib_diagnostic(entry);
                return Err(Error::DependencyBroken(DependencyError::UnresolvableShlib { pkgver, soname }));
            }
        }
        txn.prepared = true;
        Ok(())
    })();

    handle.set_transaction(txn);
    result
}

fn split_shlib_diagnostic(s: &str) -> (String, String) {
    match s.split_once(": broken, unresolvable shlib ") {
        Some((pkgver, soname)) => (pkgver.to_string(), soname.to_string()),
        None => (String::new(), s.to_string()),
    }
}

/// Phase 1: recursively collects dependencies for every pending
/// install/update/reinstall, inserting any not already present directly
/// before the entry that required them (deepest-first ordering).
fn expand_dependencies(handle: &mut Handle, txn: &mut crate::types::Transaction) -> Result<()> {
    let vpkg_prefs = handle.vpkg_prefs();
    let targets: Vec<(usize, Descriptor)> = txn
        .packages
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall))
        .map(|(i, e)| (i, e.descriptor.clone()))
        .collect();

    let mut offset = 0usize;
    for (original_index, target) in targets {
        let pool = handle.pool();
        let chain = resolve::full_dep_tree(pool, &target, &vpkg_prefs, MissingPolicy::Fatal)?;

        let mut insert_at = original_index + offset;
        for pkgver in chain {
            let name = match version::parse_pkgver(&pkgver) {
                Ok(pv) => pv.name,
                Err(_) => continue,
            };
            if txn.find(&name).is_some() {
                continue;
            }
            let Some(dep_desc) = handle.pool().lookup_real(&name)? else {
                continue;
            };
            txn.packages.insert(
                insert_at,
                Entry {
                    descriptor: dep_desc,
                    transaction: TransactionType::Install,
                    replaced: false,
                },
            );
            insert_at += 1;
            offset += 1;
        }
    }
    Ok(())
}

/// Phase 2: tags installed packages matched by a pending entry's `replaces`
/// patterns as casualties.
fn apply_replaces(handle: &mut Handle, txn: &mut crate::types::Transaction) {
    let installed: Vec<Descriptor> = handle.db().iter().collect();

    let candidates: Vec<(String, Vec<String>)> = txn
        .packages
        .iter()
        .filter(|e| matches!(e.transaction, TransactionType::Install | TransactionType::Update | TransactionType::Reinstall))
        .map(|e| (e.descriptor.pkgname().to_string(), e.descriptor.replaces().map(str::to_string).collect()))
        .collect();

    for (replacer_name, patterns) in candidates {
        for pattern in patterns {
            let Some(victim) = installed.iter().find(|d| {
                version::parse_pkgver(d.pkgver())
                    .map(|pv| version::matches(&pattern, &pv.name, &pv.version))
                    .unwrap_or(false)
            }) else {
                continue;
            };
            if victim.hold() || victim.pkgname() == replacer_name {
                continue;
            }
            if let Some(existing) = txn.find(victim.pkgname())
                && matches!(existing.transaction, TransactionType::Update | TransactionType::Reinstall)
            {
                continue;
            }

            let victim_auto = victim.automatic_install();
            txn.upsert(
                Entry {
                    descriptor: victim.clone(),
                    transaction: TransactionType::Remove,
                    replaced: true,
                },
                false,
            );
            if victim_auto {
                // Inherit automatic-install onto the replacer, unless the
                // replacer was already installed under its own name with its
                // own automatic-install separately decided false.
                let separately_non_automatic = handle.db().get(&replacer_name).is_some_and(|d| !d.automatic_install());
                if !separately_non_automatic
                    && let Some(entry) = txn.find_mut(&replacer_name)
                {
                    entry.descriptor.set_automatic_install(true);
                }
            } else if let Some(entry) = txn.find_mut(&replacer_name) {
                entry.descriptor.set_automatic_install(false);
            }
        }
    }
}

/// Phase 3: checks that every reverse dependency of an updated or removed
/// installed package is still satisfied post-transaction.
fn check_reverse_deps(handle: &mut Handle, txn: &mut crate::types::Transaction) {
    let vpkg_prefs = handle.vpkg_prefs();
    let affected: Vec<(String, Entry)> = txn
        .packages
        .iter()
        .filter(|e| matches!(e.transaction, TransactionType::Update | TransactionType::Reinstall | TransactionType::Remove))
        .map(|e| (e.descriptor.pkgname().to_string(), e.clone()))
        .collect();

    let ignored = handle.config().ignored_packages.clone();

    for (pkgname, entry) in affected {
        if is_ignored(&pkgname, &ignored) || matches!(entry.transaction, TransactionType::Reinstall) {
            continue;
        }
        let Some(installed) = handle.db().get(&pkgname) else {
            continue;
        };
        let revdeps = handle.db().reverse_deps_of(&pkgname, &vpkg_prefs);
        for q in revdeps {
            if txn.find(&q).is_some_and(|e| e.transaction == TransactionType::Remove) {
                continue;
            }
            match entry.transaction {
                TransactionType::Remove => {
                    if txn.find(&q).is_none() && !entry.replaced {
                        txn.missing_deps.push(format!("{q} breaks because {pkgname} is being removed"));
                    }
                }
                TransactionType::Update => {
                    let Some(q_desc) = handle.db().get(&q) else { continue };
                    let new_pv = match version::parse_pkgver(entry.descriptor.pkgver()) {
                        Ok(pv) => pv,
                        Err(_) => continue,
                    };
                    let satisfied = q_desc.run_depends().any(|p| {
                        let dep_name = version::pattern_name(p);
                        if dep_name == installed.pkgname() {
                            version::matches(p, &new_pv.name, &new_pv.version)
                        } else {
                            entry.descriptor.provides().any(|prov| {
                                version::pkgname_from_pkgver(prov).map(|n| n == dep_name).unwrap_or(false)
                                    && version::parse_pkgver(prov)
                                        .map(|pv| version::matches(p, &pv.name, &pv.version))
                                        .unwrap_or(false)
                            })
                        }
                    });
                    if !satisfied {
                        txn.missing_deps.push(format!("{q} breaks because {pkgname} is being updated"));
                    }
                }
                _ => {}
            }
        }
    }
}

fn is_ignored(pkgname: &str, ignored: &[String]) -> bool {
    ignored.iter().any(|glob| {
        let pattern = version::parse_pattern(glob);
        version::pattern_matches(&pattern, pkgname, "")
    })
}

/// Post-transaction package set: installed packages overlaid with the
/// transaction's decisions (removals excluded, installs/updates applied).
fn post_transaction_set(handle: &mut Handle, txn: &crate::types::Transaction) -> Vec<Descriptor> {
    let mut set: Vec<Descriptor> = handle
        .db()
        .iter()
        .filter(|d| !matches!(txn.find(d.pkgname()).map(|e| e.transaction), Some(TransactionType::Remove)))
        .map(|d| match txn.find(d.pkgname()) {
            Some(e) if matches!(e.transaction, TransactionType::Update | TransactionType::Reinstall) => e.descriptor.clone(),
            _ => d,
        })
        .collect();
    for entry in &txn.packages {
        if matches!(entry.transaction, TransactionType::Install) && !set.iter().any(|d| d.pkgname() == entry.descriptor.pkgname()) {
            set.push(entry.descriptor.clone());
        }
    }
    set
}

/// Phase 4: every required soname in the post-transaction set must have a
/// provider in that same set.
fn check_shared_libraries(handle: &mut Handle, txn: &mut crate::types::Transaction) {
    let set = post_transaction_set(handle, txn);
    let provides: HashMap<&str, &str> = set.iter().flat_map(|d| d.shlib_provides().map(move |s| (s, d.pkgver()))).collect();

    for d in &set {
        for soname in d.shlib_requires() {
            if !provides.contains_key(soname) {
                txn.missing_shlibs.push(format!("{}: broken, unresolvable shlib {soname}", d.pkgver()));
            }
        }
    }
}

/// Phase 5: every `conflicts` pattern declared by a pending entry must not
/// match another package in the post-transaction set.
fn check_conflicts(handle: &mut Handle, txn: &mut crate::types::Transaction) {
    let set = post_transaction_set(handle, txn);

    let declared: Vec<(String, Vec<String>)> = txn
        .packages
        .iter()
        .filter(|e| !matches!(e.transaction, TransactionType::Remove))
        .map(|e| (e.descriptor.pkgname().to_string(), e.descriptor.conflicts().map(str::to_string).collect()))
        .collect();

    for (owner, patterns) in declared {
        for pattern in patterns {
            let hit = set.iter().find(|d| {
                if d.pkgname() == owner {
                    return false;
                }
                version::parse_pkgver(d.pkgver())
                    .map(|pv| version::matches(&pattern, &pv.name, &pv.version))
                    .unwrap_or(false)
            });
            if let Some(hit) = hit {
                txn.conflicts.push(format!("{owner} conflicts with {}", hit.pkgver()));
            }
        }
    }
}

/// Phase 6: the net installed-size delta must fit in the rootdir's free
/// space.
fn check_disk_space(handle: &mut Handle, txn: &crate::types::Transaction) -> Result<()> {
    let mut delta: i64 = 0;
    for entry in &txn.packages {
        match entry.transaction {
            TransactionType::Install => delta += entry.descriptor.installed_size() as i64,
            TransactionType::Update | TransactionType::Reinstall => {
                delta += entry.descriptor.installed_size() as i64;
                if let Some(old) = handle.db().get(entry.descriptor.pkgname()) {
                    delta -= old.installed_size() as i64;
                }
            }
            TransactionType::Remove => {
                delta -= entry.descriptor.installed_size() as i64;
            }
            _ => {}
        }
    }
    if delta <= 0 {
        return Ok(());
    }
    let stat = statvfs(handle.config().rootdir.as_path()).map_err(|e| Error::IoFailure(std::io::Error::from(e)))?;
    let free_bytes = (stat.block_size() as u64) * (stat.blocks_free() as u64);
    if (delta as u64) > free_bytes {
        return Err(Error::ResourceExhausted(format!(
            "transaction needs {delta} bytes but only {free_bytes} are free"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;

    fn write_confdir(dir: &std::path::Path, rootdir: &std::path::Path) {
        std::fs::write(
            dir.join("00-base.toml"),
            format!("rootdir = \"{}\"\narchitecture = \"x86_64\"\n", rootdir.display()),
        )
        .unwrap();
    }

    fn installed(pkgname: &str, version: &str, auto: bool) -> Descriptor {
        let mut d = Descriptor::new(pkgname, version, "1", "x86_64");
        d.set_state(State::Installed);
        d.set_automatic_install(auto);
        d
    }

    #[test]
    fn shared_library_gap_is_recorded_and_blocks_unless_relaxed() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();

        let mut needs_lib = installed("app", "1.0", false);
        needs_lib.set_string_list("shlib-requires", ["libfoo.so.1"]);
        handle.db().put(&needs_lib).unwrap();

        let mut old_lib = installed("libfoo", "1.0", false);
        old_lib.set_string_list("shlib-provides", ["libfoo.so.1"]);
        handle.db().put(&old_lib).unwrap();

        let txn = handle.begin_transaction();
        let new_lib = {
            let mut d = installed("libfoo", "2.0", false);
            d.set_string_list("shlib-provides", ["libfoo.so.2"]);
            d
        };
        txn.upsert(
            Entry {
                descriptor: new_lib,
                transaction: TransactionType::Update,
                replaced: false,
            },
            false,
        );

        let err = prepare(&mut handle).unwrap_err();
        assert!(matches!(err, Error::DependencyBroken(DependencyError::UnresolvableShlib { .. })));

        handle.transaction_mut().unwrap().self_update_relaxation = true;
        handle.transaction_mut().unwrap().prepared = false;
        handle.transaction_mut().unwrap().missing_shlibs.clear();
        prepare(&mut handle).unwrap();
        assert!(handle.transaction().unwrap().prepared);
    }

    #[test]
    fn conflicts_are_always_fatal() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();
        handle.db().put(&installed("old-thing", "1.0", false)).unwrap();

        let txn = handle.begin_transaction();
        let mut incoming = installed("new-thing", "1.0", false);
        incoming.set_string_list("conflicts", ["old-thing"]);
        txn.upsert(
            Entry {
                descriptor: incoming,
                transaction: TransactionType::Install,
                replaced: false,
            },
            false,
        );

        let err = prepare(&mut handle).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn replaces_inherits_automatic_install_onto_a_brand_new_replacer() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();
        handle.db().put(&installed("oldpkg", "1.0", true)).unwrap();

        let txn = handle.begin_transaction();
        let mut newpkg = installed("newpkg", "1.0", false);
        newpkg.set_state(State::NotInstalled);
        newpkg.set_string_list("replaces", ["oldpkg>=0"]);
        txn.upsert(
            Entry {
                descriptor: newpkg,
                transaction: TransactionType::Install,
                replaced: false,
            },
            false,
        );

        prepare(&mut handle).unwrap();
        let txn = handle.transaction().unwrap();
        let entry = txn.find("newpkg").unwrap();
        assert!(entry.descriptor.automatic_install());
        assert!(txn.find("oldpkg").unwrap().transaction == TransactionType::Remove);
    }
}
