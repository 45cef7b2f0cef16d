//! Dependency resolver: topologically ordered full-dependency walk over
//! either the repository pool or the installed database (spec.md §4.7).
//!
//! Grounded on spec.md §4.7's "work-stealing cycle-safe walk keyed by
//! package name"; the visited-set DFS shape mirrors the teacher's
//! `deps::resolve` module, generalized from a flat AUR dependency list to a
//! provides-aware, source-agnostic walker.

use std::collections::{HashMap, HashSet};

use crate::error::{DependencyError, Error, Result};
use crate::pkgdb::PkgDb;
use crate::repo::RepoPool;
use crate::types::Descriptor;
use crate::version;

/// A source of package descriptors the resolver can walk: either the
/// repository pool or the installed-package database (spec.md §4.7,
/// "pool-or-database switch").
pub trait PackageSource {
    /// Looks up a real (non-virtual) package by name.
    ///
    /// # Errors
    /// Propagates the underlying source's lookup failures.
    fn lookup_real(&mut self, pkgname: &str) -> Result<Option<Descriptor>>;

    /// Looks up any provider of virtual package `vpkgname`, preferring
    /// `preferred_pkgver` when given.
    ///
    /// # Errors
    /// Propagates the underlying source's lookup failures.
    fn lookup_virtual(&mut self, vpkgname: &str, preferred_pkgver: Option<&str>) -> Result<Option<Descriptor>>;
}

impl PackageSource for PkgDb {
    fn lookup_real(&mut self, pkgname: &str) -> Result<Option<Descriptor>> {
        Ok(self.get(pkgname))
    }

    fn lookup_virtual(&mut self, vpkgname: &str, preferred_pkgver: Option<&str>) -> Result<Option<Descriptor>> {
        Ok(self.get_virtual(vpkgname, preferred_pkgver))
    }
}

impl PackageSource for RepoPool {
    fn lookup_real(&mut self, pkgname: &str) -> Result<Option<Descriptor>> {
        let mut found = None;
        self.foreach(|repo| {
            if let Some(d) = repo.get(pkgname) {
                found = Some(d);
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }

    fn lookup_virtual(&mut self, vpkgname: &str, preferred_pkgver: Option<&str>) -> Result<Option<Descriptor>> {
        let mut found = None;
        self.foreach(|repo| {
            for d in repo.iter() {
                if d.provides().any(|p| p == preferred_pkgver.unwrap_or_default()) {
                    found = Some(d);
                    return Ok(true);
                }
            }
            Ok(false)
        })?;
        if found.is_some() {
            return Ok(found);
        }
        let mut found = None;
        self.foreach(|repo| {
            for d in repo.iter() {
                if d.provides().any(|p| version::pkgname_from_pkgver(p).map(|n| n == vpkgname).unwrap_or(false)) {
                    found = Some(d);
                    return Ok(true);
                }
            }
            Ok(false)
        })?;
        Ok(found)
    }
}

/// Whether an unresolvable dependency aborts the walk (pool scope) or is
/// silently skipped (local-database scope, per spec.md §4.7 step 1: "absence
/// of a locally-installed runtime dep is silently skipped in that mode
/// only").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Missing dependency is fatal.
    Fatal,
    /// Missing dependency is silently skipped.
    Skip,
}

/// Computes the full, topologically ordered dependency tree for `root`:
/// deepest-first, root excluded, cycle-safe, honoring the provides-override
/// rule (spec.md §4.7, §8 testable properties 4–5).
///
/// # Errors
/// Returns [`Error::DependencyBroken`] if a pattern cannot be resolved and
/// `missing` is [`MissingPolicy::Fatal`].
pub fn full_dep_tree<S: PackageSource>(
    source: &mut S,
    root: &Descriptor,
    vpkg_prefs: &HashMap<String, String>,
    missing: MissingPolicy,
) -> Result<Vec<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root.pkgname().to_string());
    let mut emitted = Vec::new();
    walk(source, root, vpkg_prefs, missing, &mut visited, &mut emitted)?;
    Ok(emitted)
}

fn walk<S: PackageSource>(
    source: &mut S,
    node: &Descriptor,
    vpkg_prefs: &HashMap<String, String>,
    missing: MissingPolicy,
    visited: &mut HashSet<String>,
    emitted: &mut Vec<String>,
) -> Result<()> {
    let patterns: Vec<String> = node.run_depends().map(str::to_string).collect();
    let own_provides: HashSet<String> = node
        .provides()
        .filter_map(|p| version::pkgname_from_pkgver(p).ok())
        .collect();

    for pattern in patterns {
        let dep_name = version::pattern_name(&pattern);

        // Rule: if the walking package already provides this name itself,
        // the dependency is elided (spec.md §8 property 5).
        if own_provides.contains(&dep_name) {
            continue;
        }
        if visited.contains(&dep_name) {
            continue;
        }

        let preferred = vpkg_prefs.get(&dep_name).map(String::as_str);
        let resolved = match source.lookup_real(&dep_name)? {
            Some(d) => Some(d),
            None => source.lookup_virtual(&dep_name, preferred)?,
        };

        match resolved {
            Some(dep_desc) => {
                visited.insert(dep_name);
                walk(source, &dep_desc, vpkg_prefs, missing, visited, emitted)?;
                emitted.push(dep_desc.pkgver().to_string());
            }
            None if missing == MissingPolicy::Skip => {}
            None => {
                return Err(Error::DependencyBroken(DependencyError::NoSuchDependency {
                    pkgver: node.pkgver().to_string(),
                    pattern,
                }));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::silent_sink;
    use crate::types::State;

    fn installed(pkgname: &str, version: &str, run_depends: &[&str], provides: &[&str]) -> Descriptor {
        let mut d = Descriptor::new(pkgname, version, "1", "x86_64");
        d.set_state(State::Installed);
        d.set_string_list("run_depends", run_depends.iter().copied());
        d.set_string_list("provides", provides.iter().copied());
        d
    }

    #[test]
    fn full_dep_tree_is_deepest_first_and_acyclic() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        db.put(&installed("foo", "1.0", &[], &[])).unwrap();
        db.put(&installed("bar", "1.0", &["foo>=1.0"], &[])).unwrap();
        let baz = installed("baz", "1.0", &["bar>=1.0"], &[]);
        db.put(&baz).unwrap();

        let order = full_dep_tree(&mut db, &baz, &HashMap::new(), MissingPolicy::Fatal).unwrap();
        assert_eq!(order, vec!["foo-1.0_1".to_string(), "bar-1.0_1".to_string()]);
    }

    #[test]
    fn provides_elides_self_satisfied_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        let p = installed("meta-foo", "1.0", &["foo>=1.0"], &["foo-1.0_1"]);
        db.put(&p).unwrap();
        let order = full_dep_tree(&mut db, &p, &HashMap::new(), MissingPolicy::Fatal).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn missing_dependency_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        let p = installed("needs-ghost", "1.0", &["ghost>=1.0"], &[]);
        db.put(&p).unwrap();
        let err = full_dep_tree(&mut db, &p, &HashMap::new(), MissingPolicy::Fatal).unwrap_err();
        assert!(matches!(err, Error::DependencyBroken(DependencyError::NoSuchDependency { .. })));
    }

    #[test]
    fn missing_dependency_is_skipped_in_skip_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        let p = installed("needs-ghost", "1.0", &["ghost>=1.0"], &[]);
        db.put(&p).unwrap();
        let order = full_dep_tree(&mut db, &p, &HashMap::new(), MissingPolicy::Skip).unwrap();
        assert!(order.is_empty());
    }
}
