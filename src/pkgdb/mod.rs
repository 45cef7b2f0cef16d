//! Installed-package database: a single canonical mapping keyed by
//! package name, lazily materialized from a persisted file (spec component
//! "Installed-Package Database", spec.md §4.5).

pub mod lock;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::plist::{self, Mapping, Value};
use crate::types::Descriptor;
use crate::version;
use lock::DbLock;

/// On-disk format version embedded in the database filename
/// (`pkgdb-<version>.plist`, spec.md §6).
pub const DB_FORMAT_VERSION: &str = "1";

/// The installed-package database: `pkgname -> Descriptor`, plus the
/// derived virtual-provides index and a memoized reverse-dependency map.
pub struct PkgDb {
    metadir: PathBuf,
    packages: Mapping,
    /// `vpkgname -> (pkgver -> pkgname)`, derived from every descriptor's
    /// `provides` sequence (spec.md §4.5 step 5).
    vpkg_index: HashMap<String, HashMap<String, String>>,
    revdeps: Option<HashMap<String, Vec<String>>>,
    last_flushed_bytes: Option<Vec<u8>>,
    _lock: DbLock,
}

impl PkgDb {
    fn db_path(metadir: &Path) -> PathBuf {
        metadir.join(format!("pkgdb-{DB_FORMAT_VERSION}.plist"))
    }

    /// Loads (or initializes empty) the database under `metadir`, acquiring
    /// the cross-process lock per the load sequence in spec.md §4.5.
    ///
    /// # Errors
    /// Returns [`Error::IoFailure`] if `metadir` cannot be created, the lock
    /// cannot be acquired, or the database file cannot be read;
    /// [`Error::CorruptDatabase`] if the stored plist is not a mapping or a
    /// stored descriptor's `pkgver` fails to parse.
    pub fn load(metadir: impl Into<PathBuf>, events: &EventSink) -> Result<Self> {
        let metadir = metadir.into();
        fs::create_dir_all(&metadir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&metadir)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&metadir, perms)?;
        }

        let lock = DbLock::acquire(&metadir, events)?;

        let path = Self::db_path(&metadir);
        let (packages, last_flushed_bytes) = if path.is_file() {
            let text = fs::read_to_string(&path)?;
            let value = plist::internalize(&text)?;
            let map = value
                .as_map()
                .cloned()
                .ok_or_else(|| Error::CorruptDatabase(format!("{}: not a mapping", path.display())))?;
            (map, Some(text.into_bytes()))
        } else {
            (Mapping::new(), None)
        };

        let mut db = Self {
            metadir,
            packages,
            vpkg_index: HashMap::new(),
            revdeps: None,
            last_flushed_bytes,
            _lock: lock,
        };
        db.ensure_pkgname_keys()?;
        db.rebuild_vpkg_index();
        Ok(db)
    }

    fn ensure_pkgname_keys(&mut self) -> Result<()> {
        let keys: Vec<String> = self.packages.keys().map(str::to_string).collect();
        for key in keys {
            if key == crate::alternatives::ALTERNATIVES_KEY {
                continue;
            }
            let has_pkgname = self.packages.get_map(&key).is_some_and(|m| m.get_str("pkgname").is_some());
            if has_pkgname {
                continue;
            }
            let pkgver = self
                .packages
                .get_map(&key)
                .and_then(|m| m.get_str("pkgver"))
                .ok_or_else(|| Error::CorruptDatabase(format!("entry {key} has no pkgver")))?
                .to_string();
            let name = version::pkgname_from_pkgver(&pkgver)
                .map_err(|_| Error::CorruptDatabase(format!("entry {key} has unparsable pkgver {pkgver}")))?;
            if let Some(Value::Map(mut m)) = self.packages.get(&key).cloned() {
                let _ = m.insert("pkgname", Value::str(&name));
                let _ = self.packages.insert(key, Value::Map(m));
            }
        }
        Ok(())
    }

    fn rebuild_vpkg_index(&mut self) {
        self.vpkg_index.clear();
        for (pkgname, value) in self.packages.iter() {
            if pkgname == crate::alternatives::ALTERNATIVES_KEY {
                continue;
            }
            let Some(map) = value.as_map() else { continue };
            let descriptor = Descriptor::from_mapping(map.clone());
            for provided_pkgver in descriptor.provides() {
                let Ok(vpkgname) = version::pkgname_from_pkgver(provided_pkgver) else {
                    continue;
                };
                self.vpkg_index
                    .entry(vpkgname)
                    .or_default()
                    .insert(provided_pkgver.to_string(), pkgname.to_string());
            }
        }
    }

    /// Ensures the database has been loaded and indexed; exposed as an
    /// explicit no-op rather than overloading a lookup call.
    pub fn ensure_loaded(&self) {}

    /// Looks up a real package by name.
    #[must_use]
    pub fn get(&self, pkgname: &str) -> Option<Descriptor> {
        self.packages.get_map(pkgname).map(|m| Descriptor::from_mapping(m.clone()))
    }

    /// Looks up any concrete provider of virtual package `vpkgname`,
    /// preferring `preferred_pkgver` (from the user's config, spec.md §4.8)
    /// when that specific pkgver is among the providers.
    #[must_use]
    pub fn get_virtual(&self, vpkgname: &str, preferred_pkgver: Option<&str>) -> Option<Descriptor> {
        let providers = self.vpkg_index.get(vpkgname)?;
        if let Some(pref) = preferred_pkgver
            && let Some(owner) = providers.get(pref)
        {
            return self.get(owner);
        }
        providers.values().next().and_then(|owner| self.get(owner))
    }

    /// Whether `pkgname` is present with a non-`not-installed` state
    /// (spec.md §3 invariant).
    #[must_use]
    pub fn is_installed(&self, pkgname: &str) -> bool {
        self.get(pkgname)
            .is_some_and(|d| d.state() != crate::types::State::NotInstalled)
    }

    /// All installed descriptors (the reserved alternatives-registry key is
    /// excluded).
    pub fn iter(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.packages
            .iter()
            .filter(|(k, _)| *k != crate::alternatives::ALTERNATIVES_KEY)
            .filter_map(|(_, v)| v.as_map())
            .map(|m| Descriptor::from_mapping(m.clone()))
    }

    /// Loads the alternatives registry stored under the reserved key
    /// (spec.md §3 invariant `_DULGE_ALTERNATIVES_`).
    #[must_use]
    pub fn alternatives(&self) -> crate::alternatives::AlternativesRegistry {
        crate::alternatives::AlternativesRegistry::from_mapping(self.packages.get_map(crate::alternatives::ALTERNATIVES_KEY))
    }

    /// Persists the alternatives registry back under the reserved key.
    pub fn save_alternatives(&mut self, registry: &crate::alternatives::AlternativesRegistry) {
        let _ = self.packages.insert(crate::alternatives::ALTERNATIVES_KEY, Value::Map(registry.to_mapping()));
    }

    /// Inserts or replaces a package entry, keyed by its `pkgname`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the descriptor's `pkgname` is
    /// empty.
    pub fn put(&mut self, descriptor: &Descriptor) -> Result<()> {
        let name = descriptor.pkgname();
        if name.is_empty() {
            return Err(Error::InvalidArgument("descriptor has no pkgname".into()));
        }
        let name = name.to_string();
        let _ = self.packages.insert(name, Value::Map(descriptor.as_mapping().clone()));
        self.revdeps = None;
        self.rebuild_vpkg_index();
        Ok(())
    }

    /// Removes a package entry entirely.
    pub fn purge(&mut self, pkgname: &str) -> Result<()> {
        let _ = self.packages.remove(pkgname)?;
        self.revdeps = None;
        self.rebuild_vpkg_index();
        Ok(())
    }

    /// Flushes the in-memory database to disk if `flush` is set, comparing
    /// against the last-known-on-disk bytes to avoid rewriting unchanged
    /// content (spec.md §8 testable property 3, "database idempotence").
    ///
    /// # Errors
    /// Returns [`Error::IoFailure`] on write failure.
    pub fn update(&mut self, flush: bool) -> Result<()> {
        if !flush {
            return Ok(());
        }
        let text = plist::externalize(&Value::Map(self.packages.clone()));
        if self.last_flushed_bytes.as_deref() == Some(text.as_bytes()) {
            return Ok(());
        }
        let path = Self::db_path(&self.metadir);
        let tmp = path.with_extension("plist.tmp");
        fs::write(&tmp, &text)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        }
        fs::rename(&tmp, &path)?;
        self.last_flushed_bytes = Some(text.into_bytes());
        Ok(())
    }

    /// Resolves a `run_depends` pattern to the pkgname it is satisfied by,
    /// checking the user's virtual preference first, then a real package,
    /// then any local provider of the virtual name (spec.md §4.7 step 1–2).
    #[must_use]
    pub fn resolve_dep_pkgname(&self, pattern: &str, user_vpkg_prefs: &HashMap<String, String>) -> Option<String> {
        let name = version::pattern_name(pattern);
        if let Some(preferred_pkgver) = user_vpkg_prefs.get(&name) {
            if let Some(owner) = version::pkgname_from_pkgver(preferred_pkgver).ok().filter(|n| self.get(n).is_some()) {
                return Some(owner);
            }
        }
        if self.get(&name).is_some() {
            return Some(name);
        }
        self.vpkg_index.get(&name)?.values().next().cloned()
    }

    /// Computes (and memoizes) the reverse-dependency index: for every
    /// package, the set of pkgnames whose `run_depends` resolves to it.
    pub fn reverse_deps(&mut self, user_vpkg_prefs: &HashMap<String, String>) -> &HashMap<String, Vec<String>> {
        if self.revdeps.is_none() {
            let mut index: HashMap<String, Vec<String>> = HashMap::new();
            let entries: Vec<(String, Vec<String>)> = self
                .packages
                .iter()
                .filter_map(|(name, v)| v.as_map().map(|m| (name.to_string(), m.clone())))
                .map(|(name, m)| (name, Descriptor::from_mapping(m).run_depends().map(str::to_string).collect()))
                .collect();
            for (pkgname, run_depends) in entries {
                for pattern in run_depends {
                    if let Some(dep_name) = self.resolve_dep_pkgname(&pattern, user_vpkg_prefs) {
                        index.entry(dep_name).or_default().push(pkgname.clone());
                    }
                }
            }
            self.revdeps = Some(index);
        }
        self.revdeps.as_ref().expect("just computed")
    }

    /// The reverse-dependency set for a single package (empty if none or
    /// unknown).
    pub fn reverse_deps_of(&mut self, pkgname: &str, user_vpkg_prefs: &HashMap<String, String>) -> Vec<String> {
        self.reverse_deps(user_vpkg_prefs).get(pkgname).cloned().unwrap_or_default()
    }

    /// The metadir this database was loaded from.
    #[must_use]
    pub fn metadir(&self) -> &Path {
        &self.metadir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::silent_sink;
    use crate::types::State;

    fn put_installed(db: &mut PkgDb, pkgname: &str, version: &str, run_depends: &[&str], provides: &[&str]) {
        let mut d = Descriptor::new(pkgname, version, "1", "x86_64");
        d.set_state(State::Installed);
        d.set_string_list("run_depends", run_depends.iter().copied());
        d.set_string_list("provides", provides.iter().copied());
        db.put(&d).unwrap();
    }

    #[test]
    fn update_is_idempotent_second_call_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        put_installed(&mut db, "foo", "1.0", &[], &[]);
        db.update(true).unwrap();
        let path = PkgDb::db_path(dir.path());
        let mtime1 = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        db.update(true).unwrap();
        let mtime2 = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime1, mtime2);
    }

    #[test]
    fn reverse_deps_resolve_through_run_depends() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        put_installed(&mut db, "foo", "1.0", &[], &[]);
        put_installed(&mut db, "bar", "1.0", &["foo>=1.0"], &[]);
        let revdeps = db.reverse_deps_of("foo", &HashMap::new());
        assert_eq!(revdeps, vec!["bar".to_string()]);
    }

    #[test]
    fn virtual_lookup_resolves_through_provides() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PkgDb::load(dir.path(), &silent_sink()).unwrap();
        put_installed(&mut db, "python3", "3.10", &[], &["python-3.10_1"]);
        let found = db.get_virtual("python", None).unwrap();
        assert_eq!(found.pkgname(), "python3");
    }
}
