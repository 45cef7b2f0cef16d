//! Configuration: merges layered config directories into a handle-ready
//! value set (spec.md §2 item 5, §6 "Configuration").
//!
//! Grounded on the teacher's `ArchClientBuilder` (`src/client.rs`) for the
//! builder shape, generalized to the option set spec.md §6 enumerates
//! exhaustively.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// The recognized boolean flags, exhaustively, per spec.md §6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Verbose diagnostic output.
    pub debug: bool,
    /// Extra progress detail.
    pub verbose: bool,
    /// Force the configure phase even if already configured.
    pub force_configure: bool,
    /// Force file removal even on non-fatal errors.
    pub force_remove_files: bool,
    /// Force removal even with outstanding reverse dependencies.
    pub force_remove_revdeps: bool,
    /// Ignore repositories listed only in confdir, not the main config.
    pub ignore_conf_repos: bool,
    /// Save modified config files as `.new-<ver>` instead of overwriting.
    pub keep_config: bool,
    /// Allow using a repository's `stage` section even when remote.
    pub use_stage: bool,
    /// Stop the executor after the verify phase.
    pub download_only: bool,
    /// Mark newly-installed dependency-expansion results as automatic.
    pub install_auto: bool,
    /// Allow repository metadata sync to run against in-memory fetches.
    pub repos_memsync: bool,
    /// Prefer the best available match rather than the first satisfying one.
    pub bestmatch: bool,
    /// Suppress syslog notifications.
    pub disable_syslog: bool,
}

/// A single `repo` definition parsed from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoDef {
    /// Repository URL or local path.
    pub url: String,
}

/// A virtual-package preference: `virtualpkg <vpkgname> = <real-pkgver>`.
#[derive(Debug, Clone)]
pub struct VirtualPref {
    /// The virtual package name being configured.
    pub vpkgname: String,
    /// The concrete pkgver preferred for that virtual name.
    pub preferred_pkgver: String,
}

/// Raw, serde-deserializable shape of a single confdir TOML file. Layered
/// confdirs are merged field-by-field, later directories overriding
/// earlier ones for scalars and extending lists for collections.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rootdir: Option<String>,
    #[serde(default)]
    cachedir: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    keydir: Option<String>,
    #[serde(default)]
    repositories: Vec<String>,
    #[serde(default)]
    ignore_pkg: Vec<String>,
    #[serde(default)]
    preserve: Vec<String>,
    #[serde(default)]
    virtualpkg: Vec<String>,
    #[serde(default)]
    flags: Vec<String>,
}

/// The merged configuration handle built from one or more layered confdirs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root install path (default `/`).
    pub rootdir: PathBuf,
    /// Download cache directory.
    pub cachedir: PathBuf,
    /// Native architecture override, if set.
    pub architecture: Option<String>,
    /// Trusted-key store directory.
    pub keydir: PathBuf,
    /// Ordered, first-is-highest-priority repository URL list.
    pub repositories: Vec<String>,
    /// Glob patterns for packages to never consider for install/update.
    pub ignored_packages: Vec<String>,
    /// Glob patterns for files never touched by the config-file merge rule.
    pub preserved_files: Vec<String>,
    /// Virtual-package preferences, in configuration order.
    pub virtual_prefs: Vec<VirtualPref>,
    /// Parsed boolean flags.
    pub flags: Flags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rootdir: PathBuf::from("/"),
            cachedir: PathBuf::from("/var/cache/pkgcore"),
            architecture: None,
            keydir: PathBuf::from("/var/db/pkgcore/keys"),
            repositories: Vec::new(),
            ignored_packages: Vec::new(),
            preserved_files: Vec::new(),
            virtual_prefs: Vec::new(),
            flags: Flags::default(),
        }
    }
}

impl Config {
    /// Merges one or more config directories (each containing `*.toml`
    /// files, in name order) into a single handle-ready [`Config`].
    ///
    /// Later directories override earlier ones for scalar options and
    /// extend (not replace) list options, matching "merges layered config
    /// directories" in spec.md §2.
    ///
    /// # Errors
    /// Returns [`Error::IoFailure`] if a confdir cannot be read, or
    /// [`Error::InvalidArgument`] if a file fails to parse as TOML.
    pub fn load_layered(confdirs: &[impl AsRef<Path>]) -> Result<Self> {
        let mut cfg = Self::default();
        for dir in confdirs {
            let dir = dir.as_ref();
            let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == "toml"))
                .collect();
            entries.sort();
            for path in entries {
                let text = fs::read_to_string(&path)?;
                let raw: RawConfig = toml::from_str(&text)
                    .map_err(|e| Error::InvalidArgument(format!("{}: {e}", path.display())))?;
                cfg.apply(raw);
            }
        }
        Ok(cfg)
    }

    fn apply(&mut self, raw: RawConfig) {
        if let Some(r) = raw.rootdir {
            self.rootdir = PathBuf::from(r);
        }
        if let Some(c) = raw.cachedir {
            self.cachedir = PathBuf::from(c);
        }
        if let Some(a) = raw.architecture {
            self.architecture = Some(a);
        }
        if let Some(k) = raw.keydir {
            self.keydir = PathBuf::from(k);
        }
        self.repositories.extend(raw.repositories);
        self.ignored_packages.extend(raw.ignore_pkg);
        self.preserved_files.extend(raw.preserve);
        for entry in raw.virtualpkg {
            if let Some((vpkgname, preferred)) = entry.split_once('=') {
                self.virtual_prefs.push(VirtualPref {
                    vpkgname: vpkgname.trim().to_string(),
                    preferred_pkgver: preferred.trim().to_string(),
                });
            }
        }
        for flag in raw.flags {
            self.apply_flag(&flag);
        }
    }

    fn apply_flag(&mut self, flag: &str) {
        match flag {
            "debug" => self.flags.debug = true,
            "verbose" => self.flags.verbose = true,
            "force-configure" => self.flags.force_configure = true,
            "force-remove-files" => self.flags.force_remove_files = true,
            "force-remove-revdeps" => self.flags.force_remove_revdeps = true,
            "ignore-conf-repos" => self.flags.ignore_conf_repos = true,
            "keep-config" => self.flags.keep_config = true,
            "use-stage" => self.flags.use_stage = true,
            "download-only" => self.flags.download_only = true,
            "install-auto" => self.flags.install_auto = true,
            "repos-memsync" => self.flags.repos_memsync = true,
            "bestmatch" => self.flags.bestmatch = true,
            "disable-syslog" => self.flags.disable_syslog = true,
            _ => {}
        }
    }

    /// Builds the vpkg-preference lookup used by [`crate::pkgdb`] and the
    /// resolver: `vpkgname -> preferred pkgname` (derived from each
    /// preference's `preferred_pkgver`).
    #[must_use]
    pub fn virtual_preference_map(&self) -> HashMap<String, String> {
        self.virtual_prefs
            .iter()
            .filter_map(|p| {
                crate::version::pkgname_from_pkgver(&p.preferred_pkgver)
                    .ok()
                    .map(|name| (p.vpkgname.clone(), name))
            })
            .collect()
    }

    /// The metadata directory: `rootdir/var/db/pkgcore` (analogous to the
    /// spec's `metadir`, kept distinct from `keydir`/`cachedir`).
    #[must_use]
    pub fn metadir(&self) -> PathBuf {
        self.rootdir.join("var/db/pkgcore")
    }

    /// Whether `rel_path` matches one of the configured preserved-file
    /// patterns, meaning both the config-file merge (`execute.rs`) and the
    /// integrity checker's noextract skip (spec.md §4.12) must leave it
    /// untouched.
    #[must_use]
    pub fn is_preserved(&self, rel_path: &str) -> bool {
        path_is_preserved(&self.preserved_files, rel_path)
    }
}

/// True if `rel_path` matches one of `patterns` (preserved-file glob list).
/// Exposed standalone so callers already holding a cloned pattern list (to
/// avoid borrowing [`Config`] across a closure) don't need a whole `Config`.
#[must_use]
pub fn path_is_preserved(patterns: &[String], rel_path: &str) -> bool {
    patterns.iter().any(|glob| {
        if let Some(prefix) = glob.strip_suffix('*') {
            rel_path.starts_with(prefix)
        } else {
            glob == rel_path
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn layered_confdirs_merge_scalars_and_extend_lists() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        std::fs::write(
            dir1.path().join("00-base.toml"),
            "rootdir = \"/\"\nrepositories = [\"https://a/repo\"]\n",
        )
        .unwrap();
        let mut f = std::fs::File::create(dir2.path().join("10-local.toml")).unwrap();
        writeln!(f, "repositories = [\"https://b/repo\"]\nflags = [\"verbose\"]").unwrap();

        let cfg = Config::load_layered(&[dir1.path(), dir2.path()]).unwrap();
        assert_eq!(cfg.rootdir, PathBuf::from("/"));
        assert_eq!(cfg.repositories, vec!["https://a/repo", "https://b/repo"]);
        assert!(cfg.flags.verbose);
    }

    #[test]
    fn virtual_preference_map_derives_pkgname() {
        let mut cfg = Config::default();
        cfg.virtual_prefs.push(VirtualPref {
            vpkgname: "python".into(),
            preferred_pkgver: "python3-3.10_1".into(),
        });
        let map = cfg.virtual_preference_map();
        assert_eq!(map.get("python").map(String::as_str), Some("python3"));
    }

    #[test]
    fn is_preserved_matches_exact_and_glob_patterns() {
        let mut cfg = Config::default();
        cfg.preserved_files.push("etc/exact.conf".into());
        cfg.preserved_files.push("etc/local.d/*".into());

        assert!(cfg.is_preserved("etc/exact.conf"));
        assert!(cfg.is_preserved("etc/local.d/10-custom.conf"));
        assert!(!cfg.is_preserved("etc/other.conf"));
    }
}
