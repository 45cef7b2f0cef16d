//! Process-wide handle: the context created by `init` and torn down by
//! `end`, tying together configuration, the repository pool, the installed
//! database, and the event sink (spec.md glossary, "Handle").
//!
//! Grounded on the teacher's `ArchClientBuilder` (`src/client.rs`) for the
//! construct-then-use shape, generalized from a single HTTP client to the
//! full set of process-wide state the specification's `Handle` enumerates.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::events::{EventSink, HandleEvent, silent_sink};
use crate::pkgdb::PkgDb;
use crate::repo::RepoPool;
use crate::repo::signature::KeyStore;
use crate::types::Transaction;

/// Process-wide context for a single session of package operations.
///
/// Exactly one transaction may be in flight on a handle at a time (spec.md
/// glossary): [`Handle::begin_transaction`] replaces any prior one.
pub struct Handle {
    config: Config,
    pool: RepoPool,
    db: PkgDb,
    events: EventSink,
    transaction: Option<Transaction>,
}

impl Handle {
    /// Loads the layered configuration under `confdirs`, opens the
    /// repository pool (without syncing any repository yet), and loads the
    /// installed-package database, acquiring its cross-process lock.
    ///
    /// # Errors
    /// Propagates [`Config::load_layered`] and [`PkgDb::load`] failures.
    pub fn init(confdirs: &[impl AsRef<Path>], events: EventSink) -> Result<Self> {
        let config = Config::load_layered(confdirs)?;
        let metadir = config.metadir();
        let architecture = config.architecture.clone().unwrap_or_else(default_architecture);
        info!(rootdir = %config.rootdir.display(), architecture, "handle init");

        let mut pool = RepoPool::new(&metadir, &config.keydir, &architecture, config.flags.use_stage, events.clone());
        for url in &config.repositories {
            pool.store(url);
        }

        let db = PkgDb::load(&metadir, &events)?;

        Ok(Self {
            config,
            pool,
            db,
            events,
            transaction: None,
        })
    }

    /// Builds a handle with a silent event sink, for callers that don't
    /// need progress notifications.
    ///
    /// # Errors
    /// Propagates [`Handle::init`] failures.
    pub fn init_silent(confdirs: &[impl AsRef<Path>]) -> Result<Self> {
        Self::init(confdirs, silent_sink())
    }

    /// Flushes the installed database and drops the handle, releasing its
    /// lock.
    ///
    /// # Errors
    /// Propagates [`PkgDb::update`] failures.
    pub fn end(mut self) -> Result<()> {
        debug!("handle end: flushing database");
        self.db.update(true)
    }

    /// The merged configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The repository pool.
    pub fn pool(&mut self) -> &mut RepoPool {
        &mut self.pool
    }

    /// The installed-package database.
    pub fn db(&mut self) -> &mut PkgDb {
        &mut self.db
    }

    /// The event sink this handle emits through.
    #[must_use]
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// `vpkgname -> preferred pkgname`, derived from the configured virtual
    /// preferences (spec.md §4.8).
    #[must_use]
    pub fn vpkg_prefs(&self) -> HashMap<String, String> {
        self.config.virtual_preference_map()
    }

    /// The in-flight transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Mutably borrows the in-flight transaction, if any.
    pub fn transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.transaction.as_mut()
    }

    /// Starts a fresh transaction, discarding any in-flight one (spec.md
    /// glossary: "exactly one active transaction per handle").
    pub fn begin_transaction(&mut self) -> &mut Transaction {
        self.transaction = Some(Transaction::new());
        self.transaction.as_mut().expect("just inserted")
    }

    /// Clears the in-flight transaction without executing it.
    pub fn discard_transaction(&mut self) {
        self.transaction = None;
    }

    /// Takes the in-flight transaction, leaving none behind, for the
    /// executor to consume.
    pub fn take_transaction(&mut self) -> Option<Transaction> {
        self.transaction.take()
    }

    /// Restores a transaction taken via [`Handle::take_transaction`], for
    /// validator/executor phases that need the handle mutably available
    /// while still owning the transaction they're working on.
    pub fn set_transaction(&mut self, txn: Transaction) {
        self.transaction = Some(txn);
    }

    /// Persists the caller's acceptance of a previously-unseen repository
    /// signing key, in response to a [`HandleEvent::KeyImport`] event.
    ///
    /// # Errors
    /// Propagates [`KeyStore::trust`] failures.
    pub fn import_key(&self, fingerprint: &str, signer: &str, public_key_der: &[u8]) -> Result<()> {
        let store = KeyStore::new(&self.config.keydir);
        store.trust(fingerprint, signer, public_key_der)?;
        (self.events)(HandleEvent::Warning {
            pkgver: None,
            message: format!("key {fingerprint} ({signer}) trusted"),
        });
        Ok(())
    }
}

fn default_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn write_confdir(dir: &Path, rootdir: &Path) {
        std::fs::write(
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

    #[test]
    fn init_loads_config_and_opens_empty_db() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());

        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();
        assert_eq!(handle.config().architecture.as_deref(), Some("x86_64"));
        assert!(handle.db().iter().next().is_none());
        handle.end().unwrap();
    }

    #[test]
    fn begin_transaction_replaces_any_prior_one() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());
        let mut handle = Handle::init_silent(&[confdir.path()]).unwrap();

        handle.begin_transaction().missing_deps.push("stale".into());
        handle.begin_transaction();
        assert!(handle.transaction().unwrap().missing_deps.is_empty());
    }

    #[test]
    fn import_key_persists_trust_and_emits_event() {
        let confdir = tempfile::tempdir().unwrap();
        let rootdir = tempfile::tempdir().unwrap();
        write_confdir(confdir.path(), rootdir.path());

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: EventSink = Arc::new(move |ev| {
            if let HandleEvent::Warning { message, .. } = ev {
                sink_events.lock().unwrap().push(message);
            }
        });
        let handle = Handle::init(&[confdir.path()], sink).unwrap();
        handle.import_key("deadbeef", "releng@example", b"fake-der").unwrap();
        assert!(KeyStore::new(&handle.config().keydir).is_trusted("deadbeef"));
        assert!(events.lock().unwrap().iter().any(|m| m.contains("deadbeef")));
    }
}
