//! In-flight transaction: accumulated package actions plus validator
//! diagnostics and aggregate counters.

use crate::types::Descriptor;

/// The action a package is tagged with inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Fresh install of a package not previously present.
    Install,
    /// Re-install of the currently installed version (forced).
    Reinstall,
    /// Install of a newer (or reverting) version over an older one.
    Update,
    /// Removal of a currently installed package.
    Remove,
    /// Run-configure only (no unpack), used to resume a crashed transaction.
    Configure,
    /// Excluded from updates by the `hold` flag.
    Hold,
    /// Download only, no unpack/configure (the `download-only` flag).
    Download,
}

/// One entry in a transaction's package list: the descriptor plus the
/// bookkeeping the builder and validators attach to it.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The package descriptor (post-decision: this is the version that
    /// will end up installed, or the currently-installed one for removals).
    pub descriptor: Descriptor,
    /// The action tagged on this entry.
    pub transaction: TransactionType,
    /// Set by the replaces validator when this entry is a casualty of
    /// another package's `replaces` pattern.
    pub replaced: bool,
}

/// An in-flight transaction: the accumulated package action list plus
/// validator diagnostics and aggregate counters (spec.md §3 "Transaction").
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    /// Ordered package actions.
    pub packages: Vec<Entry>,
    /// `"<Q> breaks because <I> is being removed"`-style diagnostics from
    /// the reverse-dependency validator.
    pub missing_deps: Vec<String>,
    /// Diagnostics from the shared-library validator.
    pub missing_shlibs: Vec<String>,
    /// Diagnostics from the conflicts validator.
    pub conflicts: Vec<String>,
    /// Files to remove for packages being obsoleted (not fully removed).
    pub obsolete_files: Vec<(String, Vec<String>)>,
    /// Files to remove for packages being removed outright.
    pub remove_files: Vec<(String, Vec<String>)>,
    /// Whether `prepare()` has completed successfully and the transaction
    /// has been frozen.
    pub prepared: bool,
    /// Relaxation flag: set when a self-update is in progress, permitting
    /// the reverse-dependency/shlib validators to demote fatal diagnostics
    /// to warnings (spec.md §4.9, §4.10).
    pub self_update_relaxation: bool,
}

/// Aggregate counters computed once a transaction has been prepared
/// successfully (spec.md §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Number of `Install` entries.
    pub install: usize,
    /// Number of `Update` entries.
    pub update: usize,
    /// Number of `Configure` entries.
    pub configure: usize,
    /// Number of `Remove` entries.
    pub remove: usize,
    /// Number of `Download` entries.
    pub download: usize,
    /// Number of `Hold` entries.
    pub hold: usize,
    /// Total bytes that will be installed.
    pub total_installed_size: u64,
    /// Total bytes that will be downloaded.
    pub total_download_size: u64,
    /// Total bytes that will be freed by removals.
    pub total_removed_size: u64,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the entry for `pkgname`, if any.
    #[must_use]
    pub fn find(&self, pkgname: &str) -> Option<&Entry> {
        self.packages.iter().find(|e| e.descriptor.pkgname() == pkgname)
    }

    /// Finds the entry for `pkgname`, mutably.
    pub fn find_mut(&mut self, pkgname: &str) -> Option<&mut Entry> {
        self.packages.iter_mut().find(|e| e.descriptor.pkgname() == pkgname)
    }

    /// Whether any diagnostic (missing dep, shlib, or conflict) is present.
    #[must_use]
    pub fn has_diagnostics(&self) -> bool {
        !self.missing_deps.is_empty() || !self.missing_shlibs.is_empty() || !self.conflicts.is_empty()
    }

    /// Inserts or replaces an entry, deduplicating by pkgname: the more
    /// recent decision wins (spec.md §4.9 "Storage").
    ///
    /// `at_head` places a fresh entry at the head of the list (used for
    /// removals of reverse-dependency casualties); otherwise it is
    /// appended at the tail.
    pub fn upsert(&mut self, entry: Entry, at_head: bool) {
        if let Some(existing) = self
            .packages
            .iter()
            .position(|e| e.descriptor.pkgname() == entry.descriptor.pkgname())
        {
            self.packages[existing] = entry;
            return;
        }
        if at_head {
            self.packages.insert(0, entry);
        } else {
            self.packages.push(entry);
        }
    }

    /// Computes the aggregate counters described in spec.md §3.
    #[must_use]
    pub fn counters(&self) -> Counters {
        let mut c = Counters::default();
        for e in &self.packages {
            match e.transaction {
                TransactionType::Install => {
                    c.install += 1;
                    c.total_installed_size += e.descriptor.installed_size();
                    c.total_download_size += e.descriptor.filename_size();
                }
                TransactionType::Update | TransactionType::Reinstall => {
                    c.update += 1;
                    c.total_installed_size += e.descriptor.installed_size();
                    c.total_download_size += e.descriptor.filename_size();
                }
                TransactionType::Remove => {
                    c.remove += 1;
                    c.total_removed_size += e.descriptor.installed_size();
                }
                TransactionType::Configure => c.configure += 1,
                TransactionType::Hold => c.hold += 1,
                TransactionType::Download => {
                    c.download += 1;
                    c.total_download_size += e.descriptor.filename_size();
                }
            }
        }
        c
    }
}
