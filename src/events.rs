//! Event channel replacing the C `state_cb` / `fetch_cb` / `key_import_cb`
//! callback trio.
//!
//! Grounded on `other_examples/…pkgforge-soar…event.rs`'s staged-event-enum
//! style: a single flat enum with per-phase variants, emitted in the exact
//! order the executor performs the corresponding work (spec.md §9,
//! "callbacks → channels").

use std::sync::Arc;

/// Download/verify/unpack/configure phase an install-or-update action has
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    /// Archive download started.
    DownloadStarted,
    /// Archive download finished.
    DownloadFinished,
    /// Hash/signature verification passed.
    Verified,
    /// Archive extracted to `rootdir`.
    Unpacked,
    /// Configure hook ran and the package transitioned to `installed`.
    Configured,
}

/// Stage a removal has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStage {
    /// Alternatives unregistered.
    AlternativesUnregistered,
    /// Files removed from disk.
    FilesRemoved,
    /// Database entry purged.
    Purged,
}

/// Alternatives-group lifecycle events (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltGroupEvent {
    /// A new group was created with `pkgname` at the head.
    Added { group: String, pkgname: String },
    /// An existing group gained a new (non-head) provider.
    GroupAdded { group: String, pkgname: String },
    /// The group's head was switched to `pkgname`.
    Switched { group: String, pkgname: String },
    /// The group's symlinks were removed entirely (group deleted).
    Removed { group: String, pkgname: String },
    /// A single symlink was created.
    LinkAdded { group: String, link: String, target: String },
    /// A single symlink was removed.
    LinkRemoved { group: String, link: String },
}

/// Every event the core may emit to a caller-supplied sink, in the order
/// the corresponding work happens.
#[derive(Debug, Clone)]
pub enum HandleEvent {
    /// A repository's public key was seen for the first time and needs the
    /// caller's accept/reject decision (see [`crate::handle::Handle::import_key`]).
    KeyImport { fingerprint: String, signer: String },
    /// Per-byte fetch progress.
    FetchProgress {
        url: String,
        bytes_seen: u64,
        total: Option<u64>,
    },
    /// An install/update/reinstall action advanced to a new stage.
    Install { pkgver: String, stage: InstallStage },
    /// A remove action advanced to a new stage.
    Remove { pkgver: String, stage: RemoveStage },
    /// An alternatives-group lifecycle event.
    Alternatives(AltGroupEvent),
    /// A non-fatal warning (e.g. a tolerated `ENOENT` during removal).
    Warning { pkgver: Option<String>, message: String },
}

/// A callback sink for [`HandleEvent`]s. Calls are synchronous and strictly
/// ordered: the executor never emits events out of the order its phases run.
pub type EventSink = Arc<dyn Fn(HandleEvent) + Send + Sync>;

/// Builds a no-op sink, for handles that don't care about progress events.
#[must_use]
pub fn silent_sink() -> EventSink {
    Arc::new(|_event| {})
}
