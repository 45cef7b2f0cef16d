//! Unified error taxonomy for pkgcore operations.
//!
//! Every kind from the specification's error taxonomy is represented here
//! as a variant. Diagnostics collected by the transaction validators are a
//! separate, non-fatal list (see [`crate::types::transaction`]); this type
//! is for operations that fail outright.

use thiserror::Error;

/// Unified error type for all pkgcore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Package, file, or repository not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// The installed version already satisfies the request.
    #[error("already up to date: {0}")]
    AlreadyPresent(String),

    /// Malformed pkgver, pattern, or descriptor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Hash mismatch, signature failure, or corrupt archive.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// Ownership/write checks failed, or lock contention timed out.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Self-update is required before the requested action, or the
    /// database lock is held by another process in non-blocking mode.
    #[error("busy: {0}")]
    Busy(String),

    /// Missing dependency, broken reverse dependency, or missing shlib.
    #[error("dependency broken: {0}")]
    DependencyBroken(#[from] DependencyError),

    /// Package or file conflict detected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient disk space for the transaction.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Underlying read/write/network failure.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Allocation failure surfaced from a fallible operation.
    #[error("out of memory")]
    OutOfMemory,

    /// The on-disk database is internally inconsistent (e.g. a pkgver that
    /// fails to parse its own name). Per design, this never panics outside
    /// of tests: the caller is expected to treat it as unrecoverable and
    /// abort rather than attempt repair.
    #[error("corrupt database: {0}")]
    CorruptDatabase(String),

    /// Failure internalizing or externalizing a property-tree value.
    #[error("property tree error: {0}")]
    Plist(#[from] crate::plist::PlistError),

    /// Underlying HTTP fetch failure.
    #[cfg(feature = "net")]
    #[error("fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Sub-coded dependency breakage, each carrying the offending pkgver/pattern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// A `run_depends` pattern could not be resolved to any package.
    #[error("no such dependency: {pattern} (required by {pkgver})")]
    NoSuchDependency {
        /// The dependent package's pkgver.
        pkgver: String,
        /// The unsatisfiable pattern.
        pattern: String,
    },
    /// A reverse dependency would no longer be satisfied post-transaction.
    #[error("missing reverse dependency: {description}")]
    MissingReverseDependency {
        /// Free-form description, e.g. `"<Q> breaks because <I> is being removed"`.
        description: String,
    },
    /// A required shared-library soname has no provider post-transaction.
    #[error("unresolvable shlib: {pkgver}: broken, unresolvable shlib {soname}")]
    UnresolvableShlib {
        /// The dependent package's pkgver.
        pkgver: String,
        /// The missing soname.
        soname: String,
    },
}

/// Result type alias for pkgcore operations.
pub type Result<T> = std::result::Result<T, Error>;
