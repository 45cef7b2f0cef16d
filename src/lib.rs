//! Transaction engine for a binary package manager targeting a source-based
//! Linux distribution.
//!
//! This crate provides the core, UI-independent machinery: a tagged
//! property-tree value model, archive I/O, a repository pool with signature
//! trust, version algebra, the installed-package database, an alternatives
//! arbiter, a dependency resolver, and the transaction builder/validator/
//! executor pipeline that turns a set of install/update/remove requests into
//! a prepared, then applied, change to the root filesystem.
//!
//! # Example
//!
//! ```no_run
//! use pkgcore::prelude::*;
//!
//! # fn example() -> Result<()> {
//! let mut handle = Handle::init_silent(&["/etc/pkgcore"])?;
//! handle.begin_transaction();
//! # Ok(())
//! # }
//! ```

pub mod alternatives;
pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod handle;
pub mod integrity;
pub mod pkgdb;
pub mod plist;
pub mod repo;
pub mod resolve;
pub mod transaction;
pub mod types;
pub mod version;
pub mod worker;

/// Convenience re-exports for the most commonly used types and traits.
///
/// ```no_run
/// use pkgcore::prelude::*;
/// ```
pub mod prelude;

pub use error::{Error, Result};
pub use events::{EventSink, HandleEvent};
pub use handle::Handle;
pub use types::{Descriptor, FilesManifest, RepoArtifact, State, Transaction, TransactionType};
