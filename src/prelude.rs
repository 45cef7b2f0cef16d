//! Convenience re-exports.
//!
//! ```no_run
//! use pkgcore::prelude::*;
//! ```

// Handle and its context
pub use crate::handle::Handle;

// Error handling
pub use crate::error::{DependencyError, Error, Result};

// Events
pub use crate::events::{AltGroupEvent, EventSink, HandleEvent, InstallStage, RemoveStage, silent_sink};

// Core types
pub use crate::types::{Descriptor, FilesManifest, RepoArtifact, State, Transaction, TransactionType};

// Configuration
pub use crate::config::{Config, Flags};

// Repository and database
pub use crate::pkgdb::PkgDb;
pub use crate::repo::RepoPool;

// Version algebra
pub use crate::version::{Pattern, PkgVer};

// Transaction pipeline
pub use crate::transaction::SELF_PKGNAME;
