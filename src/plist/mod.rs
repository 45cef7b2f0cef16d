//! In-memory tagged-value property tree and its stable text serialization.
//!
//! This is the common model shared by the installed-package database,
//! repository indexes, package descriptors, and in-flight transactions
//! (spec component "Property Tree").

mod text;
mod value;

use std::fs;
use std::path::Path;

pub use text::{PlistError, externalize, externalize_compressed, internalize, internalize_compressed};
pub use value::{ImmutableError, Mapping, Sequence, Value};

/// Writes a value's canonical text form to `path`.
///
/// # Errors
/// Returns [`PlistError`] on I/O failure.
pub fn externalize_to_file(value: &Value, path: &Path) -> Result<(), PlistError> {
    fs::write(path, externalize(value))?;
    Ok(())
}

/// Writes a value's gzip-compressed canonical form to `path`.
///
/// # Errors
/// Returns [`PlistError`] on I/O or compression failure.
pub fn externalize_to_file_compressed(value: &Value, path: &Path) -> Result<(), PlistError> {
    fs::write(path, externalize_compressed(value)?)?;
    Ok(())
}

/// Reads and parses a plain-text plist file.
///
/// # Errors
/// Returns [`PlistError`] on I/O or parse failure.
pub fn internalize_from_file(path: &Path) -> Result<Value, PlistError> {
    let text = fs::read_to_string(path)?;
    internalize(&text)
}

/// Reads and parses a gzip-compressed plist file.
///
/// # Errors
/// Returns [`PlistError`] on I/O, decompression, or parse failure.
pub fn internalize_from_file_compressed(path: &Path) -> Result<Value, PlistError> {
    let bytes = fs::read(path)?;
    internalize_compressed(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_round_trip_plain_and_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = Mapping::new();
        map.insert("pkgname", Value::str("foo")).unwrap();
        let v = Value::Map(map);

        let plain = dir.path().join("a.plist");
        externalize_to_file(&v, &plain).unwrap();
        let back = internalize_from_file(&plain).unwrap();
        assert!(v.structural_eq(&back));

        let gz = dir.path().join("a.plist.gz");
        externalize_to_file_compressed(&v, &gz).unwrap();
        let back2 = internalize_from_file_compressed(&gz).unwrap();
        assert!(v.structural_eq(&back2));
    }
}
