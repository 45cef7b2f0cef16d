//! Archive I/O: reads a gzip/zstd-compressed tar containing a fixed set of
//! metadata entries, fetching a named member into memory or a file.
//!
//! Grounded on the teacher's tar-consuming style (absent in arch-toolkit
//! itself; generalized from AOSC-Dev-p-vector-rs's `tar`/`flate2`/`zstd`
//! dependency trio, which this crate's `Cargo.toml` reuses directly).

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use tar::Archive as TarArchive;

use crate::plist::{self, Value};

/// Compression codec an archive is wrapped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// gzip (`.tar.gz` / `.tgz`).
    Gzip,
    /// zstd (`.tar.zst`).
    Zstd,
}

impl Codec {
    /// Guesses the codec from a filename's extension.
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        if name.ends_with(".zst") || name.ends_with(".tzst") {
            Self::Zstd
        } else {
            Self::Gzip
        }
    }
}

/// Error returned while reading an archive member.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// No entry matched the requested member name.
    #[error("not found: {0}")]
    NotFound(String),
    /// The matched member failed to parse as a property tree.
    #[error("invalid plist member {0}: {1}")]
    InvalidPlist(String, #[source] plist::PlistError),
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Normalizes a tar member path the same way the spec requires: a leading
/// `./` is stripped before comparison.
#[must_use]
pub fn normalize_member_path(path: &str) -> &str {
    path.strip_prefix("./").unwrap_or(path)
}

fn open_tar<R: Read>(reader: R, codec: Codec) -> io::Result<TarArchive<Box<dyn Read>>> {
    let boxed: Box<dyn Read> = match codec {
        Codec::Gzip => Box::new(GzDecoder::new(reader)),
        Codec::Zstd => Box::new(zstd::Decoder::new(reader)?),
    };
    Ok(TarArchive::new(boxed))
}

/// Iterates a compressed tar's entries in order, invoking `visit` with each
/// normalized member path and a reader positioned at its contents. Stops
/// early if `visit` returns `Ok(true)`.
///
/// # Errors
/// Returns [`ArchiveError::Io`] on underlying I/O failure.
pub fn for_each_entry<R: Read>(
    reader: R,
    codec: Codec,
    mut visit: impl FnMut(&str, &mut tar::Entry<'_, Box<dyn Read>>) -> io::Result<bool>,
) -> Result<(), ArchiveError> {
    let mut archive = open_tar(reader, codec)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let name = normalize_member_path(&path).to_string();
        if visit(&name, &mut entry)? {
            break;
        }
    }
    Ok(())
}

/// Fetches a single named member's contents into memory and internalizes it
/// as a property tree (e.g. `props.plist`, `files.plist`).
///
/// # Errors
/// Returns [`ArchiveError::NotFound`] if no entry matches `member` before
/// EOF, or [`ArchiveError::InvalidPlist`] if the matched entry is not
/// well-formed plist text.
pub fn fetch_plist<R: Read>(reader: R, codec: Codec, member: &str) -> Result<Value, ArchiveError> {
    let wanted = normalize_member_path(member);
    let mut found: Option<Value> = None;
    for_each_entry(reader, codec, |name, entry| {
        if name == wanted {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            found = Some(
                plist::internalize(&text)
                    .map_err(|e| io::Error::other(e.to_string()))?,
            );
            return Ok(true);
        }
        Ok(false)
    })?;
    found.ok_or_else(|| ArchiveError::NotFound(wanted.to_string()))
}

/// Streams a single named member's contents into `sink` (e.g. a file
/// descriptor opened by the caller).
///
/// # Errors
/// Returns [`ArchiveError::NotFound`] if no entry matches `member` before
/// EOF.
pub fn fetch_file_into<R: Read, W: Write>(
    reader: R,
    codec: Codec,
    member: &str,
    mut sink: W,
) -> Result<(), ArchiveError> {
    let wanted = normalize_member_path(member);
    let mut matched = false;
    for_each_entry(reader, codec, |name, entry| {
        if name == wanted {
            io::copy(entry, &mut sink)?;
            matched = true;
            return Ok(true);
        }
        Ok(false)
    })?;
    if matched { Ok(()) } else { Err(ArchiveError::NotFound(wanted.to_string())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_gzip_tar(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, contents) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    #[test]
    fn fetch_plist_finds_member_and_strips_leading_dot_slash() {
        let bytes = build_gzip_tar(&[("./props.plist", "{\"pkgname\"=s:\"foo\";}")]);
        let v = fetch_plist(Cursor::new(bytes), Codec::Gzip, "props.plist").unwrap();
        assert_eq!(v.as_map().unwrap().get_str("pkgname"), Some("foo"));
    }

    #[test]
    fn fetch_plist_missing_member_is_not_found() {
        let bytes = build_gzip_tar(&[("other.plist", "{}")]);
        let err = fetch_plist(Cursor::new(bytes), Codec::Gzip, "props.plist").unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[test]
    fn fetch_file_into_streams_payload() {
        let bytes = build_gzip_tar(&[("files.plist", "hello-manifest")]);
        let mut out = Vec::new();
        fetch_file_into(Cursor::new(bytes), Codec::Gzip, "files.plist", &mut out).unwrap();
        assert_eq!(out, b"hello-manifest");
    }
}
