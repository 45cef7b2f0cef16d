//! Fetcher: HTTP(S)/file URL retrieval with resume, conditional GET
//! (mtime+size), and per-byte progress.
//!
//! Grounded on the teacher's `reqwest`/`tokio` stack (`src/aur/search.rs`
//! and friends), generalized from AUR JSON GETs to generic byte-range
//! downloads with an exponential-backoff retry policy mirroring
//! `src/client.rs`'s `RetryPolicy`.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::{EventSink, HandleEvent};

/// Outcome of a conditional fetch against a cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cached copy was fresh; nothing was downloaded.
    NotModified,
    /// New content was downloaded and written to the destination.
    Downloaded,
}

/// Retry policy for transient fetch failures: exponential backoff with
/// jitter, up to a fixed ceiling (spec.md §7 "retried with exponential
/// backoff up to a fixed ceiling").
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = self.base_delay.saturating_mul(1 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64 / 4);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Metadata used for the conditional GET (mtime + size) check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedMeta {
    /// Unix mtime of the cached file, if known.
    pub mtime: Option<i64>,
    /// Size in bytes of the cached file, if known.
    pub size: Option<u64>,
}

/// A cancellation flag polled at chunk boundaries during a fetch (spec.md
/// §5 "Suspension points").
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    /// Creates a fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(feature = "net")]
mod net {
    use super::{CachedMeta, CancelFlag, Error, EventSink, FetchOutcome, HandleEvent, Result, RetryPolicy};
    use std::path::Path;
    use tokio::io::AsyncWriteExt;

    /// Fetches `url` into `dest`, resuming a partial download if `dest`
    /// already exists, retrying transient failures per `policy`, and
    /// reporting progress through `events`.
    ///
    /// Returns [`FetchOutcome::NotModified`] without writing anything when
    /// `cached` matches the remote's reported mtime+size (conditional GET).
    ///
    /// # Errors
    /// Returns [`Error::Fetch`] after `policy.max_attempts` failed attempts,
    /// or [`Error::IoFailure`] if `dest` cannot be opened for writing.
    pub async fn fetch_to_file(
        client: &reqwest::Client,
        url: &str,
        dest: &Path,
        cached: CachedMeta,
        policy: RetryPolicy,
        cancel: &CancelFlag,
        events: &EventSink,
    ) -> Result<FetchOutcome> {
        let mut last_err = None;
        for attempt in 0..policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::IoFailure(std::io::Error::other("fetch cancelled")));
            }
            match try_fetch_once(client, url, dest, cached, cancel, events).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < policy.max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(Error::IoFailure(std::io::Error::other("fetch failed"))))
    }

    async fn try_fetch_once(
        client: &reqwest::Client,
        url: &str,
        dest: &Path,
        cached: CachedMeta,
        cancel: &CancelFlag,
        events: &EventSink,
    ) -> Result<FetchOutcome> {
        let resume_from = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        let mut request = client.get(url);
        if let Some(size) = cached.size
            && let Some(mtime) = cached.mtime
        {
            request = request.header("If-None-Match", format!("{size}-{mtime}"));
        }
        if resume_from > 0 {
            request = request.header("Range", format!("bytes={resume_from}-"));
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        let total = response.content_length();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume_from > 0)
            .open(dest)
            .await?;
        if resume_from == 0 {
            file.set_len(0).await?;
        }
        let mut response = response;
        let mut seen = resume_from;
        while let Some(chunk) = response.chunk().await? {
            if cancel.is_cancelled() {
                return Err(Error::IoFailure(std::io::Error::other("fetch cancelled")));
            }
            file.write_all(&chunk).await?;
            seen += chunk.len() as u64;
            (events)(HandleEvent::FetchProgress {
                url: url.to_string(),
                bytes_seen: seen,
                total,
            });
        }
        file.flush().await?;
        Ok(FetchOutcome::Downloaded)
    }
}

#[cfg(feature = "net")]
pub use net::fetch_to_file;

/// Reads a local `file://` or plain-path URL into memory, for the archive
/// reader's "local paths" mode (spec.md §2 item 2, §4.2).
///
/// # Errors
/// Returns [`Error::IoFailure`] if the path cannot be read.
pub fn read_local(path_or_file_url: &str) -> Result<Vec<u8>> {
    let path = path_or_file_url
        .strip_prefix("file://")
        .unwrap_or(path_or_file_url);
    std::fs::read(Path::new(path)).map_err(Error::IoFailure)
}
