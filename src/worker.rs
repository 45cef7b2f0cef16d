//! `foreach-multi`: the single worker-pool primitive for read-only scans of
//! large sequences (spec.md §5 "Intra-process parallelism").
//!
//! One worker per online CPU pulls the next up-to-32-item slice from a
//! shared atomic cursor; any worker whose callback signals a hit stops the
//! scan for everyone. Grounded on the teacher's `rayon`-backed parallel
//! search helpers (absent verbatim in `arch-toolkit`, generalized from its
//! `rayon` dependency, which this crate reuses directly).

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of items handed to a worker per pull (spec.md §5).
pub const SLICE_SIZE: usize = 32;

/// Scans `items` across a worker per online CPU, calling `callback(item)`
/// for each. Returns the index of the first item for which `callback`
/// returned `true`, or `None` if the scan completed without a hit.
///
/// The callback contract matches spec.md §5: it must not mutate shared
/// state and may read freely; ordering between slices is not defined.
pub fn foreach_multi<T, F>(items: &[T], callback: F) -> Option<usize>
where
    T: Sync,
    F: Fn(&T) -> bool + Sync,
{
    if items.is_empty() {
        return None;
    }
    let cursor = AtomicUsize::new(0);
    let hit: Mutex<Option<usize>> = Mutex::new(None);
    let workers = std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1);

    rayon::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                loop {
                    if hit.lock().expect("lock poisoned").is_some() {
                        break;
                    }
                    let start = cursor.fetch_add(SLICE_SIZE, Ordering::SeqCst);
                    if start >= items.len() {
                        break;
                    }
                    let end = (start + SLICE_SIZE).min(items.len());
                    for (offset, item) in items[start..end].iter().enumerate() {
                        if callback(item) {
                            let mut guard = hit.lock().expect("lock poisoned");
                            if guard.is_none() {
                                *guard = Some(start + offset);
                            }
                            return;
                        }
                    }
                }
            });
        }
    });

    hit.into_inner().expect("lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn finds_first_match_across_slices() {
        let items: Vec<u32> = (0..200).collect();
        let found = foreach_multi(&items, |&item| item == 137);
        assert_eq!(found, Some(137));
    }

    #[test]
    fn returns_none_when_no_match() {
        let items: Vec<u32> = (0..64).collect();
        let found = foreach_multi(&items, |&item| item == 9999);
        assert_eq!(found, None);
    }

    #[test]
    fn every_item_is_visited_when_no_hit() {
        let items: Vec<u32> = (0..500).collect();
        let visits = AtomicU32::new(0);
        let found = foreach_multi(&items, |_| {
            visits.fetch_add(1, Ordering::SeqCst);
            false
        });
        assert_eq!(found, None);
        assert_eq!(visits.load(Ordering::SeqCst), 500);
    }
}
