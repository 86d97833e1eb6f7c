use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::change::ChangeEvent;

const MAX_ATTEMPTS: u32 = 8;
const BASE_BACKOFF_NS: i128 = 1_000_000_000; // 1s

/// Files at or under this size count as "small" for queue priority.
const SMALL_FILE_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub event: ChangeEvent,
    pub attempts: u32,
    pub next_eligible_at_ns: i128,
}

impl QueueEntry {
    fn priority(&self) -> u8 {
        event_priority(&self.event)
    }
}

/// Permission files sort first, then small files, then large files —
/// mirrored from the change detector's own permission-file-first ordering,
/// generalized into a three-class numeric priority the queue can compare on.
fn event_priority(event: &ChangeEvent) -> u8 {
    if crate::change::is_permission_file(&event.path) {
        0
    } else if event.size_bytes <= SMALL_FILE_THRESHOLD_BYTES {
        1
    } else {
        2
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority() && self.event.detected_at_ns == other.event.detected_at_ns
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse priority and detected_at so the
        // queue surfaces the lowest-priority-number, oldest entry first.
        other
            .priority()
            .cmp(&self.priority())
            .then_with(|| other.event.detected_at_ns.cmp(&self.event.detected_at_ns))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of pending per-file operations with path-keyed dedup,
/// backoff scheduling, and a dead-letter set for entries that exceed
/// `MAX_ATTEMPTS`.
#[derive(Default)]
pub struct SyncQueue {
    heap: BinaryHeap<QueueEntry>,
    index: HashMap<String, ()>,
    dead_letter: HashSet<String>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a change event, collapsing onto any already-queued entry
    /// for the same path (keeping the earlier `detected_at`).
    pub fn push(&mut self, event: ChangeEvent) {
        if self.dead_letter.contains(&event.path) {
            return;
        }
        let path = event.path.clone();
        if self.index.contains_key(&path) {
            self.collapse(event);
            return;
        }
        self.index.insert(path, ());
        self.heap.push(QueueEntry {
            event,
            attempts: 0,
            next_eligible_at_ns: 0,
        });
    }

    fn collapse(&mut self, new_event: ChangeEvent) {
        let mut rebuilt = BinaryHeap::new();
        while let Some(mut entry) = self.heap.pop() {
            if entry.event.path == new_event.path {
                let earlier_detected_at = entry.event.detected_at_ns.min(new_event.detected_at_ns);
                entry.event = new_event.clone();
                entry.event.detected_at_ns = earlier_detected_at;
            }
            rebuilt.push(entry);
        }
        self.heap = rebuilt;
    }

    /// Removes and returns the highest-priority entry whose
    /// `next_eligible_at_ns` has passed, if any.
    pub fn pop_eligible(&mut self, now_ns: i128) -> Option<QueueEntry> {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = self.heap.pop() {
            if entry.next_eligible_at_ns <= now_ns {
                found = Some(entry);
                break;
            }
            deferred.push(entry);
        }
        for entry in deferred {
            self.heap.push(entry);
        }

        if let Some(entry) = &found {
            self.index.remove(&entry.event.path);
        }
        found
    }

    /// Re-enqueues `entry` after a transport failure, applying exponential
    /// backoff, or parks it in the dead-letter set once it exceeds
    /// `MAX_ATTEMPTS`.
    pub fn retry(&mut self, mut entry: QueueEntry, now_ns: i128) {
        entry.attempts += 1;
        if entry.attempts >= MAX_ATTEMPTS {
            self.dead_letter.insert(entry.event.path.clone());
            return;
        }
        entry.next_eligible_at_ns = now_ns + backoff_ns(entry.attempts);
        self.index.insert(entry.event.path.clone(), ());
        self.heap.push(entry);
    }

    pub fn is_dead_lettered(&self, path: &str) -> bool {
        self.dead_letter.contains(path)
    }

    pub fn dead_letter_paths(&self) -> Vec<String> {
        self.dead_letter.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

fn backoff_ns(attempts: u32) -> i128 {
    BASE_BACKOFF_NS * (1i128 << attempts.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeKind, Direction};

    fn event(path: &str, detected_at_ns: i128) -> ChangeEvent {
        ChangeEvent {
            path: path.to_string(),
            kind: ChangeKind::Write,
            direction: Direction::Push,
            local_hash: None,
            remote_hash: None,
            size_bytes: 10,
            detected_at_ns,
        }
    }

    #[test]
    fn large_files_dequeue_after_small_files() {
        let mut q = SyncQueue::new();
        let mut big = event("datasites/a@x.org/big.bin", 1);
        big.size_bytes = SMALL_FILE_THRESHOLD_BYTES + 1;
        q.push(big);
        q.push(event("datasites/a@x.org/small.txt", 2));

        let first = q.pop_eligible(1000).unwrap();
        assert!(first.event.path.ends_with("small.txt"));
    }

    #[test]
    fn permission_files_dequeue_before_regular_files() {
        let mut q = SyncQueue::new();
        q.push(event("datasites/a@x.org/data.txt", 1));
        q.push(event("datasites/a@x.org/syftperm.yaml", 2));

        let first = q.pop_eligible(1000).unwrap();
        assert!(first.event.path.ends_with("syftperm.yaml"));
    }

    #[test]
    fn dedup_collapses_to_newer_event_keeping_earlier_detected_at() {
        let mut q = SyncQueue::new();
        q.push(event("f.txt", 10));
        q.push(event("f.txt", 50));

        assert_eq!(q.len(), 1);
        let entry = q.pop_eligible(1000).unwrap();
        assert_eq!(entry.event.detected_at_ns, 10);
    }

    #[test]
    fn retry_applies_backoff_and_eventually_dead_letters() {
        let mut q = SyncQueue::new();
        q.push(event("flaky.txt", 1));
        let mut entry = q.pop_eligible(1000).unwrap();

        for _ in 0..MAX_ATTEMPTS - 1 {
            q.retry(entry, 1000);
            entry = q.pop_eligible(i128::MAX).unwrap();
        }
        q.retry(entry, 1000);

        assert!(q.is_dead_lettered("flaky.txt"));
        assert!(q.pop_eligible(i128::MAX).is_none());
    }

    #[test]
    fn pop_eligible_respects_backoff_window() {
        let mut q = SyncQueue::new();
        q.push(event("f.txt", 1));
        let entry = q.pop_eligible(1000).unwrap();
        q.retry(entry, 1000);

        assert!(q.pop_eligible(1000).is_none());
        assert!(q.pop_eligible(1000 + BASE_BACKOFF_NS * 2).is_some());
    }
}
