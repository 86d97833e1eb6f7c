use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::perm::PERMISSION_FILE_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// One detected change to a single file, ready for the queue.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub direction: Direction,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub size_bytes: u64,
    pub detected_at_ns: i128,
}

/// The subset of a remote file listing this module needs — the same shape
/// `dir_state` returns.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path: String,
    pub hash: String,
    pub size_bytes: u64,
    pub mtime_ns: i128,
}

/// The subset of a local scan this module needs.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: String,
    pub hash: String,
    pub size_bytes: u64,
    pub mtime_ns: i128,
}

/// Compares a fresh local scan against the remote listing and the set of
/// paths previously known to be tracked locally, producing typed change
/// events. Permission-file events are moved to the front of the returned
/// list so they are always applied first within the same cycle.
pub fn detect_changes(
    local: &[LocalEntry],
    remote: &[RemoteEntry],
    previously_tracked: &std::collections::HashSet<String>,
    now_ns: i128,
) -> Vec<ChangeEvent> {
    let local_by_path: HashMap<&str, &LocalEntry> =
        local.iter().map(|e| (e.path.as_str(), e)).collect();
    let remote_by_path: HashMap<&str, &RemoteEntry> =
        remote.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut events = Vec::new();

    for entry in local {
        match remote_by_path.get(entry.path.as_str()) {
            None => events.push(ChangeEvent {
                path: entry.path.clone(),
                kind: ChangeKind::Create,
                direction: Direction::Push,
                local_hash: Some(entry.hash.clone()),
                remote_hash: None,
                size_bytes: entry.size_bytes,
                detected_at_ns: now_ns,
            }),
            Some(remote_entry) if remote_entry.hash != entry.hash => {
                let direction = if entry.mtime_ns >= remote_entry.mtime_ns {
                    Direction::Push
                } else {
                    Direction::Pull
                };
                events.push(ChangeEvent {
                    path: entry.path.clone(),
                    kind: ChangeKind::Write,
                    direction,
                    local_hash: Some(entry.hash.clone()),
                    remote_hash: Some(remote_entry.hash.clone()),
                    size_bytes: entry.size_bytes,
                    detected_at_ns: now_ns,
                });
            }
            Some(_) => {}
        }
    }

    for entry in remote {
        if local_by_path.contains_key(entry.path.as_str()) {
            continue;
        }
        if previously_tracked.contains(&entry.path) {
            events.push(ChangeEvent {
                path: entry.path.clone(),
                kind: ChangeKind::Delete,
                direction: Direction::Push,
                local_hash: None,
                remote_hash: Some(entry.hash.clone()),
                size_bytes: entry.size_bytes,
                detected_at_ns: now_ns,
            });
        } else {
            events.push(ChangeEvent {
                path: entry.path.clone(),
                kind: ChangeKind::Create,
                direction: Direction::Pull,
                local_hash: None,
                remote_hash: Some(entry.hash.clone()),
                size_bytes: entry.size_bytes,
                detected_at_ns: now_ns,
            });
        }
    }

    // Local file absent, previously tracked, remote also absent: nothing to
    // do — the file is simply gone on both sides.

    events.sort_by_key(|e| !is_permission_file(&e.path));
    events
}

pub fn is_permission_file(path: &str) -> bool {
    path.ends_with(PERMISSION_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn local_only_file_produces_push_create() {
        let local = vec![LocalEntry {
            path: "datasites/a@x.org/new.txt".to_string(),
            hash: "h1".to_string(),
            size_bytes: 10,
            mtime_ns: 100,
        }];
        let events = detect_changes(&local, &[], &HashSet::new(), 200);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Create);
        assert_eq!(events[0].direction, Direction::Push);
    }

    #[test]
    fn remote_only_file_produces_pull_create() {
        let remote = vec![RemoteEntry {
            path: "datasites/a@x.org/new.txt".to_string(),
            hash: "h1".to_string(),
            size_bytes: 10,
            mtime_ns: 100,
        }];
        let events = detect_changes(&[], &remote, &HashSet::new(), 200);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Create);
        assert_eq!(events[0].direction, Direction::Pull);
    }

    #[test]
    fn tracked_file_missing_everywhere_is_noop() {
        let mut tracked = HashSet::new();
        tracked.insert("datasites/a@x.org/gone.txt".to_string());
        let events = detect_changes(&[], &[], &tracked, 200);
        assert!(events.is_empty());
    }

    #[test]
    fn hash_mismatch_picks_direction_by_newer_mtime() {
        let local = vec![LocalEntry {
            path: "f.txt".to_string(),
            hash: "new".to_string(),
            size_bytes: 10,
            mtime_ns: 500,
        }];
        let remote = vec![RemoteEntry {
            path: "f.txt".to_string(),
            hash: "old".to_string(),
            size_bytes: 10,
            mtime_ns: 100,
        }];
        let events = detect_changes(&local, &remote, &HashSet::new(), 999);
        assert_eq!(events[0].direction, Direction::Push);
    }

    #[test]
    fn permission_file_changes_sort_first() {
        let local = vec![
            LocalEntry {
                path: "datasites/a@x.org/data.txt".to_string(),
                hash: "h1".to_string(),
                size_bytes: 10,
                mtime_ns: 1,
            },
            LocalEntry {
                path: format!("datasites/a@x.org/{}", PERMISSION_FILE_NAME),
                hash: "h2".to_string(),
                size_bytes: 10,
                mtime_ns: 2,
            },
        ];
        let events = detect_changes(&local, &[], &HashSet::new(), 10);
        assert!(is_permission_file(&events[0].path));
    }
}
