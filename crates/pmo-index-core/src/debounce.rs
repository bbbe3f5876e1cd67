//! Per-path debounce table.
//!
//! Editors write files in bursts (truncate, write, rename-over, chmod).
//! The [`Debouncer`] coalesces every raw event for a path into one entry
//! whose deadline slides forward by `window` on each event, but never
//! past `first_seen + max_wait`, so a file that is rewritten continuously
//! still gets indexed.
//!
//! Time is injected through [`Clock`] so tests can drive the table with a
//! [`ManualClock`] instead of sleeping.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::ChangeKind;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.base + offset
    }
}

/// Raw event kinds as reported by the OS watcher, before coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Create,
    Modify,
    Remove,
    Other,
}

#[derive(Debug, Clone)]
struct Pending {
    first_seen: Instant,
    deadline: Instant,
    saw_create: bool,
    saw_remove: bool,
}

/// A path whose quiet window has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueChange {
    pub path: String,
    pub first_seen: Instant,
    pub saw_create: bool,
    pub saw_remove: bool,
}

impl DueChange {
    /// Decide the change kind from the path's current state on disk.
    ///
    /// `known` is whether the index already has a record for the path.
    pub fn classify(&self, exists: bool, known: bool) -> ChangeKind {
        if !exists {
            ChangeKind::Deleted
        } else if self.saw_create && !known {
            ChangeKind::Created
        } else {
            ChangeKind::Modified
        }
    }
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    pending: BTreeMap<String, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            pending: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, path: &str, kind: RawKind, now: Instant) {
        let window = self.window;
        let max_wait = self.max_wait;
        let entry = self.pending.entry(path.to_string()).or_insert(Pending {
            first_seen: now,
            deadline: now + window,
            saw_create: false,
            saw_remove: false,
        });
        entry.deadline = (now + window).min(entry.first_seen + max_wait);
        match kind {
            RawKind::Create => entry.saw_create = true,
            RawKind::Remove => entry.saw_remove = true,
            RawKind::Modify | RawKind::Other => {}
        }
    }

    /// Remove and return every entry whose deadline is at or before `now`,
    /// in path order.
    pub fn due(&mut self, now: Instant) -> Vec<DueChange> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|path| {
                let p = self.pending.remove(&path)?;
                Some(DueChange {
                    path,
                    first_seen: p.first_seen,
                    saw_create: p.saw_create,
                    saw_remove: p.saw_remove,
                })
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Flush everything regardless of deadlines (shutdown).
    pub fn drain_all(&mut self) -> Vec<DueChange> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(path, p)| DueChange {
                path,
                first_seen: p.first_seen,
                saw_create: p.saw_create,
                saw_remove: p.saw_remove,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_burst_coalesces_into_one() {
        let clock = ManualClock::new();
        let mut d = Debouncer::new(ms(300), ms(3000));
        for _ in 0..5 {
            d.observe("risks/a.md", RawKind::Modify, clock.now());
            clock.advance(ms(50));
        }
        assert!(d.due(clock.now()).is_empty());
        clock.advance(ms(300));
        let due = d.due(clock.now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].path, "risks/a.md");
        assert!(d.is_empty());
    }

    #[test]
    fn test_max_wait_caps_sliding_deadline() {
        let clock = ManualClock::new();
        let mut d = Debouncer::new(ms(300), ms(1000));
        let start = clock.now();
        for _ in 0..20 {
            d.observe("a.md", RawKind::Modify, clock.now());
            clock.advance(ms(100));
        }
        assert_eq!(d.next_deadline(), Some(start + ms(1000)));
        assert_eq!(d.due(start + ms(1000)).len(), 1);
    }

    #[test]
    fn test_due_in_path_order() {
        let clock = ManualClock::new();
        let mut d = Debouncer::new(ms(10), ms(100));
        d.observe("b.md", RawKind::Modify, clock.now());
        d.observe("a.md", RawKind::Create, clock.now());
        clock.advance(ms(10));
        let paths: Vec<_> = d.due(clock.now()).into_iter().map(|c| c.path).collect();
        assert_eq!(paths, vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_independent_paths_have_own_deadlines() {
        let clock = ManualClock::new();
        let mut d = Debouncer::new(ms(100), ms(1000));
        d.observe("a.md", RawKind::Modify, clock.now());
        clock.advance(ms(60));
        d.observe("b.md", RawKind::Modify, clock.now());
        clock.advance(ms(40));
        let due = d.due(clock.now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].path, "a.md");
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_classify() {
        let change = DueChange {
            path: "a.md".into(),
            first_seen: Instant::now(),
            saw_create: true,
            saw_remove: true,
        };
        assert_eq!(change.classify(true, false), ChangeKind::Created);
        assert_eq!(change.classify(true, true), ChangeKind::Modified);
        assert_eq!(change.classify(false, true), ChangeKind::Deleted);
    }

    #[test]
    fn test_drain_all() {
        let mut d = Debouncer::new(ms(100), ms(100));
        d.observe("x.md", RawKind::Remove, Instant::now());
        let all = d.drain_all();
        assert_eq!(all.len(), 1);
        assert!(all[0].saw_remove);
        assert_eq!(d.next_deadline(), None);
    }
}
