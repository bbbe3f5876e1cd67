//! Filesystem change detection.
//!
//! A recursive `notify` watcher feeds raw events into a tokio channel. Each
//! accepted path goes through the core [`Debouncer`]; when its quiet window
//! closes the path is stat'ed and classified into a [`ChangeEvent`].
//!
//! Renames are fed as a remove of the old path plus a create of the new one,
//! so the final on-disk state decides both outcomes. Directory moves and
//! watcher overflows cannot be expressed per file; they schedule a
//! reconciliation sweep instead.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pmo_index_core::debounce::{Clock, Debouncer, DueChange, RawKind, SystemClock};
use pmo_index_core::models::{ChangeEvent, ChangeKind};
use pmo_index_core::store::Store;

use crate::config::WatchConfig;
use crate::scan::{sweep_events, PathFilter};

pub struct ChangeDetector {
    filter: Arc<PathFilter>,
    store: Arc<dyn Store>,
    window: Duration,
    max_wait: Duration,
    clock: Arc<dyn Clock>,
}

/// What one raw notify event asks of the detector.
#[derive(Debug, Default, PartialEq, Eq)]
struct Observed {
    paths: Vec<(String, RawKind)>,
    sweep: bool,
}

impl ChangeDetector {
    pub fn new(filter: Arc<PathFilter>, store: Arc<dyn Store>, config: &WatchConfig) -> Self {
        Self {
            filter,
            store,
            window: config.window(),
            max_wait: config.max_wait(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Watch the workspace root until `cancel` fires, sending classified
    /// events to `tx`. Pending paths are flushed on cancellation.
    pub async fn run(self, tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) -> Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            // The receiver only disappears during shutdown.
            let _ = raw_tx.send(res);
        })
        .context("Failed to create filesystem watcher")?;
        watcher
            .watch(self.filter.root(), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", self.filter.root().display()))?;
        info!(root = %self.filter.root().display(), "watching workspace");

        let mut debouncer = Debouncer::new(self.window, self.max_wait);
        let mut sweep_at: Option<Instant> = None;

        loop {
            let next = match (debouncer.next_deadline(), sweep_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep = async {
                match next {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    let pending = debouncer.drain_all();
                    if !pending.is_empty() {
                        debug!(count = pending.len(), "flushing pending paths");
                    }
                    self.emit(pending, &tx).await;
                    break;
                }
                raw = raw_rx.recv() => {
                    let Some(raw) = raw else { break };
                    match raw {
                        Ok(event) => {
                            let observed = self.observe(&event);
                            let now = self.clock.now();
                            for (path, kind) in observed.paths {
                                debouncer.observe(&path, kind, now);
                            }
                            if observed.sweep {
                                sweep_at = Some(now + self.window);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "watcher error, scheduling sweep");
                            sweep_at = Some(self.clock.now() + self.window);
                        }
                    }
                }
                _ = sleep => {
                    let now = self.clock.now();
                    let due = debouncer.due(now);
                    if !self.emit(due, &tx).await {
                        break;
                    }
                    if sweep_at.is_some_and(|at| at <= now) {
                        sweep_at = None;
                        if !self.sweep(&tx).await {
                            break;
                        }
                    }
                }
            }
        }

        drop(watcher);
        info!("workspace watcher stopped");
        Ok(())
    }

    fn observe(&self, event: &Event) -> Observed {
        let mut observed = Observed {
            sweep: event.need_rescan(),
            ..Observed::default()
        };

        let kinds: Vec<RawKind> = match event.kind {
            EventKind::Create(_) => vec![RawKind::Create],
            EventKind::Remove(_) => vec![RawKind::Remove],
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                vec![RawKind::Remove, RawKind::Create]
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![RawKind::Remove],
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![RawKind::Create],
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => vec![RawKind::Modify],
            EventKind::Access(_) => return observed,
        };

        for (i, path) in event.paths.iter().enumerate() {
            let Some(rel) = self.filter.relative(path) else {
                continue;
            };
            let kind = kinds.get(i).or(kinds.last()).copied().unwrap_or(RawKind::Other);
            if self.filter.accepts(&rel) {
                observed.paths.push((rel, kind));
            } else if path.is_dir()
                || matches!(event.kind, EventKind::Remove(RemoveKind::Folder))
                || (matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)))
                    && path.extension().is_none())
            {
                // A whole directory appeared, vanished or moved.
                observed.sweep = true;
            }
        }
        observed
    }

    /// Classify and forward due paths. Returns `false` once the receiver is gone.
    async fn emit(&self, due: Vec<DueChange>, tx: &mpsc::Sender<ChangeEvent>) -> bool {
        for change in due {
            let abs = self.filter.absolute(&change.path);
            let exists = tokio::fs::metadata(&abs)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            let known = match self.store.content_hash(&change.path).await {
                Ok(hash) => hash.is_some(),
                Err(e) => {
                    warn!(path = %change.path, error = %e, "index lookup failed");
                    true
                }
            };

            let kind = change.classify(exists, known);
            if kind == ChangeKind::Deleted && !known {
                // Created and removed within one window (editor temp files).
                continue;
            }
            debug!(path = %change.path, ?kind, "change detected");
            if tx.send(ChangeEvent::new(change.path, kind)).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn sweep(&self, tx: &mpsc::Sender<ChangeEvent>) -> bool {
        let indexed = match self.store.paths().await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "sweep skipped, index unavailable");
                return true;
            }
        };
        let filter = Arc::clone(&self.filter);
        let events = tokio::task::spawn_blocking(move || sweep_events(&filter, &indexed)).await;
        let events = match events {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                warn!(error = %e, "sweep failed");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "sweep task failed");
                return true;
            }
        };
        info!(events = events.len(), "rescan sweep");
        for event in events {
            if tx.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use notify::event::{CreateKind, DataChange};
    use pmo_index_core::store::memory::InMemoryStore;
    use std::path::PathBuf;

    fn detector(root: PathBuf) -> ChangeDetector {
        let filter = PathFilter::new(&WorkspaceConfig {
            root,
            ..WorkspaceConfig::default()
        })
        .unwrap();
        ChangeDetector::new(
            Arc::new(filter),
            Arc::new(InMemoryStore::new()),
            &WatchConfig::default(),
        )
    }

    #[test]
    fn test_rename_feeds_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let d = detector(dir.path().to_path_buf());
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(dir.path().join("risks/old.md"))
            .add_path(dir.path().join("risks/new.md"));
        let observed = d.observe(&event);
        assert_eq!(
            observed.paths,
            vec![
                ("risks/old.md".to_string(), RawKind::Remove),
                ("risks/new.md".to_string(), RawKind::Create),
            ]
        );
        assert!(!observed.sweep);
    }

    #[test]
    fn test_filtered_paths_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let d = detector(dir.path().to_path_buf());
        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(dir.path().join("risks/.a.md.swp"))
            .add_path(dir.path().join(".pmo/index.sqlite"));
        assert_eq!(d.observe(&event), Observed::default());
    }

    #[test]
    fn test_new_directory_schedules_sweep() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("epics")).unwrap();
        let d = detector(dir.path().to_path_buf());
        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(dir.path().join("epics"));
        let observed = d.observe(&event);
        assert!(observed.paths.is_empty());
        assert!(observed.sweep);
    }

    #[tokio::test]
    async fn test_emit_skips_transient_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("risks")).unwrap();
        std::fs::write(dir.path().join("risks/kept.md"), "x").unwrap();
        let d = detector(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(8);
        let now = Instant::now();
        let due = vec![
            DueChange {
                path: "risks/gone.md".into(),
                first_seen: now,
                saw_create: true,
                saw_remove: true,
            },
            DueChange {
                path: "risks/kept.md".into(),
                first_seen: now,
                saw_create: true,
                saw_remove: false,
            },
        ];
        assert!(d.emit(due, &tx).await);
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "risks/kept.md");
        assert_eq!(event.kind, ChangeKind::Created);
        assert!(rx.recv().await.is_none());
    }
}
