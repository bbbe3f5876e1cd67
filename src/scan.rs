//! Workspace enumeration and path filtering.
//!
//! [`PathFilter`] decides which files under the root are documents (the
//! same rules apply to the full sweep and to live watcher events), and
//! [`sweep_events`] diffs the on-disk set against the indexed set.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use pmo_index_core::models::{ChangeEvent, ChangeKind};

use crate::config::WorkspaceConfig;

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/.pmo/**",
    "**/node_modules/**",
    "**/*.swp",
    "**/*.swx",
    "**/*~",
    "**/.#*",
];

#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl PathFilter {
    pub fn new(config: &WorkspaceConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            root: config.root.clone(),
            canonical_root: config.root.canonicalize().ok(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace-relative, `/`-separated form of `path`, or `None` when the
    /// path is outside the root.
    pub fn relative(&self, path: &Path) -> Option<String> {
        // The OS watcher may report canonical paths for a relative root.
        let rel = path.strip_prefix(&self.root).ok().or_else(|| {
            self.canonical_root
                .as_deref()
                .and_then(|root| path.strip_prefix(root).ok())
        })?;
        to_rel_string(rel)
    }

    pub fn accepts(&self, rel: &str) -> bool {
        !self.exclude.is_match(rel) && self.include.is_match(rel)
    }

    pub fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

fn to_rel_string(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Normalize a caller-supplied relative path, rejecting anything that
/// would escape the root.
pub fn normalize_rel(path: &str) -> Option<String> {
    to_rel_string(Path::new(path.trim_start_matches('/')))
}

/// Every accepted file under the root, sorted.
pub fn scan_workspace(filter: &PathFilter) -> Result<Vec<String>> {
    let root = filter.root();
    if !root.exists() {
        bail!("Workspace root does not exist: {}", root.display());
    }

    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(filter.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = entry.path().strip_prefix(root).ok().and_then(to_rel_string) else {
            continue;
        };
        if filter.accepts(&rel) {
            paths.push(rel);
        }
    }

    // Sort for deterministic ordering
    paths.sort();
    Ok(paths)
}

/// Synthesize the events that bring the index in line with disk: `Modified`
/// for indexed files still present, `Created` for new files, `Deleted` for
/// indexed paths that are gone. Returned in path order.
pub fn sweep_events(filter: &PathFilter, indexed: &[String]) -> Result<Vec<ChangeEvent>> {
    let on_disk: BTreeSet<String> = scan_workspace(filter)?.into_iter().collect();
    let indexed: BTreeSet<&str> = indexed.iter().map(String::as_str).collect();

    let mut events: Vec<ChangeEvent> = on_disk
        .iter()
        .map(|path| {
            let kind = if indexed.contains(path.as_str()) {
                ChangeKind::Modified
            } else {
                ChangeKind::Created
            };
            ChangeEvent::new(path.clone(), kind)
        })
        .collect();

    events.extend(
        indexed
            .iter()
            .filter(|p| !on_disk.contains(**p))
            .map(|p| ChangeEvent::new(*p, ChangeKind::Deleted)),
    );
    events.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(events)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace() -> (tempfile::TempDir, PathFilter) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("risks")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join(".pmo")).unwrap();
        fs::write(root.join("risks/b.md"), "b").unwrap();
        fs::write(root.join("risks/a.md"), "a").unwrap();
        fs::write(root.join("notes.md"), "n").unwrap();
        fs::write(root.join("image.png"), "x").unwrap();
        fs::write(root.join(".git/HEAD.md"), "x").unwrap();
        fs::write(root.join(".pmo/cache.md"), "x").unwrap();
        let filter = PathFilter::new(&WorkspaceConfig {
            root: root.to_path_buf(),
            ..WorkspaceConfig::default()
        })
        .unwrap();
        (dir, filter)
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let (_dir, filter) = workspace();
        let paths = scan_workspace(&filter).unwrap();
        assert_eq!(paths, vec!["notes.md", "risks/a.md", "risks/b.md"]);
    }

    #[test]
    fn test_sweep_events_diff() {
        let (_dir, filter) = workspace();
        let indexed = vec!["risks/a.md".to_string(), "risks/gone.md".to_string()];
        let events = sweep_events(&filter, &indexed).unwrap();
        let summary: Vec<_> = events.iter().map(|e| (e.path.as_str(), e.kind.clone())).collect();
        assert_eq!(
            summary,
            vec![
                ("notes.md", ChangeKind::Created),
                ("risks/a.md", ChangeKind::Modified),
                ("risks/b.md", ChangeKind::Created),
                ("risks/gone.md", ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_relative_and_accepts() {
        let (dir, filter) = workspace();
        let rel = filter.relative(&dir.path().join("risks").join("a.md")).unwrap();
        assert_eq!(rel, "risks/a.md");
        assert!(filter.accepts(&rel));
        assert!(!filter.accepts("risks/.a.md.swp"));
        assert!(filter.relative(Path::new("/elsewhere/x.md")).is_none());
    }

    #[test]
    fn test_normalize_rel_rejects_escape() {
        assert_eq!(normalize_rel("risks/a.md").as_deref(), Some("risks/a.md"));
        assert_eq!(normalize_rel("/risks/./a.md").as_deref(), Some("risks/a.md"));
        assert_eq!(normalize_rel("../etc/passwd"), None);
    }
}
