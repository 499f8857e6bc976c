//! Working-tree snapshots for providers without native file-change reporting.
//!
//! A snapshot records every path the VCS reports as changed together with a
//! cheap (size, mtime) fingerprint. Diffing a snapshot taken before a call with
//! one taken after yields the files the agent touched, including edits to files
//! that were already dirty.

use crate::scope::{ChangeType, FileChange};
use crate::vcs::VcsOperations;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size and modification time of a file; `None` when it does not exist.
type Fingerprint = Option<(u64, Option<SystemTime>)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeSnapshot {
    entries: BTreeMap<PathBuf, (ChangeType, Fingerprint)>,
}

impl WorkingTreeSnapshot {
    /// Capture the current dirty set.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS cannot list changed files.
    pub async fn capture(vcs: &dyn VcsOperations, root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for change in vcs.changed_files().await? {
            let fingerprint = fingerprint(&root.join(&change.path)).await;
            entries.insert(change.path, (change.change_type, fingerprint));
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Files that differ between `self` (before) and `after`.
    ///
    /// A path that was dirty before and clean after is reported as modified.
    #[must_use]
    pub fn changes_since(&self, after: &Self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        for (path, (change_type, print)) in &after.entries {
            match self.entries.get(path) {
                Some((_, before)) if before == print => {}
                _ => changes.push(FileChange {
                    path: path.clone(),
                    change_type: *change_type,
                }),
            }
        }
        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                changes.push(FileChange::modified(path.clone()));
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    #[cfg(test)]
    pub(crate) fn from_entries(
        entries: impl IntoIterator<Item = (PathBuf, ChangeType, Fingerprint)>,
    ) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(path, kind, print)| (path, (kind, print)))
                .collect(),
        }
    }
}

async fn fingerprint(path: &Path) -> Fingerprint {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.len(), meta.modified().ok()))
}
