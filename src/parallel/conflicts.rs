//! Runtime conflict detection across tasks running in the same wave.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// A file touched by a task after another task in the wave claimed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConflict {
    pub file: PathBuf,
    pub owner: PathBuf,
    pub task: PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    owners: HashMap<PathBuf, PathBuf>,
    conflicts: Vec<RuntimeConflict>,
    flagged: BTreeSet<PathBuf>,
}

/// Which task first touched each file during the current wave.
///
/// Every update takes the single lock, so two tasks reporting the same file at
/// once still produce exactly one owner.
#[derive(Debug, Default)]
pub struct FileOwnership {
    inner: Mutex<Inner>,
}

impl FileOwnership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget owners before a new wave. Recorded conflicts are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.owners.clear();
        inner.flagged.clear();
    }

    /// Claim `files` for `task`. Returns the conflicts this call found.
    pub fn record<'a, I>(&self, task: &Path, files: I) -> Vec<RuntimeConflict>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut inner = self.lock();
        let mut found = Vec::new();
        for file in files {
            match inner.owners.get(file).cloned() {
                Some(owner) if owner != task => {
                    let conflict = RuntimeConflict {
                        file: file.clone(),
                        owner,
                        task: task.to_path_buf(),
                    };
                    if !inner.conflicts.contains(&conflict) {
                        warn!(
                            file = %file.display(),
                            owner = %conflict.owner.display(),
                            task = %task.display(),
                            "Runtime file conflict"
                        );
                        found.push(conflict);
                    }
                }
                Some(_) => {}
                None => {
                    inner.owners.insert(file.clone(), task.to_path_buf());
                }
            }
        }
        if !found.is_empty() {
            inner.flagged.insert(task.to_path_buf());
            inner.conflicts.extend(found.iter().cloned());
        }
        found
    }

    /// Tasks that hit a conflict in the current wave.
    #[must_use]
    pub fn flagged(&self) -> BTreeSet<PathBuf> {
        self.lock().flagged.clone()
    }

    /// Every conflict recorded so far.
    #[must_use]
    pub fn conflicts(&self) -> Vec<RuntimeConflict> {
        self.lock().conflicts.clone()
    }
}
