//! Greedy wave partitioning.

use super::dependency::Dependency;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Group tasks into waves that contain no declared conflict.
///
/// Tasks are placed in input order into the earliest wave holding none of
/// their conflicts. This is not a minimum-wave colouring.
#[must_use]
pub fn partition_waves(tasks: &[PathBuf], dependencies: &[Dependency]) -> Vec<Vec<PathBuf>> {
    let index: HashMap<&Path, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_path(), i))
        .collect();

    let mut conflicts: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); tasks.len()];
    for dep in dependencies {
        if let (Some(&a), Some(&b)) = (
            index.get(dep.task.as_path()),
            index.get(dep.depends_on.as_path()),
        ) {
            conflicts[a].insert(b);
            conflicts[b].insert(a);
        }
    }

    let mut waves: Vec<Vec<usize>> = Vec::new();
    for (i, blocked_by) in conflicts.iter().enumerate() {
        match waves
            .iter_mut()
            .find(|wave| !wave.iter().any(|j| blocked_by.contains(j)))
        {
            Some(wave) => wave.push(i),
            None => waves.push(vec![i]),
        }
    }

    waves
        .into_iter()
        .map(|wave| wave.into_iter().map(|i| tasks[i].clone()).collect())
        .collect()
}
