/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Transactional removal of changesets and their exclusive markers.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use obsstore::descendants;
use obsstore::exclusive_markers;
use obsstore::ChangesetGraph;
use obsstore::ObsStore;
use repostate::MergeState;
use thiserror::Error;
use types::Node;
use types::NULL_ID;

use crate::bundle::bundle_with_markers;
use crate::bundle::write_bundle_file;
use crate::transaction::Transaction;
use crate::workingcopy::WorkingCopy;

#[derive(Debug, Default, Clone)]
pub struct StripOptions {
    /// Strip even when the working copy is dirty on a doomed changeset.
    pub force: bool,
    /// Leave the working copy parent pointer alone even when it is
    /// stripped. The caller takes over repositioning the checkout.
    pub keep_working_copy: bool,
}

/// Where the pre-strip backup bundle was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StripError {
    #[error("empty revision set")]
    EmptyTargetSet,

    #[error("unknown revision '{}'", .0.to_short_hex())]
    UnknownRevision(Node),

    #[error("local changes found")]
    LocalChangesFound,

    /// The strip failed after mutation began and was rolled back. The
    /// backup bundle written before the transaction is retained.
    #[error("strip aborted (backup bundle saved in {backup:?})")]
    TransactionAborted {
        backup: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct StripEngine<'a> {
    graph: &'a mut dyn ChangesetGraph,
    store: &'a mut ObsStore,
    wc: &'a mut dyn WorkingCopy,
    merge_state_path: PathBuf,
    backup_dir: PathBuf,
}

impl<'a> StripEngine<'a> {
    pub fn new(
        graph: &'a mut dyn ChangesetGraph,
        store: &'a mut ObsStore,
        wc: &'a mut dyn WorkingCopy,
        merge_state_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        StripEngine {
            graph,
            store,
            wc,
            merge_state_path: merge_state_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Strip `targets` and everything descending from them.
    ///
    /// The exclusive store lock is held from validation through commit.
    /// Order of operations under it: validate, write and fsync the
    /// backup bundle, then mutate inside a transaction (changesets out,
    /// exclusive markers out, working copy parent moved to the nearest
    /// surviving ancestor, merge state cleared). Any failure after the
    /// backup exists rolls the repository back and reports the backup
    /// path.
    pub fn strip(
        &mut self,
        targets: &HashSet<Node>,
        options: &StripOptions,
    ) -> Result<BackupHandle, StripError> {
        let _lock = self.store.lock()?;

        if targets.is_empty() {
            return Err(StripError::EmptyTargetSet);
        }
        for &target in targets {
            if !self.graph.exists(target) {
                return Err(StripError::UnknownRevision(target));
            }
        }

        let doomed = descendants(&*self.graph, targets)?;

        let wc_parent = self.wc.parent();
        if doomed.contains(&wc_parent) && self.wc.is_dirty()? && !options.force {
            return Err(StripError::LocalChangesFound);
        }
        for node in &doomed {
            if self.graph.phase(*node).is_public() {
                tracing::warn!(node = %node.to_short_hex(), "stripping public changeset");
            }
        }

        // The backup must be durable before any mutation.
        let bundle_bytes = bundle_with_markers(&*self.graph, self.store, &doomed)?;
        let root = doomed
            .iter()
            .copied()
            .min_by_key(|n| self.graph.rev(*n))
            .context("strip set has no members")?;
        let backup_path = self
            .backup_dir
            .join(format!("{}-backup.bundle", root.to_short_hex()));
        write_bundle_file(&backup_path, &bundle_bytes)?;
        tracing::info!(
            path = ?backup_path,
            changesets = doomed.len(),
            "wrote strip backup bundle"
        );

        let new_wc_parent = if doomed.contains(&wc_parent) && !options.keep_working_copy {
            Some(nearest_surviving_ancestor(&*self.graph, wc_parent, &doomed)?)
        } else {
            None
        };
        let clear_merge = match MergeState::read(&self.merge_state_path)? {
            // A merge on top of a stripped changeset can no longer be
            // resumed; neither can one whose checkout is being moved.
            Some(ms) => ms.references(&doomed) || new_wc_parent.is_some(),
            None => false,
        };
        let exclusive = exclusive_markers(self.store, &doomed);

        let merge_state_path = self.merge_state_path.clone();
        let result = {
            let mut txn = Transaction::begin(self.graph, self.store, self.wc);
            (|| -> Result<()> {
                txn.remove_changesets(&doomed)?;
                txn.remove_markers(&exclusive)?;
                if let Some(parent) = new_wc_parent {
                    txn.set_wc_parent(parent)?;
                }
                if clear_merge {
                    txn.clear_merge_state(&merge_state_path)?;
                }
                Ok(())
            })()
            .and_then(|()| txn.commit())
        };
        match result {
            Ok(()) => Ok(BackupHandle { path: backup_path }),
            Err(source) => Err(StripError::TransactionAborted {
                backup: backup_path,
                source,
            }),
        }
    }
}

/// The first ancestor of `node` (breadth-first through parents) that
/// survives the strip of `doomed`. [`NULL_ID`] when nothing survives.
fn nearest_surviving_ancestor(
    graph: &dyn ChangesetGraph,
    node: Node,
    doomed: &HashSet<Node>,
) -> Result<Node> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<Node> = graph.parents(node)?.into();
    while let Some(current) = queue.pop_front() {
        if current.is_null() || !visited.insert(current) {
            continue;
        }
        if !graph.exists(current) {
            continue;
        }
        if !doomed.contains(&current) {
            return Ok(current);
        }
        queue.extend(graph.parents(current)?);
    }
    Ok(NULL_ID)
}
