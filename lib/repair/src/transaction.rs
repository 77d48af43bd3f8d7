/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Snapshot-based two-phase mutation of the graph, the marker store and
//! the working copy.
//!
//! [`Transaction::begin`] captures nothing up front; each mutating step
//! stashes exactly the state it is about to destroy (removed changeset
//! records keep their revs and phases, the marker snapshot keeps store
//! order, the merge state file keeps its bytes). `commit` makes the
//! store durable. An uncommitted transaction rolls everything back when
//! dropped, so every early `?` return leaves the repository as it was.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use obsstore::ChangesetGraph;
use obsstore::ChangesetRecord;
use obsstore::ObsStore;
use types::Node;
use types::ObsMarker;

use crate::workingcopy::WorkingCopy;

pub struct Transaction<'a> {
    graph: &'a mut dyn ChangesetGraph,
    store: &'a mut ObsStore,
    wc: &'a mut dyn WorkingCopy,

    removed_changesets: Vec<ChangesetRecord>,
    marker_snapshot: Option<Vec<ObsMarker>>,
    original_wc_parent: Node,
    wc_parent_changed: bool,
    cleared_merge_state: Option<(PathBuf, Vec<u8>)>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(
        graph: &'a mut dyn ChangesetGraph,
        store: &'a mut ObsStore,
        wc: &'a mut dyn WorkingCopy,
    ) -> Self {
        Transaction {
            original_wc_parent: wc.parent(),
            graph,
            store,
            wc,
            removed_changesets: Vec::new(),
            marker_snapshot: None,
            wc_parent_changed: false,
            cleared_merge_state: None,
            committed: false,
        }
    }

    pub fn remove_changesets(&mut self, nodes: &HashSet<Node>) -> Result<()> {
        let mut removed = self.graph.remove(nodes)?;
        self.removed_changesets.append(&mut removed);
        Ok(())
    }

    pub fn remove_markers(&mut self, markers: &[ObsMarker]) -> Result<()> {
        if self.marker_snapshot.is_none() {
            self.marker_snapshot = Some(self.store.iter().cloned().collect());
        }
        self.store.remove(markers)?;
        Ok(())
    }

    pub fn set_wc_parent(&mut self, node: Node) -> Result<()> {
        self.wc.set_parent(node)?;
        self.wc_parent_changed = true;
        Ok(())
    }

    /// Delete the merge state file, keeping its bytes for rollback. A
    /// missing file is a no-op.
    pub fn clear_merge_state(&mut self, path: &Path) -> Result<()> {
        match fs_err::read(path) {
            Ok(bytes) => {
                fs_err::remove_file(path)?;
                self.cleared_merge_state = Some((path.to_path_buf(), bytes));
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("reading merge state for removal"),
        }
    }

    pub fn commit(mut self) -> Result<()> {
        self.store.flush()?;
        self.committed = true;
        Ok(())
    }

    fn rollback(&mut self) {
        tracing::info!(
            changesets = self.removed_changesets.len(),
            "rolling back strip transaction"
        );
        if let Some((path, bytes)) = self.cleared_merge_state.take() {
            if let Err(err) = fs_err::write(&path, bytes) {
                tracing::error!("merge state rollback failed: {}", err);
            }
        }
        if self.wc_parent_changed {
            if let Err(err) = self.wc.set_parent(self.original_wc_parent) {
                tracing::error!("working copy rollback failed: {}", err);
            }
        }
        if let Some(markers) = self.marker_snapshot.take() {
            if let Err(err) = self.store.restore(markers) {
                tracing::error!("obsstore rollback failed: {}", err);
            }
        }
        let removed = std::mem::take(&mut self.removed_changesets);
        if let Err(err) = self.graph.restore(removed) {
            tracing::error!("changeset rollback failed: {}", err);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsstore::MemChangesetGraph;
    use types::MarkerFlags;

    use crate::workingcopy::MemWorkingCopy;

    fn n(s: &str) -> Node {
        let mut bytes = [0u8; Node::LEN];
        for (byte, fill) in bytes.iter_mut().zip(s.bytes().cycle()) {
            *byte = fill;
        }
        Node::from_byte_array(bytes)
    }

    fn marker(pred: &str, succs: &[&str]) -> ObsMarker {
        ObsMarker::new(
            n(pred),
            succs.iter().map(|s| n(s)).collect(),
            MarkerFlags::empty(),
            1,
            0,
            vec![],
        )
    }

    fn sample() -> (MemChangesetGraph, ObsStore, MemWorkingCopy) {
        let mut graph = MemChangesetGraph::new();
        graph.add(n("A"), vec![], vec![]).unwrap();
        graph.add(n("B"), vec![n("A")], vec![]).unwrap();
        let mut store = ObsStore::in_memory();
        store.add(marker("A", &["B"])).unwrap();
        (graph, store, MemWorkingCopy::new(n("B")))
    }

    #[test]
    fn test_commit_keeps_mutations() -> Result<()> {
        let (mut graph, mut store, mut wc) = sample();
        let mut txn = Transaction::begin(&mut graph, &mut store, &mut wc);
        txn.remove_changesets(&HashSet::from([n("B")]))?;
        txn.remove_markers(&[marker("A", &["B"])])?;
        txn.set_wc_parent(n("A"))?;
        txn.commit()?;

        assert!(!graph.exists(n("B")));
        assert!(store.is_empty());
        assert_eq!(wc.parent(), n("A"));
        Ok(())
    }

    #[test]
    fn test_drop_rolls_back() -> Result<()> {
        let (mut graph, mut store, mut wc) = sample();
        let rev_b = graph.rev(n("B")).unwrap();
        {
            let mut txn = Transaction::begin(&mut graph, &mut store, &mut wc);
            txn.remove_changesets(&HashSet::from([n("B")]))?;
            txn.remove_markers(&[marker("A", &["B"])])?;
            txn.set_wc_parent(n("A"))?;
            // Dropped uncommitted.
        }
        assert!(graph.exists(n("B")));
        assert_eq!(graph.rev(n("B")), Some(rev_b));
        assert_eq!(store.len(), 1);
        assert_eq!(wc.parent(), n("B"));
        Ok(())
    }

    #[test]
    fn test_merge_state_rollback() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("merge");
        fs_err::write(&path, b"state")?;

        let (mut graph, mut store, mut wc) = sample();
        {
            let mut txn = Transaction::begin(&mut graph, &mut store, &mut wc);
            txn.clear_merge_state(&path)?;
            assert!(!path.exists());
        }
        assert_eq!(fs_err::read(&path)?, b"state");
        Ok(())
    }

    #[test]
    fn test_clear_missing_merge_state_is_noop() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let (mut graph, mut store, mut wc) = sample();
        let mut txn = Transaction::begin(&mut graph, &mut store, &mut wc);
        txn.clear_merge_state(&tmp.path().join("missing"))?;
        txn.commit()?;
        Ok(())
    }
}
