/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The consumed interface of the changeset storage.
//!
//! The append-only changeset store is an external collaborator. This
//! module defines the narrow view the obsolescence subsystem needs from
//! it, plus an in-memory implementation used by tests and by embedders
//! that keep their changelog in memory.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use anyhow::bail;
use anyhow::Result;
use types::Node;
use types::Phase;

/// A materialized changeset, as handed back by [`ChangesetGraph::remove`]
/// so a failed transaction can restore it exactly (including its local
/// rev and phase).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangesetRecord {
    pub node: Node,
    pub parents: Vec<Node>,
    pub rev: u64,
    pub phase: Phase,
    /// Commit metadata (user, description, date). Opaque here.
    pub payload: Vec<u8>,
}

/// Read (and narrowly, write) access to the changeset DAG.
pub trait ChangesetGraph {
    /// Parents of `node`: 0, 1 or 2 entries.
    fn parents(&self, node: Node) -> Result<Vec<Node>>;

    fn exists(&self, node: Node) -> bool;

    /// Local sequence number. Only used for deterministic ordering of
    /// output, never for identity. `None` for unknown nodes.
    fn rev(&self, node: Node) -> Option<u64>;

    /// Phase of `node`. Unknown nodes report `Draft`.
    fn phase(&self, node: Node) -> Phase;

    /// Opaque commit payload, for bundling.
    fn payload(&self, node: Node) -> Result<Vec<u8>>;

    /// Every node in the graph, in no particular order.
    fn nodes(&self) -> Vec<Node>;

    /// Insert a changeset. Adding an already-present node is a no-op.
    /// Non-null parents must already be present.
    fn add(&mut self, node: Node, parents: Vec<Node>, payload: Vec<u8>) -> Result<()>;

    /// Delete `nodes`, returning the removed records ordered by rev so
    /// [`ChangesetGraph::restore`] can undo the removal exactly.
    fn remove(&mut self, nodes: &HashSet<Node>) -> Result<Vec<ChangesetRecord>>;

    /// Re-insert records previously returned by `remove`, keeping their
    /// original revs and phases.
    fn restore(&mut self, records: Vec<ChangesetRecord>) -> Result<()>;
}

/// Close `targets` over descendants: stripping a changeset strips
/// everything built on top of it. Never expands to ancestors.
pub fn descendants(graph: &dyn ChangesetGraph, targets: &HashSet<Node>) -> Result<HashSet<Node>> {
    let mut children: HashMap<Node, Vec<Node>> = HashMap::new();
    for node in graph.nodes() {
        for parent in graph.parents(node)? {
            children.entry(parent).or_default().push(node);
        }
    }

    let mut closed = HashSet::new();
    let mut queue: VecDeque<Node> = targets.iter().copied().filter(|n| graph.exists(*n)).collect();
    while let Some(node) = queue.pop_front() {
        if !closed.insert(node) {
            continue;
        }
        if let Some(kids) = children.get(&node) {
            queue.extend(kids.iter().copied());
        }
    }
    Ok(closed)
}

/// In-memory changeset graph.
#[derive(Default)]
pub struct MemChangesetGraph {
    commits: HashMap<Node, ChangesetRecord>,
    next_rev: u64,
}

impl MemChangesetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit with an explicit phase. `add` always creates drafts.
    pub fn set_phase(&mut self, node: Node, phase: Phase) -> Result<()> {
        match self.commits.get_mut(&node) {
            Some(record) => {
                record.phase = phase;
                Ok(())
            }
            None => bail!("unknown revision {}", node.to_short_hex()),
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

impl ChangesetGraph for MemChangesetGraph {
    fn parents(&self, node: Node) -> Result<Vec<Node>> {
        match self.commits.get(&node) {
            Some(record) => Ok(record.parents.clone()),
            None => bail!("unknown revision {}", node.to_short_hex()),
        }
    }

    fn exists(&self, node: Node) -> bool {
        self.commits.contains_key(&node)
    }

    fn rev(&self, node: Node) -> Option<u64> {
        self.commits.get(&node).map(|record| record.rev)
    }

    fn phase(&self, node: Node) -> Phase {
        self.commits
            .get(&node)
            .map(|record| record.phase)
            .unwrap_or_default()
    }

    fn payload(&self, node: Node) -> Result<Vec<u8>> {
        match self.commits.get(&node) {
            Some(record) => Ok(record.payload.clone()),
            None => bail!("unknown revision {}", node.to_short_hex()),
        }
    }

    fn nodes(&self) -> Vec<Node> {
        self.commits.keys().copied().collect()
    }

    fn add(&mut self, node: Node, parents: Vec<Node>, payload: Vec<u8>) -> Result<()> {
        if self.commits.contains_key(&node) {
            return Ok(());
        }
        for parent in &parents {
            if !parent.is_null() && !self.commits.contains_key(parent) {
                bail!(
                    "cannot add {}: missing parent {}",
                    node.to_short_hex(),
                    parent.to_short_hex()
                );
            }
        }
        let rev = self.next_rev;
        self.next_rev += 1;
        self.commits.insert(
            node,
            ChangesetRecord {
                node,
                parents,
                rev,
                phase: Phase::Draft,
                payload,
            },
        );
        Ok(())
    }

    fn remove(&mut self, nodes: &HashSet<Node>) -> Result<Vec<ChangesetRecord>> {
        let mut removed: Vec<ChangesetRecord> = nodes
            .iter()
            .filter_map(|node| self.commits.remove(node))
            .collect();
        removed.sort_by_key(|record| record.rev);
        Ok(removed)
    }

    fn restore(&mut self, records: Vec<ChangesetRecord>) -> Result<()> {
        for record in records {
            self.next_rev = self.next_rev.max(record.rev + 1);
            self.commits.insert(record.node, record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Node {
        let mut bytes = [0u8; Node::LEN];
        for (byte, fill) in bytes.iter_mut().zip(s.bytes().cycle()) {
            *byte = fill;
        }
        Node::from_byte_array(bytes)
    }

    fn sample_graph() -> MemChangesetGraph {
        // A -> B -> C, plus A -> D.
        let mut graph = MemChangesetGraph::new();
        graph.add(n("A"), vec![], b"a".to_vec()).unwrap();
        graph.add(n("B"), vec![n("A")], b"b".to_vec()).unwrap();
        graph.add(n("C"), vec![n("B")], b"c".to_vec()).unwrap();
        graph.add(n("D"), vec![n("A")], b"d".to_vec()).unwrap();
        graph
    }

    #[test]
    fn test_descendants_closure() {
        let graph = sample_graph();
        let closed = descendants(&graph, &HashSet::from([n("B")])).unwrap();
        assert_eq!(closed, HashSet::from([n("B"), n("C")]));
    }

    #[test]
    fn test_descendants_never_expands_to_ancestors() {
        let graph = sample_graph();
        let closed = descendants(&graph, &HashSet::from([n("C")])).unwrap();
        assert_eq!(closed, HashSet::from([n("C")]));
    }

    #[test]
    fn test_add_requires_parents() {
        let mut graph = MemChangesetGraph::new();
        assert!(graph.add(n("B"), vec![n("A")], vec![]).is_err());
        graph.add(n("A"), vec![], vec![]).unwrap();
        assert!(graph.add(n("B"), vec![n("A")], vec![]).is_ok());
        // Idempotent re-add.
        assert!(graph.add(n("B"), vec![n("A")], vec![]).is_ok());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_remove_restore_round_trip() {
        let mut graph = sample_graph();
        let rev_b = graph.rev(n("B")).unwrap();
        let removed = graph.remove(&HashSet::from([n("B"), n("C")])).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!graph.exists(n("B")));

        graph.restore(removed).unwrap();
        assert!(graph.exists(n("B")));
        assert!(graph.exists(n("C")));
        // Revs survive the round trip.
        assert_eq!(graph.rev(n("B")), Some(rev_b));
    }
}
