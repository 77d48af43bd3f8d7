/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Changeset visibility, derived from the commit graph and the marker
//! graph.
//!
//! A changeset with outgoing markers is hidden when its rewrite chains
//! resolve locally: every chain either ends in a prune or at least one
//! chain ends in a changeset present in the graph. A changeset whose
//! successors were never pulled stays visible (a "troubled head") so
//! the user does not silently lose the only copy of their work.
//!
//! The result only depends on the set of known markers, never on the
//! order they were learned in.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use types::Node;

use crate::graph::ChangesetGraph;
use crate::store::ObsStore;

/// Classification of a node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    /// Superseded by a locally-present successor, or pruned. Also used
    /// for nodes known only through markers (absent from the graph).
    Obsolete,
    /// Absent from both the graph and every marker.
    Unknown,
}

pub struct VisibilityResolver<'a> {
    graph: &'a dyn ChangesetGraph,
    store: &'a ObsStore,
    // Memoized effective-successor closures, per resolver lifetime.
    cache: HashMap<Node, BTreeSet<Node>>,
}

impl<'a> VisibilityResolver<'a> {
    pub fn new(graph: &'a dyn ChangesetGraph, store: &'a ObsStore) -> Self {
        VisibilityResolver {
            graph,
            store,
            cache: HashMap::new(),
        }
    }

    /// The transitive, deduplicated termini of `node`'s rewrite chains:
    /// every reachable node with no outgoing markers. `{node}` when the
    /// node has no outgoing markers; empty when every chain ends in a
    /// prune.
    ///
    /// Iterative worklist with a visited set. An edge leading back into
    /// the visited set is cut, so malformed marker cycles terminate
    /// instead of looping.
    pub fn effective_successors(&mut self, node: Node) -> BTreeSet<Node> {
        if let Some(cached) = self.cache.get(&node) {
            return cached.clone();
        }
        let mut termini = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut to_visit = vec![node];
        while let Some(current) = to_visit.pop() {
            if !visited.insert(current) {
                continue;
            }
            let markers = self.store.markers_by_precursor(current);
            if markers.is_empty() {
                termini.insert(current);
                continue;
            }
            for marker in markers {
                // A prune marker contributes nothing.
                to_visit.extend(marker.successors.iter().copied());
            }
        }
        self.cache.insert(node, termini.clone());
        termini
    }

    pub fn is_obsolete(&mut self, node: Node) -> bool {
        if self.graph.phase(node).is_public() {
            return false;
        }
        if self.store.markers_by_precursor(node).is_empty() {
            return false;
        }
        let termini = self.effective_successors(node);
        // All chains pruned, or at least one chain landed on a present
        // changeset. Termini have no outgoing markers, so a present
        // terminus is itself visible.
        termini.is_empty() || termini.iter().any(|t| self.graph.exists(*t))
    }

    pub fn is_visible(&mut self, node: Node) -> bool {
        self.graph.exists(node) && !self.is_obsolete(node)
    }

    pub fn visibility(&mut self, node: Node) -> Visibility {
        if self.graph.exists(node) {
            if self.is_obsolete(node) {
                Visibility::Obsolete
            } else {
                Visibility::Visible
            }
        } else if self.store.markers_by_precursor(node).is_empty()
            && self.store.markers_by_successor(node).is_empty()
        {
            Visibility::Unknown
        } else {
            Visibility::Obsolete
        }
    }

    /// Every visible changeset.
    pub fn visible_set(&mut self) -> HashSet<Node> {
        self.graph
            .nodes()
            .into_iter()
            .filter(|node| {
                // Inlined is_visible; nodes() only returns present ones.
                !self.is_obsolete(*node)
            })
            .collect()
    }

    /// Reporting refinement: visible, non-obsolete changesets that sit
    /// on top of an obsolete ancestor.
    pub fn orphans(&mut self) -> HashSet<Node> {
        let mut orphans = HashSet::new();
        for node in self.graph.nodes() {
            if self.graph.phase(node).is_public() || self.is_obsolete(node) {
                continue;
            }
            if self.has_obsolete_ancestor(node) {
                orphans.insert(node);
            }
        }
        orphans
    }

    /// Reporting refinement: visible changesets competing as rewrites
    /// of the same precursor (two or more locally-present termini).
    pub fn divergent(&mut self) -> HashSet<Node> {
        let mut divergent = HashSet::new();
        let precursors: Vec<Node> = self.store.precursor_nodes().collect();
        for precursor in precursors {
            let present: Vec<Node> = self
                .effective_successors(precursor)
                .into_iter()
                .filter(|t| self.graph.exists(*t))
                .collect();
            if present.len() >= 2 {
                divergent.extend(present);
            }
        }
        divergent
    }

    fn has_obsolete_ancestor(&mut self, node: Node) -> bool {
        let mut visited = HashSet::new();
        let mut to_visit = self.graph.parents(node).unwrap_or_default();
        while let Some(current) = to_visit.pop() {
            if current.is_null() || !visited.insert(current) {
                continue;
            }
            if !self.graph.exists(current) {
                continue;
            }
            if self.is_obsolete(current) {
                return true;
            }
            to_visit.extend(self.graph.parents(current).unwrap_or_default());
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use types::MarkerFlags;
    use types::ObsMarker;
    use types::Phase;

    use crate::graph::MemChangesetGraph;

    fn n(s: &str) -> Node {
        let mut bytes = [0u8; Node::LEN];
        for (byte, fill) in bytes.iter_mut().zip(s.bytes().cycle()) {
            *byte = fill;
        }
        Node::from_byte_array(bytes)
    }

    fn add(store: &mut ObsStore, pred: &str, succs: &[&str]) {
        store
            .add(ObsMarker::new(
                n(pred),
                succs.iter().map(|s| n(s)).collect(),
                MarkerFlags::empty(),
                1,
                0,
                vec![],
            ))
            .unwrap();
    }

    fn commit(graph: &mut MemChangesetGraph, name: &str, parents: &[&str]) {
        graph
            .add(
                n(name),
                parents.iter().map(|p| n(p)).collect(),
                name.as_bytes().to_vec(),
            )
            .unwrap();
    }

    #[test]
    fn test_no_markers_means_visible() {
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        let store = ObsStore::in_memory();
        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert!(resolver.is_visible(n("A")));
        assert_eq!(resolver.effective_successors(n("A")), BTreeSet::from([n("A")]));
    }

    #[test]
    fn test_amend_chain_hides_precursors() {
        // A -> B -> C recorded as amend markers; only C committed last.
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "R", &[]);
        commit(&mut graph, "A", &["R"]);
        commit(&mut graph, "B", &["R"]);
        commit(&mut graph, "C", &["R"]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "A", &["B"]);
        add(&mut store, "B", &["C"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert_eq!(resolver.effective_successors(n("A")), BTreeSet::from([n("C")]));
        assert!(!resolver.is_visible(n("A")));
        assert!(!resolver.is_visible(n("B")));
        assert!(resolver.is_visible(n("C")));
        assert_eq!(
            resolver.visible_set(),
            HashSet::from([n("R"), n("C")])
        );
    }

    #[test]
    fn test_prune_hides_lineage() {
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        commit(&mut graph, "B", &["A"]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "B", &[]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert!(resolver.effective_successors(n("B")).is_empty());
        assert!(!resolver.is_visible(n("B")));
        assert!(resolver.is_visible(n("A")));
    }

    #[test]
    fn test_missing_successor_keeps_node_visible() {
        // A was amended into Z, but Z was never pulled. A must stay
        // visible: hiding it would lose the only local copy.
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "A", &["Z"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert_eq!(resolver.effective_successors(n("A")), BTreeSet::from([n("Z")]));
        assert!(resolver.is_visible(n("A")));
        // Z itself is only known through markers.
        assert!(!resolver.is_visible(n("Z")));
        assert_eq!(resolver.visibility(n("Z")), Visibility::Obsolete);
    }

    #[test]
    fn test_unknown_node() {
        let graph = MemChangesetGraph::new();
        let store = ObsStore::in_memory();
        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert_eq!(resolver.visibility(n("X")), Visibility::Unknown);
        assert!(!resolver.is_visible(n("X")));
    }

    #[test]
    fn test_prune_with_missing_precursor_does_not_raise() {
        // Marker (X -> []) exists but X was never present locally.
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "X", &[]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert!(!resolver.is_visible(n("X")));
        assert_eq!(resolver.visibility(n("X")), Visibility::Obsolete);
        assert!(resolver.is_visible(n("A")));
    }

    #[test]
    fn test_divergence_keeps_both_successors_visible() {
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        commit(&mut graph, "B", &[]);
        commit(&mut graph, "C", &[]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "A", &["B"]);
        add(&mut store, "A", &["C"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert_eq!(
            resolver.effective_successors(n("A")),
            BTreeSet::from([n("B"), n("C")])
        );
        assert!(!resolver.is_visible(n("A")));
        assert!(resolver.is_visible(n("B")));
        assert!(resolver.is_visible(n("C")));
        assert_eq!(resolver.divergent(), HashSet::from([n("B"), n("C")]));
    }

    #[test]
    fn test_cycle_terminates_and_hides() {
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        commit(&mut graph, "B", &[]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "A", &["B"]);
        add(&mut store, "B", &["A"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        // Does not loop; every chain member has outgoing markers, so
        // there is no terminus and both count as obsolete.
        assert!(resolver.effective_successors(n("A")).is_empty());
        assert!(!resolver.is_visible(n("A")));
        assert!(!resolver.is_visible(n("B")));
    }

    #[test]
    fn test_public_is_never_obsolete() {
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        commit(&mut graph, "B", &[]);
        graph.set_phase(n("A"), Phase::Public).unwrap();
        let mut store = ObsStore::in_memory();
        add(&mut store, "A", &["B"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert!(resolver.is_visible(n("A")));
        assert!(resolver.is_visible(n("B")));
    }

    #[test]
    fn test_orphan_reporting() {
        // B is obsolete, C sits on top of it and becomes an orphan.
        let mut graph = MemChangesetGraph::new();
        commit(&mut graph, "A", &[]);
        commit(&mut graph, "B", &["A"]);
        commit(&mut graph, "C", &["B"]);
        commit(&mut graph, "B2", &["A"]);
        let mut store = ObsStore::in_memory();
        add(&mut store, "B", &["B2"]);

        let mut resolver = VisibilityResolver::new(&graph, &store);
        assert_eq!(resolver.orphans(), HashSet::from([n("C")]));
    }

    #[test]
    fn test_learn_order_does_not_matter() -> Result<()> {
        // The §distributed scenario: markers learned in any order give
        // the same visible set.
        let edges = [("A0", "A1"), ("A1", "B0"), ("B0", "B1")];
        let mut expected: Option<HashSet<Node>> = None;

        // All 6 permutations of 3 edges.
        let permutations = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for permutation in permutations {
            let mut graph = MemChangesetGraph::new();
            commit(&mut graph, "R", &[]);
            for name in ["A0", "A1", "B0", "B1"] {
                commit(&mut graph, name, &["R"]);
            }
            let mut store = ObsStore::in_memory();
            for &i in &permutation {
                let (pred, succ) = edges[i];
                add(&mut store, pred, &[succ]);
            }
            let mut resolver = VisibilityResolver::new(&graph, &store);
            let visible = resolver.visible_set();
            assert_eq!(visible, HashSet::from([n("R"), n("B1")]));
            if let Some(expected) = &expected {
                assert_eq!(&visible, expected);
            }
            expected = Some(visible);
        }
        Ok(())
    }
}
