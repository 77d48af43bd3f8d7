/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Marker selection for a set of changesets.
//!
//! Two related subsets of the store:
//!
//! - relevant: the markers that must travel alongside the set when it is
//!   bundled or exchanged, so receivers can reconstruct the rewrite
//!   history around it.
//! - exclusive: the relevant markers that mention nothing outside the
//!   set. Stripping the set may physically delete exactly these; any
//!   other marker still describes surviving history.

use std::collections::HashSet;

use types::Node;
use types::ObsMarker;

use crate::store::ObsStore;

/// Markers relevant to `nodes`: the fixed point of "touches a mentioned
/// node", where a marker's own precursor and successors become mentioned
/// once it joins the result. A prune marker is also pulled in through
/// its recorded former parents, so a receiver holding only the parent
/// still learns its child was discarded.
///
/// The result is in store insertion order and duplicate-free, so the
/// same store and set always produce the same list.
pub fn relevant_markers(store: &ObsStore, nodes: &HashSet<Node>) -> Vec<ObsMarker> {
    let mut selected: HashSet<usize> = HashSet::new();
    let mut mentioned: HashSet<Node> = nodes.clone();
    let mut to_visit: Vec<Node> = nodes.iter().copied().collect();

    while let Some(node) = to_visit.pop() {
        let mut indices: Vec<usize> = Vec::new();
        if let Some(list) = store.by_pred.get(&node) {
            indices.extend_from_slice(list);
        }
        if let Some(list) = store.by_succ.get(&node) {
            indices.extend_from_slice(list);
        }
        if let Some(list) = store.by_prune_parent.get(&node) {
            indices.extend_from_slice(list);
        }
        for index in indices {
            if !selected.insert(index) {
                continue;
            }
            let marker = &store.markers[index];
            for touched in marker.mentioned() {
                if mentioned.insert(touched) {
                    to_visit.push(touched);
                }
            }
        }
    }

    let mut ordered: Vec<usize> = selected.into_iter().collect();
    ordered.sort_unstable();
    ordered
        .into_iter()
        .map(|index| store.markers[index].clone())
        .collect()
}

/// The relevant markers of `nodes` whose precursor and successors all
/// lie inside `nodes`. Metadata nodes are deliberately not constrained:
/// a prune marker recording an outside parent is still exclusive to the
/// pruned changeset.
pub fn exclusive_markers(store: &ObsStore, nodes: &HashSet<Node>) -> Vec<ObsMarker> {
    relevant_markers(store, nodes)
        .into_iter()
        .filter(|marker| {
            nodes.contains(&marker.precursor)
                && marker.successors.iter().all(|succ| nodes.contains(succ))
        })
        .collect()
}
