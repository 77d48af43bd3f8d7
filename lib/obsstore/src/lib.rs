/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The obsolescence marker store and the algorithms layered on it.
//!
//! - [`ObsStore`]: durable, append-only set of obsolescence markers with
//!   by-precursor and by-successor indices.
//! - [`VisibilityResolver`]: which changesets are visible vs hidden,
//!   given the commit graph and the marker graph.
//! - [`relevant_markers`] / [`exclusive_markers`]: which markers must
//!   travel with a set of changesets, and which markers a strip of that
//!   set may physically delete.
//!
//! Concurrency: the store is single-writer. In-process exclusivity comes
//! from `&mut self`; cross-process exclusivity comes from the store
//! directory lock ([`ObsStore::lock`]), which mutating operations are
//! expected to hold for their entire transaction. Readers either block
//! on that lock or observe a consistent pre-transaction snapshot.

pub mod graph;
pub mod lock;
pub mod relevance;
pub mod store;
pub mod visibility;

pub use crate::graph::descendants;
pub use crate::graph::ChangesetGraph;
pub use crate::graph::ChangesetRecord;
pub use crate::graph::MemChangesetGraph;
pub use crate::lock::PathLock;
pub use crate::relevance::exclusive_markers;
pub use crate::relevance::relevant_markers;
pub use crate::store::ObsStore;
pub use crate::visibility::Visibility;
pub use crate::visibility::VisibilityResolver;
