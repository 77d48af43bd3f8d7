/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Common types shared by the obsolescence store and the strip engine.

pub mod marker;
pub mod node;
pub mod phase;

pub use crate::marker::MarkerFlags;
pub use crate::marker::ObsMarker;
pub use crate::node::Node;
pub use crate::node::NULL_ID;
pub use crate::phase::Phase;
