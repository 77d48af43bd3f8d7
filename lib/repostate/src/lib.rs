/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! On-disk state of an in-progress merge.

pub mod merge_state;

pub use crate::merge_state::ConflictState;
pub use crate::merge_state::FileInfo;
pub use crate::merge_state::MergeState;
pub use crate::merge_state::UnsupportedMergeRecords;
