/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Destructive history repair: transactional strip with backup bundles.
//!
//! Stripping removes changesets (closed over descendants) and the
//! obsolescence markers exclusive to them. Before anything is mutated a
//! backup bundle capturing the doomed changesets and their relevant
//! markers is written and fsynced, so a strip is always reversible via
//! [`bundle::apply_bundle`] even when it fails partway.

pub mod bundle;
pub mod strip;
pub mod transaction;
pub mod workingcopy;

pub use crate::bundle::apply_bundle;
pub use crate::bundle::bundle_with_markers;
pub use crate::bundle::read_bundle;
pub use crate::bundle::Bundle;
pub use crate::bundle::BundleEntry;
pub use crate::strip::BackupHandle;
pub use crate::strip::StripEngine;
pub use crate::strip::StripError;
pub use crate::strip::StripOptions;
pub use crate::transaction::Transaction;
pub use crate::workingcopy::MemWorkingCopy;
pub use crate::workingcopy::WorkingCopy;
