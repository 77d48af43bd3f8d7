/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use anyhow::Result;
use types::Node;
use types::NULL_ID;

/// The narrow view of the working copy the strip engine needs: whose
/// child the checkout is, whether it has local changes, and moving it.
pub trait WorkingCopy {
    /// The checked-out parent. [`NULL_ID`] for an empty checkout.
    fn parent(&self) -> Node;

    /// Whether there are uncommitted local changes.
    fn is_dirty(&self) -> Result<bool>;

    fn set_parent(&mut self, node: Node) -> Result<()>;
}

/// In-memory working copy for tests and embedders.
pub struct MemWorkingCopy {
    parent: Node,
    dirty: bool,
}

impl MemWorkingCopy {
    pub fn new(parent: Node) -> Self {
        MemWorkingCopy {
            parent,
            dirty: false,
        }
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

impl Default for MemWorkingCopy {
    fn default() -> Self {
        Self::new(NULL_ID)
    }
}

impl WorkingCopy for MemWorkingCopy {
    fn parent(&self) -> Node {
        self.parent
    }

    fn is_dirty(&self) -> Result<bool> {
        Ok(self.dirty)
    }

    fn set_parent(&mut self, node: Node) -> Result<()> {
        self.parent = node;
        Ok(())
    }
}
