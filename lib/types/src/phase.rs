/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fmt;

/// Exchange phase of a changeset.
///
/// Public changesets are immutable by policy: they are never hidden by
/// obsolescence markers and stripping them is an operator error (the
/// engine warns but does not refuse).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    Public,
    #[default]
    Draft,
    Secret,
}

impl Phase {
    pub fn is_public(&self) -> bool {
        matches!(self, Phase::Public)
    }

    /// Mutable means history rewriting operations apply by policy.
    pub fn is_mutable(&self) -> bool {
        !self.is_public()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Phase::Public => "public",
            Phase::Draft => "draft",
            Phase::Secret => "secret",
        };
        f.write_str(name)
    }
}
