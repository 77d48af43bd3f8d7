/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::io::{self, Read, Write};

use bitflags::bitflags;
use vlqencoding::{VLQDecode, VLQEncode};

use crate::node::Node;

bitflags! {
    pub struct MarkerFlags: u64 {
        /// The precursor changeset content is not available locally.
        /// The marker was learned from a remote that never sent the
        /// precursor itself.
        const MISSING_PRECURSOR = 0b1;
    }
}

/// An obsolescence marker: a directed, timestamped edge recording that
/// `precursor` was rewritten into `successors`.
///
/// No successor means the precursor was pruned (intentionally discarded).
/// One successor is an amend/rebase. Two or more successors record a
/// split. Multiple markers sharing a precursor record divergence;
/// multiple markers sharing a successor record a fold.
///
/// Markers are append-only. They are removed only when a strip deletes
/// the marker's entire node set along with the changesets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObsMarker {
    pub precursor: Node,
    pub successors: Vec<Node>,
    pub flags: MarkerFlags,
    /// Creation time, seconds since epoch.
    pub time: i64,
    /// Timezone offset in seconds.
    pub tz: i32,
    // Sorted by key so equal markers serialize identically.
    metadata: Vec<(String, String)>,
}

/// Metadata keys recording the former parents of a pruned changeset.
pub const META_P1: &str = "p1";
pub const META_P2: &str = "p2";

impl ObsMarker {
    pub fn new(
        precursor: Node,
        successors: Vec<Node>,
        flags: MarkerFlags,
        time: i64,
        tz: i32,
        mut metadata: Vec<(String, String)>,
    ) -> Self {
        metadata.sort();
        ObsMarker {
            precursor,
            successors,
            flags,
            time,
            tz,
            metadata,
        }
    }

    /// A prune marker: `precursor` was discarded with no replacement.
    /// The former parents are recorded as metadata so a receiver can
    /// position the pruned changeset without its content. Metadata
    /// references never count as marker membership.
    pub fn prune(precursor: Node, parents: &[Node], time: i64, tz: i32) -> Self {
        let mut metadata = Vec::new();
        if let Some(p1) = parents.first() {
            metadata.push((META_P1.to_string(), p1.to_hex()));
        }
        if let Some(p2) = parents.get(1) {
            metadata.push((META_P2.to_string(), p2.to_hex()));
        }
        Self::new(
            precursor,
            Vec::new(),
            MarkerFlags::empty(),
            time,
            tz,
            metadata,
        )
    }

    pub fn is_prune(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn metadata_get(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All nodes this marker mentions: the precursor and every
    /// successor. Metadata (e.g. recorded parents of a prune) is not
    /// membership.
    pub fn mentioned(&self) -> impl Iterator<Item = Node> + '_ {
        std::iter::once(self.precursor).chain(self.successors.iter().copied())
    }

    /// Former parents recorded in prune metadata. Unparseable values
    /// are skipped.
    pub fn prune_parents(&self) -> Vec<Node> {
        [META_P1, META_P2]
            .into_iter()
            .filter_map(|key| self.metadata_get(key))
            .filter_map(|hex| hex.parse().ok())
            .collect()
    }

    pub fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(self.precursor.as_ref())?;
        w.write_vlq(self.successors.len())?;
        for succ in &self.successors {
            w.write_all(succ.as_ref())?;
        }
        w.write_vlq(self.flags.bits())?;
        w.write_vlq(self.time)?;
        w.write_vlq(self.tz)?;
        w.write_vlq(self.metadata.len())?;
        for (key, value) in &self.metadata {
            w.write_vlq(key.len())?;
            w.write_all(key.as_bytes())?;
            w.write_vlq(value.len())?;
            w.write_all(value.as_bytes())?;
        }
        Ok(())
    }

    pub fn deserialize(r: &mut dyn Read) -> io::Result<Self> {
        let read_node = |r: &mut dyn Read| -> io::Result<Node> {
            let mut bytes = [0u8; Node::LEN];
            r.read_exact(&mut bytes)?;
            Ok(Node::from_byte_array(bytes))
        };
        let read_string = |r: &mut dyn Read| -> io::Result<String> {
            let len: usize = r.read_vlq()?;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };

        let precursor = read_node(r)?;
        let succ_count: usize = r.read_vlq()?;
        let mut successors = Vec::with_capacity(succ_count);
        for _ in 0..succ_count {
            successors.push(read_node(r)?);
        }
        let bits: u64 = r.read_vlq()?;
        let flags = MarkerFlags::from_bits(bits)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown marker flags"))?;
        let time: i64 = r.read_vlq()?;
        let tz: i32 = r.read_vlq()?;
        let meta_count: usize = r.read_vlq()?;
        let mut metadata = Vec::with_capacity(meta_count);
        for _ in 0..meta_count {
            let key = read_string(r)?;
            let value = read_string(r)?;
            metadata.push((key, value));
        }
        Ok(Self::new(precursor, successors, flags, time, tz, metadata))
    }

    /// Canonical byte form. Equal markers produce equal bytes; the
    /// store and the bundle writer rely on this for deduplication and
    /// deterministic output.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.serialize(&mut buf).expect("write to Vec should not fail");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = io::Cursor::new(bytes);
        let marker = Self::deserialize(&mut cur)?;
        if cur.position() as usize != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after marker",
            ));
        }
        Ok(marker)
    }
}

#[cfg(any(test, feature = "for-tests"))]
impl quickcheck::Arbitrary for ObsMarker {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let succ_count = usize::arbitrary(g) % 3;
        let successors = (0..succ_count).map(|_| Node::arbitrary(g)).collect();
        let flags = if bool::arbitrary(g) {
            MarkerFlags::MISSING_PRECURSOR
        } else {
            MarkerFlags::empty()
        };
        let meta_count = usize::arbitrary(g) % 3;
        let metadata = (0..meta_count)
            .map(|i| (format!("k{}", i), String::arbitrary(g)))
            .collect();
        ObsMarker::new(
            Node::arbitrary(g),
            successors,
            flags,
            i64::arbitrary(g),
            i32::arbitrary(g) % 86400,
            metadata,
        )
    }
}
