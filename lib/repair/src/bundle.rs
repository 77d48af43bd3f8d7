/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Deterministic changeset+marker bundles.
//!
//! Layout: HEADER + vlq(changeset_count) + CHANGESET* + vlq(marker_count)
//! + MARKER*, where
//!
//!   HEADER    := 'obsbundle1\0'
//!   CHANGESET := node(20) + vlq(parent_count) + parents(20 each)
//!                + vlq(payload_len) + payload
//!   MARKER    := vlq(len) + marker-bytes
//!
//! Changesets are ordered by local rev (parents before children) and
//! markers by their canonical serialized bytes, so the same changesets
//! and markers always produce byte-identical output. The strip backup is
//! written by this module, which makes backups directly comparable to
//! bundles produced for exchange.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use obsstore::relevant_markers;
use obsstore::ChangesetGraph;
use obsstore::ObsStore;
use std::collections::HashSet;
use types::Node;
use types::ObsMarker;
use vlqencoding::VLQDecode;
use vlqencoding::VLQEncode;

const BUNDLE_HEADER: &[u8] = b"obsbundle1\0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleEntry {
    pub node: Node,
    pub parents: Vec<Node>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bundle {
    /// Ordered parents-before-children (by the rev order of the
    /// producing repository).
    pub changesets: Vec<BundleEntry>,
    pub markers: Vec<ObsMarker>,
}

/// Serialize `nodes` (those present in the graph) and the markers
/// relevant to them.
pub fn bundle_with_markers(
    graph: &dyn ChangesetGraph,
    store: &ObsStore,
    nodes: &HashSet<Node>,
) -> Result<Vec<u8>> {
    let mut members: Vec<Node> = nodes.iter().copied().filter(|n| graph.exists(*n)).collect();
    members.sort_by_key(|n| graph.rev(*n));

    let mut markers = relevant_markers(store, nodes);
    markers.sort_by_cached_key(|marker| marker.to_bytes());

    let mut out = Vec::new();
    out.extend_from_slice(BUNDLE_HEADER);
    out.write_vlq(members.len())?;
    for node in &members {
        out.write_all(node.as_ref())?;
        let parents = graph.parents(*node)?;
        out.write_vlq(parents.len())?;
        for parent in &parents {
            out.write_all(parent.as_ref())?;
        }
        let payload = graph.payload(*node)?;
        out.write_vlq(payload.len())?;
        out.extend_from_slice(&payload);
    }
    out.write_vlq(markers.len())?;
    for marker in &markers {
        let bytes = marker.to_bytes();
        out.write_vlq(bytes.len())?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

pub fn read_bundle(bytes: &[u8]) -> Result<Bundle> {
    if !bytes.starts_with(BUNDLE_HEADER) {
        bail!("not a bundle: bad header");
    }
    let mut cur = Cursor::new(&bytes[BUNDLE_HEADER.len()..]);

    let read_node = |cur: &mut Cursor<&[u8]>| -> Result<Node> {
        let mut buf = [0u8; Node::LEN];
        cur.read_exact(&mut buf).context("reading node")?;
        Ok(Node::from_byte_array(buf))
    };

    let changeset_count: usize = cur.read_vlq().context("reading changeset count")?;
    let mut changesets = Vec::with_capacity(changeset_count.min(1024));
    for _ in 0..changeset_count {
        let node = read_node(&mut cur)?;
        let parent_count: usize = cur.read_vlq()?;
        if parent_count > 2 {
            bail!("malformed bundle: {} parents for {}", parent_count, node);
        }
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(read_node(&mut cur)?);
        }
        let payload_len: usize = cur.read_vlq()?;
        let mut payload = vec![0u8; payload_len];
        cur.read_exact(&mut payload).context("reading payload")?;
        changesets.push(BundleEntry {
            node,
            parents,
            payload,
        });
    }

    let marker_count: usize = cur.read_vlq().context("reading marker count")?;
    let mut markers = Vec::with_capacity(marker_count.min(1024));
    for _ in 0..marker_count {
        let len: usize = cur.read_vlq()?;
        let mut buf = vec![0u8; len];
        cur.read_exact(&mut buf).context("reading marker")?;
        markers.push(ObsMarker::from_bytes(&buf).context("parsing bundled marker")?);
    }

    if (cur.position() as usize) != bytes.len() - BUNDLE_HEADER.len() {
        bail!("malformed bundle: trailing bytes");
    }
    Ok(Bundle {
        changesets,
        markers,
    })
}

/// Replay a bundle into the graph and the store. Idempotent: changesets
/// already present and markers already known are no-ops, so applying a
/// strip backup restores exactly what the strip removed.
pub fn apply_bundle(
    graph: &mut dyn ChangesetGraph,
    store: &mut ObsStore,
    bundle: &Bundle,
) -> Result<()> {
    for entry in &bundle.changesets {
        graph.add(entry.node, entry.parents.clone(), entry.payload.clone())?;
    }
    for marker in &bundle.markers {
        store.add(marker.clone())?;
    }
    store.flush()?;
    Ok(())
}

/// Write bundle bytes to `path` atomically (tmp sibling + rename) and
/// durably. Creates the parent directory on demand.
pub fn write_bundle_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs_err::create_dir_all(dir)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("bundle path has no file name")?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name));
    {
        let mut tmp = fs_err::File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs_err::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsstore::MemChangesetGraph;
    use types::MarkerFlags;

    fn n(s: &str) -> Node {
        let mut bytes = [0u8; Node::LEN];
        for (byte, fill) in bytes.iter_mut().zip(s.bytes().cycle()) {
            *byte = fill;
        }
        Node::from_byte_array(bytes)
    }

    fn marker(pred: &str, succs: &[&str]) -> ObsMarker {
        ObsMarker::new(
            n(pred),
            succs.iter().map(|s| n(s)).collect(),
            MarkerFlags::empty(),
            42,
            0,
            vec![],
        )
    }

    fn sample() -> (MemChangesetGraph, ObsStore) {
        let mut graph = MemChangesetGraph::new();
        graph.add(n("A"), vec![], b"a".to_vec()).unwrap();
        graph.add(n("B"), vec![n("A")], b"b".to_vec()).unwrap();
        graph.add(n("C"), vec![n("B")], b"c".to_vec()).unwrap();
        let mut store = ObsStore::in_memory();
        store.add(marker("B", &["C"])).unwrap();
        (graph, store)
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let (graph, store) = sample();
        let nodes = HashSet::from([n("B"), n("C")]);
        let bytes = bundle_with_markers(&graph, &store, &nodes)?;

        let bundle = read_bundle(&bytes)?;
        assert_eq!(bundle.changesets.len(), 2);
        // Parents before children.
        assert_eq!(bundle.changesets[0].node, n("B"));
        assert_eq!(bundle.changesets[1].node, n("C"));
        assert_eq!(bundle.changesets[0].payload, b"b");
        assert_eq!(bundle.markers, vec![marker("B", &["C"])]);
        Ok(())
    }

    #[test]
    fn test_deterministic_output() -> Result<()> {
        let (graph, store) = sample();
        let nodes = HashSet::from([n("B"), n("C")]);
        let first = bundle_with_markers(&graph, &store, &nodes)?;
        let second = bundle_with_markers(&graph, &store, &nodes)?;
        assert_eq!(first, second);

        // Marker insertion order does not change the output.
        let mut reordered = ObsStore::in_memory();
        reordered.add(marker("X", &["Y"])).unwrap();
        reordered.add(marker("B", &["C"])).unwrap();
        let mut other = ObsStore::in_memory();
        other.add(marker("B", &["C"])).unwrap();
        other.add(marker("X", &["Y"])).unwrap();
        assert_eq!(
            bundle_with_markers(&graph, &reordered, &nodes)?,
            bundle_with_markers(&graph, &other, &nodes)?
        );
        Ok(())
    }

    #[test]
    fn test_absent_nodes_are_skipped() -> Result<()> {
        let (graph, store) = sample();
        let bytes = bundle_with_markers(&graph, &store, &HashSet::from([n("C"), n("Z")]))?;
        let bundle = read_bundle(&bytes)?;
        assert_eq!(bundle.changesets.len(), 1);
        assert_eq!(bundle.changesets[0].node, n("C"));
        Ok(())
    }

    #[test]
    fn test_apply_is_idempotent() -> Result<()> {
        let (mut graph, mut store) = sample();
        let nodes = HashSet::from([n("B"), n("C")]);
        let bundle = read_bundle(&bundle_with_markers(&graph, &store, &nodes)?)?;

        apply_bundle(&mut graph, &mut store, &bundle)?;
        apply_bundle(&mut graph, &mut store, &bundle)?;
        assert_eq!(graph.len(), 3);
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn test_bad_header_is_rejected() {
        assert!(read_bundle(b"not a bundle").is_err());
    }

    #[test]
    fn test_truncated_bundle_is_rejected() -> Result<()> {
        let (graph, store) = sample();
        let mut bytes = bundle_with_markers(&graph, &store, &HashSet::from([n("B")]))?;
        bytes.truncate(bytes.len() - 1);
        assert!(read_bundle(&bytes).is_err());
        Ok(())
    }

    #[test]
    fn test_write_bundle_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("strip-backup").join("abc-backup.bundle");
        write_bundle_file(&path, b"obsbundle1\0rest")?;
        assert_eq!(fs_err::read(&path)?, b"obsbundle1\0rest");
        // No tmp sibling left behind.
        assert_eq!(fs_err::read_dir(path.parent().unwrap())?.count(), 1);
        Ok(())
    }
}
