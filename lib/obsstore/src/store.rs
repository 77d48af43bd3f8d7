/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Durable, append-only store for obsolescence markers.
//!
//! On-disk layout, in the store directory:
//!
//! - markers: HEADER + ENTRY_LIST
//!   HEADER := 'obslog1\0'
//!   ENTRY_LIST := '' | ENTRY_LIST + ENTRY
//!   ENTRY := vlq(LEN(MARKER)) + MARKER
//! - lock: advisory lock file taken by mutating operations.
//!
//! Appends go straight to the log. Physical removal (strip of exclusive
//! markers) rewrites the log atomically via a temporary file and a
//! rename, preserving surviving record order, so a post-strip store is
//! indistinguishable from one that never held the removed markers.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use thiserror::Error;
use types::Node;
use types::ObsMarker;
use vlqencoding::{VLQDecodeAt, VLQEncode};

use crate::graph::ChangesetGraph;
use crate::lock::PathLock;

const LOG_HEADER: &[u8] = b"obslog1\0";
const LOG_NAME: &str = "markers";
const LOCK_NAME: &str = "lock";

#[derive(Debug, Error)]
#[error("obsstore {path:?} is corrupt: {reason}")]
pub struct Corruption {
    pub path: PathBuf,
    pub reason: String,
}

pub struct ObsStore {
    // None for an in-memory store.
    dir: Option<PathBuf>,
    // Append handle for the log. Reopened after every rewrite.
    log: Option<File>,

    // Insertion-ordered markers; the order is what `iter` exposes and
    // what relevance selection sorts by.
    pub(crate) markers: Vec<ObsMarker>,
    // Canonical marker bytes -> index, for duplicate detection.
    known: HashMap<Vec<u8>, usize>,
    // Indices, maintained incrementally by add/remove. Private so they
    // can never drift from `markers`. The prune-parent index maps a
    // recorded former parent to the prune markers of its children, so
    // relevance can reach prunes whose precursor was never local.
    pub(crate) by_pred: HashMap<Node, Vec<usize>>,
    pub(crate) by_succ: HashMap<Node, Vec<usize>>,
    pub(crate) by_prune_parent: HashMap<Node, Vec<usize>>,
}

impl ObsStore {
    /// Open the store in `dir`, creating it on demand.
    pub fn open(dir: impl AsRef<Path>) -> Result<ObsStore> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating obsstore directory {:?}", dir))?;

        let mut store = ObsStore {
            dir: Some(dir.clone()),
            log: None,
            markers: Vec::new(),
            known: HashMap::new(),
            by_pred: HashMap::new(),
            by_succ: HashMap::new(),
            by_prune_parent: HashMap::new(),
        };

        let log_path = dir.join(LOG_NAME);
        match fs::read(&log_path) {
            Ok(bytes) => store.load(&log_path, &bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading obsstore log {:?}", log_path));
            }
        }

        store.log = Some(store.open_log_for_append()?);
        tracing::debug!("opened obsstore with {} markers", store.markers.len());
        Ok(store)
    }

    /// A store with no backing directory. Used by tests and by
    /// receivers that only need transient marker state.
    pub fn in_memory() -> ObsStore {
        ObsStore {
            dir: None,
            log: None,
            markers: Vec::new(),
            known: HashMap::new(),
            by_pred: HashMap::new(),
            by_succ: HashMap::new(),
            by_prune_parent: HashMap::new(),
        }
    }

    /// Take the exclusive store lock. Mutating operations hold this for
    /// their entire transaction. Returns `None` for in-memory stores.
    pub fn lock(&self) -> Result<Option<PathLock>> {
        match &self.dir {
            Some(dir) => Ok(Some(PathLock::exclusive(dir.join(LOCK_NAME))?)),
            None => Ok(None),
        }
    }

    /// Add a marker. Adding a marker identical to an existing one is a
    /// silent no-op reported as success; returns `false` in that case.
    pub fn add(&mut self, marker: ObsMarker) -> Result<bool> {
        let bytes = marker.to_bytes();
        if self.known.contains_key(&bytes) {
            return Ok(false);
        }
        if let Some(log) = self.log.as_mut() {
            let mut entry = Vec::with_capacity(bytes.len() + 2);
            entry.write_vlq(bytes.len())?;
            entry.extend_from_slice(&bytes);
            log.write_all(&entry).context("appending to obsstore log")?;
        }
        self.index_insert(marker, bytes);
        Ok(true)
    }

    /// Record that `precursor` was rewritten into `successors`
    /// (amend/rebase for one successor, split for several, fold when
    /// several markers share the successor).
    pub fn record_rewrite(
        &mut self,
        precursor: Node,
        successors: Vec<Node>,
        time: i64,
        tz: i32,
        metadata: Vec<(String, String)>,
    ) -> Result<bool> {
        self.add(ObsMarker::new(
            precursor,
            successors,
            types::MarkerFlags::empty(),
            time,
            tz,
            metadata,
        ))
    }

    /// Record that `node` was pruned, embedding its current parents as
    /// metadata so receivers can position it without its content.
    pub fn record_prune(
        &mut self,
        graph: &dyn ChangesetGraph,
        node: Node,
        time: i64,
        tz: i32,
    ) -> Result<bool> {
        let parents = graph.parents(node)?;
        self.add(ObsMarker::prune(node, &parents, time, tz))
    }

    /// All markers, in insertion order. Restartable.
    pub fn iter(&self) -> impl Iterator<Item = &ObsMarker> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn contains(&self, marker: &ObsMarker) -> bool {
        self.known.contains_key(&marker.to_bytes())
    }

    /// Markers whose precursor is `node`.
    pub fn markers_by_precursor(&self, node: Node) -> Vec<&ObsMarker> {
        self.by_pred
            .get(&node)
            .map(|indices| indices.iter().map(|&i| &self.markers[i]).collect())
            .unwrap_or_default()
    }

    /// Markers listing `node` among their successors.
    pub fn markers_by_successor(&self, node: Node) -> Vec<&ObsMarker> {
        self.by_succ
            .get(&node)
            .map(|indices| indices.iter().map(|&i| &self.markers[i]).collect())
            .unwrap_or_default()
    }

    /// Every node that is the precursor of at least one marker.
    pub fn precursor_nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.by_pred.keys().copied()
    }

    /// Per-marker successor lists of `node`. A prune marker contributes
    /// an empty list.
    pub fn successors_sets(&self, node: Node) -> Vec<Vec<Node>> {
        self.markers_by_precursor(node)
            .into_iter()
            .map(|marker| marker.successors.clone())
            .collect()
    }

    /// Direct predecessors of `node` recorded by any marker.
    pub fn predecessors(&self, node: Node) -> Vec<Node> {
        let mut seen = Vec::new();
        for marker in self.markers_by_successor(node) {
            if !seen.contains(&marker.precursor) {
                seen.push(marker.precursor);
            }
        }
        seen
    }

    /// Physically delete `markers`. Only the strip engine calls this,
    /// and only with markers exclusive to the stripped set. Unknown
    /// markers are ignored. Returns the number removed.
    pub fn remove(&mut self, markers: &[ObsMarker]) -> Result<usize> {
        let doomed: Vec<Vec<u8>> = markers
            .iter()
            .map(|marker| marker.to_bytes())
            .filter(|bytes| self.known.contains_key(bytes))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let removed = doomed.len();
        let doomed: std::collections::HashSet<Vec<u8>> = doomed.into_iter().collect();
        let survivors: Vec<ObsMarker> = self
            .markers
            .iter()
            .filter(|marker| !doomed.contains(&marker.to_bytes()))
            .cloned()
            .collect();
        self.reset(survivors)?;
        tracing::debug!("removed {} markers from obsstore", removed);
        Ok(removed)
    }

    /// Replace the entire marker set, preserving the given order. Used
    /// by transaction rollback.
    pub fn restore(&mut self, markers: Vec<ObsMarker>) -> Result<()> {
        self.reset(markers)
    }

    /// Make pending appends durable.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.flush().context("flushing obsstore log")?;
            log.sync_all().context("syncing obsstore log")?;
        }
        Ok(())
    }

    fn index_insert(&mut self, marker: ObsMarker, bytes: Vec<u8>) {
        let index = self.markers.len();
        self.by_pred.entry(marker.precursor).or_default().push(index);
        for succ in &marker.successors {
            self.by_succ.entry(*succ).or_default().push(index);
        }
        if marker.is_prune() {
            for parent in marker.prune_parents() {
                self.by_prune_parent.entry(parent).or_default().push(index);
            }
        }
        self.known.insert(bytes, index);
        self.markers.push(marker);
    }

    fn reset(&mut self, markers: Vec<ObsMarker>) -> Result<()> {
        self.markers.clear();
        self.known.clear();
        self.by_pred.clear();
        self.by_succ.clear();
        self.by_prune_parent.clear();
        for marker in markers {
            let bytes = marker.to_bytes();
            if !self.known.contains_key(&bytes) {
                self.index_insert(marker, bytes);
            }
        }
        self.rewrite_log()
    }

    fn rewrite_log(&mut self) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };
        self.log = None;

        let mut content = Vec::with_capacity(LOG_HEADER.len() + self.markers.len() * 64);
        content.extend_from_slice(LOG_HEADER);
        for marker in &self.markers {
            let bytes = marker.to_bytes();
            content.write_vlq(bytes.len())?;
            content.extend_from_slice(&bytes);
        }

        let tmp_path = dir.join(format!("{}.tmp", LOG_NAME));
        let log_path = dir.join(LOG_NAME);
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("creating {:?}", tmp_path))?;
            tmp.write_all(&content)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)
            .with_context(|| format!("replacing obsstore log {:?}", log_path))?;

        self.log = Some(self.open_log_for_append()?);
        Ok(())
    }

    fn open_log_for_append(&self) -> Result<File> {
        let dir = self.dir.as_ref().expect("on-disk store");
        let log_path = dir.join(LOG_NAME);
        if !log_path.exists() {
            let mut file = File::create(&log_path)
                .with_context(|| format!("creating obsstore log {:?}", log_path))?;
            file.write_all(LOG_HEADER)?;
            file.sync_all()?;
        }
        OpenOptions::new()
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening obsstore log {:?}", log_path))
    }

    fn load(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let corrupt = |reason: &str| Corruption {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if !bytes.starts_with(LOG_HEADER) {
            bail!(corrupt("bad header"));
        }
        let mut offset = LOG_HEADER.len();
        while offset < bytes.len() {
            let (len, vlq_size): (usize, usize) = bytes
                .read_vlq_at(offset)
                .map_err(|_| corrupt("bad entry length"))?;
            offset += vlq_size;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| corrupt("truncated entry"))?;
            let marker = ObsMarker::from_bytes(&bytes[offset..end])
                .map_err(|e| corrupt(&format!("bad marker entry: {}", e)))?;
            offset = end;
            let marker_bytes = marker.to_bytes();
            if !self.known.contains_key(&marker_bytes) {
                self.index_insert(marker, marker_bytes);
            }
        }
        Ok(())
    }
}
