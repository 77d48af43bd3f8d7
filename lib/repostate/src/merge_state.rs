/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use thiserror::Error;
use types::Node;

/// MergeState records which commits are being merged and the state of
/// conflicting files (unresolved/resolved).
///
/// It is serialized as a list of records. Each record contains an
/// arbitrary list of strings and an associated type. This `type` should
/// be a letter. If `type` is uppercase, the record is mandatory: readers
/// that don't support it must abort. If `type` is lowercase, the record
/// can be safely ignored.
///
/// Currently known records:
///
/// L: the node of the "local" part of the merge (hexified version)
/// O: the node of the "other" part of the merge (hexified version)
/// F: a file to be merged entry
/// C: a change/delete or delete/change conflict
/// P: a path conflict (file vs directory)
/// l: the labels for the parts of the merge.
///
/// Merge record states (first data field, indexed by filename):
/// u: unresolved conflict
/// r: resolved conflict
/// pu: unresolved path conflict (file conflicts with directory)
/// pr: resolved path conflict
#[derive(Default)]
pub struct MergeState {
    // commits being merged
    local: Option<Node>,
    other: Option<Node>,

    // contextual labels for local/other/base
    labels: Vec<String>,

    // conflicting files
    files: HashMap<String, FileInfo>,

    // advisory record types we did not recognize, preserved verbatim
    unsupported_records: Vec<(String, Vec<String>)>,
}

/// A mandatory (uppercase) record type this reader does not understand.
/// Proceeding could silently drop merge data, so parsing fails instead.
#[derive(Debug, Error)]
#[error("unsupported merge record types: {0:?}")]
pub struct UnsupportedMergeRecords(pub Vec<String>);

impl MergeState {
    pub fn new(local: Option<Node>, other: Option<Node>, labels: Vec<String>) -> Self {
        Self {
            local,
            other,
            labels,
            ..Default::default()
        }
    }

    /// Read the merge state file at `path`. `Ok(None)` when no merge is
    /// in progress (the file does not exist).
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs_err::File::open(path) {
            Ok(mut file) => Ok(Some(
                Self::deserialize(&mut file).context("deserializing merge state")?,
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("opening merge state"),
        }
    }

    pub fn local(&self) -> Option<&Node> {
        self.local.as_ref()
    }

    pub fn other(&self) -> Option<&Node> {
        self.other.as_ref()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn files(&self) -> &HashMap<String, FileInfo> {
        &self.files
    }

    pub fn unsupported_records(&self) -> &[(String, Vec<String>)] {
        &self.unsupported_records
    }

    /// Whether this merge involves any of `nodes`. A strip of those
    /// nodes invalidates the merge and must clear this state.
    pub fn references(&self, nodes: &HashSet<Node>) -> bool {
        self.local.as_ref().is_some_and(|n| nodes.contains(n))
            || self.other.as_ref().is_some_and(|n| nodes.contains(n))
    }

    pub fn insert(&mut self, path: String, data: Vec<String>) -> Result<()> {
        if data.is_empty() {
            bail!("invalid empty merge data for {}", path);
        }
        self.files.insert(
            path,
            FileInfo {
                state: ConflictState::from_record(&data[0])?,
                data,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn is_unresolved(&self) -> bool {
        self.files.values().any(|info| info.state.is_unresolved())
    }

    pub fn deserialize(data: &mut dyn Read) -> Result<Self> {
        let mut data = std::io::BufReader::new(data);

        let mut ms = Self::default();

        loop {
            let record_type = match data.read_u8() {
                Ok(t) => t,
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err).context("reading record type"),
            };

            let record_length = data
                .read_u32::<BigEndian>()
                .context("reading record length")?;

            let mut record_data = vec![0; record_length as usize];
            data.read_exact(&mut record_data)
                .context("reading record data")?;

            fn split_strings(data: Vec<u8>) -> Result<(String, Vec<String>)> {
                let mut fields = data.split(|b| *b == 0);
                let first = fields.next().context("first string field")?;
                Ok((
                    std::str::from_utf8(first)?.to_owned(),
                    fields
                        .map(|d| Ok(std::str::from_utf8(d)?.to_owned()))
                        .collect::<Result<_>>()
                        .context("reading record strings")?,
                ))
            }

            match record_type {
                b'L' => {
                    ms.local = Some(parse_node(&record_data).context("parsing local node")?);
                }
                b'O' => {
                    ms.other = Some(parse_node(&record_data).context("parsing other node")?);
                }
                b'F' | b'C' | b'P' => {
                    let (first, rest) = split_strings(record_data)?;
                    ms.files.insert(
                        first,
                        FileInfo {
                            state: ConflictState::from_record(
                                rest.first().context("record state")?,
                            )?,
                            data: rest,
                        },
                    );
                }
                b'l' => {
                    let (first, rest) = split_strings(record_data)?;
                    ms.labels = std::iter::once(first)
                        .chain(rest)
                        .filter(|l| !l.is_empty())
                        .collect();
                }
                _ => {
                    let (first, rest) = split_strings(record_data).unwrap_or_default();
                    ms.unsupported_records.push((
                        escape_record_type(record_type),
                        std::iter::once(first).chain(rest).collect(),
                    ));
                }
            };
        }

        // Upper case record types are required. Lower case are optional.
        let mandatory: Vec<String> = ms
            .unsupported_records
            .iter()
            .filter(|(t, _)| t.len() != 1 || !t.as_bytes()[0].is_ascii_lowercase())
            .map(|(t, _)| t.clone())
            .collect();
        if !mandatory.is_empty() {
            return Err(UnsupportedMergeRecords(mandatory).into());
        }
        for (t, _) in &ms.unsupported_records {
            tracing::warn!(record_type = t.as_str(), "ignoring advisory merge record");
        }

        Ok(ms)
    }

    pub fn serialize(&self, w: &mut dyn Write) -> Result<()> {
        let w = &mut std::io::BufWriter::new(w);

        fn write_record(
            w: &mut dyn Write,
            record_type: u8,
            first: &str,
            rest: &[impl AsRef<str>],
        ) -> Result<()> {
            w.write_u8(record_type)?;
            w.write_u32::<BigEndian>(
                (first.len() + rest.iter().fold(0, |a, v| a + v.as_ref().len()) + rest.len())
                    as u32,
            )?;

            w.write_all(first.as_bytes())?;

            for data in rest.iter() {
                w.write_u8(0)?;
                w.write_all(data.as_ref().as_bytes())?;
            }

            Ok(())
        }

        if let Some(local) = &self.local {
            write_record(w, b'L', &local.to_hex(), &Vec::<&str>::new())?;
        }

        if let Some(other) = &self.other {
            write_record(w, b'O', &other.to_hex(), &Vec::<&str>::new())?;
        }

        let mut paths: Vec<&String> = self.files.keys().collect();
        paths.sort();
        for path in paths {
            let info = &self.files[path];
            write_record(w, info.record_type(), path, &info.data)?;
        }

        if !self.labels.is_empty() {
            write_record(w, b'l', &self.labels[0], &self.labels[1..])?;
        }

        // Flush explicitly to propagate errors.
        w.flush()?;

        Ok(())
    }
}

impl std::fmt::Debug for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(local) = &self.local {
            writeln!(f, "local: {local}")?;
        }
        if let Some(other) = &self.other {
            writeln!(f, "other: {other}")?;
        }
        if !self.labels.is_empty() {
            writeln!(f, "labels:")?;
            for (t, n) in ["local", "other", "base"].iter().zip(&self.labels) {
                writeln!(f, "  {t}: {n}")?;
            }
        }
        let mut paths: Vec<&String> = self.files.keys().collect();
        paths.sort();
        for path in paths {
            let info = &self.files[path];
            writeln!(
                f,
                r#"file: {} (state "{}", data {:?})"#,
                path, info.data[0], info.data,
            )?;
        }
        for (t, d) in &self.unsupported_records {
            writeln!(f, r#"unsupported record "{}" (data {:?})"#, t, d)?;
        }
        Ok(())
    }
}

fn parse_node(hex: &[u8]) -> Result<Node> {
    let hex = std::str::from_utf8(hex)?;
    Ok(hex.parse()?)
}

fn escape_record_type(record_type: u8) -> String {
    if record_type.is_ascii_graphic() {
        (record_type as char).to_string()
    } else {
        format!("\\x{:02x}", record_type)
    }
}

#[derive(Debug)]
pub struct FileInfo {
    state: ConflictState,
    // Opaque tuple of conflict data; the first field is the state code.
    data: Vec<String>,
}

impl FileInfo {
    pub fn data(&self) -> &[String] {
        &self.data
    }

    pub fn state(&self) -> ConflictState {
        self.state
    }

    pub fn record_type(&self) -> u8 {
        match self.state {
            ConflictState::Unresolved | ConflictState::Resolved => b'F',
            ConflictState::UnresolvedPath | ConflictState::ResolvedPath => b'P',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ConflictState {
    Unresolved,
    Resolved,
    UnresolvedPath,
    ResolvedPath,
}

impl ConflictState {
    fn from_record(name: &str) -> Result<Self> {
        Ok(match name {
            "u" => Self::Unresolved,
            "r" => Self::Resolved,
            "pu" => Self::UnresolvedPath,
            "pr" => Self::ResolvedPath,
            _ => bail!("unknown merge record state '{}'", name),
        })
    }

    fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved | Self::UnresolvedPath)
    }
}
