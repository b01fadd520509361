//! Partition table decoding through an external tool.
//!
//! The binary partition table is not parsed here. Instead the tool that
//! generated it (`gen_esp32part.py`) is asked to convert it back to CSV,
//! and the CSV rows are collected into a [`PartitionTable`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::flash_args::FlashSegment;
use super::parse_int;

/// Tool location relative to the IDF root.
pub const DEFAULT_TOOL_SUBPATH: [&str; 3] = ["components", "partition_table", "gen_esp32part.py"];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("No partition table found under {}\n{details}", binary_dir.display())]
    NoPartitionTable { binary_dir: PathBuf, details: String },
}

/// One decoded partition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub type_: String,
    pub subtype: String,
    pub offset: u64,
    pub size: u64,
    pub flags: String,
}

/// Partitions keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    entries: BTreeMap<String, PartitionEntry>,
}

impl PartitionTable {
    pub fn get(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.get(name)
    }

    /// Insert an entry, replacing any earlier entry with the same name.
    pub fn insert(&mut self, entry: PartitionEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.values()
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rows: Vec<&PartitionEntry> = self.iter().collect();
        rows.sort_by_key(|e| e.offset);
        for e in rows {
            writeln!(
                f,
                "{:<16} {:<6} {:<10} 0x{:08x} {:>10} {}",
                e.name, e.type_, e.subtype, e.offset, e.size, e.flags
            )?;
        }
        Ok(())
    }
}

/// Parse a size field: a number with an optional `K` or `M` suffix.
pub fn parse_size(field: &str) -> Option<u64> {
    if let Some(kb) = field.strip_suffix('K') {
        parse_int(kb)?.checked_mul(1024)
    } else if let Some(mb) = field.strip_suffix('M') {
        parse_int(mb)?.checked_mul(1024 * 1024)
    } else {
        parse_int(field)
    }
}

/// Collect the CSV rows printed by the decoder.
///
/// Comment lines, blank lines and rows that do not parse are skipped.
pub fn parse_partition_rows(text: &str) -> PartitionTable {
    let mut table = PartitionTable::default();
    for line in text.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [name, type_, subtype, offset, size, flags] = fields.as_slice() else {
            debug!(line, "Skipping non-partition line");
            continue;
        };
        let (Some(offset), Some(size)) = (parse_int(offset), parse_size(size)) else {
            debug!(line, "Skipping unparsable partition row");
            continue;
        };
        table.insert(PartitionEntry {
            name: name.to_string(),
            type_: type_.to_string(),
            subtype: subtype.to_string(),
            offset,
            size,
            flags: flags.to_string(),
        });
    }
    table
}

/// External partition table decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTool {
    path: PathBuf,
    interpreter: Option<String>,
}

impl PartitionTool {
    /// Resolve the tool: `override_path`, else the conventional location
    /// under `idf_path`. Returns `None` unless the file exists.
    pub fn locate(
        override_path: Option<&Path>,
        idf_path: Option<&Path>,
        python: &str,
    ) -> Option<Self> {
        let path = match override_path {
            Some(p) => p.to_path_buf(),
            None => DEFAULT_TOOL_SUBPATH
                .iter()
                .fold(idf_path.map(Path::to_path_buf).unwrap_or_default(), |p, c| {
                    p.join(c)
                }),
        };
        if !path.is_file() {
            debug!(path = %path.display(), "Partition tool not found");
            return None;
        }
        let path = path.canonicalize().unwrap_or(path);
        let interpreter = (path.extension().is_some_and(|e| e == "py")).then(|| python.to_string());
        Some(Self { path, interpreter })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self, file: &Path) -> Command {
        let mut cmd = match &self.interpreter {
            Some(python) => {
                let mut cmd = Command::new(python);
                cmd.arg(&self.path);
                cmd
            }
            None => Command::new(&self.path),
        };
        cmd.arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn command_line(&self, file: &Path) -> String {
        match &self.interpreter {
            Some(python) => format!("{} {} {}", python, self.path.display(), file.display()),
            None => format!("{} {}", self.path.display(), file.display()),
        }
    }

    /// Decode the first partition-table candidate among `segments`.
    ///
    /// Candidates are tried in segment order. A candidate whose run prints
    /// a Python traceback is assumed to be the wrong binary and the next one
    /// is tried. The invocation blocks with no timeout.
    #[instrument(skip(self, segments), fields(tool = %self.path.display()))]
    pub fn decode(
        &self,
        segments: &[FlashSegment],
        binary_dir: &Path,
    ) -> Result<PartitionTable, DecodeError> {
        let mut failures: Vec<(String, String)> = Vec::new();

        let candidates = segments.iter().filter(|s| {
            s.file_path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains("partition"))
        });

        for segment in candidates {
            let file = binary_dir.join(&segment.file_path);
            let command_line = self.command_line(&file);
            debug!(command = %command_line, "Running partition tool");

            let output = match self.command(&file).output() {
                Ok(output) => output,
                Err(e) => {
                    warn!(command = %command_line, error = %e, "Failed to run partition tool");
                    failures.push((command_line, e.to_string()));
                    continue;
                }
            };

            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Traceback") {
                warn!(file = %file.display(), "Partition tool raised, trying next candidate");
                failures.push((command_line, stderr.into_owned()));
                continue;
            }

            let table = parse_partition_rows(&String::from_utf8_lossy(&output.stdout));
            info!(file = %file.display(), partitions = table.len(), "Decoded partition table");
            return Ok(table);
        }

        let details = failures
            .iter()
            .map(|(cmd, err)| format!("{cmd}:\n{err}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(DecodeError::NoPartitionTable {
            binary_dir: binary_dir.to_path_buf(),
            details,
        })
    }
}
