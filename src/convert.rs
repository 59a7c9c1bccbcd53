use crate::config::{ConvertConfig, Metadata, PEER_GROUPS_KEY, PeerGroupDocument};
use crate::normalizer::{key_text, normalize};
use crate::output;
use crate::parsers::{self, PickleError, PyValue};
use memmap2::Mmap;
use serde_json::{Map, Value};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("File '{}' not found!", .0.display())]
    MissingSource(PathBuf),

    #[error("Failed to load pickle file '{}': {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    #[error("Failed to save JSON file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pickle(#[from] PickleError),

    #[error("top-level object is a {0}, expected a dict")]
    NotAMapping(&'static str),

    #[error("'peer_groups' is a {0}, expected a dict")]
    PeerGroupsNotAMapping(&'static str),

    #[error("peer group '{group}' holds a {kind}, which has no length")]
    Unsized { group: String, kind: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    /// `str()` of the group key, as printed in the summary.
    pub name: String,
    /// The group key as it appears in `metadata.peer_group_names`.
    pub key: Value,
    pub candidates: usize,
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub input_bytes: u64,
    pub load: Duration,
    pub normalize: Duration,
    pub write: Duration,
}

#[derive(Debug, Clone)]
pub struct ConversionReport {
    /// Groups in table order.
    pub groups: Vec<GroupSummary>,
    pub total_candidates: usize,
    pub timings: Timings,
}

impl ConversionReport {
    pub fn total_peer_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn peer_group_names(&self) -> Vec<Value> {
        self.groups.iter().map(|g| g.key.clone()).collect()
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            total_peer_groups: self.total_peer_groups(),
            total_candidates: self.total_candidates,
            peer_group_names: self.peer_group_names(),
        }
    }
}

/// Reads the pickled scorer state, extracts its peer group table and writes
/// it as JSON. Progress goes to stdout as each step completes.
pub fn convert(config: &ConvertConfig) -> Result<ConversionReport, ConvertError> {
    let source = config.source.as_path();
    let destination = config.destination.as_path();
    let load_error = |err: LoadError| ConvertError::Load {
        path: source.to_path_buf(),
        source: err,
    };

    if !source.exists() {
        return Err(ConvertError::MissingSource(source.to_path_buf()));
    }

    println!("📂 Loading {}...", source.display());
    let started = Instant::now();
    let (data, input_bytes) = load(source).map_err(load_error)?;
    let table = peer_group_table(data).map_err(load_error)?;
    let load_time = started.elapsed();

    if table.is_empty() {
        println!("⚠ WARNING: No peer groups found in the pickle file");
        println!("The retention scorer will work without peer comparison");
    }
    println!("✓ Found {} peer groups", table.len());

    let groups = summarize(&table).map_err(load_error)?;
    let total_candidates: usize = groups.iter().map(|g| g.candidates).sum();
    println!("✓ Total candidates across all peer groups: {total_candidates}");

    println!("🔄 Converting to JSON format...");
    let started = Instant::now();
    let peer_groups: Map<String, Value> = table
        .iter()
        .map(|(key, candidates)| (key_text(key), normalize(candidates)))
        .collect();
    let normalize_time = started.elapsed();

    let mut report = ConversionReport {
        groups,
        total_candidates,
        timings: Timings {
            input_bytes,
            load: load_time,
            normalize: normalize_time,
            write: Duration::ZERO,
        },
    };
    let document = PeerGroupDocument {
        peer_groups,
        metadata: report.metadata(),
    };

    println!("💾 Saving to {}...", destination.display());
    let started = Instant::now();
    output::write_document(destination, &document).map_err(|err| ConvertError::Write {
        path: destination.to_path_buf(),
        source: err,
    })?;
    report.timings.write = started.elapsed();
    println!("✅ Successfully converted to {}", destination.display());

    tracing::debug!(
        groups = report.total_peer_groups(),
        candidates = report.total_candidates,
        "conversion finished"
    );
    Ok(report)
}

fn load(path: &Path) -> Result<(PyValue, u64), LoadError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    // mmap the file; the mapping is dropped before we return
    let mmap = unsafe { Mmap::map(&file)? };
    tracing::debug!(path = %path.display(), bytes = len, "mapped source file");

    let value = parsers::parse(&mmap)?;
    Ok((value, len))
}

/// The `peer_groups` entry of the top-level dict as (group key, candidates)
/// pairs. Missing, `None` and empty entries yield an empty table.
fn peer_group_table(data: PyValue) -> Result<Vec<(PyValue, PyValue)>, LoadError> {
    let pairs = match data {
        PyValue::Dict(pairs) => pairs,
        other => return Err(LoadError::NotAMapping(other.type_name())),
    };

    // a repeated key keeps its last value, as in a Python dict
    let groups = pairs.into_iter().rev().find_map(|(key, value)| {
        matches!(&key, PyValue::Str(k) if k == PEER_GROUPS_KEY).then_some(value)
    });

    match groups {
        Some(value) if value.is_truthy() => match value {
            PyValue::Dict(groups) => Ok(groups),
            other => Err(LoadError::PeerGroupsNotAMapping(other.type_name())),
        },
        _ => {
            tracing::debug!("no '{PEER_GROUPS_KEY}' entries in source, writing an empty table");
            Ok(Vec::new())
        }
    }
}

fn summarize(table: &[(PyValue, PyValue)]) -> Result<Vec<GroupSummary>, LoadError> {
    table
        .iter()
        .map(|(key, candidates)| {
            let name = key.render().unwrap_or_else(|| key_text(key));
            let count = candidates.len().ok_or_else(|| LoadError::Unsized {
                group: name.clone(),
                kind: candidates.type_name(),
            })?;
            Ok(GroupSummary {
                name,
                key: group_key(key),
                candidates: count,
            })
        })
        .collect()
}

/// A group key as `json.dumps` writes it inside a list.
fn group_key(key: &PyValue) -> Value {
    match key {
        PyValue::Tuple(items) => Value::Array(items.iter().map(group_key).collect()),
        other => normalize(other),
    }
}
