use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

pub const DEFAULT_SOURCE: &str = "retention_scorer_with_peers.pkl";
pub const DEFAULT_DESTINATION: &str = "peer_groups.json";

/// Where the retention service loads the table from at startup.
pub const SERVER_DATA_PATH: &str = "server/data/peer_groups.json";

pub const PEER_GROUPS_KEY: &str = "peer_groups";

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// The JSON file handed to the retention service.
#[derive(Debug, Serialize)]
pub struct PeerGroupDocument {
    pub peer_groups: Map<String, Value>,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub total_peer_groups: usize,
    pub total_candidates: usize,
    /// Group keys as JSON values, so a non-string key keeps its type.
    pub peer_group_names: Vec<Value>,
}
