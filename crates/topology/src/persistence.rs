//! State Persistence - Node states and trace history across restarts
//!
//! The state file is a single versioned JSON document. Writes go to a sibling
//! temp file that is renamed over the target, so a crash mid-write leaves the
//! previous document intact. An unreadable document is moved aside and the
//! engine starts cold.

use chrono::{DateTime, Utc};
use meshgate_core::{NodeId, PersistenceConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{TopologyError, TopologyResult};
use crate::node_state::NodeState;
use crate::traceroute::TracerouteResult;

/// Format version written by this build.
pub const STATE_VERSION: u32 = 1;

/// On-disk state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Document format version
    pub version: u32,
    /// When the document was written
    pub saved_at: DateTime<Utc>,
    /// Every known node
    pub nodes: HashMap<NodeId, NodeState>,
    /// Most recent trace results per node, oldest first
    #[serde(default)]
    pub history: HashMap<NodeId, Vec<TracerouteResult>>,
}

impl PersistedState {
    /// An empty document stamped `saved_at`.
    pub fn empty(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at,
            nodes: HashMap::new(),
            history: HashMap::new(),
        }
    }
}

/// Reads and writes the state file and holds trace history in memory.
#[derive(Debug)]
pub struct StatePersistence {
    path: PathBuf,
    history_per_node: usize,
    history: Mutex<HashMap<NodeId, VecDeque<TracerouteResult>>>,
    // Serialises writers of the shared temp file
    write_lock: Mutex<()>,
}

impl StatePersistence {
    /// Create a store for the configured state file.
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            path: config.path.clone(),
            history_per_node: config.history_per_node.max(1),
            history: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write the node states and current history.
    ///
    /// Concurrent callers are serialised; each save completes its
    /// write and rename before the next one starts.
    pub fn save(&self, nodes: &HashMap<NodeId, NodeState>) -> TopologyResult<()> {
        let _writer = self.write_lock.lock();
        let history = self
            .history
            .lock()
            .iter()
            .map(|(node_id, results)| (node_id.clone(), results.iter().cloned().collect()))
            .collect();
        let document = PersistedState {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            nodes: nodes.clone(),
            history,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = sibling(&self.path, ".tmp")?;
        let bytes = serde_json::to_vec_pretty(&document)?;
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;

        debug!(
            path = %self.path.display(),
            nodes = document.nodes.len(),
            "Topology state saved"
        );
        Ok(())
    }

    /// Read the state file, replacing in-memory history with its contents.
    ///
    /// Never fails: a missing file yields empty state, an unreadable one is
    /// backed up and also yields empty state.
    pub fn load(&self) -> PersistedState {
        let now = Utc::now();
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No topology state file, starting cold");
                return PersistedState::empty(now);
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Cannot read topology state file");
                return PersistedState::empty(now);
            }
        };

        let mut state = match parse(&bytes) {
            Ok(state) => state,
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Topology state file corrupted, starting cold"
                );
                self.back_up_corrupt(now);
                return PersistedState::empty(now);
            }
        };

        let cap = self.history_per_node;
        for results in state.history.values_mut() {
            if results.len() > cap {
                results.drain(..results.len() - cap);
            }
        }
        *self.history.lock() = state
            .history
            .iter()
            .map(|(node_id, results)| (node_id.clone(), results.iter().cloned().collect()))
            .collect();

        info!(
            path = %self.path.display(),
            nodes = state.nodes.len(),
            saved_at = %state.saved_at,
            "Topology state loaded"
        );
        state
    }

    fn back_up_corrupt(&self, now: DateTime<Utc>) {
        let suffix = format!(".corrupt-{}", now.format("%Y%m%dT%H%M%SZ"));
        let backup = match sibling(&self.path, &suffix) {
            Ok(backup) => backup,
            Err(e) => {
                warn!(error = %e, "Cannot name backup for corrupt state file");
                return;
            }
        };
        match fs::rename(&self.path, &backup) {
            Ok(()) => warn!(backup = %backup.display(), "Corrupt state file backed up"),
            Err(e) => warn!(error = %e, "Failed to back up corrupt state file"),
        }
    }

    /// Append a result to a node's history, dropping the oldest over capacity.
    pub fn record_history(&self, result: TracerouteResult) {
        let mut history = self.history.lock();
        let results = history.entry(result.node_id.clone()).or_default();
        results.push_back(result);
        while results.len() > self.history_per_node {
            results.pop_front();
        }
    }

    /// A node's retained results, newest last.
    pub fn history(&self, node_id: &str) -> Vec<TracerouteResult> {
        self.history
            .lock()
            .get(node_id)
            .map(|results| results.iter().cloned().collect())
            .unwrap_or_default()
    }

}

fn parse(bytes: &[u8]) -> TopologyResult<PersistedState> {
    #[derive(Deserialize)]
    struct Header {
        version: u32,
    }

    let header: Header = serde_json::from_slice(bytes)?;
    if header.version != STATE_VERSION {
        return Err(TopologyError::UnsupportedVersion {
            found: header.version,
            expected: STATE_VERSION,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

fn sibling(path: &Path, suffix: &str) -> TopologyResult<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| {
            TopologyError::Persistence(format!("state path {} has no file name", path.display()))
        })?
        .to_os_string();
    name.push(suffix);
    Ok(path.with_file_name(name))
}
