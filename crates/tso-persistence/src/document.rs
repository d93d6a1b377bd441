//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "File-backed document store for run configurations and algorithm versions."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use tso_common::run::{ParamMap, RunConfig, RunStatus};

use crate::{PersistenceError, Result};

/// Current document envelope version.
pub const DOCUMENT_VERSION: u16 = 1;

const RUN_CONFIGS: &str = "simulation_configs";
const ALGORITHM_VERSIONS: &str = "algorithm_versions";
const MAX_KEY_LEN: usize = 128;

/// Configuration a run was launched with, mirrored with its latest status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigDocument {
    /// Canonical run identifier.
    pub run_id: String,
    /// When the run was requested.
    pub created_at: DateTime<Utc>,
    /// Last time the document changed.
    pub updated_at: DateTime<Utc>,
    /// Latest known run status.
    pub status: RunStatus,
    /// Requested run duration.
    pub duration_seconds: u64,
    /// Algorithm name.
    pub algorithm: String,
    /// Algorithm version.
    pub algorithm_version: String,
    /// Effective algorithm parameters.
    #[serde(default)]
    pub algo_config: ParamMap,
    /// Effective simulator parameters.
    #[serde(default)]
    pub simulator_config: ParamMap,
    /// Free-form request metadata.
    #[serde(default)]
    pub metadata: ParamMap,
}

impl RunConfigDocument {
    /// Build a `pending` document from an effective run configuration.
    pub fn new(run_id: impl Into<String>, config: &RunConfig, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: now,
            updated_at: now,
            status: RunStatus::Pending,
            duration_seconds: config.duration_seconds,
            algorithm: config.algorithm.clone(),
            algorithm_version: config.algorithm_version.clone(),
            algo_config: config.algo_params.clone(),
            simulator_config: config.simulator_params.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

/// Metadata and default parameters for a published algorithm version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmVersionDocument {
    /// Version identifier, e.g. `v1.0.0`.
    pub version: String,
    /// When the version was registered.
    pub created_at: DateTime<Utc>,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Parameters applied under a run request's explicit parameters.
    #[serde(default)]
    pub default_config: ParamMap,
    /// Optional JSON schema describing accepted parameters.
    #[serde(default)]
    pub config_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentEnvelope<T> {
    version: u16,
    written_at: DateTime<Utc>,
    hash: String,
    document: T,
}

/// Directory-backed document store; one hashed JSON envelope per document.
#[derive(Debug)]
pub struct DocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store rooted at `root`, creating its collections if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RUN_CONFIGS))?;
        fs::create_dir_all(root.join(ALGORITHM_VERSIONS))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reachability probe: both collections must be present directories.
    pub fn ping(&self) -> Result<()> {
        for collection in [RUN_CONFIGS, ALGORITHM_VERSIONS] {
            let metadata = fs::metadata(self.root.join(collection))?;
            if !metadata.is_dir() {
                return Err(PersistenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{collection} is not a directory"),
                )));
            }
        }
        Ok(())
    }

    /// Save (or replace) a run configuration document.
    pub fn save_run_config(&self, document: &RunConfigDocument) -> Result<()> {
        let path = self.path_for(RUN_CONFIGS, &document.run_id)?;
        let _guard = self.write_lock.lock();
        write_document(&path, document)
    }

    /// Mirror a run status change. Returns `false` when no document exists.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let path = self.path_for(RUN_CONFIGS, run_id)?;
        let _guard = self.write_lock.lock();
        if !path.exists() {
            return Ok(false);
        }
        let mut document: RunConfigDocument = read_document(&path)?;
        document.status = status;
        document.updated_at = now;
        write_document(&path, &document)?;
        Ok(true)
    }

    /// Fetch a run configuration document.
    pub fn get_run_config(&self, run_id: &str) -> Result<Option<RunConfigDocument>> {
        let path = self.path_for(RUN_CONFIGS, run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_document(&path).map(Some)
    }

    /// Run configuration documents, newest first, optionally filtered.
    pub fn list_run_configs(
        &self,
        status: Option<RunStatus>,
        algorithm_version: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RunConfigDocument>> {
        let mut documents: Vec<RunConfigDocument> = self
            .load_collection(RUN_CONFIGS)?
            .into_iter()
            .filter(|doc: &RunConfigDocument| status.map_or(true, |s| doc.status == s))
            .filter(|doc| algorithm_version.map_or(true, |v| doc.algorithm_version == v))
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents.into_iter().skip(offset).take(limit).collect())
    }

    /// Register (or replace) an algorithm version.
    pub fn put_algorithm_version(&self, document: &AlgorithmVersionDocument) -> Result<()> {
        let path = self.path_for(ALGORITHM_VERSIONS, &document.version)?;
        let _guard = self.write_lock.lock();
        write_document(&path, document)
    }

    /// Fetch an algorithm version by identifier.
    pub fn get_algorithm_version(&self, version: &str) -> Result<Option<AlgorithmVersionDocument>> {
        let path = self.path_for(ALGORITHM_VERSIONS, version)?;
        if !path.exists() {
            return Ok(None);
        }
        read_document(&path).map(Some)
    }

    /// All algorithm versions, newest first.
    pub fn list_algorithm_versions(&self) -> Result<Vec<AlgorithmVersionDocument>> {
        let mut documents: Vec<AlgorithmVersionDocument> =
            self.load_collection(ALGORITHM_VERSIONS)?;
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents)
    }

    fn path_for(&self, collection: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(collection).join(format!("{key}.json")))
    }

    fn load_collection<T>(&self, collection: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Serialize,
    {
        let mut documents = Vec::new();
        for entry in fs::read_dir(self.root.join(collection))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_document(&path) {
                Ok(document) => documents.push(document),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable document");
                }
            }
        }
        Ok(documents)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidKey(key.to_owned()))
    }
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let envelope = DocumentEnvelope {
        version: DOCUMENT_VERSION,
        written_at: Utc::now(),
        hash: compute_hash(document)?,
        document,
    };

    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let json = serde_json::to_vec_pretty(&envelope)?;
        writer.write_all(&json)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "document written");
    Ok(())
}

fn read_document<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Serialize,
{
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope: DocumentEnvelope<T> = serde_json::from_slice(&bytes)?;
    if envelope.hash != compute_hash(&envelope.document)? {
        return Err(PersistenceError::HashMismatch(path.display().to_string()));
    }
    Ok(envelope.document)
}

fn compute_hash<T: Serialize>(document: &T) -> Result<String> {
    let serialized = serde_json::to_vec(document)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
