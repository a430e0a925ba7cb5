//! # ddfs-config
//!
//! Configuration management for the ddfs deduplication engine.
//!
//! Loads configuration from:
//! 1. `~/.ddfs/config.toml` (global)
//! 2. `.ddfs/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! The resulting [`DedupConfig`] is an immutable value: callers load it once
//! and hand it (or one of its sections) to each component at construction.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Maximum number of write threads picked automatically
pub const MAX_DEFAULT_WRITE_THREADS: usize = 4;

/// Number of replica slots in a location vector (slot 0 is the version tag)
pub const REPLICA_SLOTS: usize = 7;

/// Version tag that marks a location vector as "not found"; no node may use it
pub const RESERVED_MEMBER_ID: u8 = 0xFF;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub volume: VolumeConfig,
    pub write_pool: WritePoolConfig,
    pub shard_read: ShardReadConfig,
    pub audit: AuditConfig,
}

impl DedupConfig {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        // 1. Global config (~/.ddfs/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                table = read_table(&global_path)?;
            }
        }

        // 2. Project config (.ddfs/config.toml), merged key by key
        let project_path = Path::new(".ddfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            merge_tables(&mut table, read_table(project_path)?);
        }

        let mut config: DedupConfig = toml::Value::Table(table).try_into()?;

        // 3. Environment overrides
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a single explicit config file, still honouring env overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: DedupConfig = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.ddfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ddfs/config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DDFS_DEDUP_DB_STORE") {
            self.volume.dedup_db_store = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("DDFS_CHUNK_STORE") {
            self.volume.chunk_store = PathBuf::from(path);
        }
        if let Ok(len) = std::env::var("DDFS_CHUNK_LENGTH") {
            if let Ok(n) = len.parse() {
                self.volume.chunk_length = n;
            }
        }
        if let Ok(threads) = std::env::var("DDFS_WRITE_THREADS") {
            if let Ok(n) = threads.parse::<usize>() {
                self.write_pool.threads = n;
                self.write_pool.max_threads = self.write_pool.max_threads.max(n);
            }
        }
        if let Ok(copies) = std::env::var("DDFS_CLUSTER_COPIES") {
            if let Ok(n) = copies.parse() {
                self.volume.cluster_copies = n;
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.volume.chunk_length == 0 {
            return invalid("volume.chunk_length must be non-zero");
        }
        if self.volume.hash_cluster_size == 0 {
            return invalid("volume.hash_cluster_size must be at least 1");
        }
        if self.volume.storage_nodes == 0 {
            return invalid("volume.storage_nodes must be at least 1");
        }
        if self.volume.cluster_member_id == RESERVED_MEMBER_ID {
            return invalid("volume.cluster_member_id 255 is reserved for missing chunks");
        }
        if self.volume.cluster_copies as usize > REPLICA_SLOTS {
            return invalid("volume.cluster_copies cannot exceed 7 replica slots");
        }
        if self.write_pool.threads == 0 {
            return invalid("write_pool.threads must be non-zero");
        }
        if self.write_pool.max_threads < self.write_pool.threads {
            return invalid("write_pool.max_threads must be >= write_pool.threads");
        }
        if self.write_pool.queue_capacity == 0 {
            return invalid("write_pool.queue_capacity must be non-zero");
        }
        if self.shard_read.wait_rounds == 0 {
            return invalid("shard_read.wait_rounds must be non-zero");
        }
        if self.audit.batch_size == 0 {
            return invalid("audit.batch_size must be non-zero");
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Self::default().to_toml()
    }

    /// Render this config as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

/// Overlay `other` onto `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Volume layout and replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Root directory holding one block map per file
    pub dedup_db_store: PathBuf,
    /// Root directory of the chunk store
    pub chunk_store: PathBuf,
    /// Directory for safe-sync buffer journals
    pub journal_dir: PathBuf,
    /// Fixed chunk length in bytes
    pub chunk_length: usize,
    /// Maximum number of hash-addressed shards one chunk may be split into
    pub hash_cluster_size: usize,
    /// Target replica count for clustered chunk stores
    pub cluster_copies: u8,
    /// Version / cluster-member tag written into location byte 0
    pub cluster_member_id: u8,
    /// Node count of the bundled cluster store
    pub storage_nodes: usize,
    /// Mirror every write buffer into an on-disk journal
    pub safe_sync: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            dedup_db_store: PathBuf::from("/var/lib/ddfs/ddb"),
            chunk_store: PathBuf::from("/var/lib/ddfs/chunkstore"),
            journal_dir: PathBuf::from("/var/lib/ddfs/journal"),
            chunk_length: 16 * 1024,
            hash_cluster_size: 1,
            cluster_copies: 2,
            cluster_member_id: 0,
            storage_nodes: 1,
            safe_sync: false,
        }
    }
}

/// Shared worker pool sizing (flush jobs and shard reads)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePoolConfig {
    /// Core worker threads
    pub threads: usize,
    /// Burst ceiling; extra workers retire after `idle_timeout_secs`
    pub max_threads: usize,
    /// Pending task slots before submitters block
    pub queue_capacity: usize,
    pub idle_timeout_secs: u64,
}

impl WritePoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Default write thread count: min(cpu_cores / 2, MAX_DEFAULT_WRITE_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_DEFAULT_WRITE_THREADS)
}

impl Default for WritePoolConfig {
    fn default() -> Self {
        let threads = default_thread_count();
        Self {
            threads,
            max_threads: threads * 2,
            queue_capacity: 2,
            idle_timeout_secs: 10,
        }
    }
}

/// Bounded wait for multi-shard reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardReadConfig {
    pub wait_rounds: u32,
    pub wait_timeout_ms: u64,
}

impl ShardReadConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Upper bound on how long a shard read may take in total
    pub fn total_bound(&self) -> Duration {
        self.wait_timeout() * self.wait_rounds
    }
}

impl Default for ShardReadConfig {
    fn default() -> Self {
        Self {
            wait_rounds: 6,
            wait_timeout_ms: 10_000,
        }
    }
}

/// How a repaired location vector is compared with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationEquality {
    /// Same byte values regardless of slot (legacy comparison)
    #[default]
    Multiset,
    /// Slot-by-slot comparison
    Positional,
}

/// Block-map auditor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Local-data descriptors per batched existence call
    pub batch_size: usize,
    pub location_equality: LocationEquality,
    /// File extension identifying block maps
    pub map_extension: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            location_equality: LocationEquality::Multiset,
            map_extension: "map".to_string(),
        }
    }
}
