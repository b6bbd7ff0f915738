// Reaper Configuration
//
// Immutable settings for one node sweep, layered from built-in defaults,
// an optional TOML file and `REAPER__` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "reaper.toml";
pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROCESS_PREFIX: &str = "laser_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("config file {} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error("`{0}` is required")]
    Missing(&'static str),

    #[error("`{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Where and how to reach the metadata service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for one partition-list query.
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Guard against retiring partitions a storage process still holds open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub enabled: bool,
    /// Only processes whose name starts with this prefix count as holders.
    /// `None` considers every process.
    pub process_prefix: Option<String>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            process_prefix: Some(DEFAULT_PROCESS_PREFIX.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Node data root, `<node_dir>/<database>/<table>/<partition>`.
    pub node_dir: PathBuf,
    /// Quarantine root, mirrored as `<dest_dir>/<database>/<table>/<partition>`.
    pub dest_dir: PathBuf,
    /// Move orphans into `dest_dir` instead of deleting them.
    pub quarantine: bool,
    /// Report what would be retired without touching the disk.
    pub dry_run: bool,
    /// Tables processed concurrently.
    pub workers: usize,
    pub metadata: MetadataConfig,
    pub liveness: LivenessConfig,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            node_dir: PathBuf::new(),
            dest_dir: PathBuf::new(),
            quarantine: true,
            dry_run: false,
            workers: DEFAULT_WORKERS,
            metadata: MetadataConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

impl ReaperConfig {
    /// Layered configuration sources, lowest precedence first.
    pub fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(ReaperConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("REAPER__").split("__"))
    }

    /// Load configuration from `file`, or from `reaper.toml` when present.
    ///
    /// An explicitly named file must exist.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match file {
            Some(path) if !path.is_file() => return Err(ConfigError::MissingFile(path.to_path_buf())),
            Some(path) => path,
            None => Path::new(DEFAULT_CONFIG_FILE),
        };
        let config = Self::figment(file).extract().map_err(Box::new)?;
        Ok(config)
    }

    /// Reject settings a sweep cannot safely run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata.host.trim().is_empty() {
            return Err(ConfigError::Missing("metadata.host"));
        }
        if self.metadata.port == 0 {
            return Err(ConfigError::Missing("metadata.port"));
        }
        if self.metadata.query_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "metadata.query_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "at least one worker is required".into(),
            });
        }
        if self.node_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("node_dir"));
        }
        if self.dest_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("dest_dir"));
        }

        // A quarantine root inside the data root would be scanned as a database,
        // and one above it could place quarantined tables back under the data root.
        let node_dir = normalized(&self.node_dir);
        let dest_dir = normalized(&self.dest_dir);
        if dest_dir.starts_with(&node_dir) {
            return Err(ConfigError::Invalid {
                field: "dest_dir",
                reason: format!(
                    "{} must not be inside node_dir {}",
                    self.dest_dir.display(),
                    self.node_dir.display()
                ),
            });
        }
        if node_dir.starts_with(&dest_dir) {
            return Err(ConfigError::Invalid {
                field: "dest_dir",
                reason: format!(
                    "{} must not contain node_dir {}",
                    self.dest_dir.display(),
                    self.node_dir.display()
                ),
            });
        }
        Ok(())
    }
}

fn normalized(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
