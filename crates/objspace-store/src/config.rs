use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Smallest page size accepted. Smaller pages make the header and sector
/// overhead dominate the content.
pub const MIN_PAGE_SIZE: usize = 64;

/// How a clustered stream acquires sectors when it grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerPolicy {
    /// Grow one sector at a time, sharing the free pool with every stream.
    #[default]
    Shared,
    /// Reserve whole extents of `sectors` sectors per growth step.
    Extent { sectors: u32 },
}

impl ContainerPolicy {
    /// Round a sector requirement up to the policy's allocation unit.
    pub fn round_up(&self, sectors: usize) -> usize {
        match *self {
            Self::Shared => sectors,
            Self::Extent { sectors: extent } => {
                let extent = (extent as usize).max(1);
                sectors.div_ceil(extent) * extent
            }
        }
    }
}

/// Configuration for a storage file and everything layered on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the storage file.
    pub file_path: PathBuf,
    /// Directory for the commit journal and spilled pages. Defaults to the
    /// directory containing `file_path`.
    pub page_file_dir: Option<PathBuf>,
    /// Page size in bytes: unit of caching, Merkle leaves and transaction
    /// staging.
    pub page_size: usize,
    /// Memory budget in bytes for each page cache and the staged overlay.
    pub max_memory: usize,
    /// Payload bytes per sector.
    pub cluster_size: usize,
    /// Sector acquisition policy for clustered streams.
    pub container_policy: ContainerPolicy,
    /// Open without write access (shared lock, all mutations rejected).
    pub read_only: bool,
    /// Commit instead of rolling back when a standalone box or space is
    /// dropped with staged changes.
    pub commit_on_drop: bool,
    /// fsync data and header on every commit.
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("objspace.db"),
            page_file_dir: None,
            page_size: 4096,
            max_memory: 16 * 1024 * 1024,
            cluster_size: 256,
            container_policy: ContainerPolicy::Shared,
            read_only: false,
            commit_on_drop: false,
            sync_on_commit: true,
        }
    }
}

impl StorageConfig {
    /// Default configuration for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    pub fn with_page_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.page_file_dir = Some(dir.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }

    pub fn with_cluster_size(mut self, cluster_size: usize) -> Self {
        self.cluster_size = cluster_size;
        self
    }

    pub fn with_container_policy(mut self, policy: ContainerPolicy) -> Self {
        self.container_policy = policy;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_commit_on_drop(mut self, commit_on_drop: bool) -> Self {
        self.commit_on_drop = commit_on_drop;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Directory holding the journal and spill files.
    pub fn resolved_page_file_dir(&self) -> PathBuf {
        match &self.page_file_dir {
            Some(dir) => dir.clone(),
            None => match self.file_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }

    /// Path of the commit journal belonging to `file_path`.
    pub fn journal_path(&self) -> PathBuf {
        let name = self
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "objspace".to_string());
        self.resolved_page_file_dir()
            .join(format!("{name}.journal"))
    }

    /// Number of pages a cache may hold: the byte budget clipped to at
    /// least one page.
    pub fn page_budget(&self) -> usize {
        (self.max_memory / self.page_size.max(1)).max(1)
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> StoreResult<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "page_size {} is below the minimum of {MIN_PAGE_SIZE}",
                self.page_size
            )));
        }
        if u32::try_from(self.page_size).is_err() {
            return Err(StoreError::InvalidConfig(format!(
                "page_size {} does not fit in 32 bits",
                self.page_size
            )));
        }
        if self.cluster_size == 0 || u32::try_from(self.cluster_size).is_err() {
            return Err(StoreError::InvalidConfig(format!(
                "cluster_size {} must be between 1 and {}",
                self.cluster_size,
                u32::MAX
            )));
        }
        if let ContainerPolicy::Extent { sectors: 0 } = self.container_policy {
            return Err(StoreError::InvalidConfig(
                "extent policy needs at least one sector per extent".into(),
            ));
        }
        if self.file_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("file_path is empty".into()));
        }
        Ok(())
    }
}
