use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::session::{DEFAULT_KEY_PREFIX, MemoryStorage, RedisStorage, SqliteStorage, Storage};

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Which storage engine backs the service, and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// In-process store; snapshotted to `path` when set
    Embedded {
        #[serde(default)]
        path: Option<PathBuf>,
    },

    /// Redis reachable at `url`
    RemoteCache {
        #[serde(default)]
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },

    /// SQLite database file at `path`
    Relational { path: PathBuf },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Embedded { path: None }
    }
}

impl BackendConfig {
    /// Short name matching the `kind` key
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embedded { .. } => "embedded",
            Self::RemoteCache { .. } => "remote-cache",
            Self::Relational { .. } => "relational",
        }
    }

    /// Construct the storage adapter this configuration describes.
    pub async fn connect(&self) -> Result<Arc<dyn Storage>> {
        debug!(kind = self.kind(), "connecting session storage");

        let storage: Arc<dyn Storage> = match self {
            Self::Embedded { path: None } => Arc::new(MemoryStorage::new()),
            Self::Embedded { path: Some(path) } => Arc::new(MemoryStorage::open(path)?),
            Self::RemoteCache { url, key_prefix } => {
                Arc::new(RedisStorage::connect(url, key_prefix.clone()).await?)
            }
            Self::Relational { path } => Arc::new(SqliteStorage::new(path)?),
        };

        Ok(storage)
    }
}
