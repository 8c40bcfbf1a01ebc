use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{BackendConfig, ServiceConfig};
use crate::error::Result;
use crate::service::SessionService;
use crate::session::Storage;

/// Builder for constructing a [`SessionService`] instance.
///
/// # Example
///
/// ```no_run
/// # use session_keeper::{BackendConfig, SessionService};
/// # async fn example() -> Result<(), session_keeper::SessionError> {
/// let service = SessionService::builder()
///     .backend(BackendConfig::Relational { path: "sessions.db".into() })
///     .timezone("+05:30")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionServiceBuilder {
    config: ServiceConfig,
    storage: Option<Arc<dyn Storage>>,
}

impl SessionServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
            storage: None,
        }
    }

    /// Start from an already loaded configuration.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply settings from a configuration file.
    ///
    /// With `None`, the default location is used if it exists. Settings
    /// applied here can still be overridden by subsequent builder calls.
    pub fn from_config(mut self, path: Option<&Path>) -> Result<Self> {
        self.config = ServiceConfig::load(path)?;
        debug!(backend = self.config.backend.kind(), "loaded service configuration");
        Ok(self)
    }

    /// Lifetime of sessions created without an override (0 means 86400).
    pub fn default_expiry_seconds(mut self, seconds: u64) -> Self {
        self.config.default_expiry_seconds = seconds;
        self
    }

    /// Display zone for expiry times: an IANA name, `UTC`, or a fixed offset like `-03:00`.
    pub fn timezone(mut self, name: impl Into<String>) -> Self {
        self.config.timezone = name.into();
        self
    }

    /// Choose the backend to connect at build time.
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.config.backend = backend;
        self.storage = None;
        self
    }

    /// Use an already constructed storage backend (overrides `backend`).
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Use a storage backend shared with other owners.
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the [`SessionService`].
    ///
    /// Connects the backend, then runs recovery. Fails if the backend cannot
    /// be reached or its sessions cannot be enumerated.
    pub async fn build(self) -> Result<SessionService> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => self.config.backend.connect().await?,
        };

        let display_zone = self.config.display_zone();
        let default_expiry_seconds = self.config.effective_expiry_seconds();

        let service = SessionService::from_parts(storage, default_expiry_seconds, display_zone);
        let report = service.recover().await?;

        info!(
            mode = %service.expiry_mode(),
            default_expiry_seconds,
            zone = %service.display_zone(),
            recovered = report.scheduled,
            "session service ready"
        );

        Ok(service)
    }
}

impl Default for SessionServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
