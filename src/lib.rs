pub mod builder;
pub mod config;
pub mod error;
pub mod service;
pub mod session;

pub use builder::SessionServiceBuilder;
pub use config::{
    BackendConfig, DEFAULT_EXPIRY_SECONDS, DisplayZone, ServiceConfig, parse_timezone,
};
pub use error::{Result, SessionError, token_preview};
pub use service::{RecoveryReport, SessionService};
pub use session::{
    ExpiryCoordinator, ExpiryMode, MemoryStorage, RecordStream, RecoveryAction, RedisStorage,
    SessionRecord, SqliteStorage, Storage, TOKEN_LEN, TokenMinter,
};
