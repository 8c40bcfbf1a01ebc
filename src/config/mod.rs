mod backend;
mod service;

pub use backend::BackendConfig;
pub use service::{DEFAULT_EXPIRY_SECONDS, DisplayZone, ServiceConfig, parse_timezone};
