mod expiry;
mod memory;
mod record;
mod redis_cache;
mod sqlite;
mod storage;
mod token;

pub use expiry::{ExpiryCoordinator, RecoveryAction};
pub use memory::MemoryStorage;
pub use record::SessionRecord;
pub use redis_cache::{DEFAULT_KEY_PREFIX, DEFAULT_REDIS_URL, RedisStorage};
pub use sqlite::SqliteStorage;
pub use storage::{ExpiryMode, RecordStream, Storage};
pub use token::{TOKEN_LEN, TokenMinter};
