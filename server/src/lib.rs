pub mod chains;
pub mod config;
pub mod queue;
pub mod router;

pub use chains::ConfiguredChainService;
pub use config::{EngineConfig, QueueConfig, RedisConfig, ServerConfig};
pub use queue::manager::QueueManager;
pub use router::{RelayError, RelayRouter};
