//! Configuration types and loading

mod loader;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, EngineConfig, FailoverConfig, HealthConfig, PoolConfig, RoutingConfig, MAX_POOL_SIZE,
};
