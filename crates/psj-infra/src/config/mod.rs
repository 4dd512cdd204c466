//! Configuration loading / 配置加载

mod loader;

pub use loader::{load_config, ENV_PREFIX};
