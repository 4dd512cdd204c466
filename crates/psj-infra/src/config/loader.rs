//! # Configuration Loader / 配置加载器
//!
//! ## Layers / 配置层级
//!
//! 1. Built-in defaults from [`HarnessConfig::default`] / 内置默认值
//! 2. Optional TOML file / 可选的 TOML 文件
//! 3. `PSJ__`-prefixed environment variables, `__` between levels,
//!    e.g. `PSJ__WAITS__RELEASE_BOUND_MS=120000` / 环境变量覆盖
//!
//! Later layers win. No validation happens here.
//! 后面的层级优先。此处不做校验。

use std::path::Path;

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use psj_core::HarnessConfig;

pub const ENV_PREFIX: &str = "PSJ";

/// Load [`HarnessConfig`] from defaults, `path` (if given) and the environment.
/// 从默认值、配置文件（如有）和环境变量加载配置。
///
/// # Errors / 错误
///
/// Fails if the file is missing or not valid TOML, or if a layer has a value
/// of the wrong type.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HarnessConfig> {
    load_with_env(
        path,
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    )
}

fn load_with_env(path: Option<&Path>, env: Environment) -> anyhow::Result<HarnessConfig> {
    let defaults = Config::try_from(&HarnessConfig::default())
        .context("Failed to serialize default configuration")?;

    let mut builder = Config::builder().add_source(defaults);
    if let Some(path) = path {
        let path_str = path
            .to_str()
            .with_context(|| format!("Config path is not valid UTF-8: {}", path.display()))?;
        builder = builder.add_source(File::new(path_str, FileFormat::Toml).required(true));
    }

    let config = builder
        .add_source(env)
        .build()
        .with_context(|| match path {
            Some(path) => format!("Failed to load config file: {}", path.display()),
            None => "Failed to load configuration".to_string(),
        })?;

    let harness: HarnessConfig = config
        .try_deserialize()
        .context("Failed to map configuration onto HarnessConfig")?;
    tracing::debug!(?harness, "configuration loaded");
    Ok(harness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_with_env(None, no_env()).unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_file_overrides_defaults_partially() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [waits]
            release_bound_ms = 1500

            [homeserver]
            resync_event_fetch_limit = 3
            "#
        )
        .unwrap();

        let config = load_with_env(Some(file.path()), no_env()).unwrap();

        assert_eq!(config.waits.release_bound_ms, 1500);
        assert_eq!(config.waits.await_request_ms, 5000);
        assert_eq!(config.homeserver.resync_event_fetch_limit, 3);
        assert_eq!(config.homeserver.default_room_version, "10");
    }

    #[test]
    fn test_environment_wins_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[waits]\nprobe_bound_ms = 2000").unwrap();

        let env = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(HashMap::from([(
                "PSJ__WAITS__PROBE_BOUND_MS".to_string(),
                "3000".to_string(),
            )])));

        let config = load_with_env(Some(file.path()), env).unwrap();
        assert_eq!(config.waits.probe_bound_ms, 3000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = load_with_env(Some(&missing), no_env()).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
