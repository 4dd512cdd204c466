//! # Tracing Configuration / 追踪配置
//!
//! Installs the global `tracing` subscriber for `psj-runner`.
//!
//! ## Architecture / 架构
//!
//! ```text
//! RUST_LOG (optional) ──┐
//!                       ├──► EnvFilter ──► fmt layer ──► stderr
//! default directives ───┘
//! ```
//!
//! Logs go to stderr so the pass/fail summary on stdout stays readable.
//! 日志输出到 stderr，stdout 只保留场景结果。

use std::io;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter,
};

const DEFAULT_DIRECTIVES: [&str; 4] = ["info", "psj_app=debug", "psj_infra=debug", "hyper=warn"];

/// Build filter directives, raising the harness crates to `trace` when
/// `verbose` is set.
pub fn build_filter_directives(verbose: bool) -> Vec<String> {
    DEFAULT_DIRECTIVES
        .iter()
        .map(|directive| match directive.split_once('=') {
            Some((target, "debug")) if verbose && target.starts_with("psj_") => {
                format!("{target}=trace")
            }
            _ => directive.to_string(),
        })
        .collect()
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the built-in directives when it is set.
///
/// # Errors
///
/// Fails if a global subscriber is already registered.
pub fn init_tracing_subscriber(verbose: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(build_filter_directives(verbose).join(",")));

    let stderr_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_level(true)
        .with_target(true)
        .with_ansi(cfg!(not(test)))
        .with_writer(io::stderr);

    registry().with(env_filter).with(stderr_layer).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        let directives = build_filter_directives(false);
        assert!(directives.contains(&"psj_app=debug".to_string()));
        assert!(!directives.iter().any(|d| d.ends_with("=trace")));
    }

    #[test]
    fn test_verbose_raises_harness_crates() {
        let directives = build_filter_directives(true);
        assert!(directives.contains(&"psj_app=trace".to_string()));
        assert!(directives.contains(&"psj_infra=trace".to_string()));
        assert!(!directives.contains(&"psj_app=debug".to_string()));
        assert!(EnvFilter::try_new(directives.join(",")).is_ok());
    }
}
