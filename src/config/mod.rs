//! Runtime configuration.
//!
//! Every setting is exposed both as a command-line flag and as a
//! `MIRRORCACHE_*` environment variable; flags win. Invalid settings are a
//! configuration error and terminate the process with exit code 2.

pub mod size;

pub use size::SizeSpec;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};

/// How upstream credentials are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Strip client credentials; only public upstream repositories work.
    None,
    /// Forward the client's `Authorization` header to upstream operations.
    Passthrough,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mirrorcache",
    version,
    about = "Caching reverse proxy for the git smart-HTTP protocol"
)]
pub struct Config {
    /// Socket address the HTTP listener binds to.
    #[arg(long, env = "MIRRORCACHE_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Restrict proxying to a single upstream, e.g. `https://github.com`.
    /// When unset, any host named in the request path is proxied.
    #[arg(long, env = "MIRRORCACHE_UPSTREAM_BASE")]
    pub upstream_base: Option<String>,

    /// Root directory holding the bare mirror repositories.
    #[arg(long, env = "MIRRORCACHE_CACHE_ROOT", default_value = "/var/cache/mirrorcache")]
    pub cache_root: PathBuf,

    /// Disk budget for the mirror store: an absolute size ("200GiB") or a
    /// percentage of free disk ("80%"). Unset uses 80% of free disk.
    #[arg(long, env = "MIRRORCACHE_CACHE_SIZE")]
    pub cache_size: Option<SizeSpec>,

    /// Deadline in seconds for a single upstream clone or fetch.
    #[arg(long, env = "MIRRORCACHE_UPSTREAM_TIMEOUT_SECS", default_value_t = 300)]
    pub upstream_timeout_secs: u64,

    /// Upstream credential handling.
    #[arg(long, env = "MIRRORCACHE_AUTH_MODE", value_enum, default_value_t = AuthMode::None)]
    pub auth_mode: AuthMode,

    /// Log level filter; `RUST_LOG` overrides when set.
    #[arg(long, env = "MIRRORCACHE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// User-Agent sent on upstream git operations.
    #[arg(
        long,
        env = "MIRRORCACHE_USER_AGENT",
        default_value = concat!("mirrorcache/", env!("CARGO_PKG_VERSION"))
    )]
    pub user_agent: String,

    /// Accept `http://` upstream hosts in request paths.
    #[arg(long, env = "MIRRORCACHE_ALLOW_INSECURE_HTTP")]
    pub allow_insecure_http: bool,

    /// Upper bound on concurrent upstream clone/fetch operations.
    #[arg(long, env = "MIRRORCACHE_MAX_CONCURRENT_SYNCS", default_value_t = 8)]
    pub max_concurrent_syncs: usize,
}

impl Config {
    /// Sanity checks that cannot be expressed through the clap derive.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address: {}", self.listen_addr))?;

        ensure!(
            self.cache_root.is_absolute(),
            "cache root must be an absolute path: {}",
            self.cache_root.display(),
        );

        if let Some(base) = &self.upstream_base {
            let valid = base.starts_with("https://")
                || (self.allow_insecure_http && base.starts_with("http://"));
            ensure!(valid, "upstream base must carry an accepted scheme: {base}");
        }

        ensure!(self.upstream_timeout_secs > 0, "upstream timeout must be positive");
        ensure!(self.max_concurrent_syncs > 0, "max concurrent syncs must be positive");

        let level = self.log_level.to_ascii_lowercase();
        ensure!(
            matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error"),
            "unknown log level: {}",
            self.log_level,
        );

        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:8080".into(),
            upstream_base: None,
            cache_root: PathBuf::from("/var/cache/mirrorcache"),
            cache_size: None,
            upstream_timeout_secs: 300,
            auth_mode: AuthMode::None,
            log_level: "info".into(),
            user_agent: "mirrorcache/test".into(),
            allow_insecure_http: false,
            max_concurrent_syncs: 8,
        }
    }

    #[test]
    fn default_config_is_valid() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config = base_config();
        config.listen_addr = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_cache_root() {
        let mut config = base_config();
        config.cache_root = PathBuf::from("relative/cache");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_insecure_upstream_base_unless_enabled() {
        let mut config = base_config();
        config.upstream_base = Some("http://git.internal".into());
        assert!(config.validate().is_err());

        config.allow_insecure_http = true;
        config.validate().unwrap();
    }

    #[test]
    fn cache_size_parses_through_clap() {
        let config = Config::parse_from([
            "mirrorcache",
            "--cache-size",
            "75%",
            "--cache-root",
            "/tmp/mirrors",
        ]);
        assert_eq!(config.cache_size, Some(SizeSpec::Percent(75.0)));
    }
}
