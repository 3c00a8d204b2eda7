//! Upstream host configuration and credential decoration.
//!
//! The proxy is transparent: the upstream URL is reconstructed from the
//! scheme and host embedded in the request path. An optional
//! `upstream-base` pins the proxy to a single upstream; anything else is
//! refused before the store is touched. Credentials are never stored;
//! in `passthrough` mode the client's `Authorization` header rides along
//! on the git invocation as an extra HTTP header.

use std::time::Duration;

use crate::config::{AuthMode, Config};
use crate::error::ProxyError;
use crate::fingerprint::{Fingerprint, Scheme};
use crate::git::commands::GitOptions;

#[derive(Debug, Clone)]
pub struct Upstream {
    /// Normalised `scheme://host` allowlist, when configured.
    base: Option<String>,
    user_agent: String,
    timeout: Duration,
    auth_mode: AuthMode,
}

impl Upstream {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config
                .upstream_base
                .as_ref()
                .map(|b| b.trim_end_matches('/').to_string()),
            user_agent: config.user_agent.clone(),
            timeout: config.upstream_timeout(),
            auth_mode: config.auth_mode,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// Upstream fetch URL for a mirror, e.g. `https://github.com/octo/demo`.
    ///
    /// When an upstream base is configured, requests for any other origin
    /// are refused as not found.
    pub fn url_for(&self, scheme: Scheme, fingerprint: &Fingerprint) -> Result<String, ProxyError> {
        if let Some(base) = &self.base {
            let origin = format!("{}://{}", scheme.as_str(), fingerprint.host());
            if !origin.eq_ignore_ascii_case(base) {
                return Err(ProxyError::NotFound(format!(
                    "upstream host not proxied here: {origin}"
                )));
            }
        }
        Ok(format!("{}://{}", scheme.as_str(), fingerprint.as_str()))
    }

    /// Build the `git -c` decoration for an upstream operation: the
    /// configured user-agent plus, in passthrough mode, the client's
    /// `Authorization` header.
    pub fn git_options(&self, authorization: Option<&str>) -> GitOptions {
        let mut config = vec![format!("http.userAgent={}", self.user_agent)];
        if self.auth_mode == AuthMode::Passthrough {
            if let Some(auth) = authorization {
                config.push(format!("http.extraHeader=Authorization: {auth}"));
            }
        }
        GitOptions { config }
    }
}
