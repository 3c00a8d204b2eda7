//! Inbound request-path parsing.
//!
//! Requests arrive with the upstream URL embedded literally in the path,
//! `/<scheme>://<host>/<owner>/<name>[.git]/<endpoint>`, the shape produced
//! by a client-side `url.<proxy>/https://host/.insteadOf https://host/`
//! rewrite. The repository part canonicalises to a *fingerprint*,
//! `host/owner/name`, which doubles as the mirror's key on disk.

use std::fmt;

use crate::error::ProxyError;

// ---------------------------------------------------------------------------
// Scheme
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Canonical key for one upstream repository: `host/owner/name`, no scheme,
/// no `.git` suffix. Two fingerprints are byte-for-byte equal iff they refer
/// to the same mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Validate and canonicalise `host/owner/name[.git]`.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let trimmed = raw.trim_matches('/');
        let canonical = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        if canonical.is_empty() {
            return Err(ProxyError::InvalidRequest("empty repository path".into()));
        }

        let segments: Vec<&str> = canonical.split('/').collect();
        if segments.len() < 2 {
            return Err(ProxyError::InvalidRequest(format!(
                "repository path must name a host and a repository: {canonical}"
            )));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(ProxyError::InvalidRequest(format!(
                    "empty path segment in: {canonical}"
                )));
            }
            if *segment == "." || *segment == ".." {
                return Err(ProxyError::InvalidRequest(format!(
                    "traversal segment in: {canonical}"
                )));
            }
            if segment.contains('\\') {
                return Err(ProxyError::InvalidRequest(format!(
                    "backslash in path segment: {canonical}"
                )));
            }
        }

        Ok(Self(canonical.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The upstream host component (first segment).
    pub fn host(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Git smart-HTTP endpoints the dispatcher recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitEndpoint {
    /// `GET …/info/refs?service=git-upload-pack`: ref advertisement.
    InfoRefs,
    /// `POST …/git-upload-pack`: pack negotiation and transfer.
    UploadPack,
    /// Any `git-receive-pack` request. Always rejected; the proxy is
    /// read-only.
    ReceivePack,
}

impl GitEndpoint {
    pub fn label(&self) -> &'static str {
        match self {
            GitEndpoint::InfoRefs => "info-refs",
            GitEndpoint::UploadPack => "upload-pack",
            GitEndpoint::ReceivePack => "receive-pack",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitRoute {
    pub scheme: Scheme,
    pub fingerprint: Fingerprint,
    pub endpoint: GitEndpoint,
}

/// Parse a request path (plus query string) into a [`GitRoute`].
///
/// Unknown endpoint suffixes are `NotFound`; malformed repository paths and
/// disallowed schemes are `InvalidRequest`.
pub fn parse_route(
    path: &str,
    query: Option<&str>,
    allow_insecure: bool,
) -> Result<GitRoute, ProxyError> {
    let (repo_part, endpoint) = if let Some(rest) = path.strip_suffix("/info/refs") {
        match query_param(query, "service").as_deref() {
            Some("git-upload-pack") => (rest, GitEndpoint::InfoRefs),
            Some("git-receive-pack") => (rest, GitEndpoint::ReceivePack),
            Some(other) => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unsupported service: {other}"
                )))
            }
            None => {
                return Err(ProxyError::InvalidRequest(
                    "missing service parameter (dumb HTTP protocol is not served)".into(),
                ))
            }
        }
    } else if let Some(rest) = path.strip_suffix("/git-upload-pack") {
        (rest, GitEndpoint::UploadPack)
    } else if let Some(rest) = path.strip_suffix("/git-receive-pack") {
        (rest, GitEndpoint::ReceivePack)
    } else {
        return Err(ProxyError::NotFound(format!(
            "no git endpoint in path: {path}"
        )));
    };

    let (scheme, remainder) = strip_scheme(repo_part)?;
    if scheme == Scheme::Http && !allow_insecure {
        return Err(ProxyError::InvalidRequest(
            "insecure http upstreams are disabled".into(),
        ));
    }

    let fingerprint = Fingerprint::parse(remainder)?;
    Ok(GitRoute {
        scheme,
        fingerprint,
        endpoint,
    })
}

/// Split the literal scheme prefix off a repository path. Intermediate
/// proxies sometimes collapse the double slash, so `https:/host/…` is
/// accepted alongside `https://host/…`.
fn strip_scheme(path: &str) -> Result<(Scheme, &str), ProxyError> {
    let path = path.trim_start_matches('/');
    for (prefix, scheme) in [
        ("https://", Scheme::Https),
        ("https:/", Scheme::Https),
        ("http://", Scheme::Http),
        ("http:/", Scheme::Http),
    ] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return Ok((scheme, rest));
        }
    }
    Err(ProxyError::InvalidRequest(format!(
        "repository path must embed an upstream scheme: /{path}"
    )))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::parse("github.com/octocat/Hello-World.git").unwrap();
        let b = Fingerprint::parse("github.com/octocat/Hello-World.git").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "github.com/octocat/Hello-World");
    }

    #[test]
    fn fingerprint_strips_git_suffix_and_slashes() {
        let fp = Fingerprint::parse("/example.com/group/sub/project.git/").unwrap();
        assert_eq!(fp.as_str(), "example.com/group/sub/project");
        assert_eq!(fp.host(), "example.com");
    }

    #[test]
    fn fingerprint_rejects_traversal_and_empty_segments() {
        assert!(Fingerprint::parse("example.com/../etc").is_err());
        assert!(Fingerprint::parse("example.com//repo").is_err());
        assert!(Fingerprint::parse("example.com/a/./b").is_err());
        assert!(Fingerprint::parse(r"example.com/a\b/c").is_err());
        assert!(Fingerprint::parse("just-a-host").is_err());
        assert!(Fingerprint::parse("").is_err());
    }

    #[test]
    fn route_parses_upload_pack_endpoints() {
        let route = parse_route(
            "/https://github.com/octocat/Hello-World.git/info/refs",
            Some("service=git-upload-pack"),
            false,
        )
        .unwrap();
        assert_eq!(route.endpoint, GitEndpoint::InfoRefs);
        assert_eq!(route.scheme, Scheme::Https);
        assert_eq!(route.fingerprint.as_str(), "github.com/octocat/Hello-World");

        let route = parse_route(
            "/https://github.com/octocat/Hello-World/git-upload-pack",
            None,
            false,
        )
        .unwrap();
        assert_eq!(route.endpoint, GitEndpoint::UploadPack);
    }

    #[test]
    fn route_accepts_collapsed_scheme_slash() {
        let route = parse_route(
            "/https:/github.com/octocat/Hello-World/git-upload-pack",
            None,
            false,
        )
        .unwrap();
        assert_eq!(route.fingerprint.as_str(), "github.com/octocat/Hello-World");
    }

    #[test]
    fn route_flags_receive_pack() {
        let route = parse_route(
            "/https://example.com/a/b/git-receive-pack",
            None,
            false,
        )
        .unwrap();
        assert_eq!(route.endpoint, GitEndpoint::ReceivePack);

        let route = parse_route(
            "/https://example.com/a/b/info/refs",
            Some("service=git-receive-pack"),
            false,
        )
        .unwrap();
        assert_eq!(route.endpoint, GitEndpoint::ReceivePack);
    }

    #[test]
    fn route_gates_insecure_http() {
        let err = parse_route("/http://example.com/a/b/git-upload-pack", None, false);
        assert!(matches!(err, Err(ProxyError::InvalidRequest(_))));

        let route = parse_route("/http://example.com/a/b/git-upload-pack", None, true).unwrap();
        assert_eq!(route.scheme, Scheme::Http);
    }

    #[test]
    fn route_rejects_unknown_paths() {
        assert!(matches!(
            parse_route("/https://example.com/a/b/archive.tar.gz", None, false),
            Err(ProxyError::NotFound(_)),
        ));
        assert!(matches!(
            parse_route("/favicon.ico", None, false),
            Err(ProxyError::NotFound(_)),
        ));
    }
}
