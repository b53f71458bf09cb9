//! Acceptor URIs
//!
//! Two schemes: `silkit://host:port` for TCP and `local://<path>` for Unix
//! domain sockets. The registry rewrites loopback hosts in advertised URIs to
//! the address it actually observed, so participants behind "localhost"
//! acceptors stay reachable across hosts.

use crate::error::{SilKitError, SilKitResult};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptorUri {
    Tcp { host: String, port: u16 },
    Local { path: String },
}

impl AcceptorUri {
    pub fn parse(uri: &str) -> SilKitResult<Self> {
        if let Some(rest) = uri.strip_prefix("silkit://") {
            let (host, port) = split_host_port(rest)
                .ok_or_else(|| SilKitError::configuration(format!("invalid silkit uri '{}'", uri)))?;
            Ok(AcceptorUri::Tcp { host, port })
        } else if let Some(path) = uri.strip_prefix("local://") {
            if path.is_empty() {
                return Err(SilKitError::configuration(format!("invalid local uri '{}'", uri)));
            }
            Ok(AcceptorUri::Local { path: path.to_string() })
        } else {
            Err(SilKitError::configuration(format!(
                "unsupported uri scheme in '{}' (expected silkit:// or local://)",
                uri
            )))
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, AcceptorUri::Local { .. })
    }

    pub fn is_loopback_tcp(&self) -> bool {
        match self {
            AcceptorUri::Tcp { host, .. } => {
                host == "localhost"
                    || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
            }
            AcceptorUri::Local { .. } => false,
        }
    }

    /// Loopback hosts rewritten to `observed_host`; everything else untouched.
    pub fn rewritten_for(&self, observed_host: &str) -> AcceptorUri {
        match self {
            AcceptorUri::Tcp { port, .. } if self.is_loopback_tcp() => {
                AcceptorUri::Tcp { host: observed_host.to_string(), port: *port }
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for AcceptorUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorUri::Tcp { host, port } => write!(f, "silkit://{}:{}", host, port),
            AcceptorUri::Local { path } => write!(f, "local://{}", path),
        }
    }
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    // IPv6 hosts come bracketed: [::1]:8500
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let idx = s.rfind(':')?;
    let host = &s[..idx];
    if host.is_empty() {
        return None;
    }
    let port = s[idx + 1..].parse().ok()?;
    Some((host.to_string(), port))
}

/// Transform advertised acceptor URIs so a target peer can actually reach
/// them. `advertiser_host` is the address the registry observed for the peer
/// that advertised the URIs; local-IPC URIs survive only when both peers were
/// observed on loopback (same host as the registry, hence as each other).
pub fn transform_acceptor_uris(
    advertised: &[String],
    advertiser_host: &str,
    target_is_same_host: bool,
) -> Vec<String> {
    let mut out = Vec::with_capacity(advertised.len());
    for raw in advertised {
        match AcceptorUri::parse(raw) {
            Ok(uri @ AcceptorUri::Local { .. }) => {
                if target_is_same_host {
                    out.push(uri.to_string());
                }
            }
            Ok(uri) => out.push(uri.rewritten_for(advertiser_host).to_string()),
            Err(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_uri() {
        let uri = AcceptorUri::parse("silkit://127.0.0.1:8500").unwrap();
        assert_eq!(uri, AcceptorUri::Tcp { host: "127.0.0.1".into(), port: 8500 });
        assert!(uri.is_loopback_tcp());
    }

    #[test]
    fn parse_ipv6_uri() {
        let uri = AcceptorUri::parse("silkit://[::1]:8500").unwrap();
        assert_eq!(uri, AcceptorUri::Tcp { host: "::1".into(), port: 8500 });
        assert!(uri.is_loopback_tcp());
    }

    #[test]
    fn parse_local_uri() {
        let uri = AcceptorUri::parse("local:///tmp/p1.sock").unwrap();
        assert_eq!(uri, AcceptorUri::Local { path: "/tmp/p1.sock".into() });
    }

    #[test]
    fn bad_scheme_rejected() {
        assert!(AcceptorUri::parse("http://localhost:80").is_err());
        assert!(AcceptorUri::parse("silkit://noport").is_err());
    }

    #[test]
    fn loopback_rewritten_for_remote_target() {
        let uris = vec!["silkit://127.0.0.1:4242".to_string(), "local:///tmp/a.sock".to_string()];
        let out = transform_acceptor_uris(&uris, "10.1.2.3", false);
        assert_eq!(out, vec!["silkit://10.1.2.3:4242".to_string()]);
    }

    #[test]
    fn local_ipc_kept_for_same_host() {
        let uris = vec!["silkit://127.0.0.1:4242".to_string(), "local:///tmp/a.sock".to_string()];
        let out = transform_acceptor_uris(&uris, "127.0.0.1", true);
        assert_eq!(
            out,
            vec!["silkit://127.0.0.1:4242".to_string(), "local:///tmp/a.sock".to_string()]
        );
    }

    #[test]
    fn non_loopback_hosts_untouched() {
        let uris = vec!["silkit://192.168.1.5:999".to_string()];
        let out = transform_acceptor_uris(&uris, "10.0.0.1", false);
        assert_eq!(out, vec!["silkit://192.168.1.5:999".to_string()]);
    }
}
