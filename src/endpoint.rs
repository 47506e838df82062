//! Endpoint resolution: mapping a request URL (honoring HTTP proxy
//! configuration) to the `(scheme, host, port)` tuple the connection pool is
//! keyed on.

use std::env;
use std::fmt;

use url::Url;

/// A live or poolable endpoint: `(scheme, host, port)`.
///
/// This is the key the [`ConnectionPool`](crate::pool::ConnectionPool) is
/// indexed by. Two requests that resolve to the same `Endpoint` can share a
/// pooled [`Connection`](crate::pool::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// `http` or `https`. Preserved as `http` even when talking to a proxy,
    /// per the wire-behavior spec (pooling key uses the original scheme).
    pub scheme: String,
    /// Hostname or IP literal of the endpoint actually dialed.
    pub host: String,
    /// TCP port of the endpoint actually dialed.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Returns the default port for a scheme, resolving the open question in the
/// source where `_split_hostport` referenced `self.default_port` from a
/// free-function context: 80 for `http`, 443 for `https`.
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        _ => 80,
    }
}

/// Splits a `host[:port]` string into its parts, defaulting the port via
/// [`default_port`] when absent.
pub fn split_hostport(hostport: &str, scheme: &str) -> (String, u16) {
    match hostport.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (hostport.to_string(), default_port(scheme)),
        },
        None => (hostport.to_string(), default_port(scheme)),
    }
}

/// Resolves the proxy that should be used for `url`, taken from the
/// process's standard proxy environment variables (`http_proxy`/`HTTP_PROXY`
/// and friends, mirroring `curl`/`reqwest`'s own discovery).
///
/// Only `http` URLs are proxied for pooling purposes: the request line keeps
/// the full URL in that case, but the pooling key becomes the proxy's own
/// endpoint with `scheme = "http"`, as specified.
pub fn resolve_endpoint(url: &Url) -> Option<Endpoint> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return None;
    }

    if scheme == "http" {
        if let Some(proxy) = http_proxy_from_env() {
            if let Ok(proxy_url) = Url::parse(&proxy) {
                let host = proxy_url.host_str()?.to_string();
                let port = proxy_url
                    .port()
                    .unwrap_or_else(|| default_port(proxy_url.scheme()));
                return Some(Endpoint {
                    scheme: "http".to_string(),
                    host,
                    port,
                });
            }
        }
    }

    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or_else(|| default_port(scheme));
    Some(Endpoint {
        scheme: scheme.to_string(),
        host,
        port,
    })
}

fn http_proxy_from_env() -> Option<String> {
    env::var("http_proxy")
        .or_else(|_| env::var("HTTP_PROXY"))
        .ok()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_resolve_per_scheme() {
        assert_eq!(default_port("http"), 80);
        assert_eq!(default_port("https"), 443);
        assert_eq!(default_port("ftp"), 80);
    }

    #[test]
    fn split_hostport_defaults_when_no_colon() {
        assert_eq!(
            split_hostport("example.com", "https"),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn split_hostport_parses_explicit_port() {
        assert_eq!(
            split_hostport("example.com:8080", "http"),
            ("example.com".to_string(), 8080)
        );
    }

    #[test]
    fn resolve_endpoint_without_proxy() {
        env::remove_var("http_proxy");
        env::remove_var("HTTP_PROXY");
        let url = Url::parse("https://example.com/feed.xml").unwrap();
        let endpoint = resolve_endpoint(&url).unwrap();
        assert_eq!(endpoint.scheme, "https");
        assert_eq!(endpoint.host, "example.com");
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn resolve_endpoint_non_http_scheme_is_none() {
        let url = Url::parse("distribution:http://example.com/feed.xml").unwrap();
        assert!(resolve_endpoint(&url).is_none());
    }
}
