//! Per-endpoint pool of reusable HTTP connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::endpoint::Endpoint;

/// Maximum number of idle connections retained per endpoint, and the maximum
/// number of worker threads (the two are deliberately equal).
pub const MAX_POOL: usize = 15;

/// A connection handle to one endpoint.
///
/// Raw socket peeking for "did the peer send unsolicited data" is not
/// available once the transport is delegated to a pooling-aware HTTP client;
/// the signal used here instead is whether the *previous* request issued on
/// this handle ended in a transport-level error, which is the liveness
/// signal actually observable at this layer (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) endpoint: Endpoint,
    client: Arc<reqwest::blocking::Client>,
    alive: bool,
}

impl Connection {
    pub(crate) fn new(endpoint: Endpoint, client: Arc<reqwest::blocking::Client>) -> Self {
        Connection {
            endpoint,
            client,
            alive: true,
        }
    }

    /// The endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The shared blocking HTTP client used to issue requests on this
    /// connection. Sharing one client per endpoint is what gives the
    /// underlying transport real keep-alive reuse.
    pub fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Marks this connection as broken; it will not be returned by
    /// [`ConnectionPool::take`] again.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Mapping from endpoint to an ordered (LIFO) sequence of idle connections.
///
/// Also caches one [`reqwest::blocking::Client`] per endpoint: the real
/// keep-alive reuse happens inside that client's own internal pool, and
/// [`Connection`] handles checked out of here are cheap references into it.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    idle: HashMap<Endpoint, Vec<Connection>>,
    clients: HashMap<Endpoint, Arc<reqwest::blocking::Client>>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        ConnectionPool::default()
    }

    /// Returns the shared client for `endpoint`, building and caching one on
    /// first use.
    pub fn client_for(&mut self, endpoint: &Endpoint, config: &EngineConfig) -> Arc<reqwest::blocking::Client> {
        if let Some(client) = self.clients.get(endpoint) {
            return client.clone();
        }
        let client = Arc::new(build_client(config));
        self.clients.insert(endpoint.clone(), client.clone());
        client
    }

    /// Synthesizes a fresh [`Connection`] to `endpoint`, backed by the
    /// cached per-endpoint client.
    pub fn new_connection(&mut self, endpoint: Endpoint, config: &EngineConfig) -> Connection {
        let client = self.client_for(&endpoint, config);
        Connection::new(endpoint, client)
    }

    /// Removes and returns the most recently released connection for
    /// `endpoint`, or `None` if there isn't one (forcing the caller to open a
    /// fresh connection). A connection found dead is dropped and `None` is
    /// returned, same as if the pool were empty.
    pub fn take(&mut self, endpoint: &Endpoint) -> Option<Connection> {
        let bucket = self.idle.get_mut(endpoint)?;
        while let Some(connection) = bucket.pop() {
            if connection.is_alive() {
                return Some(connection);
            }
            tracing::debug!(%endpoint, "dropping dead pooled connection");
        }
        None
    }

    /// Releases `connection` back to the pool, at the head (LIFO) of its
    /// endpoint's bucket. Dead connections are dropped rather than pooled.
    /// Bucket size is bounded by `config.max_pool_per_endpoint`.
    pub fn release(&mut self, connection: Connection, config: &EngineConfig) {
        if !connection.is_alive() {
            return;
        }
        let bucket = self.idle.entry(connection.endpoint.clone()).or_default();
        assert!(
            bucket.len() < config.max_pool_per_endpoint,
            "connection pool overflow for {}",
            connection.endpoint
        );
        bucket.push(connection);
    }

    /// Total number of idle connections across all endpoints, for tests and
    /// diagnostics.
    pub fn len(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// True if no connections are pooled anywhere.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle connections pooled for one endpoint.
    pub fn len_for(&self, endpoint: &Endpoint) -> usize {
        self.idle.get(endpoint).map_or(0, Vec::len)
    }
}

/// Builds the blocking client used by a fresh [`Connection`], configured
/// with the engine's user agent and per-read timeout.
fn build_client(config: &EngineConfig) -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(300))
        .read_timeout(config.read_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("building the blocking HTTP client should never fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            scheme: "https".to_string(),
            host: host.to_string(),
            port: 443,
        }
    }

    fn connection(endpoint: Endpoint) -> Connection {
        Connection::new(endpoint, Arc::new(reqwest::blocking::Client::new()))
    }

    #[test]
    fn take_from_empty_pool_is_none() {
        let mut pool = ConnectionPool::new();
        assert!(pool.take(&endpoint("example.com")).is_none());
    }

    #[test]
    fn release_then_take_round_trips() {
        let mut pool = ConnectionPool::new();
        let config = EngineConfig::default();
        let ep = endpoint("example.com");
        pool.release(connection(ep.clone()), &config);
        assert_eq!(pool.len_for(&ep), 1);
        let taken = pool.take(&ep);
        assert!(taken.is_some());
        assert_eq!(pool.len_for(&ep), 0);
    }

    #[test]
    fn releasing_a_dead_connection_does_not_disturb_the_live_one() {
        let mut pool = ConnectionPool::new();
        let config = EngineConfig::default();
        let ep = endpoint("example.com");
        let client = Arc::new(reqwest::blocking::Client::new());

        pool.release(Connection::new(ep.clone(), client.clone()), &config);
        let mut dead = Connection::new(ep.clone(), client);
        dead.mark_dead();
        pool.release(dead, &config);

        assert_eq!(pool.len_for(&ep), 1, "dead connection is dropped on release");
        assert!(pool.take(&ep).is_some(), "the live connection is still there");
    }

    #[test]
    fn dead_connections_are_not_pooled() {
        let mut pool = ConnectionPool::new();
        let config = EngineConfig::default();
        let ep = endpoint("example.com");
        let mut dead = connection(ep.clone());
        dead.mark_dead();
        pool.release(dead, &config);
        assert_eq!(pool.len_for(&ep), 0);
    }

    #[test]
    #[should_panic(expected = "connection pool overflow")]
    fn release_past_max_pool_panics() {
        let mut pool = ConnectionPool::new();
        let config = EngineConfig::default();
        let ep = endpoint("example.com");
        let client = Arc::new(reqwest::blocking::Client::new());
        for _ in 0..=config.max_pool_per_endpoint {
            pool.release(Connection::new(ep.clone(), client.clone()), &config);
        }
    }

    #[test]
    #[should_panic(expected = "connection pool overflow")]
    fn release_respects_a_configured_bound_smaller_than_the_default() {
        let mut pool = ConnectionPool::new();
        let mut config = EngineConfig::default();
        config.max_pool_per_endpoint = 2;
        let ep = endpoint("example.com");
        let client = Arc::new(reqwest::blocking::Client::new());
        for _ in 0..=config.max_pool_per_endpoint {
            pool.release(Connection::new(ep.clone(), client.clone()), &config);
        }
    }
}
