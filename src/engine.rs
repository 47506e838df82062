//! Process-wide entry point gluing the worker pool to a concrete [`Fetcher`].
//!
//! The source this crate is modeled on keeps its connection pool and request
//! queue as global singletons, initialized once and reused for the lifetime
//! of the process. That's awkward to test and impossible to run twice in one
//! process (e.g. from several `#[tokio::test]`s in parallel), so here the
//! same state is owned by a value instead: construct one `Engine` per
//! process (or per test), and drop it to tear the worker pool down.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::queue::RequestsQueue;

/// Owns the request queue (and, transitively, its connection pool) backing
/// one [`HttpFetcher`]. Shutting down the worker pool happens automatically
/// when the last clone of the returned `Arc<RequestsQueue>` is dropped.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<RequestsQueue>,
    fetcher: Arc<dyn Fetcher>,
}

impl Engine {
    /// Starts a new engine with the given configuration. Worker threads are
    /// spawned lazily, on first use, rather than eagerly here.
    pub fn new(config: EngineConfig) -> Self {
        let queue = RequestsQueue::new(config.clone());
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(Arc::clone(&queue)));
        Engine {
            config,
            queue,
            fetcher,
        }
    }

    /// The configuration this engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The fetcher backed by this engine's worker pool, ready to hand to a
    /// [`Driver`](crate::driver::Driver).
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    /// Direct access to the underlying queue, for callers that need to
    /// inspect or drive it without going through the `Fetcher` interface
    /// (e.g. downloading a standalone resource that isn't a feed or an
    /// implementation archive).
    pub fn queue(&self) -> &Arc<RequestsQueue> {
        &self.queue
    }

    /// Requests that all in-flight and pending work stop and the worker
    /// threads exit. Idempotent; also runs automatically on drop.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_engine_uses_the_given_config() {
        let mut config = EngineConfig::default();
        config.max_workers = 3;
        let engine = Engine::new(config);
        assert_eq!(engine.config().max_workers, 3);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let engine = Engine::new(EngineConfig::default());
        engine.shutdown();
        engine.shutdown();
    }
}
