//! The iterative solve-then-fetch loop tying the solver, caches, and fetcher
//! together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use url::Url;

use crate::blocker::{await_any, Blocker};
use crate::collab::{classify_feed, distribution_companion, FeedKind, IfaceCache, Implementation, Selections, SolveOutcome, Solver, Stores};
use crate::error::{DownloadError, DriverError};
use crate::fetcher::Fetcher;
use crate::handler::Handler;
use crate::network::NetworkUse;

/// What the driver is trying to run: a root interface, optionally a specific
/// command within it, for a given architecture.
#[derive(Debug, Clone)]
pub struct Requirements {
    pub root: Url,
    pub command: Option<String>,
    pub architecture: String,
    /// Request source implementations rather than binaries.
    pub source: bool,
    pub version_constraints: Option<String>,
}

fn effective_host_arch(requirements: &Requirements) -> String {
    if requirements.source {
        format!("source:{}", requirements.architecture)
    } else {
        requirements.architecture.clone()
    }
}

/// Combines a solver invocation with concurrent feed fetches until the
/// solver is ready or no further progress is possible.
pub struct Driver {
    requirements: Requirements,
    solver: Box<dyn Solver>,
    iface_cache: Arc<dyn IfaceCache>,
    stores: Arc<dyn Stores>,
    fetcher: Arc<dyn Fetcher>,
    handler: Arc<dyn Handler>,
    network: NetworkUse,
    watchers: Vec<Box<dyn Fn(&SolveOutcome) + Send + Sync>>,
    /// Feeds explicitly flagged for a forced reread on their next
    /// encounter, independent of the loop's own `force` promotion.
    stale_feeds: HashSet<Url>,
    /// Per-instance latch for the offline "missed feed" warning (testable
    /// property 9): true after the first warning has fired.
    offline_warned: bool,
    last_selections: Selections,
}

impl Driver {
    pub fn new(
        requirements: Requirements,
        solver: Box<dyn Solver>,
        iface_cache: Arc<dyn IfaceCache>,
        stores: Arc<dyn Stores>,
        fetcher: Arc<dyn Fetcher>,
        handler: Arc<dyn Handler>,
        network: NetworkUse,
    ) -> Self {
        Driver {
            requirements,
            solver,
            iface_cache,
            stores,
            fetcher,
            handler,
            network,
            watchers: Vec::new(),
            stale_feeds: HashSet::new(),
            offline_warned: false,
            last_selections: Selections::default(),
        }
    }

    /// Registers a watcher invoked synchronously, before every await point,
    /// with the outcome of each solver invocation.
    pub fn add_watcher(&mut self, watcher: impl Fn(&SolveOutcome) + Send + Sync + 'static) {
        self.watchers.push(Box::new(watcher));
    }

    /// Flags `url` to be re-read/refetched the next time the loop
    /// encounters it, even if the current `force` state wouldn't otherwise
    /// demand it.
    pub fn mark_feed_stale(&mut self, url: Url) {
        self.stale_feeds.insert(url);
    }

    /// Whether the once-per-lifetime offline "missed feed" warning has
    /// already fired.
    pub fn offline_warned(&self) -> bool {
        self.offline_warned
    }

    fn solve_once(&mut self, host_arch: &str) -> SolveOutcome {
        let outcome = self.solver.solve(
            &self.requirements.root,
            host_arch,
            self.requirements.command.as_deref(),
        );
        for watcher in &self.watchers {
            watcher(&outcome);
        }
        self.last_selections = outcome.selections.clone();
        outcome
    }

    /// Runs the fixed-point solve/fetch loop. Three modes, selected by
    /// `(force, update_local)`: quick (`false, false`), background refresh
    /// (`false, true`), and explicit refresh (`true, _`). Returns the final
    /// solver outcome; a not-ready result is not itself an error (see
    /// [`Driver::solve_and_download_impls`] for the call that turns it into
    /// one).
    pub async fn solve_with_downloads(&mut self, force: bool, update_local: bool) -> SolveOutcome {
        let mut force = force;
        let mut finished: HashSet<Url> = HashSet::new();
        let mut in_progress: HashMap<Url, Blocker> = HashMap::new();
        let host_arch = effective_host_arch(&self.requirements);
        let mut try_quick = !(force || update_local);

        loop {
            let outcome = self.solve_once(&host_arch);

            if try_quick && outcome.ready {
                return outcome;
            }
            try_quick = false;
            if !outcome.ready {
                force = true;
            }

            for feed in &outcome.feeds_used {
                if finished.contains(feed) || in_progress.contains_key(feed) {
                    continue;
                }
                self.maybe_start_feed(feed, force, update_local, &mut in_progress);
            }

            if in_progress.is_empty() {
                return outcome;
            }

            let pending: Vec<Blocker> = in_progress.values().cloned().collect();
            await_any(&pending).await;

            for (url, blocker) in in_progress.iter() {
                if let Err(error) = blocker.check() {
                    self.handler.report_error(url, &error);
                }
            }

            let done: Vec<Url> = in_progress
                .iter()
                .filter(|(_, blocker)| blocker.has_happened())
                .map(|(url, _)| url.clone())
                .collect();

            for url in done {
                in_progress.remove(&url);
                finished.insert(url.clone());
                if let Some(distro) = distribution_companion(&url) {
                    finished.remove(&distro);
                    in_progress.remove(&distro);
                }
            }
        }
    }

    fn maybe_start_feed(
        &mut self,
        feed: &Url,
        force: bool,
        update_local: bool,
        in_progress: &mut HashMap<Url, Blocker>,
    ) {
        let forced_stale = self.stale_feeds.remove(feed);
        match classify_feed(feed) {
            FeedKind::Local => {
                if force || forced_stale {
                    in_progress.insert(feed.clone(), Blocker::idle(feed.to_string()));
                }
            }
            FeedKind::Distribution => {
                if force || update_local || forced_stale {
                    let blocker = self
                        .fetcher
                        .download_and_import_feed(feed, Arc::clone(&self.iface_cache));
                    in_progress.insert(feed.clone(), blocker);
                }
            }
            FeedKind::Network => {
                if force || forced_stale {
                    if self.network.is_offline() {
                        self.warn_offline_blocked(feed);
                    } else {
                        let blocker = self
                            .fetcher
                            .download_and_import_feed(feed, Arc::clone(&self.iface_cache));
                        in_progress.insert(feed.clone(), blocker);
                    }
                }
            }
        }
    }

    fn warn_offline_blocked(&mut self, feed: &Url) {
        if !self.offline_warned {
            tracing::warn!(%feed, "feed required but NetworkUse is offline");
            self.offline_warned = true;
        } else {
            tracing::debug!(%feed, "feed required but NetworkUse is offline");
        }
    }

    /// Solves (possibly refreshing feeds), then fetches every selected
    /// implementation the Stores don't already have, unless `select_only`.
    pub async fn solve_and_download_impls(
        &mut self,
        refresh: bool,
        select_only: bool,
    ) -> Result<(), DriverError> {
        let outcome = self.solve_with_downloads(refresh, false).await;
        if !outcome.ready {
            return Err(DriverError::SolverNotReady {
                reason: outcome
                    .reason
                    .unwrap_or_else(|| "solver did not reach a ready state".to_string()),
            });
        }

        if select_only {
            return Ok(());
        }

        let implementations: Vec<Implementation> =
            outcome.selections.implementations().cloned().collect();
        if let Some(blocker) = self.fetcher.download_impls(&implementations, self.stores.as_ref()) {
            blocker.wait().await;
            if let Err(error) = blocker.check() {
                return Err(DriverError::Download(DownloadError::Transport {
                    url: error.url().clone(),
                    source: Box::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        error.to_string(),
                    )),
                }));
            }
        }
        Ok(())
    }

    /// Pure query over the most recently solved selections: every chosen
    /// implementation the Stores don't already have.
    pub fn get_uncached_implementations(&self) -> Vec<Implementation> {
        self.last_selections
            .implementations()
            .filter(|implementation| !self.stores.is_cached(implementation))
            .cloned()
            .collect()
    }

    /// Solves once without fetching anything; true iff the solver isn't
    /// ready or any selected implementation is uncached.
    pub async fn need_download(&mut self) -> bool {
        let host_arch = effective_host_arch(&self.requirements);
        let outcome = self.solve_once(&host_arch);
        !outcome.ready || outcome.selections.implementations().any(|implementation| !self.stores.is_cached(implementation))
    }
}
