//! Narrow interfaces for the external collaborators the driver consumes as
//! black boxes: the dependency solver, the on-disk implementation store, and
//! the feed cache. None of these are implemented here — package-format
//! parsing, local unpacking, and the solving algorithm itself are explicitly
//! out of scope.

use std::collections::HashMap;
use std::path::Path;

use url::Url;

/// A concrete, downloadable candidate chosen by the solver to satisfy one
/// interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Implementation {
    /// Solver-assigned identifier, opaque to this crate.
    pub id: String,
    /// Where to fetch the implementation's archive from, if it isn't
    /// already cached.
    pub download_url: Url,
    /// Expected archive size, when known.
    pub size: Option<u64>,
    /// Opaque digest/hint passed straight through to [`Download::new`].
    ///
    /// [`Download::new`]: crate::download::Download::new
    pub digest_hint: Option<String>,
}

/// A solver's chosen mapping from interface URI to the implementation that
/// satisfies it.
#[derive(Debug, Clone, Default)]
pub struct Selections {
    pub chosen: HashMap<Url, Implementation>,
}

impl Selections {
    /// All chosen implementations, irrespective of which interface picked
    /// them.
    pub fn implementations(&self) -> impl Iterator<Item = &Implementation> {
        self.chosen.values()
    }
}

/// Reports whether an implementation is already present on disk.
pub trait Stores: Send + Sync {
    fn is_cached(&self, implementation: &Implementation) -> bool;
}

/// The on-disk cache of feed documents.
pub trait IfaceCache: Send + Sync {
    /// True if the cache already holds a copy of `url` fresh enough that a
    /// refetch can be skipped.
    fn has_fresh_feed(&self, url: &Url) -> bool;

    /// Imports the feed document at `tmp_path` (the Download's temp sink)
    /// as the cached copy for `url`.
    fn import_feed(&self, url: &Url, tmp_path: &Path) -> std::io::Result<()>;
}

/// One invocation's result from the solver.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// True iff the solver reached a complete, satisfiable selection.
    pub ready: bool,
    /// Every feed URL the solver consulted while producing this outcome,
    /// regardless of readiness.
    pub feeds_used: Vec<Url>,
    /// The solver's current best selections (meaningful even if not ready).
    pub selections: Selections,
    /// Human-readable reason, populated when `ready` is false.
    pub reason: Option<String>,
}

/// The dependency solver, consumed as a black box.
pub trait Solver: Send {
    /// Attempts to select one implementation per interface reachable from
    /// `root`, for the given `host_arch`, optionally running `command`.
    fn solve(&mut self, root: &Url, host_arch: &str, command: Option<&str>) -> SolveOutcome;
}

/// How a feed URL should be treated by the driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// An absolute local path; reloaded from disk rather than fetched.
    Local,
    /// A `distribution:`-scheme feed, provided by an OS package integration
    /// layer.
    Distribution,
    /// An ordinary network feed.
    Network,
}

/// Classifies `url` per the scheme rules the driver loop distinguishes.
pub fn classify_feed(url: &Url) -> FeedKind {
    match url.scheme() {
        "distribution" => FeedKind::Distribution,
        "http" | "https" => FeedKind::Network,
        _ => FeedKind::Local,
    }
}

/// Builds the companion `distribution:` URL for a feed `url`, used by the
/// driver to invalidate a distribution feed's cached-completion status
/// whenever the underlying feed it wraps is refreshed.
pub fn distribution_companion(url: &Url) -> Option<Url> {
    Url::parse(&format!("distribution:{url}")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_distribution_and_network_schemes() {
        let distro: Url = "distribution:http://example.com/a.xml".parse().unwrap();
        let network: Url = "https://example.com/a.xml".parse().unwrap();
        let local: Url = "file:///home/user/a.xml".parse().unwrap();
        assert_eq!(classify_feed(&distro), FeedKind::Distribution);
        assert_eq!(classify_feed(&network), FeedKind::Network);
        assert_eq!(classify_feed(&local), FeedKind::Local);
    }

    #[test]
    fn distribution_companion_wraps_the_original_url() {
        let url: Url = "http://example.com/a.xml".parse().unwrap();
        let companion = distribution_companion(&url).unwrap();
        assert_eq!(companion.as_str(), "distribution:http://example.com/a.xml");
        assert_eq!(classify_feed(&companion), FeedKind::Distribution);
    }

    #[test]
    fn selections_iterates_chosen_implementations() {
        let mut selections = Selections::default();
        selections.chosen.insert(
            "http://example.com/iface.xml".parse().unwrap(),
            Implementation {
                id: "impl-1".to_string(),
                download_url: "http://example.com/impl-1.tar.gz".parse().unwrap(),
                size: Some(100),
                digest_hint: None,
            },
        );
        assert_eq!(selections.implementations().count(), 1);
    }
}
