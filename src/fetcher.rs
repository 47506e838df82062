//! Higher-level fetch operations consumed by the [`Driver`](crate::driver::Driver):
//! given a URL, applies conditional-GET/redirect policy via a [`Download`]
//! and resolves a [`Blocker`] when the result lands where the caller needs it.

use std::sync::Arc;

use url::Url;

use crate::blocker::Blocker;
use crate::collab::{IfaceCache, Implementation, Stores};
use crate::download::Download;
use crate::error::DownloadError;
use crate::queue::RequestsQueue;

/// Narrow interface the driver depends on; see [`HttpFetcher`] for the
/// concrete implementation built on [`RequestsQueue`].
pub trait Fetcher: Send + Sync {
    /// Resolves to success once `url`'s feed is present in `iface_cache`.
    /// No-ops (an already-triggered blocker) if the cache reports a
    /// sufficiently fresh copy. `iface_cache` is `Arc`-wrapped because the
    /// import happens on a spawned task outliving this call.
    fn download_and_import_feed(&self, url: &Url, iface_cache: Arc<dyn IfaceCache>) -> Blocker;

    /// Resolves to success once every listed implementation is present in
    /// `stores`. Returns `None` if nothing needed fetching.
    fn download_impls(&self, implementations: &[Implementation], stores: &dyn Stores) -> Option<Blocker>;
}

/// The concrete [`Fetcher`], backed by a shared [`RequestsQueue`].
pub struct HttpFetcher {
    queue: Arc<RequestsQueue>,
}

impl HttpFetcher {
    pub fn new(queue: Arc<RequestsQueue>) -> Self {
        HttpFetcher { queue }
    }
}

impl Fetcher for HttpFetcher {
    fn download_and_import_feed(&self, url: &Url, iface_cache: Arc<dyn IfaceCache>) -> Blocker {
        if iface_cache.has_fresh_feed(url) {
            return Blocker::idle(url.to_string());
        }

        let download = Download::new(Arc::clone(&self.queue), url.clone(), None, None, None);
        let result = Blocker::new(url.to_string());

        if let Err(error) = download.start() {
            result.trigger_err(error);
            return result;
        }

        let url_owned = url.clone();
        let download_for_task = download.clone();
        let joint = result.clone();
        tokio::spawn(async move {
            download_for_task.blocker().wait().await;
            if let Err(error) = download_for_task.blocker().check() {
                joint.trigger_err_arc(error);
                return;
            }

            // A 304 means the cache already holds the current copy; there's
            // nothing to import, and the sink is empty anyway.
            if download_for_task.unmodified() {
                joint.trigger();
                return;
            }

            let path = match download_for_task.sink_path() {
                Some(path) => path,
                None => {
                    joint.trigger();
                    return;
                }
            };
            match iface_cache.import_feed(&url_owned, &path) {
                Ok(()) => joint.trigger(),
                Err(source) => joint.trigger_err(DownloadError::Transport {
                    url: url_owned.clone(),
                    source: Box::new(source),
                }),
            }
        });

        result
    }

    fn download_impls(&self, implementations: &[Implementation], stores: &dyn Stores) -> Option<Blocker> {
        let missing: Vec<&Implementation> = implementations
            .iter()
            .filter(|implementation| !stores.is_cached(implementation))
            .collect();

        if missing.is_empty() {
            return None;
        }

        let mut downloads = Vec::with_capacity(missing.len());
        for implementation in missing {
            let download = Download::new(
                Arc::clone(&self.queue),
                implementation.download_url.clone(),
                implementation.size,
                None,
                implementation.digest_hint.clone(),
            );
            if let Err(error) = download.start() {
                let failed = Blocker::new(implementation.download_url.to_string());
                failed.trigger_err(error);
                downloads.push(failed);
                continue;
            }
            downloads.push(download.blocker().clone());
        }

        let joint = Blocker::new("download_impls");
        join_all(downloads, joint.clone());
        Some(joint)
    }
}

/// Spawns a task that resolves `joint` once every blocker in `blockers` has
/// happened: success if none failed, otherwise the first observed error.
fn join_all(blockers: Vec<Blocker>, joint: Blocker) {
    tokio::spawn(async move {
        for blocker in &blockers {
            blocker.wait().await;
        }
        for blocker in &blockers {
            if let Err(error) = blocker.check() {
                joint.trigger_err_arc(error);
                return;
            }
        }
        joint.trigger();
    });
}
