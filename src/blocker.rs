//! One-shot awaitable used to synchronize the cooperative scheduler with
//! background worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::DownloadError;

/// A one-shot synchronization primitive with a `happened` flag and an
/// optional error payload.
///
/// Cloning a `Blocker` shares the same underlying state: every clone observes
/// the same trigger and the same error, which is what lets the driver loop
/// await several in-flight feeds as a set.
#[derive(Clone)]
pub struct Blocker {
    label: Arc<str>,
    happened: Arc<AtomicBool>,
    error: Arc<Mutex<Option<Arc<DownloadError>>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl Blocker {
    /// Creates a new, untriggered `Blocker` carrying a human-readable label
    /// (typically the URL it is watching) used in logging.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Blocker {
            label: label.into(),
            happened: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Returns an already-triggered `Blocker`, used where the spec calls for
    /// an `IdleBlocker` (e.g. scheduling local-only work with no real I/O).
    pub fn idle(label: impl Into<Arc<str>>) -> Self {
        let blocker = Blocker::new(label);
        blocker.trigger();
        blocker
    }

    /// The label this blocker was created with.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Transitions to `happened` with no error. Triggering an
    /// already-triggered `Blocker` is a programming error and panics in
    /// debug builds, matching the source's "second trigger" invariant.
    pub fn trigger(&self) {
        let was_happened = self.happened.swap(true, Ordering::AcqRel);
        debug_assert!(!was_happened, "blocker {} triggered twice", self.label);
        self.notify.notify_waiters();
    }

    /// Transitions to `happened` with a stored error, observable by
    /// subsequent calls to [`Blocker::check`].
    pub fn trigger_err(&self, error: DownloadError) {
        self.trigger_err_arc(Arc::new(error));
    }

    /// Same as [`Blocker::trigger_err`], for callers that already hold the
    /// error behind an `Arc` (e.g. a [`DoneEvent`](crate::queue::DoneEvent)
    /// relayed from a worker thread) and shouldn't have to unwrap it first.
    pub(crate) fn trigger_err_arc(&self, error: Arc<DownloadError>) {
        *self.error.lock().unwrap() = Some(error);
        let was_happened = self.happened.swap(true, Ordering::AcqRel);
        debug_assert!(!was_happened, "blocker {} triggered twice", self.label);
        self.notify.notify_waiters();
    }

    /// True once this blocker has been triggered (successfully or not).
    pub fn has_happened(&self) -> bool {
        self.happened.load(Ordering::Acquire)
    }

    /// Returns the stored error, if any, without consuming it.
    pub fn error(&self) -> Option<Arc<DownloadError>> {
        self.error.lock().unwrap().clone()
    }

    /// Re-raises the stored error if this blocker failed, otherwise returns
    /// `Ok(())`. Mirrors the source's `tasks.check` re-throw semantics.
    pub fn check(&self) -> Result<(), Arc<DownloadError>> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Suspends until this blocker has happened.
    pub async fn wait(&self) {
        loop {
            if self.has_happened() {
                return;
            }
            let notified = self.notify.notified();
            if self.has_happened() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blocker")
            .field("label", &self.label)
            .field("happened", &self.has_happened())
            .finish()
    }
}

/// Suspends until at least one of `blockers` has happened.
///
/// The caller must still inspect every blocker afterwards: completion of one
/// does not imply anything about the others. An empty slice returns
/// immediately, mirroring "nothing to wait for".
pub async fn await_any(blockers: &[Blocker]) {
    if blockers.is_empty() || blockers.iter().any(Blocker::has_happened) {
        return;
    }

    let waits: Vec<_> = blockers.iter().map(|b| Box::pin(b.wait())).collect();
    futures_util::future::select_all(waits).await;
}
