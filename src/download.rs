//! A single resource fetch: the handle the rest of the driver awaits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use url::Url;

use crate::blocker::Blocker;
use crate::error::DownloadError;
use crate::queue::{DoneEvent, Request, RequestsQueue};

/// The lifecycle state of a [`Download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Constructed, not yet dispatched.
    Starting,
    /// Enqueued or running on a worker thread.
    Fetching,
    /// Finished successfully (including an unmodified 304).
    Complete,
    /// Finished with an error, or aborted by the caller.
    Failed,
}

struct Inner {
    status: Status,
    unmodified: bool,
    aborted_by_user: bool,
    final_size: Option<u64>,
    /// Discarded once the download reaches a terminal state.
    sink: Option<NamedTempFile>,
}

/// A handle to one in-flight (or finished) resource fetch.
///
/// Cheap to clone: all mutable state lives behind an `Arc<Mutex<_>>`, and the
/// [`Blocker`] is itself shareable, so the completion task spawned by
/// [`Download::start`] can hold its own handle alongside the caller's.
#[derive(Clone)]
pub struct Download {
    url: Url,
    expected_size: Option<u64>,
    modified_since: Option<String>,
    hint: Option<String>,
    blocker: Blocker,
    abort_flag: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
    queue: Arc<RequestsQueue>,
}

impl Download {
    /// Constructs a `Download` in the `Starting` state. `hint` is an opaque
    /// value carried for the caller's own bookkeeping (e.g. a digest or
    /// implementation ID); this module never inspects it.
    pub fn new(
        queue: Arc<RequestsQueue>,
        url: Url,
        expected_size: Option<u64>,
        modified_since: Option<String>,
        hint: Option<String>,
    ) -> Self {
        let blocker = Blocker::new(url.to_string());
        Download {
            url,
            expected_size,
            modified_since,
            hint,
            blocker,
            abort_flag: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(Inner {
                status: Status::Starting,
                unmodified: false,
                aborted_by_user: false,
                final_size: None,
                sink: None,
            })),
            queue,
        }
    }

    /// The resource URL this download was constructed for.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The opaque construction-time hint.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// The current lifecycle state.
    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    /// True once the server has confirmed the cached copy is still current
    /// (a 304 response).
    pub fn unmodified(&self) -> bool {
        self.inner.lock().unwrap().unmodified
    }

    /// The blocker callers should await for completion.
    pub fn blocker(&self) -> &Blocker {
        &self.blocker
    }

    /// Path to the temp sink, while it still exists (i.e. before the
    /// download reaches a terminal state).
    pub fn sink_path(&self) -> Option<std::path::PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .sink
            .as_ref()
            .map(|f| f.path().to_path_buf())
    }

    /// Allocates the temp sink, transitions to `Fetching`, and enqueues the
    /// request. Calling this twice on the same `Download` is a programming
    /// error.
    pub fn start(&self) -> Result<(), DownloadError> {
        let named = NamedTempFile::new().map_err(|source| DownloadError::Transport {
            url: self.url.clone(),
            source: Box::new(source),
        })?;
        let worker_file = named.reopen().map_err(|source| DownloadError::Transport {
            url: self.url.clone(),
            source: Box::new(source),
        })?;

        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(
                inner.status,
                Status::Starting,
                "Download::start called more than once"
            );
            inner.sink = Some(named);
            inner.status = Status::Fetching;
        }

        let (done_tx, done_rx) = flume::bounded(1);
        self.queue.push(Request {
            requested_url: self.url.clone(),
            location: self.url.clone(),
            modified_since: self.modified_since.clone(),
            sink: worker_file,
            abort_flag: self.abort_flag.clone(),
            done_tx,
        });

        let handle = self.clone();
        tokio::spawn(async move {
            if let Ok(event) = done_rx.recv_async().await {
                handle.on_done(event);
            }
        });

        Ok(())
    }

    /// Applies the worker's completion event. A no-op if the download has
    /// already reached a terminal state, which happens when a direct
    /// [`Download::abort`] races ahead of the worker's own event for the
    /// same request.
    fn on_done(&self, event: DoneEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != Status::Fetching {
            return;
        }

        if let Some(error) = event.error {
            inner.status = Status::Failed;
            inner.sink = None;
            drop(inner);
            self.blocker.trigger_err_arc(error);
            return;
        }

        if event.unmodified {
            inner.unmodified = true;
            inner.final_size = Some(0);
            inner.status = Status::Complete;
            drop(inner);
            self.blocker.trigger();
            return;
        }

        let bytes = event.bytes_written;
        if let Some(expected) = self.expected_size {
            if bytes != expected {
                inner.status = Status::Failed;
                inner.sink = None;
                drop(inner);
                self.blocker.trigger_err(DownloadError::SizeMismatch {
                    url: self.url.clone(),
                    expected,
                    actual: bytes,
                });
                return;
            }
        }

        // The sink is kept around (unlike the failure paths) so the caller
        // can still read the downloaded bytes back out after completion.
        inner.final_size = Some(bytes);
        inner.status = Status::Complete;
        drop(inner);
        self.blocker.trigger();
    }

    /// Aborts this download. While `Fetching`, flags the worker to stop at
    /// its next chunk boundary and asks the queue to drop the request if it
    /// hasn't started yet. While `Starting` (never dispatched), there's no
    /// worker or queue entry to stop, but the transition to `Failed` still
    /// happens and the blocker still fires, since nothing else is ever going
    /// to resolve it. Idempotent once `Complete` or `Failed`: the blocker has
    /// already fired and triggering it again would panic.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.status {
            Status::Fetching => {
                inner.aborted_by_user = true;
                inner.status = Status::Failed;
                inner.sink = None;
                drop(inner);

                self.abort_flag.store(true, Ordering::Release);
                self.queue.abort(&self.url);
                self.blocker.trigger_err(DownloadError::Aborted {
                    url: self.url.clone(),
                });
            }
            Status::Starting => {
                inner.aborted_by_user = true;
                inner.status = Status::Failed;
                inner.sink = None;
                drop(inner);

                self.blocker.trigger_err(DownloadError::Aborted {
                    url: self.url.clone(),
                });
            }
            Status::Complete | Status::Failed => {}
        }
    }

    /// `0` while `Starting`; `1` once the sink is gone (a terminal state);
    /// `None` if `expected_size` was never supplied; otherwise the ratio of
    /// bytes received so far to `expected_size`.
    pub fn progress_fraction(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        if inner.status == Status::Starting {
            return Some(0.0);
        }
        // A discarded sink (abort/error) or an unmodified 304 both mean
        // there's nothing further to receive.
        if inner.sink.is_none() || inner.unmodified {
            return Some(1.0);
        }
        let expected = self.expected_size?;
        let bytes = sink_len(&inner);
        Some(bytes as f64 / expected.max(1) as f64)
    }

    /// `0` while `Starting`; the live size of the temp sink while
    /// `Fetching`; the recorded final size afterwards.
    pub fn bytes_so_far(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.status {
            Status::Starting => 0,
            Status::Fetching => sink_len(&inner),
            Status::Complete | Status::Failed => inner.final_size.unwrap_or(0),
        }
    }
}

fn sink_len(inner: &Inner) -> u64 {
    inner
        .sink
        .as_ref()
        .and_then(|f| f.as_file().metadata().ok())
        .map(|m| m.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::EngineConfig;

    fn queue() -> Arc<RequestsQueue> {
        RequestsQueue::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn successful_download_transitions_to_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let url: Url = format!("{}/file", server.uri()).parse().unwrap();
        let download = Download::new(queue(), url, Some(10), None, None);
        assert_eq!(download.status(), Status::Starting);
        assert_eq!(download.progress_fraction(), Some(0.0));

        download.start().unwrap();
        assert_eq!(download.status(), Status::Fetching);

        download.blocker().wait().await;
        assert_eq!(download.status(), Status::Complete);
        assert!(download.blocker().check().is_ok());
        assert_eq!(download.bytes_so_far(), 10);
        assert_eq!(download.progress_fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn size_mismatch_fails_with_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/short"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let url: Url = format!("{}/short", server.uri()).parse().unwrap();
        let download = Download::new(queue(), url, Some(100), None, None);
        download.start().unwrap();
        download.blocker().wait().await;

        assert_eq!(download.status(), Status::Failed);
        let error = download.blocker().check().unwrap_err();
        assert!(matches!(
            *error,
            DownloadError::SizeMismatch {
                expected: 100,
                actual: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn not_modified_response_marks_unmodified_with_zero_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let url: Url = format!("{}/cached", server.uri()).parse().unwrap();
        let download = Download::new(queue(), url, None, Some("Tue, 1 Jan".to_string()), None);
        download.start().unwrap();
        download.blocker().wait().await;

        assert_eq!(download.status(), Status::Complete);
        assert!(download.unmodified());
        assert_eq!(download.bytes_so_far(), 0);
    }

    #[tokio::test]
    async fn abort_mid_flight_triggers_aborted_error_promptly() {
        let server = MockServer::start().await;
        let body = vec![0u8; 4 * 1024 * 1024];
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let url: Url = format!("{}/big", server.uri()).parse().unwrap();
        let download = Download::new(queue(), url, None, None, None);
        download.start().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        download.abort();

        assert_eq!(download.status(), Status::Failed);
        let error = tokio::time::timeout(Duration::from_secs(1), async {
            download.blocker().wait().await;
            download.blocker().check().unwrap_err()
        })
        .await
        .expect("abort should resolve promptly");
        assert!(matches!(*error, DownloadError::Aborted { .. }));
    }

    #[tokio::test]
    async fn aborting_before_start_transitions_straight_to_failed() {
        let download = Download::new(
            queue(),
            "http://example.invalid/never-started".parse().unwrap(),
            None,
            None,
            None,
        );
        download.abort();
        assert_eq!(download.status(), Status::Failed);
        let error = download.blocker().check().unwrap_err();
        assert!(matches!(*error, DownloadError::Aborted { .. }));
    }

    #[tokio::test]
    async fn aborting_an_already_terminal_download_is_a_no_op() {
        let download = Download::new(
            queue(),
            "http://example.invalid/never-started".parse().unwrap(),
            None,
            None,
            None,
        );
        download.abort();
        assert_eq!(download.status(), Status::Failed);

        // A second abort must not re-trigger the blocker (which would panic).
        download.abort();
        assert_eq!(download.status(), Status::Failed);
    }

    #[tokio::test]
    async fn hint_is_carried_through_unchanged() {
        let download = Download::new(
            queue(),
            "http://example.invalid/x".parse().unwrap(),
            None,
            None,
            Some("sha256new=deadbeef".to_string()),
        );
        assert_eq!(download.hint(), Some("sha256new=deadbeef"));
    }
}
