//! External reporting interface: errors and user-visible progress.

use url::Url;

use crate::error::DownloadError;

/// Collaborator that the driver reports recoverable errors and progress to.
/// Implemented by the embedding application; this crate only ever calls it.
pub trait Handler: Send + Sync {
    /// A feed or implementation fetch failed in a way that's recoverable —
    /// solving can continue with partial information, or the failure is
    /// otherwise not fatal to the overall task.
    fn report_error(&self, url: &Url, error: &DownloadError);

    /// Best-effort progress update for `url`; see
    /// [`Download::progress_fraction`](crate::download::Download::progress_fraction)
    /// for the fraction's semantics. The default implementation ignores it.
    fn report_progress(&self, _url: &Url, _fraction: Option<f64>) {}
}

/// Logs errors and progress via `tracing` instead of forwarding them
/// anywhere user-visible. A reasonable default for headless use.
#[derive(Debug, Default)]
pub struct TracingHandler;

impl Handler for TracingHandler {
    fn report_error(&self, url: &Url, error: &DownloadError) {
        tracing::warn!(%url, %error, "feed or implementation fetch failed");
    }

    fn report_progress(&self, url: &Url, fraction: Option<f64>) {
        tracing::trace!(%url, ?fraction, "download progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingHandler {
        pub errors: Mutex<Vec<(Url, String)>>,
    }

    impl Handler for RecordingHandler {
        fn report_error(&self, url: &Url, error: &DownloadError) {
            self.errors
                .lock()
                .unwrap()
                .push((url.clone(), error.to_string()));
        }
    }

    #[test]
    fn tracing_handler_does_not_panic() {
        let handler = TracingHandler;
        let url: Url = "http://example.com/feed.xml".parse().unwrap();
        handler.report_error(
            &url,
            &DownloadError::Aborted { url: url.clone() },
        );
        handler.report_progress(&url, Some(0.5));
    }

    #[test]
    fn recording_handler_captures_reported_errors() {
        let handler = RecordingHandler::default();
        let url: Url = "http://example.com/feed.xml".parse().unwrap();
        handler.report_error(&url, &DownloadError::Aborted { url: url.clone() });
        assert_eq!(handler.errors.lock().unwrap().len(), 1);
    }
}
