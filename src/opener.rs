//! The HTTP opener: issues one GET and interprets the response per the
//! wire-behavior spec (redirects, conditional GET, chunked streaming).

use std::io::{Read, Write};
use std::sync::atomic::Ordering;

use url::Url;

use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::pool::Connection;
use crate::queue::Request;

/// Redirect status codes that are followed, per the wire-behavior spec.
const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

/// The result of one opener invocation.
pub enum Outcome {
    /// The server asked us to follow a redirect to `new_location`.
    Redirect(Url),
    /// The request finished without a redirect.
    Complete {
        /// True iff the server replied 304 Not Modified.
        unmodified: bool,
        /// Bytes written to the sink (0 for a 304).
        bytes_written: u64,
    },
}

/// Runs one GET over a pooled keep-alive connection.
pub fn run_keepalive(
    connection: &Connection,
    request: &mut Request,
    config: &EngineConfig,
) -> Result<Outcome, DownloadError> {
    let response = build_request(connection.client(), request).send().map_err(|source| {
        transport_error(&request.requested_url, source)
    })?;
    handle_response(response, request, config)
}

/// Runs one GET with a throwaway client, used when the scheme or connection
/// state rules out pooling.
pub fn run_generic(request: &mut Request, config: &EngineConfig) -> Result<Outcome, DownloadError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(config.user_agent.clone())
        .read_timeout(config.read_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("building the fallback HTTP client should never fail");
    let response = build_request(&client, request)
        .send()
        .map_err(|source| transport_error(&request.requested_url, source))?;
    handle_response(response, request, config)
}

fn build_request(
    client: &reqwest::blocking::Client,
    request: &Request,
) -> reqwest::blocking::RequestBuilder {
    let mut builder = client
        .get(request.location.clone())
        .header(reqwest::header::CONNECTION, "keep-alive");
    if let Some(token) = &request.modified_since {
        builder = builder.header(reqwest::header::IF_MODIFIED_SINCE, token.clone());
    }
    builder
}

fn handle_response(
    response: reqwest::blocking::Response,
    request: &mut Request,
    config: &EngineConfig,
) -> Result<Outcome, DownloadError> {
    let status = response.status();

    if REDIRECT_STATUSES.contains(&status.as_u16()) {
        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(new_url) = request.location.join(location) {
                return Ok(Outcome::Redirect(new_url));
            }
        }
        return Err(status_error(request, status.as_u16(), "redirect without a usable Location header"));
    }

    if status.as_u16() == 304 {
        return Ok(Outcome::Complete {
            unmodified: true,
            bytes_written: 0,
        });
    }

    if status.as_u16() == 200 {
        let bytes_written = stream_body(response, request, config)?;
        return Ok(Outcome::Complete {
            unmodified: false,
            bytes_written,
        });
    }

    Err(status_error(
        request,
        status.as_u16(),
        status.canonical_reason().unwrap_or("unexpected status"),
    ))
}

fn stream_body(
    mut response: reqwest::blocking::Response,
    request: &mut Request,
    config: &EngineConfig,
) -> Result<u64, DownloadError> {
    let mut buf = vec![0u8; config.chunk_size];
    let mut total = 0u64;

    loop {
        if request.abort_flag.load(Ordering::Acquire) {
            return Err(DownloadError::Aborted {
                url: request.requested_url.clone(),
            });
        }

        let n = response
            .read(&mut buf)
            .map_err(|source| transport_io_error(&request.requested_url, source))?;
        if n == 0 {
            break;
        }

        request
            .sink
            .write_all(&buf[..n])
            .map_err(|source| transport_io_error(&request.requested_url, source))?;
        total += n as u64;
    }

    request
        .sink
        .flush()
        .map_err(|source| transport_io_error(&request.requested_url, source))?;
    Ok(total)
}

fn status_error(request: &Request, status: u16, reason: &str) -> DownloadError {
    DownloadError::HttpStatus {
        url: request.requested_url.clone(),
        status,
        reason: reason.to_string(),
    }
}

fn transport_error(url: &Url, source: reqwest::Error) -> DownloadError {
    DownloadError::Transport {
        url: url.clone(),
        source: Box::new(source),
    }
}

fn transport_io_error(url: &Url, source: std::io::Error) -> DownloadError {
    DownloadError::Transport {
        url: url.clone(),
        source: Box::new(source),
    }
}
