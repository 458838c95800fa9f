//! Resilient downloads from a ghmirror server (or anything else speaking HTTP).
//!
//! Each attempt streams into a fresh temp file beside the destination, which is
//! renamed over it only once the body has been read completely. Transient
//! failures are retried with a linearly growing delay.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, select, tick};
use thiserror::Error;

use crate::cache::StagedFile;
use crate::cancel::{Cancel, Cancelled};
use crate::upstream::clip;

const USER_AGENT: &str = concat!("ghmirror/", env!("CARGO_PKG_VERSION"));
const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("body ended after {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },
    #[error("giving up after {attempts} attempts")]
    GaveUp {
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
}

impl From<Cancelled> for TransferError {
    fn from(_: Cancelled) -> Self {
        TransferError::Cancelled
    }
}

impl TransferError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            TransferError::Transport(_) | TransferError::Truncated { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
    /// How often to log progress. `None` disables the reporter.
    pub progress_interval: Option<Duration>,
    pub headers: Vec<(String, String)>,
    pub cancel: Cancel,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Duration::from_millis(500),
            progress_interval: Some(Duration::from_secs(2)),
            headers: Vec::new(),
            cancel: Cancel::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub attempts: u32,
    pub bytes: u64,
}

/// Download `url` to `dest`, retrying transient failures.
///
/// On failure `dest` is left exactly as it was.
pub fn download(url: &str, dest: &Path, opts: &TransferOptions) -> Result<TransferReport, TransferError> {
    let agent = ureq::AgentBuilder::new()
        .user_agent(USER_AGENT)
        .timeout_connect(CONNECT_TIMEOUT)
        .build();
    let attempts = opts.attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = opts.backoff * (attempt - 1);
            log::debug!("retrying {} in {:?}", url, delay);
            opts.cancel.sleep(delay)?;
        }
        opts.cancel.check()?;

        match attempt_once(&agent, url, dest, opts) {
            Ok(bytes) => {
                log::info!("downloaded {} ({}) in {} attempt(s)", url, format_bytes(bytes), attempt);
                return Ok(TransferReport { attempts: attempt, bytes });
            }
            Err(e) if e.is_retryable() => {
                log::warn!("attempt {}/{} for {} failed: {}", attempt, attempts, url, e);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(match last {
        Some(last) => TransferError::GaveUp {
            attempts,
            last: Box::new(last),
        },
        None => TransferError::Cancelled,
    })
}

fn attempt_once(
    agent: &ureq::Agent,
    url: &str,
    dest: &Path,
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    let mut request = agent.get(url);
    for (name, value) in &opts.headers {
        request = request.set(name, value);
    }
    if let Some(remaining) = opts.cancel.remaining() {
        request = request.timeout(remaining);
    }

    let response = match request.call() {
        Ok(response) => response,
        Err(ureq::Error::Status(status, response)) => {
            let message = clip(response.into_string().unwrap_or_default(), 512);
            return Err(TransferError::Status { status, message });
        }
        Err(ureq::Error::Transport(t)) => return Err(TransferError::Transport(t.to_string())),
    };
    let expected = response
        .header("Content-Length")
        .and_then(|v| v.trim().parse::<u64>().ok());

    let mut staged = StagedFile::create(dest)?;
    let progress = ProgressReporter::start(url, expected, opts.progress_interval);
    let mut reader = response.into_reader();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        opts.cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Transport(e.to_string())),
        };
        staged.write_all(&buf[..n])?;
        written += n as u64;
        progress.add(n as u64);
    }
    progress.finish();

    if let Some(expected) = expected {
        if written != expected {
            return Err(TransferError::Truncated {
                got: written,
                expected,
            });
        }
    }
    staged.persist()?;
    Ok(written)
}

/// Logs transfer progress from its own thread at a fixed interval.
struct ProgressReporter {
    bytes: Arc<AtomicU64>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    fn start(label: &str, total: Option<u64>, interval: Option<Duration>) -> Self {
        let bytes = Arc::new(AtomicU64::new(0));
        let Some(interval) = interval else {
            return Self {
                bytes,
                stop: None,
                thread: None,
            };
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let counter = Arc::clone(&bytes);
        let label = label.to_string();
        let thread = thread::Builder::new()
            .name("ghmirror-progress".to_string())
            .spawn(move || {
                let started = Instant::now();
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => return,
                        recv(ticker) -> _ => {
                            let done = counter.load(Ordering::Relaxed);
                            log::info!("{}: {}", label, describe_progress(done, total, started.elapsed()));
                        }
                    }
                }
            })
            .expect("failed to spawn progress thread");

        Self {
            bytes,
            stop: Some(stop_tx),
            thread: Some(thread),
        }
    }

    fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn finish(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// `"1.5M of 3.0M (50%) at 768.0K/s"`, or without the total when unknown.
pub fn describe_progress(bytes: u64, total: Option<u64>, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { (bytes as f64 / secs) as u64 } else { 0 };
    match total {
        Some(total) if total > 0 => format!(
            "{} of {} ({}%) at {}/s",
            format_bytes(bytes),
            format_bytes(total),
            bytes.saturating_mul(100) / total,
            format_bytes(rate)
        ),
        _ => format!("{} at {}/s", format_bytes(bytes), format_bytes(rate)),
    }
}

/// Format bytes as human-readable size.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubResponse, StubServer};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn quick() -> TransferOptions {
        TransferOptions {
            attempts: 3,
            backoff: Duration::from_millis(10),
            progress_interval: Some(Duration::from_millis(5)),
            ..TransferOptions::default()
        }
    }

    #[test]
    fn retries_after_bad_gateway() {
        let calls = AtomicUsize::new(0);
        let server = StubServer::start(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                StubResponse::status(502, b"bad gateway".to_vec())
            } else {
                StubResponse::ok(b"archive bytes".to_vec())
            }
        });
        let dir = tempdir().unwrap();
        let dest = dir.path().join("main.zip");

        let report = download(&server.url("/download?repo=octo/demo"), &dest, &quick()).unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.bytes, 13);
        assert_eq!(server.hits(), 2);
        assert_eq!(fs::read(&dest).unwrap(), b"archive bytes");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let server = StubServer::start(|_| StubResponse::status(404, b"no such repo".to_vec()));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("main.zip");
        fs::write(&dest, b"previous").unwrap();

        let err = download(&server.url("/download"), &dest, &quick()).unwrap_err();
        assert!(matches!(err, TransferError::Status { status: 404, .. }));
        assert_eq!(server.hits(), 1);
        assert_eq!(fs::read(&dest).unwrap(), b"previous");
    }

    #[test]
    fn gives_up_after_attempt_budget() {
        let server = StubServer::start(|_| StubResponse::status(503, Vec::new()));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("main.zip");

        let err = download(&server.url("/download"), &dest, &quick()).unwrap_err();
        match err {
            TransferError::GaveUp { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TransferError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.hits(), 3);
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn forwards_headers() {
        let server = StubServer::start(|_| StubResponse::ok(b"ok".to_vec()));
        let dir = tempdir().unwrap();
        let mut opts = quick();
        opts.headers.push(("X-User".into(), "alice".into()));

        download(&server.url("/download"), &dir.path().join("out"), &opts).unwrap();
        assert_eq!(server.requests()[0].header("x-user").as_deref(), Some("alice"));
    }

    #[test]
    fn cancelled_before_start() {
        let server = StubServer::start(|_| StubResponse::ok(Vec::new()));
        let dir = tempdir().unwrap();
        let opts = quick();
        opts.cancel.cancel();

        let err = download(&server.url("/"), &dir.path().join("out"), &opts).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(server.hits(), 0);
    }

    #[test]
    fn progress_descriptions() {
        assert_eq!(
            describe_progress(1536, Some(3072), Duration::from_secs(2)),
            "1.5K of 3.0K (50%) at 768B/s"
        );
        assert_eq!(
            describe_progress(2 * 1024 * 1024, None, Duration::from_secs(1)),
            "2.0M at 2.0M/s"
        );
        assert_eq!(describe_progress(0, Some(0), Duration::ZERO), "0B at 0B/s");
    }
}
