//! Test doubles: a throwaway HTTP server and a scripted upstream.

use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use zip::write::SimpleFileOptions;

use crate::cancel::Cancel;
use crate::types::{Branch, RepoKey};
use crate::upstream::{MirrorRemote, Upstream, UpstreamError};

/// A request as seen by [`StubServer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

pub struct StubResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }
}

/// An HTTP server on an ephemeral port answering every request with `handler`.
pub struct StubServer {
    base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StubServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> StubResponse + Send + 'static,
    {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&requests);
        let stopped = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !stopped.load(Ordering::SeqCst) {
                let mut request = match server.recv_timeout(Duration::from_millis(20)) {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let _ = io::copy(request.as_reader(), &mut io::sink());
                let recorded = Recorded {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    headers: request
                        .headers()
                        .iter()
                        .map(|h| (h.field.as_str().as_str().to_string(), h.value.as_str().to_string()))
                        .collect(),
                };
                seen.lock().unwrap().push(recorded.clone());

                let reply = handler(&recorded);
                let response =
                    tiny_http::Response::from_data(reply.body).with_status_code(reply.status);
                let _ = request.respond(response);
            }
        });

        Self {
            base: format!("http://127.0.0.1:{}", port),
            requests,
            stop,
            thread: Some(thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Build a GitHub-style archive: everything under `<repo>-<branch>/`, with
/// the commit SHA as the archive comment.
pub fn github_archive(top: &str, files: &[(&str, &[u8])], sha: Option<&str>) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .add_directory(format!("{}/", top), SimpleFileOptions::default())
        .unwrap();
    for (name, contents) in files {
        writer
            .start_file(format!("{}/{}", top, name), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    if let Some(sha) = sha {
        writer.set_comment(sha.to_string());
    }
    writer.finish().unwrap().into_inner()
}

/// Scripted [`Upstream`] with call counters.
pub struct FakeUpstream {
    pub default_branch: String,
    /// Branch name to head SHA. Branches missing here are unknown upstream.
    pub heads: Mutex<HashMap<String, String>>,
    /// Override the archive body (e.g. with garbage).
    pub archive_override: Mutex<Option<Vec<u8>>>,
    pub remote_url: Mutex<String>,
    pub repo_missing: AtomicBool,
    /// Answer 404 to requests without a token, like GitHub does for private repos.
    pub private: AtomicBool,
    pub sha_unavailable: AtomicBool,
    pub download_fails: AtomicBool,
    pub download_delay: Duration,
    pub metadata_calls: AtomicUsize,
    pub sha_calls: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl FakeUpstream {
    pub fn new(default_branch: &str, sha: &str) -> Self {
        let mut heads = HashMap::new();
        heads.insert(default_branch.to_string(), sha.to_string());
        Self {
            default_branch: default_branch.to_string(),
            heads: Mutex::new(heads),
            archive_override: Mutex::new(None),
            remote_url: Mutex::new(String::new()),
            repo_missing: AtomicBool::new(false),
            private: AtomicBool::new(false),
            sha_unavailable: AtomicBool::new(false),
            download_fails: AtomicBool::new(false),
            download_delay: Duration::ZERO,
            metadata_calls: AtomicUsize::new(0),
            sha_calls: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn set_head(&self, branch: &str, sha: &str) {
        self.heads
            .lock()
            .unwrap()
            .insert(branch.to_string(), sha.to_string());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn hidden_from(&self, token: Option<&str>) -> bool {
        token.is_none() && self.private.load(Ordering::SeqCst)
    }

    fn head(&self, branch: &Branch) -> Option<String> {
        self.heads.lock().unwrap().get(branch.as_str()).cloned()
    }
}

impl Upstream for FakeUpstream {
    fn default_branch(
        &self,
        key: &RepoKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Branch, UpstreamError> {
        cancel.check()?;
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.repo_missing.load(Ordering::SeqCst) || self.hidden_from(token) {
            return Err(UpstreamError::NotFound(key.to_string()));
        }
        self.default_branch
            .parse()
            .map_err(|_| UpstreamError::Invalid(self.default_branch.clone()))
    }

    fn branch_sha(
        &self,
        key: &RepoKey,
        branch: &Branch,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<String, UpstreamError> {
        cancel.check()?;
        self.sha_calls.fetch_add(1, Ordering::SeqCst);
        if self.sha_unavailable.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".into()));
        }
        if self.hidden_from(token) {
            return Err(UpstreamError::NotFound(key.to_string()));
        }
        self.head(branch)
            .ok_or_else(|| UpstreamError::NotFound(format!("{}@{}", key, branch)))
    }

    fn download_archive(
        &self,
        key: &RepoKey,
        branch: &Branch,
        _token: Option<&str>,
        out: &mut dyn Write,
        cancel: &Cancel,
    ) -> Result<u64, UpstreamError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if !self.download_delay.is_zero() {
            cancel.sleep(self.download_delay)?;
        }
        cancel.check()?;
        if self.download_fails.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        let body = match self.archive_override.lock().unwrap().clone() {
            Some(body) => body,
            None => {
                let sha = self.head(branch);
                let top = format!("{}-{}", key.repo, branch.file_stem());
                let readme = format!("{}@{}", branch, sha.as_deref().unwrap_or("unknown"));
                github_archive(
                    &top,
                    &[("README.md", readme.as_bytes()), ("src/lib.rs", b"pub fn demo() {}")],
                    sha.as_deref(),
                )
            }
        };
        out.write_all(&body)?;
        Ok(body.len() as u64)
    }

    fn mirror_remote(&self, _key: &RepoKey, token: Option<&str>) -> MirrorRemote {
        MirrorRemote {
            url: self.remote_url.lock().unwrap().clone(),
            token: token.map(str::to_string),
        }
    }
}
