//! HTTP surface over the cache engine.
//!
//! A fixed pool of worker threads pulls requests off one `tiny_http` listener.
//! Every request gets its own [`Cancel`] with the configured deadline; the
//! janitor runs alongside and stops with the server.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, ResponseBox};

use crate::cache::{
    CacheError, CachePaths, EnsureRequest, ErrorKind, ExportRequest, Janitor, JanitorHandle,
    Namespace, RepoStore, Snapshot, temp_path_for,
};
use crate::cancel::Cancel;
use crate::config::Config;
use crate::protocol::{
    BRANCH_HEADER, CACHE_HEADER, COMMIT_HEADER, ErrorBody, StatusResult, SwitchBranchRequest,
    SwitchBranchResult,
};
use crate::types::{Branch, RepoKey, UserId};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_BODY: u64 = 64 * 1024;

/// A failed request, ready to be rendered as JSON.
#[derive(Debug)]
struct HttpError {
    status: u16,
    kind: &'static str,
    message: String,
}

impl HttpError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            kind: "bad_input",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            kind: "not_found",
            message: message.into(),
        }
    }
}

impl From<CacheError> for HttpError {
    fn from(e: CacheError) -> Self {
        let (status, kind) = match (&e, e.kind()) {
            (CacheError::NotEmpty(_), _) => (409, "not_empty"),
            (CacheError::LockFailed(_), _) => (503, "busy"),
            (_, ErrorKind::BadInput) => (400, "bad_input"),
            (_, ErrorKind::NotFound) => (404, "not_found"),
            (_, ErrorKind::Integrity) => (422, "integrity"),
            (_, ErrorKind::Unavailable) => (502, "unavailable"),
            (_, ErrorKind::Cancelled) => (408, "cancelled"),
            (_, ErrorKind::Internal) => (500, "internal"),
        };
        if status >= 500 {
            log::warn!("request failed: {}", e);
        }
        Self {
            status,
            kind,
            message: e.to_string(),
        }
    }
}

impl From<crate::types::ParseError> for HttpError {
    fn from(e: crate::types::ParseError) -> Self {
        HttpError::bad_request(e.to_string())
    }
}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(e).into()
    }
}

/// State shared by the request workers.
struct Context {
    store: Arc<dyn RepoStore>,
    config: Config,
    started: Instant,
}

/// A parsed request: path, query parameters and the headers we care about.
struct Incoming {
    method: Method,
    path: String,
    params: HashMap<String, String>,
    user: Option<String>,
    token: Option<String>,
}

impl Incoming {
    fn from_request(request: &Request) -> Self {
        let url = request.url();
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let header = |name: &str| {
            request
                .headers()
                .iter()
                .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str().trim().to_string())
        };
        let token = header("Authorization").and_then(|value| bearer_token(&value));

        Self {
            method: request.method().clone(),
            path: path.trim_end_matches('/').to_string(),
            params,
            user: header("X-User"),
            token,
        }
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.param(name), Some("1" | "true" | "yes"))
    }

    fn repo(&self) -> Result<RepoKey, HttpError> {
        let raw = self
            .param("repo")
            .ok_or_else(|| HttpError::bad_request("missing 'repo' parameter"))?;
        Ok(raw.parse()?)
    }

    fn branch(&self) -> Result<Option<Branch>, HttpError> {
        Ok(self.param("branch").map(str::parse).transpose()?)
    }

    /// Header wins over the query parameter; both fall back to the default user.
    fn user(&self, config: &Config) -> Result<UserId, HttpError> {
        let raw = self.user.as_deref().or_else(|| self.param("user"));
        Ok(UserId::sanitize(raw, &config.default_user)?)
    }

    fn token(&self, config: &Config) -> Option<String> {
        self.token.clone().or_else(|| config.default_token.clone())
    }
}

/// `Bearer <t>` or `token <t>`.
fn bearer_token(value: &str) -> Option<String> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    let known = scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token");
    (known && !token.is_empty()).then(|| token.to_string())
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn json_response<T: Serialize>(status: u16, body: &T) -> ResponseBox {
    let data = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::from_data(data).with_status_code(status);
    if let Some(h) = header("Content-Type", "application/json") {
        response.add_header(h);
    }
    response.boxed()
}

fn error_response(err: &HttpError) -> ResponseBox {
    json_response(err.status, &ErrorBody::new(err.kind, err.message.clone()))
}

/// Serve `file` as a zip attachment.
fn zip_response(file: File, filename: &str, headers: &[(&str, String)]) -> ResponseBox {
    let mut response = Response::from_file(file);
    let disposition = format!("attachment; filename=\"{}\"", filename);
    for (name, value) in [
        ("Content-Type", "application/zip"),
        ("Content-Disposition", disposition.as_str()),
    ]
    .into_iter()
    .chain(headers.iter().map(|(n, v)| (*n, v.as_str())))
    {
        if let Some(h) = header(name, value) {
            response.add_header(h);
        }
    }
    response.boxed()
}

/// Open a scratch file for streaming and unlink it; the handle keeps it alive.
fn open_scratch(path: &Path) -> io::Result<File> {
    let file = File::open(path)?;
    if let Err(e) = fs::remove_file(path) {
        log::debug!("could not unlink {}: {}", path.display(), e);
    }
    Ok(file)
}

fn scratch_path(paths: &CachePaths, name: &str) -> io::Result<PathBuf> {
    let dir = paths.tmp_dir();
    fs::create_dir_all(&dir)?;
    Ok(temp_path_for(&dir.join(name)))
}

fn route(ctx: &Context, req: &Incoming, body: &[u8]) -> Result<ResponseBox, HttpError> {
    match (&req.method, req.path.as_str()) {
        (Method::Get, "/download") => download(ctx, req),
        (Method::Get, "/download/sparse") => download_sparse(ctx, req),
        (Method::Post, "/branch/switch") => switch_branch(ctx, req, body),
        (Method::Get, "/dir/list") => list_dir(ctx, req),
        (Method::Delete, "/dir") => delete_dir(ctx, req),
        (Method::Get, "/status") => Ok(json_response(200, &status(ctx))),
        (Method::Get, "/healthz") => Ok(Response::from_string("ok").boxed()),
        (_, "/download" | "/download/sparse" | "/branch/switch" | "/dir/list" | "/dir" | "/status") => {
            Err(HttpError {
                status: 405,
                kind: "method_not_allowed",
                message: format!("{} not allowed on {}", req.method, req.path),
            })
        }
        _ => Err(HttpError::not_found(format!("no route for {}", req.path))),
    }
}

fn download(ctx: &Context, req: &Incoming) -> Result<ResponseBox, HttpError> {
    let ensure = EnsureRequest {
        user: req.user(&ctx.config)?,
        repo: req.repo()?,
        branch: req.branch()?,
        token: req.token(&ctx.config),
        force: req.flag("force"),
    };
    let cancel = Cancel::with_timeout(ctx.config.request_timeout);
    let (snapshot, file) = ctx.store.open_snapshot(&ensure, &cancel)?;
    let filename = format!("{}-{}.zip", ensure.repo.repo, snapshot.branch.file_stem());
    Ok(zip_response(file, &filename, &snapshot_headers(&snapshot)))
}

fn snapshot_headers(snapshot: &Snapshot) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (BRANCH_HEADER, snapshot.branch.to_string()),
        (
            CACHE_HEADER,
            if snapshot.downloaded { "miss" } else { "hit" }.to_string(),
        ),
    ];
    if let Some(commit) = &snapshot.commit {
        headers.push((COMMIT_HEADER, commit.clone()));
    }
    headers
}

fn download_sparse(ctx: &Context, req: &Incoming) -> Result<ResponseBox, HttpError> {
    let export = ExportRequest {
        repo: req.repo()?,
        branch: req.branch()?,
        paths: req
            .param("paths")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        token: req.token(&ctx.config),
    };
    let cancel = Cancel::with_timeout(ctx.config.request_timeout);
    let scratch = scratch_path(ctx.store.paths(), "sparse.zip")?;
    let summary = ctx.store.export_sparse_zip(&export, &scratch, &cancel)?;
    let file = open_scratch(&scratch)?;

    let filename = format!("{}-sparse.zip", export.repo.repo);
    let headers = [
        (COMMIT_HEADER, summary.commit.clone()),
        (BRANCH_HEADER, summary.branch.clone()),
    ];
    Ok(zip_response(file, &filename, &headers))
}

fn switch_branch(ctx: &Context, req: &Incoming, body: &[u8]) -> Result<ResponseBox, HttpError> {
    let switch: SwitchBranchRequest = serde_json::from_slice(body)
        .map_err(|e| HttpError::bad_request(format!("invalid JSON body: {}", e)))?;
    let ensure = EnsureRequest {
        user: req.user(&ctx.config)?,
        repo: switch.repo.parse()?,
        branch: switch
            .branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .map(str::parse)
            .transpose()?,
        token: req.token(&ctx.config),
        force: switch.force,
    };
    let cancel = Cancel::with_timeout(ctx.config.request_timeout);
    let snapshot = ctx.store.ensure_repo(&ensure, &cancel)?;

    Ok(json_response(
        200,
        &SwitchBranchResult {
            repo: ensure.repo.to_string(),
            branch: snapshot.branch.to_string(),
            commit: snapshot.commit,
            downloaded: snapshot.downloaded,
        },
    ))
}

fn namespace(ctx: &Context, req: &Incoming) -> Result<Namespace, HttpError> {
    match req.param("scope") {
        None | Some("user") => Ok(Namespace::User(req.user(&ctx.config)?)),
        Some("mirrors") => Ok(Namespace::Mirrors),
        Some(other) => Err(HttpError::bad_request(format!("unknown scope '{}'", other))),
    }
}

fn list_dir(ctx: &Context, req: &Incoming) -> Result<ResponseBox, HttpError> {
    let ns = namespace(ctx, req)?;
    let entries = ctx.store.list(&ns, req.param("path").unwrap_or(""))?;
    Ok(json_response(200, &entries))
}

fn delete_dir(ctx: &Context, req: &Incoming) -> Result<ResponseBox, HttpError> {
    let ns = namespace(ctx, req)?;
    let path = req
        .param("path")
        .ok_or_else(|| HttpError::bad_request("missing 'path' parameter"))?;
    ctx.store.delete(&ns, path, req.flag("recursive"))?;
    Ok(Response::empty(204).boxed())
}

fn status(ctx: &Context) -> StatusResult {
    StatusResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
        uptime_secs: ctx.started.elapsed().as_secs(),
        cache_root: ctx.store.paths().root().display().to_string(),
        layout: ctx.store.layout().to_string(),
        locks: ctx.store.lock_count(),
    }
}

/// Handle a single request and write the response.
fn handle(ctx: &Context, mut request: Request) {
    let started = Instant::now();
    let incoming = Incoming::from_request(&request);

    let mut body = Vec::new();
    let read = request
        .as_reader()
        .take(MAX_BODY)
        .read_to_end(&mut body);
    let result = match read {
        Ok(_) => route(ctx, &incoming, &body),
        Err(e) => Err(HttpError::bad_request(format!("unreadable body: {}", e))),
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };
    let status = response.status_code().0;
    log::info!(
        "{} {} -> {} in {}ms",
        incoming.method,
        incoming.path,
        status,
        started.elapsed().as_millis()
    );
    if let Err(e) = request.respond(response) {
        log::debug!("client went away: {}", e);
    }
}

/// Handle for the running server: its workers and the janitor.
pub struct ServerHandle {
    addr: SocketAddr,
    http: Arc<tiny_http::Server>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    janitor: Option<JanitorHandle>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests, wait for in-flight ones, stop the janitor.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.http.unblock();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(mut janitor) = self.janitor.take() {
            janitor.shutdown();
            log::info!("Server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind `config.listen` and start serving `store`.
pub fn start(config: &Config, store: Arc<dyn RepoStore>) -> io::Result<ServerHandle> {
    // Scratch files from a previous run are unreferenced by now.
    let tmp = store.paths().tmp_dir();
    match fs::remove_dir_all(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("could not clear {}: {}", tmp.display(), e),
    }
    fs::create_dir_all(&tmp)?;

    let http = tiny_http::Server::http(config.listen.as_str()).map_err(io::Error::other)?;
    let addr = http
        .server_addr()
        .to_ip()
        .ok_or_else(|| io::Error::other("listener has no IP address"))?;
    let http = Arc::new(http);
    log::info!(
        "Listening on http://{} (cache {}, layout {})",
        addr,
        store.paths().root().display(),
        store.layout()
    );

    let ctx = Arc::new(Context {
        store: Arc::clone(&store),
        config: config.clone(),
        started: Instant::now(),
    });
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::with_capacity(config.workers);
    for i in 0..config.workers.max(1) {
        let http = Arc::clone(&http);
        let ctx = Arc::clone(&ctx);
        let shutdown = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name(format!("ghmirror-http-{}", i))
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match http.recv_timeout(POLL_INTERVAL) {
                        Ok(Some(request)) => handle(&ctx, request),
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn http worker thread");
        workers.push(worker);
    }

    let janitor = Janitor::spawn(store, config.ttl, config.sweep_interval);

    Ok(ServerHandle {
        addr,
        http,
        shutdown,
        workers,
        janitor: Some(janitor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fixtures::{SourceRepo, require_git};
    use crate::cache::open_store_with;
    use crate::config::Layout;
    use crate::protocol::DirEntry;
    use crate::testing::FakeUpstream;
    use crate::upstream::Upstream;
    use std::io::Cursor;
    use tempfile::{TempDir, tempdir};

    const SHA: &str = "dddddddddddddddddddddddddddddddddddddddd";

    struct Harness {
        dir: TempDir,
        upstream: Arc<FakeUpstream>,
        server: ServerHandle,
    }

    impl Harness {
        fn start(layout: Layout) -> Self {
            let dir = tempdir().unwrap();
            let upstream = Arc::new(FakeUpstream::new("main", SHA));
            let config = Config {
                listen: "127.0.0.1:0".to_string(),
                cache_dir: dir.path().join("cache"),
                layout,
                workers: 2,
                sweep_interval: Duration::from_secs(3600),
                ..Config::default()
            };
            let shared: Arc<dyn Upstream> = upstream.clone();
            let server = start(&config, open_store_with(&config, shared)).unwrap();
            Self {
                dir,
                upstream,
                server,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.server.addr(), path)
        }

        fn cache(&self, rel: &str) -> PathBuf {
            self.dir.path().join("cache").join(rel)
        }
    }

    fn send(request: ureq::Request) -> ureq::Response {
        match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => panic!("transport error: {e}"),
        }
    }

    fn send_json(request: ureq::Request, body: &str) -> ureq::Response {
        match request
            .set("Content-Type", "application/json")
            .send_string(body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => panic!("transport error: {e}"),
        }
    }

    fn zip_names(response: ureq::Response) -> Vec<String> {
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body).unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn download_then_serve_from_cache() {
        let h = Harness::start(Layout::Zip);

        let first = send(ureq::get(&h.url("/download?repo=octo/demo&branch=main")));
        assert_eq!(first.status(), 200);
        assert_eq!(first.header(COMMIT_HEADER), Some(SHA));
        assert_eq!(first.header(CACHE_HEADER), Some("miss"));
        assert!(zip_names(first).contains(&"demo-main/README.md".to_string()));
        assert!(h.cache("users/default/repos/octo/demo/main.zip").is_file());

        let second = send(ureq::get(&h.url("/download?repo=octo/demo&branch=main")));
        assert_eq!(second.status(), 200);
        assert_eq!(second.header(CACHE_HEADER), Some("hit"));
        assert_eq!(second.header(COMMIT_HEADER), Some(SHA));
        assert_eq!(h.upstream.downloads(), 1);
    }

    #[test]
    fn download_resolves_default_branch_per_user() {
        let h = Harness::start(Layout::Zip);

        let response = send(ureq::get(&h.url("/download?repo=octo/demo")).set("X-User", "alice"));
        assert_eq!(response.status(), 200);
        assert_eq!(response.header(BRANCH_HEADER), Some("main"));
        assert!(h.cache("users/alice/repos/octo/demo/main.zip").is_file());

        let response = send(ureq::get(&h.url("/download?repo=octo/demo&user=../bob")));
        assert_eq!(response.status(), 200);
        assert!(h.cache("users/..bob/repos/octo/demo/main.zip").is_file());
    }

    #[test]
    fn download_rejects_bad_input() {
        let h = Harness::start(Layout::Zip);

        assert_eq!(send(ureq::get(&h.url("/download"))).status(), 400);
        assert_eq!(send(ureq::get(&h.url("/download?repo=nope"))).status(), 400);
        assert_eq!(
            send(ureq::get(&h.url("/download?repo=octo/demo&branch=a..b"))).status(),
            400
        );
        let missing = send(ureq::get(&h.url("/download?repo=octo/demo&branch=gone")));
        assert_eq!(missing.status(), 404);
        let body: ErrorBody = serde_json::from_str(&missing.into_string().unwrap()).unwrap();
        assert_eq!(body.kind, "not_found");
        assert_eq!(h.upstream.downloads(), 0);
    }

    #[test]
    fn dir_layout_streams_zipped_tree() {
        let h = Harness::start(Layout::Dir);

        let response = send(ureq::get(&h.url("/download?repo=octo/demo&branch=main")));
        assert_eq!(response.status(), 200);
        assert_eq!(zip_names(response), vec!["README.md", "src/lib.rs"]);
        assert!(h.cache("users/default/repos/octo/demo/main/README.md").is_file());
        // The scratch zip is unlinked once opened.
        assert_eq!(fs::read_dir(h.cache("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn switch_branch_prepopulates() {
        let h = Harness::start(Layout::Zip);
        h.upstream.set_head("dev", SHA);

        let response = send_json(
            ureq::post(&h.url("/branch/switch")),
            r#"{"repo":"octo/demo","branch":"dev"}"#,
        );
        assert_eq!(response.status(), 200);
        let result: SwitchBranchResult = serde_json::from_str(&response.into_string().unwrap()).unwrap();
        assert_eq!(result.branch, "dev");
        assert_eq!(result.commit.as_deref(), Some(SHA));
        assert!(result.downloaded);
        assert!(h.cache("users/default/repos/octo/demo/dev.zip").is_file());

        let response = send_json(ureq::post(&h.url("/branch/switch")), "not json");
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn list_and_delete() {
        let h = Harness::start(Layout::Zip);
        send(ureq::get(&h.url("/download?repo=octo/demo&branch=main")));

        let response = send(ureq::get(&h.url("/dir/list?path=repos/octo/demo")));
        assert_eq!(response.status(), 200);
        let entries: Vec<DirEntry> = serde_json::from_str(&response.into_string().unwrap()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["main.sha", "main.zip"]);

        for bad in ["..", "/etc", "./..", "repos/../../x"] {
            let url = h.url(&format!("/dir/list?path={}", bad));
            assert_eq!(send(ureq::get(&url)).status(), 400, "list {bad}");
            let url = h.url(&format!("/dir?path={}&recursive=1", bad));
            assert_eq!(send(ureq::delete(&url)).status(), 400, "delete {bad}");
        }

        let response = send(ureq::delete(&h.url("/dir?path=repos/octo")));
        assert_eq!(response.status(), 409);
        let response = send(ureq::delete(&h.url("/dir?path=repos/octo&recursive=true")));
        assert_eq!(response.status(), 204);
        assert!(!h.cache("users/default/repos/octo").exists());

        let response = send(ureq::get(&h.url("/dir/list?path=.")));
        let entries: Vec<DirEntry> = serde_json::from_str(&response.into_string().unwrap()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn status_health_and_unknown_routes() {
        let h = Harness::start(Layout::Dir);

        let response = send(ureq::get(&h.url("/status")));
        assert_eq!(response.status(), 200);
        let status: StatusResult = serde_json::from_str(&response.into_string().unwrap()).unwrap();
        assert_eq!(status.layout, "dir");
        assert_eq!(status.pid, std::process::id());

        assert_eq!(send(ureq::get(&h.url("/healthz"))).into_string().unwrap(), "ok");
        assert_eq!(send(ureq::get(&h.url("/nope"))).status(), 404);
        assert_eq!(send(ureq::post(&h.url("/download"))).status(), 405);
    }

    #[test]
    fn sparse_download_exports_prefixes() {
        if !require_git() {
            return;
        }
        let h = Harness::start(Layout::Zip);
        let source = SourceRepo::create(&h.dir.path().join("source"));
        let commit = source.commit(
            &[
                ("src/lib.rs", b"pub fn demo() {}"),
                ("docs/guide.md", b"# Guide"),
                ("tests/it.rs", b"#[test] fn it() {}"),
            ],
            "initial",
        );
        *h.upstream.remote_url.lock().unwrap() = source.url();

        let response = send(ureq::get(&h.url("/download/sparse?repo=octo/demo&paths=src,docs")));
        assert_eq!(response.status(), 200);
        let commit = commit.to_string();
        assert_eq!(response.header(COMMIT_HEADER), Some(commit.as_str()));
        assert_eq!(zip_names(response), vec!["docs/guide.md", "src/lib.rs"]);
        assert!(h.cache("git-cache/octo/demo.git").is_dir());

        let response = send(ureq::get(&h.url("/download/sparse?repo=octo/demo&paths=../x")));
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut h = Harness::start(Layout::Zip);
        let started = Instant::now();
        h.server.shutdown();
        h.server.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn bearer_tokens() {
        assert_eq!(bearer_token("Bearer abc").as_deref(), Some("abc"));
        assert_eq!(bearer_token("token abc").as_deref(), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
