use serde::{Deserialize, Serialize};

/// Response header carrying the commit a served archive was taken at.
pub const COMMIT_HEADER: &str = "X-Commit";
/// Response header carrying the branch that was resolved for the request.
pub const BRANCH_HEADER: &str = "X-Branch";
/// `hit` when the snapshot was served from cache, `miss` when downloaded.
pub const CACHE_HEADER: &str = "X-Cache";

/// One entry of a `/dir/list` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the namespace root, `/`-separated
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// `POST /branch/switch` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchBranchRequest {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// `POST /branch/switch` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchBranchResult {
    pub repo: String,
    pub branch: String,
    pub commit: Option<String>,
    pub downloaded: bool,
}

/// `GET /status` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    pub cache_root: String,
    pub layout: String,
    /// Keys currently known to the lock registry
    pub locks: usize,
}

/// Body of every non-2xx JSON response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.into(),
        }
    }
}
