//! Runtime configuration and the reference constants.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of sessions that may hold an admission slot at once.
pub const MAX_CONCURRENT_USERS: usize = 1;

/// Lifetime of a verification code (5 minutes).
pub const CODE_TTL_MS: u64 = 5 * 60_000;

/// Delay between a confirmed privileged action and its script launch.
pub const SCRIPT_DELAY_MS: u64 = 5_000;

/// Wall-clock limit for a terminal command.
pub const COMMAND_TIMEOUT_MS: u64 = 30_000;

/// How often expired verification codes are swept from the store.
pub const CODE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Directory name prefixes that mark a sibling directory as a project.
pub const PROJECT_PREFIXES: &[&str] = &["Module.", "Web."];

/// Path components excluded from project listings.
pub const ARTIFACT_MARKERS: &[&str] = &["build", "obj"];

pub const DEFAULT_PAGE: &str = "home.html";
pub const DEFAULT_MODULE_NAME: &str = "MainWeb";

/// Everything the service needs to know at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Terminal sandbox root and project discovery directory.
    pub workspace: PathBuf,
    /// Root for static file loading, relative to the process directory by default.
    pub static_dir: PathBuf,
    /// Directory holding `restart`/`close` scripts.
    pub scripts_dir: PathBuf,
    pub max_users: usize,
    pub code_ttl: Duration,
    pub script_delay: Duration,
    pub command_timeout: Duration,
    /// Argument passed to privileged scripts.
    pub module_name: String,
}

impl Config {
    /// Reference configuration rooted at `workspace`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            static_dir: PathBuf::from("src"),
            scripts_dir: PathBuf::from("scripts"),
            workspace,
            max_users: MAX_CONCURRENT_USERS,
            code_ttl: Duration::from_millis(CODE_TTL_MS),
            script_delay: Duration::from_millis(SCRIPT_DELAY_MS),
            command_timeout: Duration::from_millis(COMMAND_TIMEOUT_MS),
            module_name: DEFAULT_MODULE_NAME.to_string(),
        }
    }
}

/// The parent of `cwd`, or `cwd` itself when it has none.
pub fn default_workspace(cwd: &Path) -> PathBuf {
    cwd.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}
