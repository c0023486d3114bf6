//! Privileged host actions and their deferred script execution.
//!
//! A privileged action needs two round trips: the client first obtains a
//! verification code for the action, then presents it to confirm. Confirmed
//! actions launch their script after a fixed delay, in a background task
//! whose outcome only reaches the log.

use crate::codes::CodeStore;
use crate::error::{Result, ServiceError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegedAction {
    Restart,
    Close,
}

impl PrivilegedAction {
    /// Script file implementing this action on the current platform.
    pub fn script_name(self) -> &'static str {
        match (self, cfg!(windows)) {
            (Self::Restart, true) => "restart.bat",
            (Self::Restart, false) => "restart.sh",
            (Self::Close, true) => "close.bat",
            (Self::Close, false) => "close.sh",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for PrivilegedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivilegedAction {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "close" => Ok(Self::Close),
            _ => Err(ServiceError::UnknownAction(s.to_string())),
        }
    }
}

/// Launches action scripts after a delay.
#[derive(Debug, Clone)]
pub struct ScriptScheduler {
    scripts_dir: PathBuf,
    delay: Duration,
    module_name: String,
}

impl ScriptScheduler {
    pub fn new(
        scripts_dir: impl Into<PathBuf>,
        delay: Duration,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            delay,
            module_name: module_name.into(),
        }
    }

    pub fn script_path(&self, action: PrivilegedAction) -> PathBuf {
        self.scripts_dir.join(action.script_name())
    }

    /// The script for `action`, provided it exists on disk.
    pub fn existing_script(&self, action: PrivilegedAction) -> Result<PathBuf> {
        let path = self.script_path(action);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ServiceError::ScriptNotFound(action.to_string()))
        }
    }

    /// Schedule the script for `action` and return immediately.
    ///
    /// The returned handle completes once the script has been launched and
    /// has exited; callers serving a request simply drop it.
    pub fn schedule(&self, action: PrivilegedAction) -> Result<JoinHandle<()>> {
        let script = self.existing_script(action)?;
        let script = std::fs::canonicalize(&script)
            .map_err(|e| ServiceError::io(format!("resolve script {}", script.display()), e))?;
        let delay = self.delay;
        let module_name = self.module_name.clone();
        info!(
            %action,
            script = %script.display(),
            delay_ms = delay.as_millis() as u64,
            "Script scheduled"
        );

        Ok(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_script(&script, &module_name).await;
        }))
    }
}

async fn run_script(script: &Path, module_name: &str) {
    let mut child = match script_command(script, module_name).spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(script = %script.display(), "Execute script failed: {}", e);
            return;
        }
    };
    info!(script = %script.display(), pid = ?child.id(), "Script executed");
    match child.wait().await {
        Ok(status) => debug!(script = %script.display(), ?status, "Script exited"),
        Err(e) => error!(script = %script.display(), "Waiting for script failed: {}", e),
    }
}

fn script_command(script: &Path, module_name: &str) -> Command {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd.exe");
        command.arg("/C").arg(script);
        command
    } else {
        let mut command = Command::new("/bin/bash");
        command.arg(script);
        command
    };
    command
        .arg(module_name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // Own process group, so the script outlives a server it stops.
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Issues and consumes verification codes for privileged actions.
#[derive(Debug, Clone)]
pub struct PrivilegedActions {
    codes: Arc<CodeStore>,
    scheduler: ScriptScheduler,
}

impl PrivilegedActions {
    pub fn new(codes: Arc<CodeStore>, scheduler: ScriptScheduler) -> Self {
        Self { codes, scheduler }
    }

    pub fn codes(&self) -> &Arc<CodeStore> {
        &self.codes
    }

    /// Issue a code for `action`. No code is created unless the action's
    /// script exists on this host.
    pub fn issue(&self, action: &str) -> Result<String> {
        if action.is_empty() {
            return Err(ServiceError::validation("missing action"));
        }
        let action: PrivilegedAction = action.parse()?;
        self.scheduler.existing_script(action)?;
        let code = self.codes.issue();
        info!(%action, "Verification code issued");
        Ok(code)
    }

    /// Validate `code` and schedule `action`.
    pub fn confirm(&self, action: &str, code: &str) -> Result<JoinHandle<()>> {
        if action.is_empty() || code.is_empty() {
            return Err(ServiceError::validation("missing parameters"));
        }
        self.codes.validate(code)?;
        let action: PrivilegedAction = action.parse()?;
        self.scheduler.schedule(action)
    }
}
