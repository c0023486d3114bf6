//! Shared application state.

use crate::admission::AdmissionController;
use crate::codes::CodeStore;
use crate::config::Config;
use crate::error::Result;
use crate::projects::ProjectRegistry;
use crate::scripts::{PrivilegedActions, ScriptScheduler};
use crate::terminal::TerminalEngine;
use std::sync::Arc;

/// Long-lived service object, built once at startup and cloned into every
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub admission: AdmissionController,
    pub privileged: Arc<PrivilegedActions>,
    pub terminal: Arc<TerminalEngine>,
    pub projects: Arc<ProjectRegistry>,
}

impl AppState {
    /// Build the state for `config`, discovering projects in its workspace.
    pub fn new(config: Config) -> Result<Self> {
        let projects = ProjectRegistry::discover(&config.workspace)?;
        Ok(Self::with_projects(config, projects))
    }

    pub fn with_projects(config: Config, projects: ProjectRegistry) -> Self {
        let codes = Arc::new(CodeStore::new(config.code_ttl));
        let scheduler = ScriptScheduler::new(
            config.scripts_dir.clone(),
            config.script_delay,
            config.module_name.clone(),
        );
        Self {
            admission: AdmissionController::new(config.max_users),
            privileged: Arc::new(PrivilegedActions::new(codes, scheduler)),
            terminal: Arc::new(TerminalEngine::new(
                config.workspace.clone(),
                config.command_timeout,
            )),
            projects: Arc::new(projects),
            config: Arc::new(config),
        }
    }
}
