//! devgate - session-gated project file and terminal service.
//!
//! A single operator browses and edits sandboxed project directories and
//! runs shell commands over a polling HTTP protocol. Host restart and
//! shutdown are confirmed with a short-lived verification code and run
//! after a fixed delay.

pub mod admission;
pub mod codes;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http_server;
pub mod output_queue;
pub mod projects;
pub mod sandbox;
pub mod scripts;
pub mod state;
pub mod static_files;
pub mod terminal;

pub use config::Config;
pub use envelope::ResponseEnvelope;
pub use error::ServiceError;
pub use state::AppState;
