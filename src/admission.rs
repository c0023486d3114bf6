//! Concurrent-session admission.
//!
//! A fixed pool of slots bounds how many distinct sessions may have a
//! non-static request in flight. A session that already holds a slot is let
//! through again without taking another one; static assets and the
//! heartbeat bypass the pool entirely. Slots are never waited for.

use crate::error::{Result, ServiceError};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Cookie carrying the client's session id.
pub const SESSION_COOKIE: &str = "devgate_session";

const MAX_SESSION_ID_LEN: usize = 128;

/// Path prefixes that always go through admission.
const API_PREFIXES: &[&str] = &["/system", "/project", "/terminal"];

const STATIC_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "json", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff",
    "woff2", "ttf", "eot", "txt", "xml", "pdf", "zip",
];

#[derive(Debug)]
struct Slots {
    max: usize,
    active: Mutex<HashSet<String>>,
}

impl Slots {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    slots: Arc<Slots>,
}

/// Outcome of a granted admission. Dropping it ends the request's claim.
#[derive(Debug)]
pub enum Admission {
    /// Static traffic; no slot involved.
    Bypass,
    /// The session already holds a slot through another request.
    Reentrant,
    /// A slot was taken for this session and is released on drop.
    Granted(SlotGuard),
}

/// Holds one admission slot for a session until dropped.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<Slots>,
    session_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.session_id);
        debug!(session = %self.session_id, "Admission slot released");
    }
}

impl AdmissionController {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Arc::new(Slots {
                max,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Try to admit a request from `session_id` without blocking.
    pub fn try_enter(&self, session_id: &str, is_static: bool) -> Result<Admission> {
        if is_static {
            return Ok(Admission::Bypass);
        }
        let mut active = self.slots.lock();
        if active.contains(session_id) {
            return Ok(Admission::Reentrant);
        }
        if active.len() >= self.slots.max {
            return Err(ServiceError::Busy);
        }
        active.insert(session_id.to_string());
        Ok(Admission::Granted(SlotGuard {
            slots: Arc::clone(&self.slots),
            session_id: session_id.to_string(),
        }))
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.slots.lock().contains(session_id)
    }
}

/// Whether a request path skips the admission pool: the heartbeat, and
/// static assets recognised by extension outside the API prefixes.
pub fn bypasses_admission(path: &str) -> bool {
    if path.is_empty() || path == "/" {
        return false;
    }
    let path = path.to_ascii_lowercase();
    if path.starts_with("/heartbeat") {
        return true;
    }
    if API_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return false;
    }
    Path::new(&path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| STATIC_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Session id from the request cookies, if one was presented.
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && value.len() <= MAX_SESSION_ID_LEN)
}

/// Middleware gating every request through the [`AdmissionController`].
///
/// Clients without a session cookie get a fresh id, which is set on the
/// response.
pub async fn admission_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (session_id, fresh) = match session_from_headers(request.headers()) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };
    let is_static = bypasses_admission(request.uri().path());

    let mut response = match state.admission.try_enter(&session_id, is_static) {
        Ok(admission) => {
            let response = next.run(request).await;
            drop(admission);
            response
        }
        Err(err) => {
            warn!(
                session = %session_id,
                path = %request.uri().path(),
                "Rejected request: server busy"
            );
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    };

    if fresh {
        let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}
