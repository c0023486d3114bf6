//! Short-lived verification codes guarding privileged actions.
//!
//! A code is an opaque UUIDv4 mapped to the millisecond it was issued. It
//! validates while `now - issued <= ttl` and is not consumed by use.

use crate::error::{Result, ServiceError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use tracing::{debug, info};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
pub struct CodeStore {
    codes: Mutex<HashMap<String, u64>>,
    ttl_ms: u64,
}

impl CodeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Issue a fresh code stamped with the current time.
    pub fn issue(&self) -> String {
        self.issue_at(now_ms())
    }

    pub fn issue_at(&self, issued_at_ms: u64) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.lock().insert(token.clone(), issued_at_ms);
        token
    }

    pub fn validate(&self, token: &str) -> Result<()> {
        self.validate_at(token, now_ms())
    }

    pub fn validate_at(&self, token: &str, now_ms: u64) -> Result<()> {
        let issued = self
            .lock()
            .get(token)
            .copied()
            .ok_or(ServiceError::InvalidOrExpiredCode)?;
        if now_ms.saturating_sub(issued) > self.ttl_ms {
            debug!("rejected expired code");
            return Err(ServiceError::InvalidOrExpiredCode);
        }
        Ok(())
    }

    /// Drop every code that can no longer validate. Returns how many went.
    pub fn sweep_expired_at(&self, now_ms: u64) -> usize {
        let mut codes = self.lock();
        let before = codes.len();
        codes.retain(|_, issued| now_ms.saturating_sub(*issued) <= self.ttl_ms);
        before - codes.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.codes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodically remove expired codes.
pub fn spawn_sweeper(store: Arc<CodeStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(every);
        loop {
            interval.tick().await;
            let removed = store.sweep_expired_at(now_ms());
            if removed > 0 {
                info!(removed, "Swept expired verification codes");
            }
        }
    })
}
