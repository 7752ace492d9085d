//! Single-flight run lock.
//!
//! One persisted string per scope, `termine` (idle) or `enCours` (running).
//! Not a queue, not fair, not reentrant: a second run observing `enCours` is
//! rejected with no side effects. Every run path must restore `termine`
//! before returning; a run killed by the host can leave the flag stuck, and
//! [`LockStore::force_release`] is the supported remediation for that.

use async_trait::async_trait;

use crate::models::Result;

pub const LOCK_RUNNING: &str = "enCours";
pub const LOCK_IDLE: &str = "termine";

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Compare-and-set `termine` → `enCours`. False when already running.
    async fn try_acquire(&self, scope: &str) -> Result<bool>;
    /// Restores `termine`. Must succeed for held and non-held locks alike.
    async fn release(&self, scope: &str) -> Result<()>;
    async fn state(&self, scope: &str) -> Result<String>;
    /// Operational escape hatch for a lock left `enCours` by a killed run.
    async fn force_release(&self, scope: &str) -> Result<()>;
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryLockStore {
    states: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, scope: &str) -> Result<bool> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(scope.to_string())
            .or_insert_with(|| LOCK_IDLE.to_string());
        if state == LOCK_RUNNING {
            return Ok(false);
        }
        *state = LOCK_RUNNING.to_string();
        Ok(true)
    }

    async fn release(&self, scope: &str) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(scope.to_string(), LOCK_IDLE.to_string());
        Ok(())
    }

    async fn state(&self, scope: &str) -> Result<String> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(scope)
            .cloned()
            .unwrap_or_else(|| LOCK_IDLE.to_string()))
    }

    async fn force_release(&self, scope: &str) -> Result<()> {
        self.release(scope).await
    }
}
