//! Registry of in-flight runs, keyed by session id

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle of a registered run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

/// A cloneable handle for cancelling one run.
///
/// Cloning is cheap; all clones share the same cancellation token.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: Uuid,
    cancel: CancellationToken,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the run loop
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Clone)]
struct RunRecord {
    handle: RunHandle,
    status: RunStatus,
}

/// Session id to run mapping, shared between the HTTP layer and the run loop
#[derive(Debug, Clone)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunRecord>>>,
    grace: Duration,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    /// How long a finished run stays visible before removal
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_grace(Self::DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Register a running run. Returns the handle it displaced, if that one
    /// was still running; the displaced run is left to finish on its own.
    pub fn register(&self, session_id: &str, handle: RunHandle) -> Option<RunHandle> {
        let previous = self.runs.lock().insert(
            session_id.to_string(),
            RunRecord {
                handle,
                status: RunStatus::Running,
            },
        );
        previous
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.handle)
    }

    /// Abort the session's run and mark it stopped.
    pub fn stop(&self, session_id: &str) -> Result<()> {
        let handle = {
            let mut runs = self.runs.lock();
            let record = runs
                .get_mut(session_id)
                .ok_or_else(|| Error::RunNotFound(session_id.to_string()))?;
            record.status = RunStatus::Stopped;
            record.handle.clone()
        };
        handle.abort();
        Ok(())
    }

    pub fn status(&self, session_id: &str) -> Option<RunStatus> {
        self.runs.lock().get(session_id).map(|r| r.status)
    }

    /// Mark a run finished and schedule its removal after the grace period.
    ///
    /// Only touches the record if it still belongs to `run_id`.
    pub fn finish(&self, session_id: &str, run_id: Uuid) {
        {
            let mut runs = self.runs.lock();
            match runs.get_mut(session_id) {
                Some(record) if record.handle.id() == run_id => {
                    record.status = RunStatus::Stopped;
                }
                _ => return,
            }
        }

        let runs = Arc::clone(&self.runs);
        let session_id = session_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut runs = runs.lock();
            if runs
                .get(&session_id)
                .is_some_and(|r| r.handle.id() == run_id)
            {
                runs.remove(&session_id);
                tracing::debug!(session_id = %session_id, "run record removed");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}
