//! Retention and cleanup scheduling.
//!
//! A sweep reclaims terminal workspaces whose retention window (measured
//! from their last status change) has expired. When a soft disk ceiling is
//! configured and tracked usage is above it, the oldest remaining terminal
//! workspaces are reclaimed early until usage drops under the ceiling.
//! Active workspaces are never touched.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::RetentionConfig;
use crate::error::EngineError;
use crate::lifecycle::WorkspaceManager;
use crate::model::records::Workspace;
use crate::model::types::{WorkspaceId, WorkspaceStatus, now_unix_ms};

/// A workspace a sweep reclaimed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reclaimed {
    pub workspace_id: WorkspaceId,
    /// Status before cleanup.
    pub status: WorkspaceStatus,
    pub reclaimed_bytes: u64,
}

/// A workspace a sweep wanted to reclaim but could not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub workspace_id: WorkspaceId,
    pub reason: String,
}

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Reclaimed because their retention window expired.
    pub cleaned: Vec<Reclaimed>,
    /// Reclaimed early to get under the soft disk ceiling.
    pub force_reclaimed: Vec<Reclaimed>,
    pub skipped: Vec<Skipped>,
    pub total_bytes_after: u64,
}

impl SweepReport {
    #[must_use]
    pub fn reclaimed_bytes(&self) -> u64 {
        self.cleaned
            .iter()
            .chain(&self.force_reclaimed)
            .map(|r| r.reclaimed_bytes)
            .sum()
    }
}

/// Periodically cleans up finished workspaces.
#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    manager: Arc<WorkspaceManager>,
    policy: RetentionConfig,
}

impl CleanupScheduler {
    /// A scheduler using the manager's `[retention]` settings.
    #[must_use]
    pub fn new(manager: Arc<WorkspaceManager>) -> Self {
        let policy = manager.config().retention.clone();
        Self { manager, policy }
    }

    /// A scheduler with an explicit policy.
    #[must_use]
    pub const fn with_policy(manager: Arc<WorkspaceManager>, policy: RetentionConfig) -> Self {
        Self { manager, policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetentionConfig {
        &self.policy
    }

    /// Run one cleanup pass as of `now_ms`.
    ///
    /// Failures on individual workspaces are reported in
    /// [`SweepReport::skipped`] and do not stop the pass.
    ///
    /// # Errors
    /// `Internal` if the registry cannot be read.
    #[instrument(skip_all)]
    pub fn sweep(&self, now_ms: i64) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        self.manager.refresh_disk_estimates()?;

        let candidates = self
            .manager
            .registry
            .terminal_workspaces()
            .map_err(|e| EngineError::registry("sweep", &e))?;

        let mut retained = Vec::new();
        for ws in candidates {
            if self.expired(&ws, now_ms) {
                if let Some(done) = self.reclaim(&ws, &mut report) {
                    info!(workspace = %ws.id, status = %ws.status, bytes = done.reclaimed_bytes, "retention expired; cleaned");
                    report.cleaned.push(done);
                }
            } else {
                retained.push(ws);
            }
        }

        if let Some(ceiling) = self.policy.disk_ceiling_bytes {
            let mut total = self.manager.total_disk_usage()?;
            // Oldest first: terminal_workspaces is ordered by last change.
            for ws in &retained {
                if total <= ceiling {
                    break;
                }
                if let Some(done) = self.reclaim(ws, &mut report) {
                    warn!(
                        workspace = %ws.id,
                        status = %ws.status,
                        bytes = done.reclaimed_bytes,
                        ceiling,
                        "force-reclaimed before retention expiry"
                    );
                    report.force_reclaimed.push(done);
                    total = self.manager.total_disk_usage()?;
                }
            }
            if total > ceiling {
                warn!(total, ceiling, "disk usage still above ceiling after sweep");
            }
        }

        report.total_bytes_after = self.manager.total_disk_usage()?;
        Ok(report)
    }

    fn expired(&self, ws: &Workspace, now_ms: i64) -> bool {
        let Some(window) = self.policy.window(ws.status) else {
            return false;
        };
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(ws.updated_at_ms) >= window_ms
    }

    fn reclaim(&self, ws: &Workspace, report: &mut SweepReport) -> Option<Reclaimed> {
        match self
            .manager
            .cleanup_workspace(&ws.id, self.policy.preserve_history)
        {
            Ok(result) => Some(Reclaimed {
                workspace_id: result.workspace_id,
                status: ws.status,
                reclaimed_bytes: result.reclaimed_bytes,
            }),
            Err(e) => {
                warn!(workspace = %ws.id, error = %e, "cleanup skipped");
                report.skipped.push(Skipped {
                    workspace_id: ws.id.clone(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Sweep now and then every `cleanup_interval_secs` on a background
    /// thread until the handle is stopped or dropped.
    #[must_use]
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.policy.interval().max(Duration::from_secs(1));
        let join = thread::spawn(move || {
            let mut sweeps = 0_usize;
            loop {
                match self.sweep(now_unix_ms()) {
                    Ok(report) => info!(
                        cleaned = report.cleaned.len(),
                        force_reclaimed = report.force_reclaimed.len(),
                        skipped = report.skipped.len(),
                        total_bytes = report.total_bytes_after,
                        "sweep finished"
                    ),
                    Err(e) => error!(error = %e, "sweep failed"),
                }
                sweeps += 1;
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            sweeps
        });
        SchedulerHandle {
            stop_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop_tx: mpsc::Sender<()>,
    join: Option<JoinHandle<usize>>,
}

impl SchedulerHandle {
    /// Stop the scheduler and wait for the current sweep to finish.
    /// Returns the number of sweeps that ran.
    #[must_use]
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    /// Block until the scheduler thread exits on its own (it only does so
    /// when stopped).
    pub fn wait(mut self) {
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            error!("scheduler thread panicked");
        }
    }

    fn shutdown(&mut self) -> usize {
        let _ = self.stop_tx.send(());
        self.join
            .take()
            .map_or(0, |join| join.join().unwrap_or_else(|_| {
                error!("scheduler thread panicked");
                0
            }))
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
