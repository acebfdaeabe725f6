use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::reclaim::ScanResult;

/// Completion state exposed to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    CompletedTruncated,
    Failed,
}

impl RunStatus {
    pub fn of(result: &Result<ScanResult, EngineError>) -> Self {
        match result {
            Ok(scan) => scan.status,
            Err(_) => RunStatus::Failed,
        }
    }
}

/// Scan-wide deadline observed cooperatively by every long-running stage.
///
/// Wraps a child of the caller's token, so expiry never cancels the caller's
/// other work. Once expired it stays expired.
#[derive(Debug, Clone)]
pub struct ScanDeadline {
    token: CancellationToken,
    started: Instant,
    timeout: Option<Duration>,
    tripped: Arc<AtomicBool>,
}

impl ScanDeadline {
    pub fn new(timeout: Option<Duration>, parent: &CancellationToken) -> Self {
        ScanDeadline {
            token: parent.child_token(),
            started: Instant::now(),
            timeout,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, &CancellationToken::new())
    }

    /// True once the timeout elapsed or the caller cancelled. Callers must not
    /// schedule new work after this returns true.
    pub fn is_expired(&self) -> bool {
        if self.tripped.load(Ordering::Acquire) {
            return true;
        }
        let timed_out = self
            .timeout
            .map(|limit| self.started.elapsed() >= limit)
            .unwrap_or(false);
        if timed_out || self.token.is_cancelled() {
            self.tripped.store(true, Ordering::Release);
            self.token.cancel();
            return true;
        }
        false
    }

    /// Whether any stage observed expiry during this run.
    pub fn was_hit(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// Operation metrics tracking

#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub operation: String,
    pub start_time: Instant,
    pub checkpoints: Vec<(String, Duration)>,
}

impl OperationMetrics {
    pub fn new(operation: impl Into<String>) -> Self {
        OperationMetrics {
            operation: operation.into(),
            start_time: Instant::now(),
            checkpoints: Vec::new(),
        }
    }

    pub fn checkpoint(&mut self, name: &str) {
        self.checkpoints
            .push((name.to_string(), self.start_time.elapsed()));
    }

    pub fn complete(self) -> OperationReport {
        OperationReport {
            operation: self.operation,
            total_duration: self.start_time.elapsed(),
            checkpoints: self.checkpoints,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub total_duration: Duration,
    pub checkpoints: Vec<(String, Duration)>,
}

impl OperationReport {
    pub fn log_summary(&self) {
        let stages: Vec<String> = self
            .checkpoints
            .iter()
            .map(|(name, at)| format!("{}@{}ms", name, at.as_millis()))
            .collect();
        log::info!(
            "{} finished in {}ms [{}]",
            self.operation,
            self.total_duration.as_millis(),
            stages.join(", ")
        );
    }
}
