//! Named, versioned pipeline operations
//!
//! Provides:
//! - The `Operation` trait (typed input, dependencies and output)
//! - `execute_operation`, which runs one inside a tracing span, records a
//!   report and wraps failures with the operation's identity
//! - An in-memory report store

use crate::error::EnvError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// One stage of the pipeline
#[async_trait]
pub trait Operation: Send + Sync {
    /// Stable name
    const NAME: &'static str;
    /// Version, bumped when semantics change
    const VERSION: &'static str;

    /// Caller-provided input
    type Input: Send;
    /// Outputs of earlier stages
    type Deps: Send + Sync;
    /// Result
    type Output: Send;

    /// Run the operation
    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &Self::Deps,
        input: Self::Input,
    ) -> Result<Self::Output, EnvError>;
}

/// Shared per-run context
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Cancels every stage and subprocess
    pub cancel: CancellationToken,
    /// Report sink
    pub reporter: Arc<MemoryReporter>,
}

impl OperationContext {
    /// Create a context with a fresh reporter
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            reporter: Arc::new(MemoryReporter::new()),
        }
    }
}

/// How an operation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum ReportStatus {
    /// Still running
    Running,
    /// Finished successfully
    Succeeded,
    /// Failed with this error
    Failed(String),
}

/// Execution record of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Unique id
    pub id: Uuid,
    /// Operation name
    pub name: String,
    /// Operation version
    pub version: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome
    pub status: ReportStatus,
}

/// Thread-safe in-memory report store
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: DashMap<Uuid, Report>,
}

impl MemoryReporter {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, name: &str, version: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.reports.insert(
            id,
            Report {
                id,
                name: name.to_string(),
                version: version.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                status: ReportStatus::Running,
            },
        );
        id
    }

    fn finish(&self, id: Uuid, status: ReportStatus) {
        if let Some(mut report) = self.reports.get_mut(&id) {
            report.finished_at = Some(Utc::now());
            report.status = status;
        }
    }

    /// All reports, oldest first
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        let mut reports: Vec<Report> = self.reports.iter().map(|entry| entry.value().clone()).collect();
        reports.sort_by_key(|report| report.started_at);
        reports
    }

    /// Latest report of an operation
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<Report> {
        self.reports
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.value().clone())
            .max_by_key(|report| report.started_at)
    }

    /// Number of recorded reports
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

/// Run an operation, record its report and wrap errors with its identity
///
/// # Errors
/// Returns the operation's error wrapped in `EnvError::Operation`.
pub async fn execute_operation<O: Operation>(
    ctx: &OperationContext,
    operation: &O,
    deps: &O::Deps,
    input: O::Input,
) -> Result<O::Output, EnvError> {
    if ctx.cancel.is_cancelled() {
        return Err(EnvError::Cancelled.in_operation(O::NAME, O::VERSION));
    }

    let span = tracing::info_span!("operation", name = O::NAME, version = O::VERSION);
    let id = ctx.reporter.start(O::NAME, O::VERSION);
    let started = Instant::now();

    async {
        tracing::info!(stage = O::NAME, "stage started");
        let result = operation.execute(ctx, deps, input).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => {
                ctx.reporter.finish(id, ReportStatus::Succeeded);
                tracing::info!(stage = O::NAME, elapsed_ms, "stage finished");
                Ok(output)
            }
            Err(err) => {
                ctx.reporter.finish(id, ReportStatus::Failed(err.to_string()));
                tracing::error!(stage = O::NAME, elapsed_ms, error = %err, "stage failed");
                Err(err.in_operation(O::NAME, O::VERSION))
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TopologyError;

    struct Double;

    #[async_trait]
    impl Operation for Double {
        const NAME: &'static str = "double";
        const VERSION: &'static str = "1.0.0";
        type Input = u32;
        type Deps = ();
        type Output = u32;

        async fn execute(&self, _ctx: &OperationContext, _deps: &(), input: u32) -> Result<u32, EnvError> {
            if input == 0 {
                return Err(TopologyError::NoNodeSets.into());
            }
            Ok(input * 2)
        }
    }

    #[tokio::test]
    async fn success_is_reported() {
        let ctx = OperationContext::new(CancellationToken::new());
        assert_eq!(execute_operation(&ctx, &Double, &(), 21).await.unwrap(), 42);

        let report = ctx.reporter.latest("double").unwrap();
        assert_eq!(report.status, ReportStatus::Succeeded);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn failure_is_wrapped_with_identity() {
        let ctx = OperationContext::new(CancellationToken::new());
        let err = execute_operation(&ctx, &Double, &(), 0).await.unwrap_err();

        assert!(matches!(err, EnvError::Operation { name: "double", version: "1.0.0", .. }));
        assert!(err.is_validation());
        assert!(matches!(ctx.reporter.latest("double").unwrap().status, ReportStatus::Failed(_)));
    }

    #[tokio::test]
    async fn cancelled_context_skips_execution() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = OperationContext::new(cancel);
        let err = execute_operation(&ctx, &Double, &(), 1).await.unwrap_err();
        assert!(err.to_string().contains("operation cancelled"));
        assert!(ctx.reporter.is_empty());
    }
}
