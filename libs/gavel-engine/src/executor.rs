/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Drive one job through its lifecycle and persist every step.
///
/// **Architecture:**
/// 1. Claim the submission (`pending → compiling`), unless it was cancelled
/// 2. Use SandboxEngine to prepare a workspace and compile once (engine.rs)
/// 3. Run tests strictly in order, scoring each with the Evaluator (evaluator.rs)
/// 4. Remove the workspace
/// 5. Store the terminal verdict in one atomic update
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How scoring works (evaluator's job)
/// - How records are persisted (store's job)

use crate::engine::{CompileOutcome, JobContext, RunOutcome, SandboxEngine, Workspace};
use crate::evaluator;
use crate::store::Ledger;
use gavel_common::config::ComparisonPolicy;
use gavel_common::error::{JudgeError, JudgeResult};
use gavel_common::types::{SubmissionStatus, Summary};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Executor {
    engine: SandboxEngine,
    ledger: Arc<Ledger>,
    comparison: ComparisonPolicy,
}

impl Executor {
    pub fn new(engine: SandboxEngine, ledger: Arc<Ledger>, comparison: ComparisonPolicy) -> Self {
        Self {
            engine,
            ledger,
            comparison,
        }
    }

    /// Execute a job end to end.
    ///
    /// Returns the terminal status this call stored, or `None` if the job was
    /// cancelled before a worker claimed it.
    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission_id, language = %ctx.language.name))]
    pub async fn execute(&self, ctx: JobContext) -> JudgeResult<Option<SubmissionStatus>> {
        let id = ctx.submission_id;

        if !self.ledger.begin(id).await? {
            info!("Submission cancelled before execution, skipping");
            return Ok(None);
        }

        info!(test_count = ctx.test_cases.len(), "Starting job execution");

        if ctx.cancel.is_cancelled() {
            return self.conclude_cancelled(id).await;
        }

        let workspace = match self.engine.prepare(&ctx) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to prepare workspace");
                return self.fail_internal(id).await.map(Some);
            }
        };

        match self.engine.compile(&workspace, &ctx).await {
            Ok(CompileOutcome::Success) => {}
            Ok(CompileOutcome::Failed(diagnostics)) => {
                release(workspace);
                let verdict = evaluator::compile_error_verdict();
                return self
                    .conclude(id, verdict.status, verdict.summary, Some(diagnostics), Some(vec![]))
                    .await;
            }
            Ok(CompileOutcome::Cancelled) => {
                release(workspace);
                return self.conclude_cancelled(id).await;
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Compilation could not run");
                release(workspace);
                return self.fail_internal(id).await.map(Some);
            }
        }

        let mut results = Vec::with_capacity(ctx.test_cases.len());
        let mut cancelled = false;

        for (i, test_case) in ctx.test_cases.iter().enumerate() {
            let index = i + 1;
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.ledger.mark_running(id, index).await?;
            debug!(test = index, total = ctx.test_cases.len(), "Executing test");

            let result = match self.engine.run_test(&workspace, &ctx, index, test_case).await {
                Ok(RunOutcome::Completed(output)) => {
                    evaluator::evaluate_test(&output, test_case, self.comparison)
                }
                Ok(RunOutcome::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!(test = index, error = %format!("{:#}", e), "Test could not run");
                    evaluator::internal_error_result(index)
                }
            };

            // Nothing is appended once cancellation has been requested
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            info!(
                test = index,
                status = ?result.status,
                execution_ms = result.execution_time_ms,
                "Test evaluated"
            );
            self.ledger.append_result(id, &result).await?;
            results.push(result);
        }

        release(workspace);

        if cancelled {
            warn!(
                completed = results.len(),
                total = ctx.test_cases.len(),
                "Job cancelled mid-run"
            );
            return self.conclude_cancelled(id).await;
        }

        let verdict = evaluator::evaluate(&results);
        self.conclude(id, verdict.status, verdict.summary, None, Some(results))
            .await
    }

    async fn conclude(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        summary: Summary,
        compile_output: Option<String>,
        results: Option<Vec<gavel_common::types::ExecutionResult>>,
    ) -> JudgeResult<Option<SubmissionStatus>> {
        match self
            .ledger
            .finish(id, status, summary, compile_output, results)
            .await?
        {
            Some(record) => {
                info!(
                    status = %record.status,
                    execution_ms = record.execution_time_ms,
                    "Submission finished"
                );
                Ok(Some(record.status))
            }
            None => {
                warn!("Submission was already terminal, verdict discarded");
                Ok(None)
            }
        }
    }

    async fn conclude_cancelled(&self, id: Uuid) -> JudgeResult<Option<SubmissionStatus>> {
        let written = self
            .ledger
            .get(id)
            .await?
            .map(|r| Summary::from_results(&r.results))
            .unwrap_or_else(|| Summary::from_results(&[]));
        self.conclude(id, SubmissionStatus::Cancelled, written, None, None)
            .await
    }

    /// Degrade a submission the judge failed to run to a runtime error.
    ///
    /// Results already written are kept; every remaining test gets a
    /// sanitized "Internal judge error" result.
    pub async fn fail_internal(&self, id: Uuid) -> JudgeResult<SubmissionStatus> {
        let record = self
            .ledger
            .get(id)
            .await?
            .ok_or(JudgeError::NotFound(id))?;

        let mut results = record.results.clone();
        for index in results.len() + 1..=record.test_cases.len() {
            results.push(evaluator::internal_error_result(index));
        }
        let summary = Summary::from_results(&results);

        self.conclude(id, SubmissionStatus::RuntimeError, summary, None, Some(results))
            .await?;
        Ok(SubmissionStatus::RuntimeError)
    }
}

/// Remove the workspace; failure is logged since the verdict must still be stored
fn release(workspace: Workspace) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        error!(workspace = %path.display(), error = %e, "Failed to remove workspace");
    }
}
