// Judge facade: submit, getStatus, cancel, listing and subscription
use crate::engine::{JobContext, SandboxEngine};
use crate::exercises::ExerciseCatalog;
use crate::executor::Executor;
use crate::intake::{validate_job, JobSpec, SubmitRequest};
use crate::languages::LanguageRegistry;
use crate::scheduler::Scheduler;
use crate::store::{Ledger, ListFilter, ResultStore};
use gavel_common::config::JudgeConfig;
use gavel_common::error::{JudgeError, JudgeResult};
use gavel_common::types::{
    StatusEvent, StatusSnapshot, SubmissionListing, SubmissionRecord, SubmissionStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Acknowledgement returned by `submit` and `cancel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
}

pub struct Judge {
    config: Arc<JudgeConfig>,
    registry: Arc<LanguageRegistry>,
    catalog: Arc<dyn ExerciseCatalog>,
    ledger: Arc<Ledger>,
    scheduler: Scheduler,
}

impl Judge {
    /// Build the judge and start its workers. Must be called inside a Tokio runtime.
    pub fn new(
        config: JudgeConfig,
        registry: LanguageRegistry,
        catalog: Arc<dyn ExerciseCatalog>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(store));
        let engine = SandboxEngine::new(config.sandbox.clone(), config.limits.clone());
        let executor = Arc::new(Executor::new(engine, ledger.clone(), config.comparison));
        let scheduler = Scheduler::start(&config.scheduler, executor);

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            catalog,
            ledger,
            scheduler,
        }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &dyn ExerciseCatalog {
        self.catalog.as_ref()
    }

    /// Submit against a catalogued exercise
    pub async fn submit(&self, request: SubmitRequest) -> JudgeResult<Submitted> {
        let exercise = self.catalog.lookup(&request.exercise_id).ok_or_else(|| {
            JudgeError::validation(format!("unknown exercise '{}'", request.exercise_id))
        })?;
        self.submit_job(JobSpec::for_exercise(request, exercise))
            .await
    }

    /// Submit a job carrying its own tests and limits
    pub async fn submit_job(&self, spec: JobSpec) -> JudgeResult<Submitted> {
        let job = validate_job(spec, &self.registry, &self.config.limits)?;
        let reservation = self.scheduler.reserve()?;

        let id = Uuid::new_v4();
        let record = SubmissionRecord::new(
            id,
            job.owner.clone(),
            job.exercise_id.clone(),
            job.language.name.clone(),
            job.source_code.clone(),
            job.limits,
            job.test_cases.clone(),
        );
        self.ledger.create(&record).await?;

        info!(
            submission_id = %id,
            language = %job.language.name,
            test_count = job.test_cases.len(),
            time_limit_secs = job.limits.time_limit_secs,
            memory_limit_mb = job.limits.memory_limit_mb,
            "Submission queued"
        );

        reservation.dispatch(JobContext {
            submission_id: id,
            language: job.language,
            source_code: job.source_code,
            limits: job.limits,
            test_cases: job.test_cases,
            cancel: CancellationToken::new(),
        });

        Ok(Submitted {
            submission_id: id,
            status: SubmissionStatus::Pending,
        })
    }

    /// Latest consistent snapshot
    pub async fn status(&self, id: Uuid) -> JudgeResult<StatusSnapshot> {
        self.ledger.snapshot(id).await
    }

    /// Cancel a submission and wait until it is terminal.
    ///
    /// Already-terminal submissions are acknowledged with their existing status.
    pub async fn cancel(&self, id: Uuid) -> JudgeResult<StatusSnapshot> {
        let current = self.ledger.snapshot(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        self.scheduler.cancel(id);
        if let Some(record) = self.ledger.cancel_pending(id).await? {
            info!(submission_id = %id, "Cancelled queued submission");
            return Ok(record.snapshot());
        }

        info!(submission_id = %id, "Cancellation requested for running submission");
        self.ledger.wait_terminal(id).await
    }

    pub async fn wait(&self, id: Uuid) -> JudgeResult<StatusSnapshot> {
        self.ledger.wait_terminal(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.ledger.subscribe()
    }

    pub async fn list(&self, filter: &ListFilter) -> JudgeResult<Vec<SubmissionListing>> {
        self.ledger.list(filter).await
    }

    pub fn languages(&self) -> Vec<String> {
        self.registry.list_languages()
    }

    /// Close the queue and let workers finish what is already queued
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
