/// Scheduler - Bounded Worker Pool
///
/// A fixed number of workers pull jobs from one bounded FIFO queue. A queue
/// slot is reserved before the submission record exists, so a full judge
/// rejects work synchronously instead of accepting jobs it cannot hold.
///
/// Each queued job carries its own cancellation token. Firing it kills the
/// job's process group if it is running; a job cancelled while still queued
/// is skipped when a worker reaches it.

use crate::engine::JobContext;
use crate::executor::Executor;
use gavel_common::config::SchedulerConfig;
use gavel_common::error::{JudgeError, JudgeResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

type Controls = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// A held queue slot. Dropping it without dispatching releases the slot.
pub struct Reservation {
    permit: mpsc::OwnedPermit<JobContext>,
    controls: Controls,
}

impl Reservation {
    pub fn dispatch(self, ctx: JobContext) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.insert(ctx.submission_id, ctx.cancel.clone());
        }
        self.permit.send(ctx);
    }
}

pub struct Scheduler {
    queue: Mutex<Option<mpsc::Sender<JobContext>>>,
    controls: Controls,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start(config: &SchedulerConfig, executor: Arc<Executor>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let controls: Controls = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    executor.clone(),
                    controls.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Scheduler started"
        );

        Self {
            queue: Mutex::new(Some(sender)),
            controls,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Reserve a queue slot or fail with `Capacity` right away
    pub fn reserve(&self) -> JudgeResult<Reservation> {
        let sender = self
            .queue
            .lock()
            .map_err(|_| JudgeError::Internal("scheduler lock poisoned".to_string()))?
            .clone()
            .ok_or(JudgeError::Capacity)?;

        let permit = sender
            .try_reserve_owned()
            .map_err(|_| JudgeError::Capacity)?;

        Ok(Reservation {
            permit,
            controls: self.controls.clone(),
        })
    }

    /// Fire the job's cancellation token. False if no worker owns the job.
    pub fn cancel(&self, id: Uuid) -> bool {
        let token = self
            .controls
            .lock()
            .ok()
            .and_then(|controls| controls.get(&id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop accepting work and wait for queued jobs to drain
    pub async fn shutdown(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!("Scheduler stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<JobContext>>>,
    executor: Arc<Executor>,
    controls: Controls,
) {
    debug!(worker_id, "Worker started");

    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(ctx) = next else {
            debug!(worker_id, "Queue closed, worker exiting");
            break;
        };

        let id = ctx.submission_id;
        let job_executor = executor.clone();

        // A panicking job must not take the worker down with it
        let outcome = tokio::spawn(async move { job_executor.execute(ctx).await }).await;

        let failed = match outcome {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                error!(worker_id, submission_id = %id, error = %e, "Job failed");
                true
            }
            Err(e) => {
                error!(worker_id, submission_id = %id, error = %e, "Job panicked");
                true
            }
        };
        if failed {
            if let Err(e) = executor.fail_internal(id).await {
                error!(submission_id = %id, error = %e, "Failed to record internal error");
            }
        }

        if let Ok(mut controls) = controls.lock() {
            controls.remove(&id);
        }
    }
}
