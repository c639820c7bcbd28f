use std::sync::Arc;
use std::time::{Duration, Instant};

use playbook_domain::generation::{DraftGenerationService, GenerationOutcome};
use playbook_domain::jobs::now_ms;
use playbook_domain::ports::jobs::{JobQueue, JobQueueError, JobType};
use tracing::Instrument;

/// What happened to one dequeued job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub job_type: JobType,
    pub result: &'static str,
    pub duration_ms: f64,
    pub lag_ms: i64,
}

/// Pulls draft generation jobs off the queue and runs them. Every dequeued
/// job is acked: a failed generation is retried by re-triggering, and a job
/// that died mid-run is reclaimed through the trigger record's in-flight TTL.
#[derive(Clone)]
pub struct GenerationConsumer {
    queue: Arc<dyn JobQueue>,
    service: DraftGenerationService,
    poll_timeout: Duration,
}

impl GenerationConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        service: DraftGenerationService,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            service,
            poll_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Moves jobs orphaned in the processing list back to ready.
    pub async fn recover(&self, batch: usize) -> Result<usize, JobQueueError> {
        let mut recovered = 0usize;
        loop {
            let moved = self.queue.requeue_processing(batch.max(1)).await?;
            recovered += moved;
            if moved < batch.max(1) {
                break;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "requeued jobs left in processing");
        }
        Ok(recovered)
    }

    pub async fn process_next(&self) -> Result<Option<JobReport>, JobQueueError> {
        let Some(job) = self.queue.dequeue(self.poll_timeout).await? else {
            return Ok(None);
        };
        let started = Instant::now();
        let lag_ms = now_ms().saturating_sub(job.created_at_ms);
        let span = tracing::info_span!(
            "job",
            job_id = %job.job_id,
            job_type = job.job_type.as_str(),
            request_id = %job.request_id,
            correlation_id = %job.correlation_id,
        );

        let result = match self.service.run(&job).instrument(span).await {
            Ok(GenerationOutcome::Completed { .. }) => "completed",
            Ok(GenerationOutcome::Superseded) => "superseded",
            Ok(GenerationOutcome::DraftClosed) => "draft_closed",
            Ok(GenerationOutcome::Failed { .. }) => "failed",
            Err(err) => {
                tracing::error!(job_id = %job.job_id, error = %err, "job processing error");
                "error"
            }
        };
        self.queue.ack(&job.job_id).await?;

        Ok(Some(JobReport {
            job_id: job.job_id,
            job_type: job.job_type,
            result,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            lag_ms,
        }))
    }
}
