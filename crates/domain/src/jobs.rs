use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::DomainResult;
use crate::engine::RequestContext;
use crate::error::DomainError;
use crate::ports::jobs::{JobEnvelope, JobType};
use crate::triggers::TriggerKey;

/// Work order for one draft generation pass, enqueued by an allowed trigger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationJobPayload {
    pub run_id: String,
    pub trigger_key: TriggerKey,
    pub draft_id: String,
    pub target_ids: Vec<String>,
}

impl GenerationJobPayload {
    /// Ids missing from `context` are derived from the trigger run so a job
    /// can always be traced back to it.
    pub fn into_job(self, job_id: String, context: &RequestContext) -> DomainResult<JobEnvelope> {
        let request_id = context
            .request_id
            .clone()
            .unwrap_or_else(|| format!("job:{}:{}", JobType::DraftGeneration.as_str(), self.run_id));
        let correlation_id = context
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.run_id.clone());
        let payload = serde_json::to_value(&self)
            .map_err(|err| DomainError::InvalidInput(format!("job payload: {err}")))?;
        Ok(JobEnvelope {
            job_id,
            job_type: JobType::DraftGeneration,
            payload,
            request_id,
            correlation_id,
            created_at_ms: now_ms(),
        })
    }

    pub fn from_job(job: &JobEnvelope) -> DomainResult<Self> {
        if job.job_type != JobType::DraftGeneration {
            return Err(DomainError::InvalidInput(format!(
                "job {} is not a draft generation job",
                job.job_id
            )));
        }
        serde_json::from_value(job.payload.clone())
            .map_err(|err| DomainError::InvalidInput(format!("job {} payload: {err}", job.job_id)))
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
