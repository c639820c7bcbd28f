use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
    #[error("job queue serialization error: {0}")]
    Serialization(String),
    #[error("job queue operation failed: {0}")]
    Operation(String),
}

impl From<JobQueueError> for DomainError {
    fn from(err: JobQueueError) -> Self {
        DomainError::Storage(err.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DraftGeneration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DraftGeneration => "draft_generation",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub request_id: String,
    pub correlation_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub processing: u64,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>>;
    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>>;
    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>>;
    /// Moves jobs left in processing by a crashed consumer back to ready.
    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>>;
    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth, JobQueueError>>;
}
