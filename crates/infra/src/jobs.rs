use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError, QueueDepth};
use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;
use tokio::sync::Notify;

const DEFAULT_PREFIX: &str = "playbook:jobs";

/// Ready list, processing list and a payload hash keyed by job id. A job
/// moves ready -> processing atomically on dequeue and leaves on ack.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    ready_key: String,
    processing_key: String,
    payload_key: String,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let prefix = prefix.into();
        Ok(Self {
            manager,
            ready_key: format!("{prefix}:ready"),
            processing_key: format!("{prefix}:processing"),
            payload_key: format!("{prefix}:payloads"),
        })
    }

    fn serialize(job: &JobEnvelope) -> Result<String, JobQueueError> {
        serde_json::to_string(job).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<JobEnvelope, JobQueueError> {
        serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }
}

fn operation(err: redis::RedisError) -> JobQueueError {
    JobQueueError::Operation(err.to_string())
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = match Self::serialize(job) {
            Ok(payload) => payload,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let ready_key = self.ready_key.clone();
        let payload_key = self.payload_key.clone();
        let job_id = job.job_id.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("HSET")
                .arg(&payload_key)
                .arg(&job_id)
                .arg(payload);
            pipeline.cmd("LPUSH").arg(&ready_key).arg(&job_id);
            let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(operation)?;
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        let ready_key = self.ready_key.clone();
        let processing_key = self.processing_key.clone();
        let payload_key = self.payload_key.clone();
        // A zero timeout would block forever.
        let timeout_secs = timeout.as_secs().max(1);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let job_id: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&ready_key)
                .arg(&processing_key)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(operation)?;
            let Some(job_id) = job_id else {
                return Ok(None);
            };

            let payload: Option<String> = conn.hget(&payload_key, &job_id).await.map_err(operation)?;
            let Some(payload) = payload else {
                let _: i64 = conn
                    .lrem(&processing_key, 1, &job_id)
                    .await
                    .map_err(operation)?;
                return Err(JobQueueError::Operation(format!(
                    "missing payload for job_id {job_id}"
                )));
            };
            Ok(Some(Self::deserialize(&payload)?))
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let processing_key = self.processing_key.clone();
        let payload_key = self.payload_key.clone();
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline.cmd("LREM").arg(&processing_key).arg(1).arg(&job_id);
            pipeline.cmd("HDEL").arg(&payload_key).arg(&job_id);
            let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(operation)?;
            Ok(())
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        let processing_key = self.processing_key.clone();
        let ready_key = self.ready_key.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            while moved < limit {
                let job_id: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&processing_key)
                    .arg(&ready_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(operation)?;
                if job_id.is_none() {
                    break;
                }
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let ready: u64 = conn.llen(&self.ready_key).await.map_err(operation)?;
            let processing: u64 = conn.llen(&self.processing_key).await.map_err(operation)?;
            Ok(QueueDepth { ready, processing })
        })
    }
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<String>,
    processing: Vec<String>,
    payloads: HashMap<String, JobEnvelope>,
}

/// Process-local queue for the memory backend and tests.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<MemoryQueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryQueueState>, JobQueueError> {
        self.state
            .lock()
            .map_err(|_| JobQueueError::Operation("job queue lock poisoned".into()))
    }

    fn try_take(&self) -> Result<Option<JobEnvelope>, JobQueueError> {
        let mut state = self.lock()?;
        while let Some(job_id) = state.ready.pop_front() {
            if let Some(job) = state.payloads.get(&job_id).cloned() {
                state.processing.push(job_id);
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                state.ready.push_back(job.job_id.clone());
                state.payloads.insert(job.job_id.clone(), job);
            }
            self.notify.notify_one();
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        Box::pin(async move {
            if let Some(job) = self.try_take()? {
                return Ok(Some(job));
            }
            let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
            self.try_take()
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut state = self.lock()?;
            state.processing.retain(|id| id != &job_id);
            state.payloads.remove(&job_id);
            Ok(())
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            let count = limit.min(state.processing.len());
            let moved: Vec<String> = state.processing.drain(..count).collect();
            state.ready.extend(moved);
            Ok(count)
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth, JobQueueError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(QueueDepth {
                ready: state.ready.len() as u64,
                processing: state.processing.len() as u64,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_domain::engine::RequestContext;
    use playbook_domain::jobs::GenerationJobPayload;
    use playbook_domain::triggers::{TriggerKey, TriggerType};

    fn job(job_id: &str) -> JobEnvelope {
        GenerationJobPayload {
            run_id: "trg-1".to_string(),
            trigger_key: TriggerKey::new(TriggerType::CatalogSync, "owner", "auto", "t1", "h1"),
            draft_id: "draft-1".to_string(),
            target_ids: vec!["t1".to_string()],
        }
        .into_job(job_id.to_string(), &RequestContext::default())
        .unwrap()
    }

    #[tokio::test]
    async fn memory_queue_is_fifo_and_tracks_processing() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(&job("job-1")).await.unwrap();
        queue.enqueue(&job("job-2")).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.job_id, "job-1");
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                ready: 1,
                processing: 1
            }
        );

        queue.ack(&first.job_id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn memory_queue_requeues_unacked_jobs() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(&job("job-1")).await.unwrap();
        let taken = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(taken.is_some());

        assert_eq!(queue.requeue_processing(10).await.unwrap(), 1);
        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.job_id, "job-1");
    }

    #[tokio::test]
    async fn memory_queue_dequeue_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        let job = queue.dequeue(Duration::from_millis(5)).await.unwrap();
        assert!(job.is_none());
    }
}
