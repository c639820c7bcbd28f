use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;
use crate::triggers::{TriggerKey, TriggerRecord, TriggerStatus};

#[derive(Debug, Error)]
pub enum TriggerStoreError {
    #[error("trigger store unavailable: {0}")]
    Unavailable(String),
    #[error("trigger store serialization error: {0}")]
    Serialization(String),
    #[error("trigger store error: {0}")]
    Store(String),
}

impl From<TriggerStoreError> for DomainError {
    fn from(err: TriggerStoreError) -> Self {
        DomainError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored,
    Existing(TriggerRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Updated,
    Mismatch(Option<TriggerRecord>),
}

/// Idempotency record storage. The key uniqueness constraint lives here:
/// `put_if_absent` must be atomic, and `compare_and_set` must only write
/// when the stored record still has `expected_status` and `expected_run_id`.
pub trait TriggerRecordStore: Send + Sync {
    fn get(&self, key: &TriggerKey)
    -> BoxFuture<'_, Result<Option<TriggerRecord>, TriggerStoreError>>;

    fn put_if_absent(
        &self,
        key: &TriggerKey,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<PutOutcome, TriggerStoreError>>;

    fn compare_and_set(
        &self,
        key: &TriggerKey,
        expected_status: TriggerStatus,
        expected_run_id: &str,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<CasOutcome, TriggerStoreError>>;
}
