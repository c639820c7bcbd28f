use crate::DomainResult;
use crate::drafts::{Draft, DraftKey};
use crate::ports::BoxFuture;

/// Draft persistence. Implementations must enforce that at most one
/// non-expired draft exists per [`DraftKey`]: `create` fails with
/// `DomainError::Conflict` when a live draft already holds the key.
#[allow(clippy::needless_pass_by_value)]
pub trait DraftRepository: Send + Sync {
    fn create(&self, draft: &Draft) -> BoxFuture<'_, DomainResult<Draft>>;

    fn get(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Option<Draft>>>;

    fn get_live_by_key(&self, key: &DraftKey) -> BoxFuture<'_, DomainResult<Option<Draft>>>;

    /// Compare-and-set on `version`: stores `draft` (with `version` bumped by
    /// the caller) only if the stored version equals `expected_version`.
    /// Fails with `DomainError::Conflict` otherwise.
    fn update(&self, draft: &Draft, expected_version: u64) -> BoxFuture<'_, DomainResult<Draft>>;

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<Draft>>>;

    /// Moves every non-expired draft with `expires_at_ms <= now_ms` to
    /// `Expired` and releases its key. Returns how many rows transitioned.
    fn expire_due(&self, now_ms: i64) -> BoxFuture<'_, DomainResult<usize>>;

    /// Expires live drafts of an automation whose scope differs from
    /// `current_scope_id`.
    fn expire_other_scopes(
        &self,
        owner_id: &str,
        automation_id: &str,
        current_scope_id: &str,
        now_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>>;
}
