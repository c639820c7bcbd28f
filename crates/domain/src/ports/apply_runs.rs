use crate::DomainResult;
use crate::apply::ApplyRun;
use crate::ports::BoxFuture;

/// Apply run persistence. Implementations allow a single `Running` run per
/// draft: `create` fails with `DomainError::Conflict` while one is active.
#[allow(clippy::needless_pass_by_value)]
pub trait ApplyRunRepository: Send + Sync {
    fn create(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>>;

    /// Overwrites a run that is still `Running` in storage, either with
    /// progress or with its terminal state. A terminal write releases the
    /// draft. Fails with `DomainError::Conflict` if the stored run is
    /// already terminal.
    fn update_running(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>>;

    fn get(&self, run_id: &str) -> BoxFuture<'_, DomainResult<Option<ApplyRun>>>;

    /// Runs of a draft, oldest first.
    fn list_by_draft(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>>;

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>>;
}
