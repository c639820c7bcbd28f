use crate::DomainResult;
use crate::ports::BoxFuture;
use crate::quota::{QuotaLedgerEntry, QuotaResource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { used_after: u64 },
    Rejected { used: u64 },
}

/// Append-only quota ledger.
#[allow(clippy::needless_pass_by_value)]
pub trait QuotaLedgerRepository: Send + Sync {
    /// Net usage (consumption minus offsets, floored at zero) in a window.
    fn used_in_window(
        &self,
        owner_id: &str,
        resource: QuotaResource,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<u64>>;

    fn append(&self, entry: &QuotaLedgerEntry) -> BoxFuture<'_, DomainResult<()>>;

    /// Appends a consumption entry only if the window's net usage plus the
    /// entry's units stays within `limit`. The check and the append are one
    /// atomic step.
    fn append_within_limit(
        &self,
        entry: &QuotaLedgerEntry,
        limit: u64,
    ) -> BoxFuture<'_, DomainResult<AppendOutcome>>;

    fn list_window(
        &self,
        owner_id: &str,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<QuotaLedgerEntry>>>;
}
