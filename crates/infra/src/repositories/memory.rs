use std::collections::HashMap;
use std::sync::Arc;

use playbook_domain::DomainResult;
use playbook_domain::apply::{ApplyRun, ApplyRunStatus};
use playbook_domain::drafts::{Draft, DraftKey, DraftStatus};
use playbook_domain::error::DomainError;
use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::apply_runs::ApplyRunRepository;
use playbook_domain::ports::drafts::DraftRepository;
use playbook_domain::ports::quota::{AppendOutcome, QuotaLedgerRepository};
use playbook_domain::quota::{QuotaLedgerEntry, QuotaResource, net_usage};
use tokio::sync::RwLock;

#[derive(Default)]
struct DraftState {
    drafts: HashMap<String, Draft>,
    live_by_key: HashMap<String, String>,
}

impl DraftState {
    fn expire(&mut self, draft_id: &str, now_ms: i64) -> bool {
        let Some(draft) = self.drafts.get_mut(draft_id) else {
            return false;
        };
        if draft.status == DraftStatus::Expired {
            return false;
        }
        draft.status = DraftStatus::Expired;
        draft.expired_at_ms = Some(now_ms);
        draft.updated_at_ms = now_ms;
        draft.version += 1;
        let storage_key = draft.key().storage_key();
        if self.live_by_key.get(&storage_key).map(String::as_str) == Some(draft_id) {
            self.live_by_key.remove(&storage_key);
        }
        true
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDraftRepository {
    state: Arc<RwLock<DraftState>>,
}

impl InMemoryDraftRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DraftRepository for InMemoryDraftRepository {
    fn create(&self, draft: &Draft) -> BoxFuture<'_, DomainResult<Draft>> {
        let draft = draft.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let storage_key = draft.key().storage_key();
            if state.drafts.contains_key(&draft.draft_id)
                || state.live_by_key.contains_key(&storage_key)
            {
                return Err(DomainError::Conflict);
            }
            if draft.status != DraftStatus::Expired {
                state
                    .live_by_key
                    .insert(storage_key, draft.draft_id.clone());
            }
            state.drafts.insert(draft.draft_id.clone(), draft.clone());
            Ok(draft)
        })
    }

    fn get(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Option<Draft>>> {
        let draft_id = draft_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.drafts.get(&draft_id).cloned()) })
    }

    fn get_live_by_key(&self, key: &DraftKey) -> BoxFuture<'_, DomainResult<Option<Draft>>> {
        let storage_key = key.storage_key();
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            Ok(state
                .live_by_key
                .get(&storage_key)
                .and_then(|draft_id| state.drafts.get(draft_id))
                .cloned())
        })
    }

    fn update(&self, draft: &Draft, expected_version: u64) -> BoxFuture<'_, DomainResult<Draft>> {
        let draft = draft.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let current_version = state
                .drafts
                .get(&draft.draft_id)
                .map(|current| current.version)
                .ok_or(DomainError::NotFound)?;
            if current_version != expected_version {
                return Err(DomainError::Conflict);
            }
            if draft.status == DraftStatus::Expired {
                let storage_key = draft.key().storage_key();
                if state.live_by_key.get(&storage_key) == Some(&draft.draft_id) {
                    state.live_by_key.remove(&storage_key);
                }
            }
            state.drafts.insert(draft.draft_id.clone(), draft.clone());
            Ok(draft)
        })
    }

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<Draft>>> {
        let owner_id = owner_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut drafts = state
                .read()
                .await
                .drafts
                .values()
                .filter(|draft| draft.owner_id == owner_id)
                .cloned()
                .collect::<Vec<_>>();
            drafts.sort_by(|a, b| {
                b.updated_at_ms
                    .cmp(&a.updated_at_ms)
                    .then_with(|| b.draft_id.cmp(&a.draft_id))
            });
            Ok(drafts)
        })
    }

    fn expire_due(&self, now_ms: i64) -> BoxFuture<'_, DomainResult<usize>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let due = state
                .drafts
                .values()
                .filter(|draft| draft.status != DraftStatus::Expired && draft.expires_at_ms <= now_ms)
                .map(|draft| draft.draft_id.clone())
                .collect::<Vec<_>>();
            Ok(due
                .iter()
                .filter(|draft_id| state.expire(draft_id, now_ms))
                .count())
        })
    }

    fn expire_other_scopes(
        &self,
        owner_id: &str,
        automation_id: &str,
        current_scope_id: &str,
        now_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let owner_id = owner_id.to_string();
        let automation_id = automation_id.to_string();
        let current_scope_id = current_scope_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let stale = state
                .drafts
                .values()
                .filter(|draft| {
                    draft.status != DraftStatus::Expired
                        && draft.owner_id == owner_id
                        && draft.automation_id == automation_id
                        && draft.scope_id != current_scope_id
                })
                .map(|draft| draft.draft_id.clone())
                .collect::<Vec<_>>();
            Ok(stale
                .iter()
                .filter(|draft_id| state.expire(draft_id, now_ms))
                .count())
        })
    }
}

#[derive(Default)]
struct ApplyRunState {
    runs: HashMap<String, ApplyRun>,
    running_by_draft: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct InMemoryApplyRunRepository {
    state: Arc<RwLock<ApplyRunState>>,
}

impl InMemoryApplyRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_oldest_first(runs: &mut [ApplyRun]) {
    runs.sort_by(|a, b| {
        a.started_at_ms
            .cmp(&b.started_at_ms)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

impl ApplyRunRepository for InMemoryApplyRunRepository {
    fn create(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>> {
        let run = run.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if state.runs.contains_key(&run.run_id) {
                return Err(DomainError::Conflict);
            }
            if run.status == ApplyRunStatus::Running {
                if state.running_by_draft.contains_key(&run.draft_id) {
                    return Err(DomainError::Conflict);
                }
                state
                    .running_by_draft
                    .insert(run.draft_id.clone(), run.run_id.clone());
            }
            state.runs.insert(run.run_id.clone(), run.clone());
            Ok(run)
        })
    }

    fn update_running(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>> {
        let run = run.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let stored = state.runs.get(&run.run_id).ok_or(DomainError::NotFound)?;
            if stored.status.is_terminal() {
                return Err(DomainError::Conflict);
            }
            if run.status.is_terminal()
                && state.running_by_draft.get(&run.draft_id) == Some(&run.run_id)
            {
                state.running_by_draft.remove(&run.draft_id);
            }
            state.runs.insert(run.run_id.clone(), run.clone());
            Ok(run)
        })
    }

    fn get(&self, run_id: &str) -> BoxFuture<'_, DomainResult<Option<ApplyRun>>> {
        let run_id = run_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.runs.get(&run_id).cloned()) })
    }

    fn list_by_draft(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>> {
        let draft_id = draft_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut runs = state
                .read()
                .await
                .runs
                .values()
                .filter(|run| run.draft_id == draft_id)
                .cloned()
                .collect::<Vec<_>>();
            sort_oldest_first(&mut runs);
            Ok(runs)
        })
    }

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>> {
        let owner_id = owner_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut runs = state
                .read()
                .await
                .runs
                .values()
                .filter(|run| run.owner_id == owner_id)
                .cloned()
                .collect::<Vec<_>>();
            sort_oldest_first(&mut runs);
            Ok(runs)
        })
    }
}

/// Append-only ledger; the write lock makes `append_within_limit` atomic.
#[derive(Clone, Default)]
pub struct InMemoryQuotaLedgerRepository {
    entries: Arc<RwLock<Vec<QuotaLedgerEntry>>>,
}

impl InMemoryQuotaLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn window_usage(
    entries: &[QuotaLedgerEntry],
    owner_id: &str,
    resource: QuotaResource,
    window_start_ms: i64,
) -> u64 {
    net_usage(
        entries.iter().filter(|entry| {
            entry.owner_id == owner_id && entry.window_start_ms == window_start_ms
        }),
        resource,
    )
}

impl QuotaLedgerRepository for InMemoryQuotaLedgerRepository {
    fn used_in_window(
        &self,
        owner_id: &str,
        resource: QuotaResource,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<u64>> {
        let owner_id = owner_id.to_string();
        let entries = self.entries.clone();
        Box::pin(async move {
            let entries = entries.read().await;
            Ok(window_usage(&entries, &owner_id, resource, window_start_ms))
        })
    }

    fn append(&self, entry: &QuotaLedgerEntry) -> BoxFuture<'_, DomainResult<()>> {
        let entry = entry.clone();
        let entries = self.entries.clone();
        Box::pin(async move {
            let mut entries = entries.write().await;
            if entries.iter().any(|existing| existing.entry_id == entry.entry_id) {
                return Err(DomainError::Conflict);
            }
            entries.push(entry);
            Ok(())
        })
    }

    fn append_within_limit(
        &self,
        entry: &QuotaLedgerEntry,
        limit: u64,
    ) -> BoxFuture<'_, DomainResult<AppendOutcome>> {
        let entry = entry.clone();
        let entries = self.entries.clone();
        Box::pin(async move {
            let mut entries = entries.write().await;
            let used = window_usage(
                &entries,
                &entry.owner_id,
                entry.resource,
                entry.window_start_ms,
            );
            let used_after = used.saturating_add(entry.units);
            if used_after > limit {
                return Ok(AppendOutcome::Rejected { used });
            }
            if entries.iter().any(|existing| existing.entry_id == entry.entry_id) {
                return Err(DomainError::Conflict);
            }
            entries.push(entry);
            Ok(AppendOutcome::Appended { used_after })
        })
    }

    fn list_window(
        &self,
        owner_id: &str,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<QuotaLedgerEntry>>> {
        let owner_id = owner_id.to_string();
        let entries = self.entries.clone();
        Box::pin(async move {
            Ok(entries
                .read()
                .await
                .iter()
                .filter(|entry| entry.owner_id == owner_id && entry.window_start_ms == window_start_ms)
                .cloned()
                .collect())
        })
    }
}
