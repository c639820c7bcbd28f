use std::sync::Arc;

use playbook_domain::DomainResult;
use playbook_domain::apply::ApplyRun;
use playbook_domain::drafts::{Draft, DraftKey, DraftStatus};
use playbook_domain::error::DomainError;
use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::apply_runs::ApplyRunRepository;
use playbook_domain::ports::drafts::DraftRepository;
use playbook_domain::ports::quota::{AppendOutcome, QuotaLedgerRepository};
use playbook_domain::quota::{QuotaLedgerEntry, QuotaResource};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, to_value};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

const QUOTA_LIMIT_REACHED: &str = "quota_limit_reached";

const SCHEMA: &str = "\
    DEFINE TABLE IF NOT EXISTS automation_draft SCHEMALESS;\n\
    DEFINE INDEX IF NOT EXISTS automation_draft_live_key ON automation_draft FIELDS live_key UNIQUE;\n\
    DEFINE INDEX IF NOT EXISTS automation_draft_owner ON automation_draft FIELDS owner_id, automation_id;\n\
    DEFINE TABLE IF NOT EXISTS apply_run SCHEMALESS;\n\
    DEFINE INDEX IF NOT EXISTS apply_run_active_key ON apply_run FIELDS active_key UNIQUE;\n\
    DEFINE INDEX IF NOT EXISTS apply_run_draft ON apply_run FIELDS draft_id;\n\
    DEFINE TABLE IF NOT EXISTS quota_ledger SCHEMALESS;\n\
    DEFINE INDEX IF NOT EXISTS quota_ledger_window ON quota_ledger FIELDS owner_id, resource, window_start_ms;";

/// Defines tables and the unique indexes the repositories rely on.
pub async fn ensure_schema(client: &Surreal<Client>) -> DomainResult<()> {
    let response = client.query(SCHEMA).await.map_err(map_surreal_error)?;
    response.check().map_err(map_surreal_error)?;
    Ok(())
}

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let message = err.to_string().to_lowercase();
    if message.contains("already exists")
        || message.contains("already contains")
        || message.contains("duplicate")
        || message.contains("unique")
        || message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Storage(format!("surreal query failed: {message}"))
}

fn invalid_result(err: surrealdb::Error) -> DomainError {
    DomainError::Storage(format!("invalid query result: {err}"))
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>, entity: &str) -> DomainResult<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|err| DomainError::Storage(format!("invalid {entity} row: {err}")))
        })
        .collect()
}

fn decode_one<T: DeserializeOwned>(rows: Vec<Value>, entity: &str) -> DomainResult<Option<T>> {
    Ok(decode_rows(rows, entity)?.into_iter().next())
}

fn payload_with(value: &impl serde::Serialize, field: &str, key: String) -> DomainResult<Value> {
    let mut payload =
        to_value(value).map_err(|err| DomainError::Storage(format!("invalid payload: {err}")))?;
    if let Value::Object(map) = &mut payload {
        map.insert(field.to_string(), Value::String(key));
    }
    Ok(payload)
}

/// Expired drafts keep a per-draft sentinel so the unique index only
/// constrains live drafts.
fn draft_live_key(draft: &Draft) -> String {
    if draft.status == DraftStatus::Expired {
        format!("expired:{}", draft.draft_id)
    } else {
        draft.key().storage_key()
    }
}

pub struct SurrealDraftRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealDraftRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn exists(client: &Surreal<Client>, draft_id: String) -> DomainResult<bool> {
        let mut response = client
            .query("SELECT draft_id FROM automation_draft WHERE draft_id = $draft_id LIMIT 1")
            .bind(("draft_id", draft_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        Ok(!rows.is_empty())
    }
}

impl DraftRepository for SurrealDraftRepository {
    fn create(&self, draft: &Draft) -> BoxFuture<'_, DomainResult<Draft>> {
        let draft = draft.clone();
        let payload = payload_with(&draft, "live_key", draft_live_key(&draft));
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let response = client
                .query("CREATE type::record('automation_draft', $draft_id) CONTENT $payload")
                .bind(("draft_id", draft.draft_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            response.check().map_err(map_surreal_error)?;
            Ok(draft)
        })
    }

    fn get(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Option<Draft>>> {
        let draft_id = draft_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM automation_draft WHERE draft_id = $draft_id LIMIT 1")
                .bind(("draft_id", draft_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_one(rows, "draft")
        })
    }

    fn get_live_by_key(&self, key: &DraftKey) -> BoxFuture<'_, DomainResult<Option<Draft>>> {
        let live_key = key.storage_key();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM automation_draft WHERE live_key = $live_key LIMIT 1")
                .bind(("live_key", live_key))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_one(rows, "draft")
        })
    }

    fn update(&self, draft: &Draft, expected_version: u64) -> BoxFuture<'_, DomainResult<Draft>> {
        let draft = draft.clone();
        let payload = payload_with(&draft, "live_key", draft_live_key(&draft));
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let mut response = client
                .query(
                    "UPDATE type::record('automation_draft', $draft_id) CONTENT $payload \
                     WHERE version = $expected_version RETURN AFTER",
                )
                .bind(("draft_id", draft.draft_id.clone()))
                .bind(("payload", payload))
                .bind(("expected_version", expected_version))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            if !rows.is_empty() {
                return Ok(draft);
            }
            if Self::exists(&client, draft.draft_id.clone()).await? {
                Err(DomainError::Conflict)
            } else {
                Err(DomainError::NotFound)
            }
        })
    }

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<Draft>>> {
        let owner_id = owner_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM automation_draft WHERE owner_id = $owner_id \
                     ORDER BY updated_at_ms DESC, draft_id DESC",
                )
                .bind(("owner_id", owner_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_rows(rows, "draft")
        })
    }

    fn expire_due(&self, now_ms: i64) -> BoxFuture<'_, DomainResult<usize>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE automation_draft SET \
                        status = 'expired', \
                        expired_at_ms = $now_ms, \
                        updated_at_ms = $now_ms, \
                        version += 1, \
                        live_key = string::concat('expired:', draft_id) \
                     WHERE status != 'expired' AND expires_at_ms <= $now_ms \
                     RETURN draft_id",
                )
                .bind(("now_ms", now_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            Ok(rows.len())
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
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE automation_draft SET \
                        status = 'expired', \
                        expired_at_ms = $now_ms, \
                        updated_at_ms = $now_ms, \
                        version += 1, \
                        live_key = string::concat('expired:', draft_id) \
                     WHERE owner_id = $owner_id AND automation_id = $automation_id \
                        AND scope_id != $scope_id AND status != 'expired' \
                     RETURN draft_id",
                )
                .bind(("owner_id", owner_id))
                .bind(("automation_id", automation_id))
                .bind(("scope_id", current_scope_id))
                .bind(("now_ms", now_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            Ok(rows.len())
        })
    }
}

/// A running run holds its draft id as `active_key`; terminal runs release it.
fn run_active_key(run: &ApplyRun) -> String {
    if run.status.is_terminal() {
        format!("done:{}", run.run_id)
    } else {
        run.draft_id.clone()
    }
}

pub struct SurrealApplyRunRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealApplyRunRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn list_where(&self, field: &'static str, value: String) -> DomainResult<Vec<ApplyRun>> {
        let query = format!(
            "SELECT * FROM apply_run WHERE {field} = $value ORDER BY started_at_ms ASC, run_id ASC"
        );
        let mut response = self
            .client
            .query(query)
            .bind(("value", value))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        decode_rows(rows, "apply run")
    }
}

impl ApplyRunRepository for SurrealApplyRunRepository {
    fn create(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>> {
        let run = run.clone();
        let payload = payload_with(&run, "active_key", run_active_key(&run));
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let response = client
                .query("CREATE type::record('apply_run', $run_id) CONTENT $payload")
                .bind(("run_id", run.run_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            response.check().map_err(map_surreal_error)?;
            Ok(run)
        })
    }

    fn update_running(&self, run: &ApplyRun) -> BoxFuture<'_, DomainResult<ApplyRun>> {
        let run = run.clone();
        let payload = payload_with(&run, "active_key", run_active_key(&run));
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let mut response = client
                .query(
                    "UPDATE type::record('apply_run', $run_id) CONTENT $payload \
                     WHERE status = 'running' RETURN AFTER; \
                     SELECT run_id FROM apply_run WHERE run_id = $run_id LIMIT 1",
                )
                .bind(("run_id", run.run_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            let updated: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            if !updated.is_empty() {
                return Ok(run);
            }
            let existing: Vec<Value> = response.take(1).map_err(invalid_result)?;
            if existing.is_empty() {
                Err(DomainError::NotFound)
            } else {
                Err(DomainError::Conflict)
            }
        })
    }

    fn get(&self, run_id: &str) -> BoxFuture<'_, DomainResult<Option<ApplyRun>>> {
        let run_id = run_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM apply_run WHERE run_id = $run_id LIMIT 1")
                .bind(("run_id", run_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_one(rows, "apply run")
        })
    }

    fn list_by_draft(&self, draft_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>> {
        let draft_id = draft_id.to_string();
        Box::pin(async move { self.list_where("draft_id", draft_id).await })
    }

    fn list_by_owner(&self, owner_id: &str) -> BoxFuture<'_, DomainResult<Vec<ApplyRun>>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move { self.list_where("owner_id", owner_id).await })
    }
}

#[derive(Debug, Deserialize)]
struct LedgerUnitsRow {
    kind: String,
    units: u64,
}

pub struct SurrealQuotaLedgerRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealQuotaLedgerRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn usage(
        &self,
        owner_id: String,
        resource: QuotaResource,
        window_start_ms: i64,
    ) -> DomainResult<u64> {
        let mut response = self
            .client
            .query(
                "SELECT kind, units FROM quota_ledger \
                 WHERE owner_id = $owner_id AND resource = $resource \
                    AND window_start_ms = $window_start_ms",
            )
            .bind(("owner_id", owner_id))
            .bind(("resource", resource.as_str()))
            .bind(("window_start_ms", window_start_ms))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        let rows: Vec<LedgerUnitsRow> = decode_rows(rows, "quota ledger")?;
        let (consumed, offset) = rows.iter().fold((0u64, 0u64), |(consumed, offset), row| {
            if row.kind == "offset" {
                (consumed, offset.saturating_add(row.units))
            } else {
                (consumed.saturating_add(row.units), offset)
            }
        });
        Ok(consumed.saturating_sub(offset))
    }
}

impl QuotaLedgerRepository for SurrealQuotaLedgerRepository {
    fn used_in_window(
        &self,
        owner_id: &str,
        resource: QuotaResource,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<u64>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move { self.usage(owner_id, resource, window_start_ms).await })
    }

    fn append(&self, entry: &QuotaLedgerEntry) -> BoxFuture<'_, DomainResult<()>> {
        let entry_id = entry.entry_id.clone();
        let payload = to_value(entry);
        let client = self.client.clone();
        Box::pin(async move {
            let payload =
                payload.map_err(|err| DomainError::Storage(format!("invalid payload: {err}")))?;
            let response = client
                .query("CREATE type::record('quota_ledger', $entry_id) CONTENT $payload")
                .bind(("entry_id", entry_id))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            response.check().map_err(map_surreal_error)?;
            Ok(())
        })
    }

    fn append_within_limit(
        &self,
        entry: &QuotaLedgerEntry,
        limit: u64,
    ) -> BoxFuture<'_, DomainResult<AppendOutcome>> {
        let entry = entry.clone();
        let payload = to_value(&entry);
        let client = self.client.clone();
        Box::pin(async move {
            let payload =
                payload.map_err(|err| DomainError::Storage(format!("invalid payload: {err}")))?;
            let result = client
                .query(
                    "BEGIN TRANSACTION; \
                     LET $rows = (SELECT kind, units FROM quota_ledger \
                        WHERE owner_id = $owner_id AND resource = $resource \
                            AND window_start_ms = $window_start_ms); \
                     LET $consumed = math::sum((SELECT VALUE units FROM $rows WHERE kind = 'consumption')); \
                     LET $offset = math::sum((SELECT VALUE units FROM $rows WHERE kind = 'offset')); \
                     LET $used = math::max([0, $consumed - $offset]); \
                     IF $used + $units > $limit { THROW 'quota_limit_reached' }; \
                     CREATE type::record('quota_ledger', $entry_id) CONTENT $payload; \
                     RETURN $used + $units; \
                     COMMIT TRANSACTION;",
                )
                .bind(("owner_id", entry.owner_id.clone()))
                .bind(("resource", entry.resource.as_str()))
                .bind(("window_start_ms", entry.window_start_ms))
                .bind(("units", entry.units))
                .bind(("limit", limit))
                .bind(("entry_id", entry.entry_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)
                .and_then(|response| response.check().map_err(map_surreal_error));

            match result {
                Ok(_) => {
                    let used_after = self
                        .usage(entry.owner_id.clone(), entry.resource, entry.window_start_ms)
                        .await?;
                    Ok(AppendOutcome::Appended { used_after })
                }
                Err(DomainError::Storage(message)) if message.contains(QUOTA_LIMIT_REACHED) => {
                    let used = self
                        .usage(entry.owner_id.clone(), entry.resource, entry.window_start_ms)
                        .await?;
                    Ok(AppendOutcome::Rejected { used })
                }
                Err(err) => Err(err),
            }
        })
    }

    fn list_window(
        &self,
        owner_id: &str,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<QuotaLedgerEntry>>> {
        let owner_id = owner_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM quota_ledger \
                     WHERE owner_id = $owner_id AND window_start_ms = $window_start_ms \
                     ORDER BY created_at_ms ASC, entry_id ASC",
                )
                .bind(("owner_id", owner_id))
                .bind(("window_start_ms", window_start_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_rows(rows, "quota ledger")
        })
    }
}
