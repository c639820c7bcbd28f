use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::DomainResult;
use crate::automations::TargetDescriptor;
use crate::drafts::{DraftService, DraftStatus, GeneratedItem};
use crate::error::DomainError;
use crate::jobs::GenerationJobPayload;
use crate::ports::collaborators::{
    AutomationSettingsProvider, EligibleTargetProvider, GenerationCapability,
};
use crate::ports::jobs::JobEnvelope;
use crate::quota::{QuotaController, QuotaResource};
use crate::triggers::TriggerGate;

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub call_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { generated: usize },
    /// The trigger record no longer belongs to this run.
    Superseded,
    /// The draft was applied or expired before generation finished.
    DraftClosed,
    Failed { message: String },
}

/// Consumes draft generation jobs. The only holder of the generation
/// capability.
#[derive(Clone)]
pub struct DraftGenerationService {
    gate: TriggerGate,
    drafts: DraftService,
    quota: QuotaController,
    targets: Arc<dyn EligibleTargetProvider>,
    settings: Arc<dyn AutomationSettingsProvider>,
    generator: Arc<dyn GenerationCapability>,
    config: GenerationConfig,
}

impl DraftGenerationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: TriggerGate,
        drafts: DraftService,
        quota: QuotaController,
        targets: Arc<dyn EligibleTargetProvider>,
        settings: Arc<dyn AutomationSettingsProvider>,
        generator: Arc<dyn GenerationCapability>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            gate,
            drafts,
            quota,
            targets,
            settings,
            generator,
            config,
        }
    }

    pub async fn run(&self, job: &JobEnvelope) -> DomainResult<GenerationOutcome> {
        let payload = GenerationJobPayload::from_job(job)?;

        if !self
            .gate
            .mark_running(&payload.trigger_key, &payload.run_id)
            .await?
        {
            return Ok(GenerationOutcome::Superseded);
        }

        match self.generate(&payload).await {
            Ok(GenerationOutcome::Superseded) => {
                tracing::warn!(
                    run_id = %payload.run_id,
                    draft_id = %payload.draft_id,
                    "trigger record reclaimed by another run, stopping generation"
                );
                Ok(GenerationOutcome::Superseded)
            }
            Ok(outcome) => {
                self.gate
                    .mark_succeeded(&payload.trigger_key, &payload.run_id)
                    .await?;
                tracing::info!(
                    run_id = %payload.run_id,
                    draft_id = %payload.draft_id,
                    outcome = ?outcome,
                    "draft generation finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(
                    run_id = %payload.run_id,
                    draft_id = %payload.draft_id,
                    error = %message,
                    "draft generation failed"
                );
                self.gate
                    .mark_failed(&payload.trigger_key, &payload.run_id, &message)
                    .await?;
                Ok(GenerationOutcome::Failed { message })
            }
        }
    }

    async fn generate(&self, payload: &GenerationJobPayload) -> DomainResult<GenerationOutcome> {
        let draft = self.drafts.get(&payload.draft_id).await?;
        if matches!(draft.status, DraftStatus::Applied | DraftStatus::Expired) {
            return Ok(GenerationOutcome::DraftClosed);
        }

        let automation = self
            .settings
            .get_automation(&draft.owner_id, &draft.automation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let tier = self.settings.plan_tier(&draft.owner_id).await?;
        let eligible: HashMap<String, TargetDescriptor> = self
            .targets
            .list_eligible_targets(&draft.owner_id, &draft.automation_id)
            .await?
            .into_iter()
            .map(|target| (target.target_id.clone(), target))
            .collect();

        let mut generated = 0usize;
        for target_id in &payload.target_ids {
            if !draft.target_ids.contains(target_id) {
                continue;
            }
            let Some(target) = eligible.get(target_id) else {
                tracing::debug!(target_id, "target no longer eligible, skipping generation");
                continue;
            };
            if !self
                .gate
                .heartbeat(&payload.trigger_key, &payload.run_id)
                .await?
            {
                return Ok(GenerationOutcome::Superseded);
            }

            let reference = format!("{}:{target_id}", payload.run_id);
            self.quota
                .admit(
                    &draft.owner_id,
                    tier,
                    QuotaResource::GenerationCall,
                    1,
                    &reference,
                )
                .await?;

            let call = self.generator.generate(target, &automation.rule_config);
            let suggestion = match tokio::time::timeout(self.config.call_timeout, call).await {
                Ok(Ok(suggestion)) => suggestion,
                Ok(Err(err)) => {
                    self.refund(&draft.owner_id, &reference).await;
                    return Err(err.into());
                }
                Err(_) => {
                    self.refund(&draft.owner_id, &reference).await;
                    return Err(DomainError::Collaborator(format!(
                        "generation timed out after {}ms",
                        self.config.call_timeout.as_millis()
                    )));
                }
            };

            let item = GeneratedItem {
                target_id: target_id.clone(),
                suggestion,
                current_value: target.current_value.clone(),
            };
            match self.drafts.append_items(&draft.draft_id, vec![item]).await {
                Ok(_) => generated += 1,
                Err(DomainError::DraftApplied | DomainError::DraftExpired) => {
                    return Ok(GenerationOutcome::DraftClosed);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(GenerationOutcome::Completed { generated })
    }

    async fn refund(&self, owner_id: &str, reference: &str) {
        if let Err(err) = self
            .quota
            .refund(owner_id, QuotaResource::GenerationCall, 1, reference)
            .await
        {
            tracing::warn!(owner_id, reference, error = %err, "quota refund failed");
        }
    }
}
