//! Workflow lifecycle service.
//!
//! Creating a workflow or a new version always goes through validation
//! first; a definition with issues is rejected whole, so the store only
//! ever holds versions the orchestrator can run. Creation also checks that
//! every `secret.<name>` reference resolves to a stored secret, which is a
//! deployment property the structural validator cannot see.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use runloom_types::error::StoreError;
use runloom_types::workflow::{
    Trigger, TriggerType, Workflow, WorkflowDefinition, WorkflowVersion,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::secret::SecretStore;
use crate::repository::workflow::{RunTransaction, WorkflowStore};
use crate::workflow::validator::{self, ValidationIssue, ValidationReport};

#[derive(Debug, Error)]
pub enum WorkflowServiceError {
    #[error("workflow definition is invalid ({} issue(s))", .0.len())]
    Validation(Vec<ValidationIssue>),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Service owning workflow and version creation.
pub struct WorkflowService<S, SS> {
    store: Arc<S>,
    secrets: Arc<SS>,
}

impl<S, SS> WorkflowService<S, SS>
where
    S: WorkflowStore,
    SS: SecretStore,
{
    pub fn new(store: Arc<S>, secrets: Arc<SS>) -> Self {
        WorkflowService { store, secrets }
    }

    /// Create a workflow with its first version and a `Manual` trigger, in
    /// one transaction. The workflow never exists without a runnable
    /// version.
    pub async fn create(
        &self,
        name: &str,
        definition: WorkflowDefinition,
    ) -> Result<(Workflow, WorkflowVersion), WorkflowServiceError> {
        self.validate_or_reject(&definition).await?;
        let now = Utc::now();

        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            version: 1,
            definition,
            created_at: now,
        };
        let workflow = Workflow {
            id: version.workflow_id,
            name: name.to_string(),
            is_active: true,
            latest_version_id: Some(version.id),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_workflow(workflow.clone()).await?;
        tx.insert_trigger(Trigger {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            trigger_type: TriggerType::Manual,
            name: "Manual".to_string(),
            is_active: true,
            config: json!({}),
            created_at: now,
        })
        .await?;
        tx.insert_version(version.clone()).await?;
        tx.set_latest_version(workflow.id, version.id).await?;
        tx.commit().await?;

        tracing::info!(
            workflow_id = %workflow.id,
            version_id = %version.id,
            name,
            "workflow created"
        );
        Ok((workflow, version))
    }

    /// Add a new version to an existing workflow and advance its latest
    /// pointer. Version numbers are allocated inside the transaction, so
    /// concurrent creators cannot collide.
    pub async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowVersion, WorkflowServiceError> {
        self.store
            .workflow(workflow_id)
            .await?
            .ok_or(WorkflowServiceError::WorkflowNotFound(workflow_id))?;
        self.validate_or_reject(&definition).await?;

        let mut tx = self.store.begin().await?;
        let next = tx.latest_version_number(workflow_id).await?.unwrap_or(0) + 1;
        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id,
            version: next,
            definition,
            created_at: Utc::now(),
        };
        tx.insert_version(version.clone()).await?;
        tx.set_latest_version(workflow_id, version.id).await?;
        tx.commit().await?;

        tracing::info!(
            workflow_id = %workflow_id,
            version_id = %version.id,
            version = next,
            "workflow version created"
        );
        Ok(version)
    }

    /// Structural validation only; no store access. Suitable for a dry-run
    /// check of a definition before saving it.
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        validator::validate_definition(definition)
    }

    /// Structural validation plus secret-existence checks; any issue
    /// rejects the definition.
    async fn validate_or_reject(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), WorkflowServiceError> {
        let report = validator::validate_definition(definition);
        let mut issues = report.issues;

        let names: BTreeSet<String> = report
            .referenced_secrets
            .iter()
            .map(|r| r.name.clone())
            .collect();
        if !names.is_empty() {
            let names: Vec<String> = names.into_iter().collect();
            let known: BTreeSet<String> = self
                .secrets
                .find_many_by_names(&names)
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect();
            // Report each missing name once, at its first occurrence.
            let mut reported = BTreeSet::new();
            for reference in &report.referenced_secrets {
                if known.contains(&reference.name) || !reported.insert(reference.name.clone()) {
                    continue;
                }
                issues.push(ValidationIssue {
                    field: Some(reference.field.clone()),
                    step_key: reference.step_key.clone(),
                    message: format!("secret \"{}\" not found", reference.name),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(WorkflowServiceError::Validation(issues))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
