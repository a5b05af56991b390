// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Standalone deployment lifecycle.
//!
//! Deployments reuse the unified task queue: deploy tasks carry a deployment
//! back-reference instead of an experiment one. Status follows the task
//! outcomes (all hosts confirmed means `active`, any abandoned deploy means
//! `degraded`), and deletion issues best-effort rollback tasks.

use chrono::Utc;
use phoenix_model::{
    DeploymentId, DeploymentStatus, HostId, HostSelector, NewTask, PipelineDeployment, PipelineId,
    TaskAction, TaskStatus, new_id,
};
use std::collections::BTreeMap;

use crate::controller::Controller;
use crate::error::Error;

/// Parameters for creating a standalone deployment.
#[derive(Debug, Clone)]
pub struct CreateDeployment {
    /// Display name.
    pub name: String,
    /// The pipeline to deploy.
    pub pipeline: PipelineId,
    /// Target host selection.
    pub host_selector: HostSelector,
    /// Template parameters.
    pub parameters: BTreeMap<String, String>,
}

/// Mutable fields of a deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    /// New display name.
    pub name: Option<String>,
    /// Replacement template parameters.
    pub parameters: Option<BTreeMap<String, String>>,
}

impl Controller {
    /// Creates a deployment and issues its deploy tasks.
    ///
    /// Label selectors resolve against currently registered hosts; an empty
    /// resolution is a validation error.
    pub fn create_deployment(
        &self,
        params: CreateDeployment,
    ) -> Result<PipelineDeployment, Error> {
        let mut errors = params.host_selector.validation_errors();
        if params.pipeline.is_empty() {
            errors.push("pipeline must not be empty".to_owned());
        }
        if !errors.is_empty() {
            return Err(Error::Validation {
                entity: "deployment",
                errors,
            });
        }
        let resolved: Vec<HostId> = match &params.host_selector {
            HostSelector::Hosts(hosts) => hosts.clone(),
            HostSelector::Labels(labels) => {
                let matched = self.store.hosts_matching_labels(labels);
                if matched.is_empty() {
                    return Err(Error::Validation {
                        entity: "deployment",
                        errors: vec!["host_selector.labels matches no registered hosts".to_owned()],
                    });
                }
                matched
            }
        };

        let now = Utc::now();
        let deployment = PipelineDeployment {
            id: new_id(),
            name: params.name,
            pipeline: params.pipeline.clone(),
            host_selector: params.host_selector,
            parameters: params.parameters.clone(),
            status: DeploymentStatus::Pending,
            resolved_hosts: resolved.clone(),
            created_at: now,
            updated_at: now,
        };
        let deployment = self.store.create_deployment(deployment)?;

        let specs = resolved
            .into_iter()
            .map(|host| {
                NewTask::for_deployment(
                    deployment.id.clone(),
                    host,
                    TaskAction::DeployPipeline {
                        pipeline: params.pipeline.clone(),
                        variant: None,
                        parameters: params.parameters.clone(),
                    },
                )
            })
            .collect();
        let _ = self.store.enqueue_tasks(specs);
        let (deployment, ()) = self.store.update_deployment(&deployment.id, |d| {
            d.status = DeploymentStatus::Deploying;
        })?;
        tracing::info!(deployment = %deployment.id, hosts = deployment.resolved_hosts.len(), "deployment created");
        Ok(deployment)
    }

    /// Reads a deployment.
    pub fn get_deployment(&self, id: &DeploymentId) -> Result<PipelineDeployment, Error> {
        Ok(self.store.get_deployment(id)?)
    }

    /// All deployments, in creation order.
    #[must_use]
    pub fn list_deployments(&self) -> Vec<PipelineDeployment> {
        self.store.list_deployments()
    }

    /// Applies a patch to a non-terminal deployment.
    ///
    /// # Errors
    ///
    /// Precondition failure when the deployment is already rolled back or
    /// deleted.
    pub fn patch_deployment(
        &self,
        id: &DeploymentId,
        patch: DeploymentPatch,
    ) -> Result<PipelineDeployment, Error> {
        let current = self.store.get_deployment(id)?;
        if current.status.is_terminal() {
            return Err(Error::DeploymentTerminal {
                id: id.clone(),
                status: current.status,
            });
        }
        let (deployment, ()) = self.store.update_deployment(id, |d| {
            if let Some(name) = patch.name {
                d.name = name;
            }
            if let Some(parameters) = patch.parameters {
                d.parameters = parameters;
            }
        })?;
        Ok(deployment)
    }

    /// Deletes a deployment: outstanding tasks are terminally failed and a
    /// rollback task is issued per resolved host. A deployment that never
    /// issued tasks is deleted outright.
    pub fn delete_deployment(&self, id: &DeploymentId) -> Result<PipelineDeployment, Error> {
        let current = self.store.get_deployment(id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        let _ = self
            .store
            .fail_deployment_tasks(id, "deployment deleted");
        let final_status = if current.resolved_hosts.is_empty() {
            DeploymentStatus::Deleted
        } else {
            let specs = current
                .resolved_hosts
                .iter()
                .map(|host| {
                    NewTask::for_deployment(
                        id.clone(),
                        host.clone(),
                        TaskAction::RollbackPipeline {
                            pipeline: current.pipeline.clone(),
                        },
                    )
                })
                .collect();
            let _ = self.store.enqueue_tasks(specs);
            DeploymentStatus::RolledBack
        };
        let (deployment, ()) = self.store.update_deployment(id, |d| {
            d.status = final_status;
        })?;
        tracing::info!(deployment = %id, status = ?deployment.status, "deployment deleted");
        Ok(deployment)
    }

    /// Reconciles every live deployment against its task outcomes.
    pub(crate) fn reconcile_deployments(&self) {
        for deployment in self.store.list_deployments() {
            if deployment.status == DeploymentStatus::Deploying
                && let Err(e) = self.reconcile_deployment(&deployment.id)
            {
                tracing::warn!(deployment = %deployment.id, error = %e, "deployment reconcile failed");
            }
        }
    }

    /// Advances one deployment's status from its task outcomes.
    pub(crate) fn reconcile_deployment(&self, id: &DeploymentId) -> Result<(), Error> {
        let deployment = self.store.get_deployment(id)?;
        if deployment.status != DeploymentStatus::Deploying {
            return Ok(());
        }
        let tasks = self.store.tasks_for_deployment(id);
        let deploys: Vec<_> = tasks
            .iter()
            .filter(|t| matches!(t.action, TaskAction::DeployPipeline { .. }))
            .collect();
        if deploys.iter().any(|t| t.status == TaskStatus::Abandoned) {
            let (_, ()) = self.store.update_deployment(id, |d| {
                d.status = DeploymentStatus::Degraded;
            })?;
            tracing::warn!(deployment = %id, "deployment degraded");
        } else if !deploys.is_empty() && deploys.iter().all(|t| t.status == TaskStatus::Completed) {
            let (_, ()) = self.store.update_deployment(id, |d| {
                d.status = DeploymentStatus::Active;
            })?;
            tracing::info!(deployment = %id, "deployment active");
        }
        Ok(())
    }
}
