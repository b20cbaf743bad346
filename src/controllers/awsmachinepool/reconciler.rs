use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::*;

use super::client::PoolClient;
use super::reconcilers::fleet::{self, DesiredFleet};
use super::reconcilers::launch_template::{
    desired_launch_template, reconcile_launch_template, LaunchTemplateOutcome, Rollout,
    ROLLOUT_HASH_TAG,
};
use super::reconcilers::machines::{delete_all_machines, sync_machines};
use super::reconcilers::tags::reconcile_tags;
use super::scope::ClusterScope;
use crate::cloud::{Fleet, FleetGateway, TaggedResource};
use crate::conditions::{self, reasons, Conditions};
use crate::resources::awsmachinepools::{
    AwsMachinePool, AwsMachinePoolInstanceStatus, AwsMachinePoolStatus, ConditionSeverity,
    FleetStatus,
};
use crate::resources::awsmachines::provider_id;
use crate::{Error, Result};

/// Wait after creating a fleet before looking at it again.
pub const CREATE_REQUEUE: Duration = Duration::from_secs(15);
/// Wait while an earlier instance refresh blocks a rollout.
pub const REFRESH_DEFERRED_REQUEUE: Duration = Duration::from_secs(30);
/// Poll interval while cloud resources are being torn down.
pub const DELETE_POLL_REQUEUE: Duration = Duration::from_secs(15);
/// Resync interval for fleet membership when instances are tracked individually.
pub const MACHINE_RESYNC_REQUEUE: Duration = Duration::from_secs(3 * 60);

/// `status.failureReason` for problems only a spec change can fix.
const INVALID_CONFIGURATION: &str = "InvalidConfiguration";

#[derive(Clone, Debug, Default)]
pub struct ReconcilerConfig {
    /// Track every fleet instance with its own AwsMachine
    pub machine_pool_machines: bool,
}

/// Converges one AwsMachinePool with its autoscaling group and launch template
pub struct PoolReconciler {
    gateway: Arc<dyn FleetGateway>,
    client: Arc<dyn PoolClient>,
    config: ReconcilerConfig,
}

enum Pass {
    Requeue(Action),
    /// The finalizer is gone; the object may vanish at any moment
    Released,
}

impl PoolReconciler {
    pub fn new(
        gateway: Arc<dyn FleetGateway>,
        client: Arc<dyn PoolClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            gateway,
            client,
            config,
        }
    }

    /// Runs a single pass for the named pool and persists the resulting status.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(pool) = self.client.get_pool(namespace, name).await? else {
            debug!("AwsMachinePool {namespace}/{name} no longer exists");
            return Ok(Action::await_change());
        };

        let mut status = pool.status.clone().unwrap_or_default();
        let mut conditions = Conditions::new(status.conditions.as_ref());

        let result = if pool.meta().deletion_timestamp.is_some() {
            self.reconcile_delete(&pool, &mut status, &mut conditions)
                .await
        } else {
            self.reconcile_normal(&pool, &mut status, &mut conditions)
                .await
                .map(Pass::Requeue)
        };

        let result = match result {
            Ok(Pass::Released) => return Ok(Action::await_change()),
            Ok(Pass::Requeue(action)) => Ok(action),
            Err(err) if err.is_terminal() => {
                warn!("AwsMachinePool {namespace}/{name} needs a spec change: {err}");
                status.failure_reason = Some(INVALID_CONFIGURATION.into());
                status.failure_message = Some(err.to_string());
                conditions.mark_false(
                    conditions::ASG_READY,
                    reasons::INVALID_SPEC,
                    ConditionSeverity::Error,
                    err.to_string(),
                );
                Err(err)
            }
            Err(err) => Err(err),
        };

        conditions.set_summary(conditions::READY, &conditions::READY_CONSTITUENTS);
        status.ready = conditions.is_true(conditions::READY);
        status.conditions = Some(conditions.into_vec());
        status.observed_generation = pool.metadata.generation;
        self.client.patch_status(&pool, &status).await?;

        result
    }

    async fn reconcile_normal(
        &self,
        pool: &AwsMachinePool,
        status: &mut AwsMachinePoolStatus,
        conditions: &mut Conditions,
    ) -> Result<Action> {
        // nothing may be created in the cloud before deletion is guarded
        if !pool.has_finalizer() {
            self.client.add_finalizer(pool).await?;
        }

        pool.validate().map_err(Error::InvalidSpec)?;
        status.failure_reason = None;
        status.failure_message = None;

        let namespace = pool.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let Some((scope, user_data)) = self.prerequisites(pool, &namespace, conditions).await?
        else {
            // the Cluster and Secret watches bring us back
            return Ok(Action::await_change());
        };

        let span = scope.span();
        self.reconcile_fleet(pool, &scope, user_data, status, conditions)
            .instrument(span)
            .await
    }

    async fn prerequisites(
        &self,
        pool: &AwsMachinePool,
        namespace: &str,
        conditions: &mut Conditions,
    ) -> Result<Option<(ClusterScope, Vec<u8>)>> {
        let cluster_name = &pool.spec.cluster_name;
        let scope = match self.client.cluster_scope(namespace, cluster_name).await? {
            Some(scope) if scope.is_ready() && !scope.is_paused() => scope,
            other => {
                let message = match other {
                    None => format!("Cluster {cluster_name} or its infrastructure does not exist"),
                    Some(scope) if scope.is_paused() => format!("Cluster {cluster_name} is paused"),
                    Some(_) => format!("Cluster {cluster_name} infrastructure is not ready"),
                };
                info!("Waiting for cluster infrastructure: {message}");
                conditions.mark_false(
                    conditions::ASG_READY,
                    reasons::WAITING_FOR_CLUSTER_INFRASTRUCTURE,
                    ConditionSeverity::Info,
                    message,
                );
                return Ok(None);
            }
        };

        let user_data = match pool.spec.bootstrap.data_secret_name.as_deref() {
            Some(secret_name) => self.client.bootstrap_data(namespace, secret_name).await?,
            None => None,
        };
        let Some(user_data) = user_data else {
            info!("Waiting for bootstrap data of AwsMachinePool {}", pool.name_any());
            conditions.mark_false(
                conditions::ASG_READY,
                reasons::WAITING_FOR_BOOTSTRAP_DATA,
                ConditionSeverity::Info,
                "bootstrap data secret is not available yet",
            );
            return Ok(None);
        };

        Ok(Some((scope, user_data)))
    }

    async fn reconcile_fleet(
        &self,
        pool: &AwsMachinePool,
        scope: &ClusterScope,
        user_data: Vec<u8>,
        status: &mut AwsMachinePoolStatus,
        conditions: &mut Conditions,
    ) -> Result<Action> {
        let fleet_name = pool.fleet_name();
        let fleet = self
            .gateway
            .find_fleet(&fleet_name)
            .await
            .map_err(Error::gateway("describe", format!("fleet {fleet_name}")))?
            .filter(|f| f.status != FleetStatus::Deleted);

        if let Some(fleet) = fleet
            .as_ref()
            .filter(|f| f.status == FleetStatus::DeleteInProgress)
        {
            warn!("Fleet {} is being deleted out from under its pool", fleet.name);
            status.fleet_status = Some(fleet.status);
            conditions.mark_false(
                conditions::ASG_READY,
                reasons::ASG_DELETION_IN_PROGRESS,
                ConditionSeverity::Warning,
                format!("fleet {} is being deleted", fleet.name),
            );
            return Ok(Action::requeue(DELETE_POLL_REQUEUE));
        }

        let tags = desired_tags(pool, scope);
        let desired_template = desired_launch_template(pool, tags.clone(), user_data);
        let template = reconcile_launch_template(
            self.gateway.as_ref(),
            pool,
            &desired_template,
            fleet.as_ref(),
            conditions,
        )
        .await?;
        status.launch_template_id = Some(template.template.id.clone());
        status.launch_template_version = Some(template.template.version.to_string());

        let desired = DesiredFleet::new(pool, scope);
        let Some(fleet) = fleet else {
            return self
                .create_fleet(pool, &desired, &template, tags, status, conditions)
                .await;
        };

        if self.config.machine_pool_machines {
            match sync_machines(self.gateway.as_ref(), self.client.as_ref(), pool, &fleet).await {
                Ok(()) => conditions.mark_true(conditions::MACHINES_SYNCED),
                Err(err) => {
                    warn!("Failed to sync AwsMachines of fleet {}: {err}", fleet.name);
                    conditions.mark_false(
                        conditions::MACHINES_SYNCED,
                        reasons::MACHINES_SYNC_FAILED,
                        ConditionSeverity::Warning,
                        err.to_string(),
                    );
                }
            }
        }

        if pool.replicas_externally_managed() {
            if let Some(observed) = fleet
                .desired_capacity
                .filter(|capacity| Some(*capacity) != pool.spec.replicas)
            {
                info!(
                    "Capacity of fleet {} is managed externally, recording {observed} replicas",
                    fleet.name
                );
                self.client.patch_replicas(pool, observed).await?;
            }
        }

        let diff = fleet::diff(&desired, &fleet);
        if diff.needs_update() {
            if diff.subnets_changed {
                debug!(
                    "Subnets of fleet {} changed from {:?} to {:?}",
                    fleet.name, fleet.subnets, desired.subnets
                );
            }
            info!("Updating fleet {}: {diff}", fleet.name);
            self.gateway
                .update_fleet(&desired.input(
                    fleet.name.clone(),
                    template.template.id.clone(),
                    None,
                ))
                .await
                .map_err(Error::gateway("update", format!("fleet {}", fleet.name)))?;
        }

        self.reconcile_suspended_processes(pool, &fleet).await?;

        reconcile_tags(
            self.gateway.as_ref(),
            self.client.as_ref(),
            pool,
            &tags,
            &[
                TaggedResource::Fleet(fleet.name.clone()),
                TaggedResource::LaunchTemplate(template.template.id.clone()),
            ],
        )
        .await?;

        project_status(status, &fleet);
        conditions.mark_true(conditions::ASG_READY);

        Ok(if template.rollout == Rollout::Deferred {
            Action::requeue(REFRESH_DEFERRED_REQUEUE)
        } else if self.config.machine_pool_machines {
            Action::requeue(MACHINE_RESYNC_REQUEUE)
        } else {
            Action::await_change()
        })
    }

    async fn create_fleet(
        &self,
        pool: &AwsMachinePool,
        desired: &DesiredFleet,
        template: &LaunchTemplateOutcome,
        mut tags: BTreeMap<String, String>,
        status: &mut AwsMachinePoolStatus,
        conditions: &mut Conditions,
    ) -> Result<Action> {
        tags.insert(ROLLOUT_HASH_TAG.into(), template.rollout_hash.clone());
        let mut input =
            desired.input(pool.fleet_name(), template.template.id.clone(), Some(tags));
        // externally managed pools still start at their declared size
        input.desired_capacity = pool.spec.replicas;

        info!("Creating fleet {}", input.name);
        let fleet = self.gateway.create_fleet(&input).await.map_err(|err| {
            conditions.mark_false(
                conditions::ASG_READY,
                reasons::ASG_PROVISION_FAILED,
                ConditionSeverity::Error,
                err.to_string(),
            );
            Error::gateway("create", format!("fleet {}", input.name))(err)
        })?;

        if let Err(err) = self
            .client
            .publish_event(
                pool,
                "FleetCreated",
                "Creating",
                format!("Created fleet `{}`", fleet.name),
            )
            .await
        {
            warn!("Failed to publish event: {err}");
        }

        status.provider_id = Some(fleet.id.clone());
        status.fleet_status = Some(fleet.status);
        conditions.mark_false(
            conditions::ASG_READY,
            reasons::ASG_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );

        Ok(Action::requeue(CREATE_REQUEUE))
    }

    async fn reconcile_suspended_processes(
        &self,
        pool: &AwsMachinePool,
        fleet: &Fleet,
    ) -> Result<()> {
        let (resume, suspend) = fleet::process_changes(
            &fleet.suspended_processes,
            &pool.desired_suspended_processes(),
        );

        if !resume.is_empty() {
            info!("Resuming processes {resume:?} of fleet {}", fleet.name);
            self.gateway
                .resume_processes(&fleet.name, &resume)
                .await
                .map_err(Error::gateway("resume processes of", format!("fleet {}", fleet.name)))?;
        }
        if !suspend.is_empty() {
            info!("Suspending processes {suspend:?} of fleet {}", fleet.name);
            self.gateway
                .suspend_processes(&fleet.name, &suspend)
                .await
                .map_err(Error::gateway("suspend processes of", format!("fleet {}", fleet.name)))?;
        }
        Ok(())
    }

    /// Tears down the fleet, then the launch template, and only then releases the pool.
    async fn reconcile_delete(
        &self,
        pool: &AwsMachinePool,
        status: &mut AwsMachinePoolStatus,
        conditions: &mut Conditions,
    ) -> Result<Pass> {
        if !pool.has_finalizer() {
            return Ok(Pass::Released);
        }

        if self.config.machine_pool_machines {
            delete_all_machines(self.client.as_ref(), pool).await?;
        }

        let fleet_name = pool.fleet_name();
        let fleet = self
            .gateway
            .find_fleet(&fleet_name)
            .await
            .map_err(Error::gateway("describe", format!("fleet {fleet_name}")))?;

        match fleet {
            Some(fleet) if fleet.status == FleetStatus::DeleteInProgress => {
                info!("Fleet {} is still being deleted", fleet.name);
                status.fleet_status = Some(fleet.status);
                conditions.mark_false(
                    conditions::ASG_READY,
                    reasons::ASG_DELETION_IN_PROGRESS,
                    ConditionSeverity::Warning,
                    "",
                );
                return Ok(Pass::Requeue(Action::requeue(DELETE_POLL_REQUEUE)));
            }
            Some(fleet) if fleet.status != FleetStatus::Deleted => {
                info!("Deleting fleet {}", fleet.name);
                self.gateway
                    .delete_fleet(&fleet.name)
                    .await
                    .map_err(Error::gateway("delete", format!("fleet {}", fleet.name)))?;

                if let Err(err) = self
                    .client
                    .publish_event(
                        pool,
                        "DeleteRequested",
                        "Deleting",
                        format!("Deleting fleet `{}`", fleet.name),
                    )
                    .await
                {
                    warn!("Failed to publish event: {err}");
                }

                status.fleet_status = Some(FleetStatus::DeleteInProgress);
                conditions.mark_false(
                    conditions::ASG_READY,
                    reasons::ASG_DELETION_IN_PROGRESS,
                    ConditionSeverity::Warning,
                    "",
                );
                return Ok(Pass::Requeue(Action::requeue(DELETE_POLL_REQUEUE)));
            }
            _ => {}
        }
        status.fleet_status = Some(FleetStatus::Deleted);

        let template_name = pool.launch_template_name();
        if let Some(template) = self
            .gateway
            .find_launch_template(&template_name)
            .await
            .map_err(Error::gateway(
                "describe",
                format!("launch template {template_name}"),
            ))?
        {
            info!("Deleting launch template {}", template.name);
            self.gateway
                .delete_launch_template(&template.id)
                .await
                .map_err(Error::gateway(
                    "delete",
                    format!("launch template {}", template.name),
                ))?;
            // released on a later pass that sees both resources gone
            return Ok(Pass::Requeue(Action::requeue(DELETE_POLL_REQUEUE)));
        }

        info!(
            "Fleet and launch template of AwsMachinePool {} are gone, removing finalizer",
            pool.name_any()
        );
        self.client.remove_finalizer(pool).await?;
        Ok(Pass::Released)
    }
}

/// Cluster-wide tags overlaid with the pool's own.
fn desired_tags(pool: &AwsMachinePool, scope: &ClusterScope) -> BTreeMap<String, String> {
    let mut tags = scope.additional_tags();
    if let Some(additional) = &pool.spec.additional_tags {
        tags.extend(additional.clone());
    }
    tags
}

fn project_status(status: &mut AwsMachinePoolStatus, fleet: &Fleet) {
    status.provider_id = Some(fleet.id.clone());
    status.fleet_status = Some(fleet.status);
    status.provider_id_list = Some(
        fleet
            .instances
            .iter()
            .map(|i| provider_id(&i.availability_zone, &i.id))
            .collect(),
    );
    status.instances = Some(
        fleet
            .instances
            .iter()
            .map(|i| AwsMachinePoolInstanceStatus {
                instance_id: i.id.clone(),
                availability_zone: i.availability_zone.clone(),
                lifecycle_state: i.lifecycle_state.clone(),
            })
            .collect(),
    );
    status.replicas = i32::try_from(fleet.instances.len()).unwrap_or(i32::MAX);
}
