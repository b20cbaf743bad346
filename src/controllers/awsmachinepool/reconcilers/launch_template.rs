use std::collections::{BTreeMap, BTreeSet};

use sha2::Digest;
use tracing::*;

use crate::cloud::{
    Fleet, FleetGateway, LaunchTemplate, LaunchTemplateInput, RefreshOutcome, TaggedResource,
};
use crate::conditions::{self, reasons, Conditions};
use crate::resources::awsmachinepools::{AwsMachinePool, ConditionSeverity};
use crate::{Error, Result};

/// Fleet tag recording which launch template contents the running instances were rolled out with.
pub const ROLLOUT_HASH_TAG: &str = "machinepool.dev/rollout-hash";

/// What happened to already-running instances during launch template reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rollout {
    /// Instances already match the template, or refreshes are disabled
    NotNeeded,
    Started,
    /// Another refresh is in flight; retry on a later pass
    Deferred,
}

pub(crate) struct LaunchTemplateOutcome {
    pub template: LaunchTemplate,
    pub rollout_hash: String,
    pub rollout: Rollout,
}

pub(crate) fn user_data_hash(user_data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(user_data))
}

pub(crate) fn desired_launch_template(
    pool: &AwsMachinePool,
    tags: BTreeMap<String, String>,
    user_data: Vec<u8>,
) -> LaunchTemplateInput {
    let spec = &pool.spec.aws_launch_template;
    LaunchTemplateInput {
        name: pool.launch_template_name(),
        ami_id: spec.ami_id.clone(),
        instance_type: spec.instance_type.clone(),
        iam_instance_profile: spec.iam_instance_profile.clone(),
        ssh_key_name: spec.ssh_key_name.clone(),
        security_group_ids: spec.additional_security_groups.clone().unwrap_or_default(),
        user_data_hash: user_data_hash(&user_data),
        user_data,
        tags,
    }
}

/// Hash over the template fields whose change should replace running instances.
/// User data is left out: new bootstrap data only applies to newly launched instances.
pub(crate) fn rollout_hash(input: &LaunchTemplateInput) -> String {
    use std::hash::Hasher;

    let mut hasher = fnv::FnvHasher::default();
    let mut write = |field: &str| {
        hasher.write(field.as_bytes());
        hasher.write_u8(0);
    };

    write(&input.ami_id);
    write(&input.instance_type);
    write(input.iam_instance_profile.as_deref().unwrap_or_default());
    write(input.ssh_key_name.as_deref().unwrap_or_default());
    for sg in input.security_group_ids.iter().collect::<BTreeSet<_>>() {
        write(sg);
    }
    for (key, value) in &input.tags {
        write(key);
        write(value);
    }

    format!("{:016x}", hasher.finish())
}

/// Whether the latest version of `current` differs from `desired` in a refresh-worthy field.
fn template_changed(current: &LaunchTemplate, desired: &LaunchTemplateInput) -> bool {
    let current_sgs: BTreeSet<&String> = current.security_group_ids.iter().collect();
    let desired_sgs: BTreeSet<&String> = desired.security_group_ids.iter().collect();

    current.ami_id != desired.ami_id
        || current.instance_type != desired.instance_type
        || current.iam_instance_profile != desired.iam_instance_profile
        || current.ssh_key_name != desired.ssh_key_name
        || current_sgs != desired_sgs
        || current.tags != desired.tags
}

/// Ensures the launch template exists with a latest version matching the pool, and rolls the
/// fleet's instances onto it when its refresh-worthy contents changed.
pub(crate) async fn reconcile_launch_template(
    gateway: &dyn FleetGateway,
    pool: &AwsMachinePool,
    desired: &LaunchTemplateInput,
    fleet: Option<&Fleet>,
    conditions: &mut Conditions,
) -> Result<LaunchTemplateOutcome> {
    let rollout_hash = rollout_hash(desired);

    let existing = match gateway.find_launch_template(&desired.name).await {
        Ok(existing) => existing,
        Err(err) => {
            conditions.mark_unknown(
                conditions::LAUNCH_TEMPLATE_READY,
                reasons::LAUNCH_TEMPLATE_NOT_FOUND,
                err.to_string(),
            );
            return Err(Error::gateway(
                "describe",
                format!("launch template {}", desired.name),
            )(err));
        }
    };

    let Some(current) = existing else {
        info!("Creating launch template {}", desired.name);
        let template = gateway.create_launch_template(desired).await.map_err(|err| {
            conditions.mark_false(
                conditions::LAUNCH_TEMPLATE_READY,
                reasons::LAUNCH_TEMPLATE_CREATE_FAILED,
                ConditionSeverity::Error,
                err.to_string(),
            );
            Error::gateway("create", format!("launch template {}", desired.name))(err)
        })?;
        conditions.mark_true(conditions::LAUNCH_TEMPLATE_READY);

        let rollout = roll_out(gateway, pool, fleet, &rollout_hash, conditions).await?;
        return Ok(LaunchTemplateOutcome {
            template,
            rollout_hash,
            rollout,
        });
    };

    let needs_new_version = template_changed(&current, desired)
        || current.user_data_hash.as_deref() != Some(desired.user_data_hash.as_str());

    // the refresh gate is consulted before the version that would need it exists
    let rollout = roll_out_gate(gateway, pool, fleet, &rollout_hash).await?;

    let template = if needs_new_version {
        info!(
            "Creating a new version of launch template {} (currently {})",
            current.name, current.version
        );
        create_version(gateway, &current, desired)
            .await
            .inspect_err(|err| {
                conditions.mark_false(
                    conditions::LAUNCH_TEMPLATE_READY,
                    reasons::LAUNCH_TEMPLATE_RECONCILE_FAILED,
                    ConditionSeverity::Error,
                    err.to_string(),
                )
            })?
    } else {
        current
    };
    conditions.mark_true(conditions::LAUNCH_TEMPLATE_READY);

    let rollout = match rollout {
        Gate::Open => start_refresh(gateway, pool, fleet, &rollout_hash, conditions).await?,
        Gate::Closed => {
            conditions.mark_false(
                conditions::INSTANCE_REFRESH_STARTED,
                reasons::INSTANCE_REFRESH_NOT_READY,
                ConditionSeverity::Info,
                "waiting for the running instance refresh to finish",
            );
            Rollout::Deferred
        }
        Gate::NotNeeded => Rollout::NotNeeded,
    };

    Ok(LaunchTemplateOutcome {
        template,
        rollout_hash,
        rollout,
    })
}

async fn create_version(
    gateway: &dyn FleetGateway,
    current: &LaunchTemplate,
    desired: &LaunchTemplateInput,
) -> Result<LaunchTemplate> {
    gateway
        .prune_launch_template_versions(&current.id)
        .await
        .map_err(Error::gateway(
            "prune versions of",
            format!("launch template {}", current.name),
        ))?;
    gateway
        .create_launch_template_version(&current.id, desired)
        .await
        .map_err(Error::gateway(
            "create a version of",
            format!("launch template {}", current.name),
        ))
}

enum Gate {
    NotNeeded,
    Open,
    Closed,
}

/// Decides whether the fleet needs a rollout and whether one can start now. Fleets that have
/// never been tagged, and fleets of pools with refreshes disabled, adopt the current hash.
async fn roll_out_gate(
    gateway: &dyn FleetGateway,
    pool: &AwsMachinePool,
    fleet: Option<&Fleet>,
    rollout_hash: &str,
) -> Result<Gate> {
    let Some(fleet) = fleet else {
        return Ok(Gate::NotNeeded);
    };

    match fleet.tags.get(ROLLOUT_HASH_TAG) {
        Some(applied) if applied == rollout_hash => Ok(Gate::NotNeeded),
        Some(_) if !pool.refresh_disabled() => {
            let can_start = gateway
                .can_start_instance_refresh(&fleet.name)
                .await
                .map_err(Error::gateway(
                    "check instance refresh of",
                    format!("fleet {}", fleet.name),
                ))?;
            Ok(if can_start { Gate::Open } else { Gate::Closed })
        }
        _ => {
            debug!("Adopting rollout hash {rollout_hash} for fleet {}", fleet.name);
            tag_rollout_hash(gateway, fleet, rollout_hash).await?;
            Ok(Gate::NotNeeded)
        }
    }
}

/// Used when the template had to be created from scratch under an existing fleet.
async fn roll_out(
    gateway: &dyn FleetGateway,
    pool: &AwsMachinePool,
    fleet: Option<&Fleet>,
    rollout_hash: &str,
    conditions: &mut Conditions,
) -> Result<Rollout> {
    match roll_out_gate(gateway, pool, fleet, rollout_hash).await? {
        Gate::Open => start_refresh(gateway, pool, fleet, rollout_hash, conditions).await,
        Gate::Closed => Ok(Rollout::Deferred),
        Gate::NotNeeded => Ok(Rollout::NotNeeded),
    }
}

async fn start_refresh(
    gateway: &dyn FleetGateway,
    pool: &AwsMachinePool,
    fleet: Option<&Fleet>,
    rollout_hash: &str,
    conditions: &mut Conditions,
) -> Result<Rollout> {
    let Some(fleet) = fleet else {
        return Ok(Rollout::NotNeeded);
    };

    let preferences = pool.spec.refresh_preferences.clone().unwrap_or_default();
    let outcome = gateway
        .start_instance_refresh(&fleet.name, &preferences)
        .await
        .map_err(Error::gateway(
            "start instance refresh of",
            format!("fleet {}", fleet.name),
        ))?;

    match outcome {
        RefreshOutcome::Started => {
            info!("Started instance refresh of fleet {}", fleet.name);
            tag_rollout_hash(gateway, fleet, rollout_hash).await?;
            conditions.mark_true(conditions::INSTANCE_REFRESH_STARTED);
            Ok(Rollout::Started)
        }
        RefreshOutcome::AlreadyInProgress => {
            debug!("Instance refresh of fleet {} already in progress", fleet.name);
            Ok(Rollout::Deferred)
        }
    }
}

async fn tag_rollout_hash(gateway: &dyn FleetGateway, fleet: &Fleet, rollout_hash: &str) -> Result<()> {
    let resource = TaggedResource::Fleet(fleet.name.clone());
    gateway
        .update_resource_tags(
            &resource,
            &BTreeMap::from([(ROLLOUT_HASH_TAG.to_string(), rollout_hash.to_string())]),
            &BTreeSet::new(),
        )
        .await
        .map_err(Error::gateway("tag", resource.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> LaunchTemplateInput {
        LaunchTemplateInput {
            name: "pool-a".into(),
            ami_id: "ami-1".into(),
            instance_type: "m6i.large".into(),
            security_group_ids: vec!["sg-1".into(), "sg-2".into()],
            user_data: b"#!/bin/bash".to_vec(),
            user_data_hash: user_data_hash(b"#!/bin/bash"),
            ..Default::default()
        }
    }

    fn template_of(input: &LaunchTemplateInput) -> LaunchTemplate {
        LaunchTemplate {
            id: "lt-1".into(),
            name: input.name.clone(),
            version: 1,
            ami_id: input.ami_id.clone(),
            instance_type: input.instance_type.clone(),
            iam_instance_profile: input.iam_instance_profile.clone(),
            ssh_key_name: input.ssh_key_name.clone(),
            security_group_ids: input.security_group_ids.clone(),
            user_data_hash: Some(input.user_data_hash.clone()),
            tags: input.tags.clone(),
        }
    }

    #[test]
    fn user_data_hash_is_hex_sha256() {
        assert_eq!(
            user_data_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rollout_hash_ignores_user_data_and_group_order() {
        let base = input();

        let mut reordered = input();
        reordered.security_group_ids.reverse();
        assert_eq!(rollout_hash(&base), rollout_hash(&reordered));

        let mut new_user_data = input();
        new_user_data.user_data = b"#!/bin/sh".to_vec();
        new_user_data.user_data_hash = user_data_hash(&new_user_data.user_data);
        assert_eq!(rollout_hash(&base), rollout_hash(&new_user_data));

        let mut new_ami = input();
        new_ami.ami_id = "ami-2".into();
        assert_ne!(rollout_hash(&base), rollout_hash(&new_ami));
    }

    #[test]
    fn template_change_detection() {
        let desired = input();
        let mut current = template_of(&desired);
        assert!(!template_changed(&current, &desired));

        current.security_group_ids.reverse();
        assert!(!template_changed(&current, &desired));

        current.instance_type = "m6i.xlarge".into();
        assert!(template_changed(&current, &desired));
    }
}
