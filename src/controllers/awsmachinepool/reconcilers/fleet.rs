use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::controllers::awsmachinepool::scope::ClusterScope;
use crate::cloud::{Fleet, FleetInput};
use crate::resources::awsmachinepools::{
    AwsMachinePool, InstancesDistribution, MixedInstancesPolicy,
};

/// The mutable fleet settings a pool declares
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DesiredFleet {
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: Option<i32>,
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    pub capacity_rebalance: bool,
    /// Compared as a set, outside the field diff
    #[serde(skip)]
    pub subnets: Vec<String>,
}

impl DesiredFleet {
    pub fn new(pool: &AwsMachinePool, scope: &ClusterScope) -> Self {
        let spec = &pool.spec;
        let subnets = match spec.subnets.as_ref().filter(|s| !s.is_empty()) {
            Some(subnets) => subnets.clone(),
            None => scope.subnet_ids(spec.availability_zones.as_deref()),
        };

        Self {
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_capacity: if pool.replicas_externally_managed() {
                None
            } else {
                spec.replicas
            },
            mixed_instances_policy: spec.mixed_instances_policy.clone(),
            capacity_rebalance: spec.capacity_rebalance.unwrap_or(false),
            subnets,
        }
    }

    pub fn input(
        &self,
        name: String,
        launch_template_id: String,
        tags: Option<BTreeMap<String, String>>,
    ) -> FleetInput {
        FleetInput {
            name,
            launch_template_id,
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            subnets: self.subnets.clone(),
            mixed_instances_policy: self.mixed_instances_policy.clone(),
            capacity_rebalance: self.capacity_rebalance,
            tags,
        }
    }
}

/// Fills the fields the provider defaults when they are left unset.
fn with_defaults(mut policy: MixedInstancesPolicy) -> MixedInstancesPolicy {
    let distribution = policy
        .instances_distribution
        .get_or_insert_with(InstancesDistribution::default);
    distribution
        .on_demand_allocation_strategy
        .get_or_insert_with(|| "prioritized".into());
    distribution
        .spot_allocation_strategy
        .get_or_insert_with(|| "lowest-price".into());
    distribution.on_demand_base_capacity.get_or_insert(0);
    distribution
        .on_demand_percentage_above_base_capacity
        .get_or_insert(100);
    policy
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FieldChange {
    pub field: String,
    pub desired: Value,
    pub observed: Value,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.observed, self.desired)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct FleetDiff {
    pub changes: Vec<FieldChange>,
    pub subnets_changed: bool,
}

impl FleetDiff {
    pub fn needs_update(&self) -> bool {
        !self.changes.is_empty() || self.subnets_changed
    }
}

impl fmt::Display for FleetDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.changes.iter().map(ToString::to_string).collect();
        if self.subnets_changed {
            parts.push("subnets".into());
        }
        f.write_str(&parts.join(", "))
    }
}

/// Compares the declared fleet against what the provider reports.
///
/// The observed values are projected onto a copy of `desired`, so fields the pool does not
/// control (an unset or externally managed desired capacity) never show up as changes.
pub(crate) fn diff(desired: &DesiredFleet, observed: &Fleet) -> FleetDiff {
    let mut projected = desired.clone();
    projected.min_size = observed.min_size;
    projected.max_size = observed.max_size;
    if desired.desired_capacity.is_some() {
        projected.desired_capacity = observed.desired_capacity;
    }
    projected.capacity_rebalance = observed.capacity_rebalance;
    projected.mixed_instances_policy = observed.mixed_instances_policy.clone().map(with_defaults);

    let mut desired = desired.clone();
    desired.mixed_instances_policy = desired.mixed_instances_policy.map(with_defaults);

    let mut changes: Vec<FieldChange> = match (serde_json::to_value(&desired), serde_json::to_value(&projected)) {
        (Ok(Value::Object(desired)), Ok(Value::Object(observed))) => desired
            .into_iter()
            .filter_map(|(field, desired)| {
                let observed = observed.get(&field).cloned().unwrap_or(Value::Null);
                (desired != observed).then_some(FieldChange {
                    field,
                    desired,
                    observed,
                })
            })
            .collect(),
        // plain data always serializes to an object
        _ => Vec::new(),
    };
    changes.sort_by(|a, b| a.field.cmp(&b.field));

    let desired_subnets: BTreeSet<&String> = desired.subnets.iter().collect();
    let observed_subnets: BTreeSet<&String> = observed.subnets.iter().collect();

    FleetDiff {
        changes,
        subnets_changed: desired_subnets != observed_subnets,
    }
}

/// Splits the suspended process sets into the processes to resume and the ones to suspend.
pub(crate) fn process_changes(
    current: &[String],
    desired: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let current: BTreeSet<String> = current.iter().cloned().collect();
    let resume = current.difference(desired).cloned().collect();
    let suspend = desired.difference(&current).cloned().collect();
    (resume, suspend)
}
