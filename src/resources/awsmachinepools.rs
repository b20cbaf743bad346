use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static AWS_MACHINE_POOL_FINALIZER: &str = "awsmachinepools.infrastructure.machinepool.dev";

/// When set to any non-empty value, the fleet's desired capacity is owned by an external
/// autoscaler and flows back into `spec.replicas` instead of being enforced.
pub const REPLICAS_MANAGED_BY_ANNOTATION: &str = "cluster.x-k8s.io/replicas-managed-by";

/// JSON object of the additional tags last pushed to the fleet and launch template.
pub const LAST_APPLIED_TAGS_ANNOTATION: &str = "machinepool.dev/last-applied-tags";

/// Autoscaling processes that may be listed in `spec.suspendProcesses`.
pub const SUSPENDABLE_PROCESSES: [&str; 9] = [
    "Launch",
    "Terminate",
    "AddToLoadBalancer",
    "AlarmNotification",
    "AZRebalance",
    "HealthCheck",
    "InstanceRefresh",
    "ReplaceUnhealthy",
    "ScheduledActions",
];

const ALL_PROCESSES: &str = "All";

/// Represents a pool of EC2 instances backed by an autoscaling group and a launch template
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "AwsMachinePool",
    group = "infrastructure.machinepool.dev",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"MinSize", "type":"integer", "jsonPath":".spec.minSize"}"#,
    printcolumn = r#"{"name":"MaxSize", "type":"integer", "jsonPath":".spec.maxSize"}"#,
    printcolumn = r#"{"name":"LaunchTemplate", "priority": 1, "type":"string", "jsonPath":".status.launchTemplateVersion"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "AwsMachinePoolStatus", shortname = "awsmp")]
#[serde(rename_all = "camelCase")]
pub struct AwsMachinePoolSpec {
    /// clusterName is the name of the Cluster (in the same namespace) this pool belongs to.
    pub cluster_name: String,
    /// replicas is the desired capacity of the fleet. Written back by the operator when
    /// replicas are managed externally.
    #[schemars(range(min = 0))]
    pub replicas: Option<i32>,
    /// minSize defines the minimum size of the group. Defaults to 1.
    #[serde(default = "default_min_size")]
    #[schemars(range(min = 0))]
    pub min_size: i32,
    /// maxSize defines the maximum size of the group. Defaults to 1.
    #[serde(default = "default_max_size")]
    #[schemars(range(min = 0))]
    pub max_size: i32,
    /// availabilityZones restricts subnets taken from the cluster network to these zones.
    pub availability_zones: Option<Vec<String>>,
    /// subnets is an explicit list of subnet IDs; when unset the cluster's private subnets are used.
    pub subnets: Option<Vec<String>>,
    /// additionalTags is a map of tags applied to the fleet, launch template and instances.
    pub additional_tags: Option<BTreeMap<String, String>>,
    /// awsLaunchTemplate describes the instances the fleet launches.
    pub aws_launch_template: AwsLaunchTemplateSpec,
    /// mixedInstancesPolicy describes how multiple instance types are used.
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    /// suspendProcesses lists autoscaling processes to suspend. `All` suspends every process.
    pub suspend_processes: Option<Vec<String>>,
    /// refreshPreferences describes how instances are replaced when the launch template changes.
    pub refresh_preferences: Option<RefreshPreferences>,
    /// capacityRebalance enables proactive replacement of spot instances at elevated risk of interruption.
    pub capacity_rebalance: Option<bool>,
    /// bootstrap locates the instance user data.
    #[serde(default)]
    pub bootstrap: BootstrapSpec,
}

fn default_min_size() -> i32 {
    1
}

fn default_max_size() -> i32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsLaunchTemplateSpec {
    /// The name of the launch template. Defaults to the pool name.
    pub name: Option<String>,
    /// The AMI to launch instances from.
    pub ami_id: String,
    /// The EC2 instance type, eg `m6i.large`.
    pub instance_type: String,
    /// The IAM instance profile attached to instances.
    pub iam_instance_profile: Option<String>,
    /// The SSH key pair name.
    pub ssh_key_name: Option<String>,
    /// Security group IDs attached to instances.
    pub additional_security_groups: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// The name of a Secret in the pool's namespace whose `value` key holds the instance user data.
    /// Unset until the bootstrap provider has generated it.
    pub data_secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MixedInstancesPolicy {
    pub instances_distribution: Option<InstancesDistribution>,
    pub overrides: Option<Vec<InstanceTypeOverride>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstancesDistribution {
    /// Defaults to `prioritized`.
    pub on_demand_allocation_strategy: Option<String>,
    /// Defaults to `lowest-price`.
    pub spot_allocation_strategy: Option<String>,
    /// Defaults to 0.
    pub on_demand_base_capacity: Option<i64>,
    /// Defaults to 100.
    pub on_demand_percentage_above_base_capacity: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeOverride {
    pub instance_type: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPreferences {
    /// disable, if true, stops the operator from starting an instance refresh when the
    /// launch template changes.
    pub disable: Option<bool>,
    /// The refresh strategy. Only `Rolling` is supported by the provider today.
    pub strategy: Option<String>,
    /// Seconds until a newly launched instance is configured and ready to use.
    pub instance_warmup: Option<i64>,
    /// The percentage of the fleet that must remain healthy during a refresh.
    #[schemars(range(min = 0, max = 100))]
    pub min_healthy_percentage: Option<i64>,
}

/// Lifecycle of the backing autoscaling group, as reported by the provider.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum FleetStatus {
    Provisioning,
    Active,
    Updating,
    DeleteInProgress,
    Deleted,
}

/// Status of the AwsMachinePool.
/// This is set and managed automatically.
/// Read-only.
/// More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachinePoolStatus {
    /// True once the fleet exists and its instances are reflected here.
    #[serde(default)]
    pub ready: bool,
    /// The number of instances currently in the fleet.
    #[serde(default)]
    pub replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_status: Option<FleetStatus>,
    /// The ARN of the autoscaling group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Provider IDs (`aws:///<zone>/<instance-id>`) of every fleet member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<AwsMachinePoolInstanceStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_template_version: Option<String>,
    /// Set for problems that need a change to the spec to resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<AwsMachinePoolCondition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachinePoolInstanceStatus {
    pub instance_id: String,
    pub availability_zone: String,
    pub lifecycle_state: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachinePoolCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,

    /// Human-readable message indicating details about last transition.
    pub message: Option<String>,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,

    /// How bad a False condition is. Unset for True conditions.
    pub severity: Option<ConditionSeverity>,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: ConditionStatus,

    /// Type of the condition, known values are (`Ready`, `ASGReady`, `LaunchTemplateReady`,
    /// `InstanceRefreshStarted`, `MachinesSynced`).
    pub r#type: String,
}

impl AwsMachinePool {
    /// Whether an external autoscaler owns the fleet's desired capacity.
    pub fn replicas_externally_managed(&self) -> bool {
        self.annotations()
            .get(REPLICAS_MANAGED_BY_ANNOTATION)
            .is_some_and(|v| !v.is_empty())
    }

    pub fn launch_template_name(&self) -> String {
        self.spec
            .aws_launch_template
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// The autoscaling group shares the pool's name.
    pub fn fleet_name(&self) -> String {
        self.name_any()
    }

    pub fn refresh_disabled(&self) -> bool {
        self.spec
            .refresh_preferences
            .as_ref()
            .and_then(|r| r.disable)
            .unwrap_or(false)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == AWS_MACHINE_POOL_FINALIZER)
    }

    /// The set of autoscaling processes that should be suspended, with `All` expanded.
    pub fn desired_suspended_processes(&self) -> BTreeSet<String> {
        let requested = self.spec.suspend_processes.iter().flatten();
        if requested.clone().any(|p| p == ALL_PROCESSES) {
            return SUSPENDABLE_PROCESSES.iter().map(|p| p.to_string()).collect();
        }
        requested.cloned().collect()
    }

    /// Checks the parts of the spec that no amount of retrying can fix.
    pub fn validate(&self) -> Result<(), String> {
        let spec = &self.spec;
        if spec.min_size < 0 {
            return Err(format!("minSize must not be negative, got {}", spec.min_size));
        }
        if spec.max_size < spec.min_size {
            return Err(format!(
                "maxSize ({}) must not be below minSize ({})",
                spec.max_size, spec.min_size
            ));
        }
        if let Some(replicas) = spec.replicas {
            if !self.replicas_externally_managed()
                && !(spec.min_size..=spec.max_size).contains(&replicas)
            {
                return Err(format!(
                    "replicas ({replicas}) must be within [{}, {}]",
                    spec.min_size, spec.max_size
                ));
            }
        }
        if spec.aws_launch_template.ami_id.is_empty() {
            return Err("awsLaunchTemplate.amiId must be set".into());
        }
        if spec.aws_launch_template.instance_type.is_empty() {
            return Err("awsLaunchTemplate.instanceType must be set".into());
        }
        if let Some(unknown) = spec
            .suspend_processes
            .iter()
            .flatten()
            .find(|p| *p != ALL_PROCESSES && !SUSPENDABLE_PROCESSES.contains(&p.as_str()))
        {
            return Err(format!("unknown process {unknown:?} in suspendProcesses"));
        }
        Ok(())
    }

    /// Tags last pushed to cloud resources, as recorded on the pool.
    pub fn last_applied_tags(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        match self.annotations().get(LAST_APPLIED_TAGS_ANNOTATION) {
            Some(json) if !json.is_empty() => serde_json::from_str(json),
            _ => Ok(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_annotation(key: &str, value: &str) -> AwsMachinePool {
        let mut pool = AwsMachinePool::new("pool-a", AwsMachinePoolSpec::default());
        pool.annotations_mut().insert(key.into(), value.into());
        pool
    }

    #[test]
    fn externally_managed_requires_a_value() {
        assert!(pool_with_annotation(REPLICAS_MANAGED_BY_ANNOTATION, "cluster-autoscaler")
            .replicas_externally_managed());
        assert!(!pool_with_annotation(REPLICAS_MANAGED_BY_ANNOTATION, "")
            .replicas_externally_managed());
        assert!(!AwsMachinePool::new("pool-a", AwsMachinePoolSpec::default())
            .replicas_externally_managed());
    }

    #[test]
    fn launch_template_name_defaults_to_pool_name() {
        let mut pool = AwsMachinePool::new("pool-a", AwsMachinePoolSpec::default());
        assert_eq!(pool.launch_template_name(), "pool-a");

        pool.spec.aws_launch_template.name = Some("workers".into());
        assert_eq!(pool.launch_template_name(), "workers");
    }

    #[test]
    fn last_applied_tags_parse() {
        let pool = pool_with_annotation(LAST_APPLIED_TAGS_ANNOTATION, r#"{"team":"infra"}"#);
        assert_eq!(
            pool.last_applied_tags().unwrap(),
            BTreeMap::from([("team".to_string(), "infra".to_string())])
        );

        let pool = pool_with_annotation(LAST_APPLIED_TAGS_ANNOTATION, "not json");
        assert!(pool.last_applied_tags().is_err());
    }

    fn valid_pool() -> AwsMachinePool {
        AwsMachinePool::new(
            "pool-a",
            AwsMachinePoolSpec {
                cluster_name: "prod".into(),
                replicas: Some(2),
                min_size: 1,
                max_size: 3,
                aws_launch_template: AwsLaunchTemplateSpec {
                    ami_id: "ami-1".into(),
                    instance_type: "m6i.large".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn validation() {
        assert_eq!(valid_pool().validate(), Ok(()));

        let mut pool = valid_pool();
        pool.spec.max_size = 0;
        assert!(pool.validate().unwrap_err().contains("maxSize (0)"));

        let mut pool = valid_pool();
        pool.spec.replicas = Some(5);
        assert!(pool.validate().is_err());
        pool.annotations_mut()
            .insert(REPLICAS_MANAGED_BY_ANNOTATION.into(), "autoscaler".into());
        assert_eq!(pool.validate(), Ok(()));

        let mut pool = valid_pool();
        pool.spec.aws_launch_template.ami_id.clear();
        assert!(pool.validate().is_err());

        let mut pool = valid_pool();
        pool.spec.suspend_processes = Some(vec!["Launch".into(), "Reboot".into()]);
        assert_eq!(
            pool.validate(),
            Err("unknown process \"Reboot\" in suspendProcesses".into())
        );
    }

    #[test]
    fn all_expands_to_every_process() {
        let mut pool = valid_pool();
        assert!(pool.desired_suspended_processes().is_empty());

        pool.spec.suspend_processes = Some(vec!["HealthCheck".into(), "Launch".into()]);
        assert_eq!(
            pool.desired_suspended_processes(),
            BTreeSet::from(["HealthCheck".to_string(), "Launch".to_string()])
        );

        pool.spec.suspend_processes = Some(vec!["All".into()]);
        assert_eq!(pool.desired_suspended_processes().len(), SUSPENDABLE_PROCESSES.len());
        assert_eq!(pool.validate(), Ok(()));
    }

    #[test]
    fn min_and_max_size_default_to_one() {
        let spec: AwsMachinePoolSpec = serde_json::from_value(serde_json::json!({
            "clusterName": "prod",
            "awsLaunchTemplate": {"amiId": "ami-1", "instanceType": "m6i.large"}
        }))
        .unwrap();

        assert_eq!(spec.min_size, 1);
        assert_eq!(spec.max_size, 1);
        assert_eq!(spec.bootstrap, BootstrapSpec::default());
    }
}
