use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::awsmachinepools::{FleetStatus, MixedInstancesPolicy, RefreshPreferences};

mod http;

pub use http::HttpFleetGateway;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists, is already deleting, or has an operation in flight.
    #[error("conflicting operation: {0}")]
    Conflict(String),

    /// The provider refused the request as invalid; retrying with the same input cannot help.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transient gateway failure: {0}")]
    Transient(String),
}

impl GatewayError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }
}

/// A live autoscaling group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fleet {
    /// The ARN of the group
    pub id: String,
    pub name: String,
    pub status: FleetStatus,
    pub desired_capacity: Option<i32>,
    pub min_size: i32,
    pub max_size: i32,
    #[serde(default)]
    pub subnets: Vec<String>,
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    #[serde(default)]
    pub capacity_rebalance: bool,
    #[serde(default)]
    pub suspended_processes: Vec<String>,
    #[serde(default)]
    pub instances: Vec<FleetInstance>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FleetInstance {
    pub id: String,
    pub availability_zone: String,
    pub lifecycle_state: Option<String>,
}

/// Everything needed to create or update a fleet.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetInput {
    pub name: String,
    pub launch_template_id: String,
    pub min_size: i32,
    pub max_size: i32,
    /// None leaves the provider's current desired capacity untouched.
    pub desired_capacity: Option<i32>,
    pub subnets: Vec<String>,
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    pub capacity_rebalance: bool,
    /// Only sent on creation. Later tag changes go through `update_resource_tags`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// The latest version of a named launch template
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplate {
    pub id: String,
    pub name: String,
    pub version: i64,
    pub ami_id: String,
    pub instance_type: String,
    pub iam_instance_profile: Option<String>,
    pub ssh_key_name: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// Hex SHA-256 of the user data of this version
    pub user_data_hash: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchTemplateInput {
    pub name: String,
    pub ami_id: String,
    pub instance_type: String,
    pub iam_instance_profile: Option<String>,
    pub ssh_key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub user_data: Vec<u8>,
    pub user_data_hash: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub availability_zone: String,
    pub state: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Started,
    AlreadyInProgress,
}

/// A cloud resource whose tags the operator manages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaggedResource {
    Fleet(String),
    LaunchTemplate(String),
}

impl TaggedResource {
    pub fn kind(&self) -> &'static str {
        match self {
            TaggedResource::Fleet(_) => "fleet",
            TaggedResource::LaunchTemplate(_) => "launch-template",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TaggedResource::Fleet(id) | TaggedResource::LaunchTemplate(id) => id,
        }
    }
}

impl std::fmt::Display for TaggedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Calls against the autoscaling and launch template APIs.
///
/// Lookups return `Ok(None)` for absent resources. Long-running operations (fleet
/// creation and deletion, instance refreshes) return as soon as the provider has
/// accepted them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetGateway: Send + Sync {
    async fn find_fleet(&self, name: &str) -> Result<Option<Fleet>, GatewayError>;

    /// Tolerates an existing fleet of the same name by returning it.
    async fn create_fleet(&self, input: &FleetInput) -> Result<Fleet, GatewayError>;

    /// Issuing an update with no effective change is a no-op on the provider side.
    /// The input carries no tags and the fleet's tags are left untouched.
    async fn update_fleet(&self, input: &FleetInput) -> Result<(), GatewayError>;

    /// Starts an asynchronous delete; tolerates a fleet that is already deleting or gone.
    async fn delete_fleet(&self, name: &str) -> Result<(), GatewayError>;

    async fn suspend_processes(&self, fleet: &str, processes: &[String])
        -> Result<(), GatewayError>;

    async fn resume_processes(&self, fleet: &str, processes: &[String])
        -> Result<(), GatewayError>;

    /// False while another instance refresh is in flight for the fleet.
    async fn can_start_instance_refresh(&self, fleet: &str) -> Result<bool, GatewayError>;

    async fn start_instance_refresh(
        &self,
        fleet: &str,
        preferences: &RefreshPreferences,
    ) -> Result<RefreshOutcome, GatewayError>;

    async fn find_launch_template(&self, name: &str)
        -> Result<Option<LaunchTemplate>, GatewayError>;

    async fn create_launch_template(
        &self,
        input: &LaunchTemplateInput,
    ) -> Result<LaunchTemplate, GatewayError>;

    async fn create_launch_template_version(
        &self,
        id: &str,
        input: &LaunchTemplateInput,
    ) -> Result<LaunchTemplate, GatewayError>;

    /// Deletes the oldest version that is neither the default nor the latest, if any.
    async fn prune_launch_template_versions(&self, id: &str) -> Result<(), GatewayError>;

    /// Tolerates a template that is already gone.
    async fn delete_launch_template(&self, id: &str) -> Result<(), GatewayError>;

    async fn instance_by_id(&self, id: &str) -> Result<Option<Instance>, GatewayError>;

    async fn update_resource_tags(
        &self,
        resource: &TaggedResource,
        create: &BTreeMap<String, String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), GatewayError>;
}
