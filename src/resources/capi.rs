use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster API Cluster, the owner of a pool's infrastructure and control plane
/// API: cluster.x-k8s.io/v1beta1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced
)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Paused clusters are not reconciled
    #[serde(default)]
    pub paused: bool,

    /// Reference to the infrastructure provider object, eg an AWSCluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Reference to the control plane provider object, eg an AWSManagedControlPlane
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub infrastructure_ready: bool,

    #[serde(default)]
    pub control_plane_ready: bool,
}

/// Cluster API Machine, optionally owning an AwsMachine
/// API: cluster.x-k8s.io/v1beta1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub cluster_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,
}

/// Self-managed AWS cluster infrastructure
/// API: infrastructure.cluster.x-k8s.io/v1beta2
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "AWSCluster",
    root = "AwsCluster",
    namespaced
)]
#[kube(status = "AwsClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct AwsClusterSpec {
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub network: NetworkSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_tags: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct AwsClusterStatus {
    #[serde(default)]
    pub ready: bool,
}

/// Control plane of an EKS cluster, which also carries its network
/// API: controlplane.cluster.x-k8s.io/v1beta2
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "AWSManagedControlPlane",
    root = "AwsManagedControlPlane",
    namespaced
)]
#[kube(status = "AwsManagedControlPlaneStatus")]
#[serde(rename_all = "camelCase")]
pub struct AwsManagedControlPlaneSpec {
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub network: NetworkSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_tags: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct AwsManagedControlPlaneStatus {
    #[serde(default)]
    pub ready: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct NetworkSpec {
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub availability_zone: String,

    #[serde(default)]
    pub is_public: bool,
}
