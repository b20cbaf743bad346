use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the name of the AwsMachinePool a child machine belongs to.
pub const POOL_NAME_LABEL: &str = "machinepool.dev/pool-name";

/// Label carrying the name of the Cluster a child machine belongs to.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Tracks a single instance of an AwsMachinePool's fleet
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[kube(
    kind = "AwsMachine",
    group = "infrastructure.machinepool.dev",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"InstanceID", "type":"string", "jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"Zone", "type":"string", "jsonPath":".spec.availabilityZone"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(shortname = "awsm")]
#[serde(rename_all = "camelCase")]
pub struct AwsMachineSpec {
    /// The provider ID of the instance, `aws:///<zone>/<instance-id>`.
    pub provider_id: String,
    /// The EC2 instance ID.
    pub instance_id: String,
    pub availability_zone: String,
}

/// Formats the identifier nodes and machines use to refer to an EC2 instance.
pub fn provider_id(availability_zone: &str, instance_id: &str) -> String {
    format!("aws:///{availability_zone}/{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_format() {
        assert_eq!(
            provider_id("eu-west-1a", "i-0123456789abcdef0"),
            "aws:///eu-west-1a/i-0123456789abcdef0"
        );
    }
}
