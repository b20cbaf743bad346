use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::info_span;

use crate::resources::capi::{AwsCluster, AwsManagedControlPlane, Cluster, NetworkSpec};

pub const AWS_CLUSTER_KIND: &str = "AWSCluster";
pub const AWS_MANAGED_CLUSTER_KIND: &str = "AWSManagedCluster";
pub const AWS_MANAGED_CONTROL_PLANE_KIND: &str = "AWSManagedControlPlane";

/// The cluster a pool belongs to, together with whichever object carries its AWS network
#[derive(Clone, Debug)]
pub enum ClusterScope {
    /// Self-managed control plane on an AWSCluster
    Unmanaged { cluster: Cluster, infra: AwsCluster },
    /// EKS
    Managed {
        cluster: Cluster,
        control_plane: AwsManagedControlPlane,
    },
}

impl ClusterScope {
    fn cluster(&self) -> &Cluster {
        match self {
            ClusterScope::Unmanaged { cluster, .. } | ClusterScope::Managed { cluster, .. } => {
                cluster
            }
        }
    }

    pub fn name(&self) -> String {
        self.cluster().name_any()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterScope::Unmanaged { .. } => AWS_CLUSTER_KIND,
            ClusterScope::Managed { .. } => AWS_MANAGED_CONTROL_PLANE_KIND,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.cluster().spec.paused
    }

    /// Whether instances can be launched into this cluster yet.
    pub fn is_ready(&self) -> bool {
        let cluster = self.cluster();
        let infrastructure_ready = cluster
            .status
            .as_ref()
            .is_some_and(|s| s.infrastructure_ready);

        match self {
            ClusterScope::Unmanaged { infra, .. } => {
                infrastructure_ready && infra.status.as_ref().is_some_and(|s| s.ready)
            }
            ClusterScope::Managed { control_plane, .. } => {
                infrastructure_ready && control_plane.status.as_ref().is_some_and(|s| s.ready)
            }
        }
    }

    pub fn region(&self) -> &str {
        match self {
            ClusterScope::Unmanaged { infra, .. } => &infra.spec.region,
            ClusterScope::Managed { control_plane, .. } => &control_plane.spec.region,
        }
    }

    fn network(&self) -> &NetworkSpec {
        match self {
            ClusterScope::Unmanaged { infra, .. } => &infra.spec.network,
            ClusterScope::Managed { control_plane, .. } => &control_plane.spec.network,
        }
    }

    /// Private subnets of the cluster network, restricted to `zones` when given.
    pub fn subnet_ids(&self, zones: Option<&[String]>) -> Vec<String> {
        self.network()
            .subnets
            .iter()
            .filter(|s| !s.is_public && !s.id.is_empty())
            .filter(|s| zones.is_none_or(|zones| zones.contains(&s.availability_zone)))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Tags every resource of the cluster carries, including the ownership tag.
    pub fn additional_tags(&self) -> BTreeMap<String, String> {
        let mut tags = match self {
            ClusterScope::Unmanaged { infra, .. } => infra.spec.additional_tags.clone(),
            ClusterScope::Managed { control_plane, .. } => {
                control_plane.spec.additional_tags.clone()
            }
        }
        .unwrap_or_default();

        tags.insert(
            format!("sigs.k8s.io/cluster-api-provider-aws/cluster/{}", self.name()),
            "owned".into(),
        );
        tags
    }

    pub fn span(&self) -> tracing::Span {
        info_span!(
            "cluster_scope",
            cluster = %self.name(),
            kind = self.kind(),
            region = %self.region(),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::capi::{
        AwsClusterSpec, AwsClusterStatus, ClusterSpec, ClusterStatus, SubnetSpec,
    };

    pub(crate) fn ready_scope() -> ClusterScope {
        let mut cluster = Cluster::new("prod", ClusterSpec::default());
        cluster.status = Some(ClusterStatus {
            infrastructure_ready: true,
            control_plane_ready: true,
        });

        let mut infra = AwsCluster::new(
            "prod",
            AwsClusterSpec {
                region: "us-east-1".into(),
                network: NetworkSpec {
                    subnets: vec![
                        SubnetSpec {
                            id: "subnet-a".into(),
                            availability_zone: "us-east-1a".into(),
                            is_public: false,
                        },
                        SubnetSpec {
                            id: "subnet-b".into(),
                            availability_zone: "us-east-1b".into(),
                            is_public: false,
                        },
                        SubnetSpec {
                            id: "subnet-public".into(),
                            availability_zone: "us-east-1a".into(),
                            is_public: true,
                        },
                    ],
                },
                additional_tags: Some(BTreeMap::from([("env".into(), "prod".into())])),
            },
        );
        infra.status = Some(AwsClusterStatus { ready: true });

        ClusterScope::Unmanaged { cluster, infra }
    }

    #[test]
    fn subnets_skip_public_and_filter_zones() {
        let scope = ready_scope();
        assert_eq!(scope.subnet_ids(None), vec!["subnet-a", "subnet-b"]);
        assert_eq!(
            scope.subnet_ids(Some(&["us-east-1b".to_string()])),
            vec!["subnet-b"]
        );
    }

    #[test]
    fn readiness_needs_cluster_and_infra() {
        let scope = ready_scope();
        assert!(scope.is_ready());

        let ClusterScope::Unmanaged { cluster, mut infra } = scope else {
            unreachable!()
        };
        infra.status = None;
        assert!(!ClusterScope::Unmanaged { cluster, infra }.is_ready());
    }

    #[test]
    fn tags_include_ownership() {
        let tags = ready_scope().additional_tags();
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(
            tags.get("sigs.k8s.io/cluster-api-provider-aws/cluster/prod")
                .map(String::as_str),
            Some("owned")
        );
    }
}
