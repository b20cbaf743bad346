use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::*;

use super::scope::{
    ClusterScope, AWS_CLUSTER_KIND, AWS_MANAGED_CLUSTER_KIND, AWS_MANAGED_CONTROL_PLANE_KIND,
};
use crate::cloud::FleetInstance;
use crate::resources::awsmachinepools::{
    AwsMachinePool, AwsMachinePoolStatus, AWS_MACHINE_POOL_FINALIZER,
    LAST_APPLIED_TAGS_ANNOTATION,
};
use crate::resources::awsmachines::{
    provider_id, AwsMachine, AwsMachineSpec, CLUSTER_NAME_LABEL, POOL_NAME_LABEL,
};
use crate::resources::capi::{AwsCluster, AwsManagedControlPlane, Cluster, Machine};
use crate::{Error, Result};

const FIELD_MANAGER: &str = "machinepool-operator";

/// Key in the bootstrap secret holding the user data.
const BOOTSTRAP_DATA_KEY: &str = "value";

/// Everything the pool reconciler reads from or writes to the Kubernetes API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<Option<AwsMachinePool>>;

    async fn add_finalizer(&self, pool: &AwsMachinePool) -> Result<()>;

    async fn remove_finalizer(&self, pool: &AwsMachinePool) -> Result<()>;

    async fn patch_status(&self, pool: &AwsMachinePool, status: &AwsMachinePoolStatus)
        -> Result<()>;

    /// Writes `spec.replicas`, the only spec field the operator ever changes.
    async fn patch_replicas(&self, pool: &AwsMachinePool, replicas: i32) -> Result<()>;

    async fn set_last_applied_tags(
        &self,
        pool: &AwsMachinePool,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Resolves the named Cluster and its AWS infrastructure. `None` while any of them is missing.
    async fn cluster_scope(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ClusterScope>>;

    async fn bootstrap_data(&self, namespace: &str, secret_name: &str)
        -> Result<Option<Vec<u8>>>;

    async fn list_machines(&self, pool: &AwsMachinePool) -> Result<Vec<AwsMachine>>;

    async fn create_machine(&self, pool: &AwsMachinePool, instance: &FleetInstance) -> Result<()>;

    /// Deletes the Machine owning `machine` if there is one, otherwise `machine` itself.
    async fn delete_machine(&self, machine: &AwsMachine) -> Result<()>;

    async fn publish_event(
        &self,
        pool: &AwsMachinePool,
        reason: &str,
        action: &str,
        note: String,
    ) -> Result<()>;
}

pub struct KubePoolClient {
    client: Client,
    recorder: Recorder,
}

impl KubePoolClient {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), FIELD_MANAGER.into()),
            client,
        }
    }

    fn pools(&self, pool: &AwsMachinePool) -> Result<Api<AwsMachinePool>> {
        let namespace = pool.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }

    async fn patch_finalizers(&self, pool: &AwsMachinePool, finalizers: Vec<String>) -> Result<()> {
        // resourceVersion makes the merge patch fail on a stale list instead of clobbering it
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": pool.resource_version(),
            }
        });
        self.pools(pool)?
            .patch(&pool.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl PoolClient for KubePoolClient {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<Option<AwsMachinePool>> {
        let pools: Api<AwsMachinePool> = Api::namespaced(self.client.clone(), namespace);
        Ok(pools.get_opt(name).await?)
    }

    async fn add_finalizer(&self, pool: &AwsMachinePool) -> Result<()> {
        let mut finalizers = pool.finalizers().to_vec();
        finalizers.push(AWS_MACHINE_POOL_FINALIZER.into());
        debug!("Adding finalizer to AwsMachinePool {}", pool.name_any());
        self.patch_finalizers(pool, finalizers).await
    }

    async fn remove_finalizer(&self, pool: &AwsMachinePool) -> Result<()> {
        let finalizers = pool
            .finalizers()
            .iter()
            .filter(|f| *f != AWS_MACHINE_POOL_FINALIZER)
            .cloned()
            .collect();
        debug!("Removing finalizer from AwsMachinePool {}", pool.name_any());
        self.patch_finalizers(pool, finalizers).await
    }

    async fn patch_status(
        &self,
        pool: &AwsMachinePool,
        status: &AwsMachinePoolStatus,
    ) -> Result<()> {
        let new_status = Patch::Apply(json!({
            "apiVersion": "infrastructure.machinepool.dev/v1",
            "kind": "AwsMachinePool",
            "status": status,
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        self.pools(pool)?
            .patch_status(&pool.name_any(), &ps, &new_status)
            .await?;
        Ok(())
    }

    async fn patch_replicas(&self, pool: &AwsMachinePool, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.pools(pool)?
            .patch(&pool.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_last_applied_tags(
        &self,
        pool: &AwsMachinePool,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let annotations =
            BTreeMap::from([(LAST_APPLIED_TAGS_ANNOTATION, serde_json::to_string(tags)?)]);
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.pools(pool)?
            .patch(&pool.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn cluster_scope(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ClusterScope>> {
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let Some(cluster) = clusters.get_opt(cluster_name).await? else {
            return Ok(None);
        };
        let Some(infra_ref) = cluster.spec.infrastructure_ref.clone() else {
            return Ok(None);
        };

        match infra_ref.kind.as_deref() {
            Some(AWS_CLUSTER_KIND) => {
                let infras: Api<AwsCluster> = Api::namespaced(self.client.clone(), namespace);
                let name = infra_ref.name.as_deref().unwrap_or(cluster_name);
                Ok(infras
                    .get_opt(name)
                    .await?
                    .map(|infra| ClusterScope::Unmanaged { cluster, infra }))
            }
            Some(AWS_MANAGED_CLUSTER_KIND) | Some(AWS_MANAGED_CONTROL_PLANE_KIND) => {
                let Some(control_plane_name) = cluster
                    .spec
                    .control_plane_ref
                    .as_ref()
                    .and_then(|r| r.name.clone())
                else {
                    return Ok(None);
                };
                let control_planes: Api<AwsManagedControlPlane> =
                    Api::namespaced(self.client.clone(), namespace);
                Ok(control_planes
                    .get_opt(&control_plane_name)
                    .await?
                    .map(|control_plane| ClusterScope::Managed {
                        cluster,
                        control_plane,
                    }))
            }
            other => Err(Error::InvalidSpec(format!(
                "Cluster {cluster_name} has unsupported infrastructure kind {}",
                other.unwrap_or("<unset>")
            ))),
        }
    }

    async fn bootstrap_data(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<Option<Vec<u8>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(secret_name).await?.and_then(|secret| {
            secret
                .data
                .and_then(|mut data| data.remove(BOOTSTRAP_DATA_KEY))
                .map(|bytes| bytes.0)
        }))
    }

    async fn list_machines(&self, pool: &AwsMachinePool) -> Result<Vec<AwsMachine>> {
        let namespace = pool.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let machines: Api<AwsMachine> = Api::namespaced(self.client.clone(), &namespace);
        let lp = ListParams::default().labels(&format!("{POOL_NAME_LABEL}={}", pool.name_any()));
        Ok(machines.list(&lp).await?.items)
    }

    async fn create_machine(&self, pool: &AwsMachinePool, instance: &FleetInstance) -> Result<()> {
        let namespace = pool.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let oref = pool
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("uid"))?;

        let machine = AwsMachine {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", pool.name_any(), instance.id)),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([
                    (POOL_NAME_LABEL.to_string(), pool.name_any()),
                    (
                        CLUSTER_NAME_LABEL.to_string(),
                        pool.spec.cluster_name.clone(),
                    ),
                ])),
                owner_references: Some(vec![oref]),
                ..Default::default()
            },
            spec: AwsMachineSpec {
                provider_id: provider_id(&instance.availability_zone, &instance.id),
                instance_id: instance.id.clone(),
                availability_zone: instance.availability_zone.clone(),
            },
        };

        let machines: Api<AwsMachine> = Api::namespaced(self.client.clone(), &namespace);
        match machines.create(&PostParams::default(), &machine).await {
            Ok(_) => Ok(()),
            // created by an earlier pass
            Err(err) if is_status(&err, 409) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_machine(&self, machine: &AwsMachine) -> Result<()> {
        let namespace = machine
            .namespace()
            .ok_or(Error::MissingObjectKey("namespace"))?;

        let owning_machine = machine.owner_references().iter().find(|oref| {
            oref.kind == Machine::kind(&())
                && oref
                    .api_version
                    .split('/')
                    .next()
                    .is_some_and(|group| group == Machine::group(&()))
        });

        let result = match owning_machine {
            Some(oref) => {
                debug!(
                    "Deleting Machine {} owning AwsMachine {}",
                    oref.name,
                    machine.name_any()
                );
                Api::<Machine>::namespaced(self.client.clone(), &namespace)
                    .delete(&oref.name, &DeleteParams::default())
                    .await
                    .map(|_| ())
            }
            None => Api::<AwsMachine>::namespaced(self.client.clone(), &namespace)
                .delete(&machine.name_any(), &DeleteParams::default())
                .await
                .map(|_| ()),
        };

        match result {
            Err(err) if is_status(&err, 404) => Ok(()),
            other => Ok(other?),
        }
    }

    async fn publish_event(
        &self,
        pool: &AwsMachinePool,
        reason: &str,
        action: &str,
        note: String,
    ) -> Result<()> {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                &pool.object_ref(&()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::awsmachinepools::AwsMachinePoolSpec;
    use http::{Request, Response};
    use kube::client::Body;

    fn pool() -> AwsMachinePool {
        let mut pool = AwsMachinePool::new("pool-a", AwsMachinePoolSpec::default());
        pool.metadata.namespace = Some("team-a".into());
        pool.metadata.resource_version = Some("42".into());
        pool.metadata.finalizers = Some(vec!["other.dev/finalizer".into()]);
        pool
    }

    #[tokio::test]
    async fn add_finalizer_sends_guarded_merge_patch() {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = KubePoolClient::new(Client::new(mock_service, "default"));
        let pool = pool();

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/infrastructure.machinepool.dev/v1/namespaces/team-a/awsmachinepools/pool-a"
            );
            assert_eq!(
                request.headers().get(http::header::CONTENT_TYPE).unwrap(),
                "application/merge-patch+json"
            );

            let body = request.into_body().collect_bytes().await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_diff::assert_json_eq!(
                body,
                json!({
                    "metadata": {
                        "finalizers": ["other.dev/finalizer", AWS_MACHINE_POOL_FINALIZER],
                        "resourceVersion": "42",
                    }
                })
            );

            let response = serde_json::to_vec(&self::pool()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
        });

        client.add_finalizer(&pool).await.unwrap();
        server.await.unwrap();
    }
}
