use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::object::HasStatus;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use tokio::sync::RwLock;
use tracing::*;

use super::backoff::Backoff;
use super::client::KubePoolClient;
use super::reconciler::PoolReconciler;
use crate::controllers::{Diagnostics, State};
use crate::resources::awsmachinepools::AwsMachinePool;
use crate::resources::awsmachines::{AwsMachine, POOL_NAME_LABEL};
use crate::resources::capi::Cluster;
use crate::{telemetry, Error, Metrics, Result};

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// The pool state machine
    pub reconciler: PoolReconciler,
    /// Requeue delays of failing pools
    pub backoff: Backoff<ObjectRef<AwsMachinePool>>,
    /// The controller's view of every pool
    pub pools: Store<AwsMachinePool>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        pools: Store<AwsMachinePool>,
    ) -> Arc<Context> {
        Arc::new(Context {
            recorder: Recorder::new(client.clone(), "machinepool-operator".into()),
            reconciler: PoolReconciler::new(
                state.gateway.clone(),
                Arc::new(KubePoolClient::new(client)),
                state.config.clone(),
            ),
            backoff: Backoff::default(),
            pools,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, pool), fields(trace_id))]
async fn reconcile(pool: Arc<AwsMachinePool>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<AwsMachinePool>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    ctx.backoff.retain(|key| ctx.pools.get(key).is_some());

    let namespace = pool.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = pool.name_any();

    info!("Reconciling AwsMachinePool {name} in namespace {namespace}");
    match ctx.reconciler.reconcile(&namespace, &name).await {
        Ok(action) => {
            ctx.backoff.reset(&ObjectRef::from_obj(pool.as_ref()));
            Ok(action)
        }
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            if let Err(publish_err) = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &pool.object_ref(&()),
                )
                .await
            {
                warn!("Failed to publish event: {publish_err}");
            }

            ctx.metrics.reconcile_failure(pool.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(pool: Arc<AwsMachinePool>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_terminal() {
        // retrying cannot help until the pool changes
        return Action::await_change();
    }
    Action::requeue(ctx.backoff.next(ObjectRef::from_obj(pool.as_ref())))
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

pub async fn run(client: Client, metrics: Metrics, state: State) {
    let watch_namespace = state.watch_namespace.clone();
    let pool_api = api::<AwsMachinePool>(&client, watch_namespace.as_deref());
    let machine_api = api::<AwsMachine>(&client, watch_namespace.as_deref());
    let cluster_api = api::<Cluster>(&client, watch_namespace.as_deref());
    let secret_api = api::<Secret>(&client, watch_namespace.as_deref());

    match client.list_api_groups().await {
        Ok(list) if list.groups.iter().any(|group| group.name == Cluster::group(&())) => {}
        Ok(_) => {
            error!("Cluster API is not available on the apiserver. Is it installed?");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Could not list api groups: {e:?}");
            std::process::exit(1);
        }
    }

    if let Err(e) = pool_api.list(&ListParams::default().limit(1)).await {
        error!("AwsMachinePool is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let machine_watcher = watcher(machine_api, Config::default().labels(POOL_NAME_LABEL))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let cluster_watcher = watcher(cluster_api, Config::default())
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate));

    // data changes leave secret metadata untouched, so there is no predicate here
    let secret_watcher = metadata_watcher(secret_api, Config::default()).touched_objects();

    let controller = Controller::new(pool_api, Config::default()).shutdown_on_signal();
    let pools = controller.store();
    let cluster_pools = pools.clone();
    let secret_pools = pools.clone();

    controller
        .watches_stream(machine_watcher, |machine| owner_pool(machine.meta()))
        .watches_stream(cluster_watcher, move |cluster| {
            pools_of_cluster(cluster_pools.state(), &cluster)
        })
        .watches_stream(secret_watcher, move |secret| {
            pools_using_secret(secret_pools.state(), &secret.metadata)
        })
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, pools),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// Pools in the namespace of `cluster` that belong to it.
fn pools_of_cluster(
    pools: Vec<Arc<AwsMachinePool>>,
    cluster: &Cluster,
) -> Vec<ObjectRef<AwsMachinePool>> {
    let namespace = cluster.namespace();
    let cluster_name = cluster.name_any();
    pools
        .into_iter()
        .filter(|pool| pool.namespace() == namespace && pool.spec.cluster_name == cluster_name)
        .map(|pool| ObjectRef::from_obj(pool.as_ref()))
        .collect()
}

/// Pools in the namespace of `secret` that take their bootstrap data from it.
fn pools_using_secret(
    pools: Vec<Arc<AwsMachinePool>>,
    secret: &ObjectMeta,
) -> Vec<ObjectRef<AwsMachinePool>> {
    pools
        .into_iter()
        .filter(|pool| {
            pool.metadata.namespace == secret.namespace
                && pool.spec.bootstrap.data_secret_name.is_some()
                && pool.spec.bootstrap.data_secret_name == secret.name
        })
        .map(|pool| ObjectRef::from_obj(pool.as_ref()))
        .collect()
}

/// Finds the pool owning an object through its owner references, matching kind and API group.
pub(crate) fn owner_pool(meta: &ObjectMeta) -> Option<ObjectRef<AwsMachinePool>> {
    let oref = meta.owner_references.as_ref()?.iter().find(|oref| {
        oref.kind == AwsMachinePool::kind(&())
            && oref.api_version.split('/').next() == Some(AwsMachinePool::group(&()).as_ref())
    })?;

    let pool = ObjectRef::new(&oref.name);
    Some(match meta.namespace.as_deref() {
        Some(namespace) => pool.within(namespace),
        None => pool,
    })
}

fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    Some(hasher.finish())
}

fn status_predicate<K: Resource + HasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Hash,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        s.hash(&mut hasher)
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use crate::resources::awsmachinepools::{AwsMachinePoolSpec, BootstrapSpec};
    use crate::resources::capi::ClusterSpec;

    fn meta_owned_by(api_version: &str, kind: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("pool-a-i-123".into()),
            namespace: Some("team-a".into()),
            owner_references: Some(vec![OwnerReference {
                api_version: api_version.into(),
                kind: kind.into(),
                name: "pool-a".into(),
                uid: "8d7e2a8c".into(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn owner_lookup_matches_kind_and_group() {
        assert_eq!(
            owner_pool(&meta_owned_by(
                "infrastructure.machinepool.dev/v1",
                "AwsMachinePool"
            )),
            Some(ObjectRef::new("pool-a").within("team-a"))
        );

        // same kind, other group
        assert_eq!(
            owner_pool(&meta_owned_by(
                "infrastructure.cluster.x-k8s.io/v1beta2",
                "AwsMachinePool"
            )),
            None
        );
        assert_eq!(
            owner_pool(&meta_owned_by("cluster.x-k8s.io/v1beta1", "MachinePool")),
            None
        );
        assert_eq!(owner_pool(&ObjectMeta::default()), None);
    }

    fn pool(namespace: &str, name: &str, cluster: &str, secret: Option<&str>) -> Arc<AwsMachinePool> {
        let mut pool = AwsMachinePool::new(
            name,
            AwsMachinePoolSpec {
                cluster_name: cluster.into(),
                bootstrap: BootstrapSpec {
                    data_secret_name: secret.map(Into::into),
                },
                ..Default::default()
            },
        );
        pool.metadata.namespace = Some(namespace.into());
        Arc::new(pool)
    }

    fn pools() -> Vec<Arc<AwsMachinePool>> {
        vec![
            pool("team-a", "pool-a", "prod", Some("pool-a-bootstrap")),
            pool("team-a", "pool-b", "prod", None),
            pool("team-a", "pool-c", "staging", Some("shared-bootstrap")),
            pool("team-b", "pool-a", "prod", Some("pool-a-bootstrap")),
        ]
    }

    #[test]
    fn cluster_changes_reach_its_pools() {
        let mut cluster = Cluster::new("prod", ClusterSpec::default());
        cluster.metadata.namespace = Some("team-a".into());

        assert_eq!(
            pools_of_cluster(pools(), &cluster),
            vec![
                ObjectRef::new("pool-a").within("team-a"),
                ObjectRef::new("pool-b").within("team-a"),
            ]
        );
    }

    #[test]
    fn bootstrap_secrets_reach_the_pools_using_them() {
        let secret = ObjectMeta {
            name: Some("pool-a-bootstrap".into()),
            namespace: Some("team-b".into()),
            ..Default::default()
        };
        assert_eq!(
            pools_using_secret(pools(), &secret),
            vec![ObjectRef::new("pool-a").within("team-b")]
        );

        let unrelated = ObjectMeta {
            name: Some("registry-credentials".into()),
            namespace: Some("team-a".into()),
            ..Default::default()
        };
        assert!(pools_using_secret(pools(), &unrelated).is_empty());
    }

    #[tokio::test]
    async fn failing_event_publish_keeps_the_reconcile_error() {
        use http::{Request, Response};
        use kube::client::Body;

        use crate::cloud::MockFleetGateway;
        use crate::controllers::awsmachinepool::client::MockPoolClient;
        use crate::controllers::awsmachinepool::reconciler::ReconcilerConfig;
        use crate::resources::awsmachinepools::AWS_MACHINE_POOL_FINALIZER;

        let mut invalid = AwsMachinePool::new(
            "pool-a",
            AwsMachinePoolSpec {
                cluster_name: "prod".into(),
                min_size: 3,
                max_size: 1,
                ..Default::default()
            },
        );
        invalid.metadata.namespace = Some("team-a".into());
        invalid.metadata.finalizers = Some(vec![AWS_MACHINE_POOL_FINALIZER.into()]);

        let mut pools = MockPoolClient::new();
        let served = invalid.clone();
        pools
            .expect_get_pool()
            .returning(move |_, _| Ok(Some(served.clone())));
        pools.expect_patch_status().times(1).returning(|_, _| Ok(()));

        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let apiserver = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("event not published");
            assert_eq!(request.method(), http::Method::POST);
            let status = serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "etcdserver: request timed out",
                "reason": "InternalError",
                "code": 500,
            });
            send.send_response(
                Response::builder()
                    .status(500)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        });

        let (store, _writer) = kube::runtime::reflector::store();
        let ctx = Arc::new(Context {
            recorder: Recorder::new(
                Client::new(mock_service, "default"),
                "machinepool-operator".into(),
            ),
            reconciler: PoolReconciler::new(
                Arc::new(MockFleetGateway::new()),
                Arc::new(pools),
                ReconcilerConfig::default(),
            ),
            backoff: Backoff::default(),
            pools: store,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
        });

        let err = reconcile(Arc::new(invalid), ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)), "{err}");
        assert!(err.is_terminal());
        apiserver.await.unwrap();
    }

    #[test]
    fn deleted_objects_always_change() {
        let machine = AwsMachine::new(
            "pool-a-i-123",
            crate::resources::awsmachines::AwsMachineSpec {
                provider_id: "aws:///us-east-1a/i-123".into(),
                instance_id: "i-123".into(),
                availability_zone: "us-east-1a".into(),
            },
        );
        let before = changed_predicate(&machine);

        let event: std::result::Result<_, ()> = ensure_deletion_change(Ok(
            kube::runtime::watcher::Event::Delete(machine),
        ));
        let Ok(kube::runtime::watcher::Event::Delete(deleted)) = event else {
            panic!("expected a delete event");
        };
        assert_ne!(changed_predicate(&deleted), before);
    }
}
