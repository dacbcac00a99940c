use std::collections::BTreeMap;
use std::sync::Arc;

use corral_core::{keys, Cluster, ClusterSpec, ControllerConfig, NodeRole, NodeSpec, ObjectKey};
use corral_engine::{Controller, PassResult, PolicyHandle};
use corral_resources::{cluster_router, pod_router};
use corral_store::{typed, MemStore};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn cluster(version: &str, nodes: Vec<NodeSpec>) -> Cluster {
    let mut c = Cluster::new("alpha", ClusterSpec { cluster_id: "blue".into(), schema_version: version.into(), nodes });
    c.metadata.namespace = Some("corral".into());
    c
}

fn two_nodes() -> Vec<NodeSpec> {
    vec![NodeSpec::new("a", NodeRole::Master, 2, "4Gi"), NodeSpec::new("b", NodeRole::Worker, 4, "8Gi")]
}

fn cluster_controller(store: &Arc<MemStore>, policy: PolicyHandle) -> Controller<Cluster> {
    let router = cluster_router(store.clone(), &ControllerConfig::default()).unwrap();
    Controller::new("cluster", store.clone(), router, keys::CLUSTER_FINALIZER, policy)
}

fn key() -> ObjectKey { ObjectKey::new(Some("corral"), "alpha") }

/// Run passes until one writes nothing; returns how many passes that took.
async fn converge(store: &MemStore, ctl: &Controller<Cluster>) -> usize {
    for n in 1..=8 {
        store.reset_counters();
        ctl.run_pass(&key()).await.unwrap();
        if store.writes() == 0 {
            return n;
        }
    }
    panic!("no convergence after 8 passes: {:?}", store.write_log());
}

#[tokio::test]
async fn converged_cluster_pass_is_write_free() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("2.0.0", two_nodes())).unwrap();
    let ctl = cluster_controller(&store, PolicyHandle::default());

    assert!(converge(&store, &ctl).await <= 3);
    store.reset_counters();
    ctl.run_pass(&key()).await.unwrap();
    assert_eq!(store.writes(), 0, "{:?}", store.write_log());

    let maps = typed::list::<ConfigMap>(store.as_ref(), Some("blue"), None).await.unwrap();
    assert_eq!(maps.len(), 2);
    let services = typed::list::<Service>(store.as_ref(), Some("blue"), None).await.unwrap();
    assert_eq!(services.len(), 2);
    let stored: Cluster = typed::get(store.as_ref(), Some("corral"), "alpha").await.unwrap();
    assert_eq!(stored.node_indexes(), BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)]));
}

#[tokio::test]
async fn scale_down_then_up_reuses_the_freed_index() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("2.0.0", vec![
        NodeSpec::new("a", NodeRole::Master, 2, "4Gi"),
        NodeSpec::new("b", NodeRole::Worker, 2, "4Gi"),
        NodeSpec::new("c", NodeRole::Worker, 2, "4Gi"),
    ]))
    .unwrap();
    let ctl = cluster_controller(&store, PolicyHandle::default());
    converge(&store, &ctl).await;

    let mut stored: Cluster = typed::get(store.as_ref(), Some("corral"), "alpha").await.unwrap();
    stored.spec.nodes.retain(|n| n.id != "b");
    stored.spec.nodes.push(NodeSpec::new("d", NodeRole::Worker, 2, "4Gi"));
    typed::update(store.as_ref(), &stored).await.unwrap();
    converge(&store, &ctl).await;

    let stored: Cluster = typed::get(store.as_ref(), Some("corral"), "alpha").await.unwrap();
    assert_eq!(stored.node_indexes()["d"], 2);
    assert!(typed::get_opt::<Deployment>(store.as_ref(), Some("blue"), "worker-b").await.unwrap().is_none());
    let map: ConfigMap = typed::get(store.as_ref(), Some("blue"), "worker-d").await.unwrap();
    assert_eq!(map.data.unwrap()["node-index"], "2");
}

#[tokio::test]
async fn rollout_waits_for_policy_and_moves_one_group_per_pass() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("2.0.0", two_nodes())).unwrap();
    let policy = PolicyHandle::default();
    let ctl = cluster_controller(&store, policy.clone());
    converge(&store, &ctl).await;

    let mut stored: Cluster = typed::get(store.as_ref(), Some("corral"), "alpha").await.unwrap();
    stored.spec.schema_version = "2.1.0".into();
    typed::update(store.as_ref(), &stored).await.unwrap();

    policy.set_updates_allowed(false);
    store.reset_counters();
    ctl.run_pass(&key()).await.unwrap();
    assert!(store.write_log().iter().all(|w| !w.contains("Deployment")), "{:?}", store.write_log());

    policy.set_updates_allowed(true);
    store.reset_counters();
    ctl.run_pass(&key()).await.unwrap();
    let rolled: Vec<_> = store.write_log().into_iter().filter(|w| w.contains("Deployment")).collect();
    assert_eq!(rolled, vec!["update apps/v1/Deployment blue/master-a".to_string()]);
}

#[tokio::test]
async fn deleting_the_cluster_tears_everything_down() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("1.5.0", two_nodes())).unwrap();
    let ctl = cluster_controller(&store, PolicyHandle::default());
    converge(&store, &ctl).await;
    assert!(store.len() > 1);

    typed::delete::<Cluster>(store.as_ref(), Some("corral"), "alpha").await.unwrap();
    let res = ctl.run_pass(&key()).await.unwrap();
    assert!(matches!(res, PassResult::Completed(_)));
    assert!(store.is_empty(), "{:?}", store.write_log());
}

#[tokio::test]
async fn other_generation_is_left_alone() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("3.0.0", two_nodes())).unwrap();
    let ctl = cluster_controller(&store, PolicyHandle::default());
    assert!(ctl.run_pass(&key()).await.is_err());
    assert_eq!(store.writes(), 0);
    assert_eq!(store.len(), 1);
}

fn unit(ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("master-a-7f9c".into()),
            namespace: Some("blue".into()),
            labels: Some(BTreeMap::from([
                (keys::MANAGED_BY_LABEL.to_string(), keys::MANAGED_BY.to_string()),
                (keys::VERSION_LABEL.to_string(), "2.0.0".to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (keys::ENDPOINT_SERVICE_ANNOTATION.to_string(), "master".to_string()),
                (keys::ENDPOINT_IP_ANNOTATION.to_string(), ip.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn unit_lifecycle_drives_endpoints() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("2.0.0", two_nodes())).unwrap();
    converge(&store, &cluster_controller(&store, PolicyHandle::default())).await;

    let router = pod_router(store.clone(), &ControllerConfig::default()).unwrap();
    let pods = Controller::new("endpoint", store.clone(), router, keys::ENDPOINT_FINALIZER, PolicyHandle::default());
    let unit_key = ObjectKey::new(Some("blue"), "master-a-7f9c");
    store.seed(&unit("10.0.0.5")).unwrap();

    pods.run_pass(&unit_key).await.unwrap();
    let ep: Endpoints = typed::get(store.as_ref(), Some("blue"), "master").await.unwrap();
    assert_eq!(ep.subsets.unwrap()[0].addresses.as_ref().unwrap()[0].ip, "10.0.0.5");

    typed::delete::<Pod>(store.as_ref(), Some("blue"), "master-a-7f9c").await.unwrap();
    pods.run_pass(&unit_key).await.unwrap();
    let held: Pod = typed::get(store.as_ref(), Some("blue"), "master-a-7f9c").await.unwrap();
    assert!(held.metadata.deletion_timestamp.is_some());
    assert!(typed::get_opt::<Endpoints>(store.as_ref(), Some("blue"), "master").await.unwrap().is_some());

    let mut drained = held.clone();
    drained.metadata.annotations.get_or_insert_with(Default::default).insert(keys::DRAINED_ANNOTATION.to_string(), "true".to_string());
    typed::update(store.as_ref(), &drained).await.unwrap();
    pods.run_pass(&unit_key).await.unwrap();
    assert!(typed::get_opt::<Endpoints>(store.as_ref(), Some("blue"), "master").await.unwrap().is_none());
    assert!(typed::get_opt::<Pod>(store.as_ref(), Some("blue"), "master-a-7f9c").await.unwrap().is_none());
}
