#![forbid(unsafe_code)]

use piceli_core::{K8sObject, Origin};
use piceli_plan::{plan, DependencyHints, PlanError};
use serde_json::{json, Value};

fn obj(raw: Value) -> K8sObject {
    K8sObject::new(raw, Origin::Api).expect("valid object")
}

/// The full fixture from the layered-deploy scenario: RBAC, storage,
/// config, a workload, its service, a cron job, and an autoscaler.
fn layered_fixture() -> Vec<K8sObject> {
    vec![
        obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {"name": "example-role", "namespace": "demo"}
        })),
        obj(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "example-sa", "namespace": "demo"}
        })),
        obj(json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": {"name": "resizable"},
            "provisioner": "k8s.io/minikube-hostpath",
            "allowVolumeExpansion": true
        })),
        obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": {"name": "example-rb", "namespace": "demo"},
            "roleRef": {"kind": "Role", "name": "example-role"},
            "subjects": [{"kind": "ServiceAccount", "name": "example-sa"}]
        })),
        obj(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s", "namespace": "demo"},
            "stringData": {"token": "hunter2"}
        })),
        obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "demo"},
            "data": {"key": "value"}
        })),
        obj(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "pvc", "namespace": "demo"},
            "spec": {
                "storageClassName": "resizable",
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "1Gi"}}
            }
        })),
        obj(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "demo"},
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": "d"}},
                "template": {
                    "metadata": {"labels": {"app": "d"}},
                    "spec": {
                        "serviceAccountName": "example-sa",
                        "volumes": [
                            {"name": "cfg", "configMap": {"name": "cm"}},
                            {"name": "creds", "secret": {"secretName": "s"}},
                            {"name": "data", "persistentVolumeClaim": {"claimName": "pvc"}}
                        ],
                        "containers": [{"name": "d", "image": "nginx:1.25"}]
                    }
                }
            }
        })),
        obj(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "demo"},
            "spec": {"selector": {"app": "d"}, "ports": [{"port": 80}]}
        })),
        obj(json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": {"name": "cj", "namespace": "demo"},
            "spec": {
                "schedule": "*/5 * * * *",
                "jobTemplate": {"spec": {"template": {"spec": {
                    "containers": [{"name": "cj", "image": "alpine:3.19"}],
                    "restartPolicy": "Never"
                }}}}
            }
        })),
        obj(json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": {"name": "hpa", "namespace": "demo"},
            "spec": {
                "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "d"},
                "minReplicas": 1,
                "maxReplicas": 3
            }
        })),
    ]
}

fn level_names(p: &piceli_plan::Plan) -> Vec<Vec<String>> {
    p.levels()
        .iter()
        .map(|level| level.iter().map(|id| id.name.clone()).collect())
        .collect()
}

#[test]
fn layered_fixture_levels_out_as_expected() {
    let p = plan(layered_fixture(), &DependencyHints::default(), false).unwrap();
    assert_eq!(
        level_names(&p),
        vec![
            vec!["example-role", "example-sa", "resizable"],
            vec!["example-rb"],
            vec!["cm", "s"],
            vec!["pvc"],
            vec!["d"],
            vec!["svc"],
            vec!["cj"],
            vec!["hpa"],
        ]
    );
}

#[test]
fn level_assignment_is_input_order_independent() {
    let forward = plan(layered_fixture(), &DependencyHints::default(), false).unwrap();
    let mut shuffled = layered_fixture();
    shuffled.reverse();
    shuffled.rotate_left(3);
    let reordered = plan(shuffled, &DependencyHints::default(), false).unwrap();
    assert_eq!(forward.levels(), reordered.levels());
}

#[test]
fn layered_fixture_passes_full_validation() {
    assert!(plan(layered_fixture(), &DependencyHints::default(), true).is_ok());
}

#[test]
fn mutual_service_hints_report_a_cycle() {
    let svc = |name: &str| {
        obj(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": "demo"},
            "spec": {"ports": [{"port": 80}]}
        }))
    };
    let a = svc("alpha");
    let b = svc("beta");
    let (ida, idb) = (a.id(), b.id());
    let mut hints = DependencyHints::default();
    hints.depends_on.insert(ida.clone(), vec![idb.clone()]);
    hints.depends_on.insert(idb.clone(), vec![ida.clone()]);
    match plan(vec![a, b], &hints, false) {
        Err(PlanError::CycleDetected(cycle)) => {
            assert!(cycle.contains(&ida), "cycle should list alpha: {cycle:?}");
            assert!(cycle.contains(&idb), "cycle should list beta: {cycle:?}");
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn references_outside_the_set_are_assumed_preexisting() {
    let d = obj(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "demo"},
        "spec": {"template": {"spec": {
            "serviceAccountName": "preexisting-sa",
            "containers": [{"name": "web", "image": "nginx"}]
        }}}
    }));
    let p = plan(vec![d], &DependencyHints::default(), false).unwrap();
    assert_eq!(p.levels().len(), 1);
}
