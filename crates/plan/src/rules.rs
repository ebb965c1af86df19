//! Edge inference data: kind precedence ranks and per-kind reference
//! extractors over the spec tree.

use piceli_core::K8sObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Precedence classes, applied before reference edges: every object
/// gains an edge from every object of the nearest populated lower
/// rank. Unknown kinds rank with the workloads.
const KIND_RANKS: &[&[&str]] = &[
    &["Namespace"],
    &["Role", "ClusterRole", "ServiceAccount", "StorageClass", "PersistentVolume"],
    &["RoleBinding", "ClusterRoleBinding"],
    &["Secret", "ConfigMap"],
    &["PersistentVolumeClaim"],
    &["Deployment", "StatefulSet", "DaemonSet", "Job", "Pod"],
    &["Service", "Ingress"],
    &["CronJob"],
    &["HorizontalPodAutoscaler", "VerticalPodAutoscaler"],
];

const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "Job", "CronJob", "Pod"];

pub fn kind_rank(kind: &str) -> usize {
    for (rank, kinds) in KIND_RANKS.iter().enumerate() {
        if kinds.contains(&kind) {
            return rank;
        }
    }
    // Unknown kinds (CRDs) deploy with the workloads.
    KIND_RANKS.iter().position(|k| k.contains(&"Deployment")).unwrap_or(0)
}

pub fn is_workload(kind: &str) -> bool {
    WORKLOAD_KINDS.contains(&kind)
}

/// Workloads a Service selector can settle on. CronJobs rank after
/// Services and their pods are transient, so they never take the edge.
pub fn is_selectable_workload(kind: &str) -> bool {
    matches!(kind, "Deployment" | "StatefulSet" | "DaemonSet" | "Job" | "Pod")
}

/// A by-name reference to another object, extracted from a spec tree.
/// `namespace = None` targets a cluster-scoped object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl Reference {
    fn namespaced(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Reference {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    fn cluster(kind: &str, name: &str) -> Self {
        Reference { kind: kind.to_string(), namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// By-name references carried by `obj`, per its kind. The Service
/// selector rule is label-based rather than by-name and lives with the
/// graph builder.
pub fn extract_references(obj: &K8sObject) -> Vec<Reference> {
    let ns = obj.namespace();
    let mut refs = Vec::new();
    // Namespaced objects settle inside their Namespace.
    if let Some(ns) = ns {
        refs.push(Reference::cluster("Namespace", ns));
    }
    match obj.kind() {
        "RoleBinding" | "ClusterRoleBinding" => binding_refs(obj, ns, &mut refs),
        "PersistentVolumeClaim" => {
            if let Some(sc) = obj
                .raw()
                .get("spec")
                .and_then(|s| s.get("storageClassName"))
                .and_then(Value::as_str)
            {
                refs.push(Reference::cluster("StorageClass", sc));
            }
        }
        "HorizontalPodAutoscaler" | "VerticalPodAutoscaler" => scale_target_refs(obj, ns, &mut refs),
        kind if is_workload(kind) => workload_refs(obj, ns, &mut refs),
        _ => {}
    }
    refs
}

fn binding_refs(obj: &K8sObject, ns: Option<&str>, refs: &mut Vec<Reference>) {
    if let Some(role_ref) = obj.raw().get("roleRef") {
        let kind = role_ref.get("kind").and_then(Value::as_str).unwrap_or("Role");
        if let Some(name) = role_ref.get("name").and_then(Value::as_str) {
            if kind == "ClusterRole" {
                refs.push(Reference::cluster(kind, name));
            } else {
                refs.push(Reference::namespaced(kind, ns, name));
            }
        }
    }
    if let Some(subjects) = obj.raw().get("subjects").and_then(Value::as_array) {
        for subject in subjects {
            if subject.get("kind").and_then(Value::as_str) != Some("ServiceAccount") {
                continue;
            }
            if let Some(name) = subject.get("name").and_then(Value::as_str) {
                let subject_ns = subject.get("namespace").and_then(Value::as_str).or(ns);
                refs.push(Reference::namespaced("ServiceAccount", subject_ns, name));
            }
        }
    }
}

fn scale_target_refs(obj: &K8sObject, ns: Option<&str>, refs: &mut Vec<Reference>) {
    let spec = match obj.raw().get("spec") {
        Some(s) => s,
        None => return,
    };
    // HPA names it scaleTargetRef, VPA targetRef.
    let target = spec.get("scaleTargetRef").or_else(|| spec.get("targetRef"));
    if let Some(target) = target {
        if let (Some(kind), Some(name)) = (
            target.get("kind").and_then(Value::as_str),
            target.get("name").and_then(Value::as_str),
        ) {
            refs.push(Reference::namespaced(kind, ns, name));
        }
    }
}

fn workload_refs(obj: &K8sObject, ns: Option<&str>, refs: &mut Vec<Reference>) {
    if let Some(sa) = obj.service_account_name() {
        refs.push(Reference::namespaced("ServiceAccount", ns, sa));
    }
    let spec = match obj.pod_spec() {
        Some(s) => s,
        None => return,
    };
    if let Some(volumes) = spec.get("volumes").and_then(Value::as_array) {
        for volume in volumes {
            if let Some(name) = volume
                .get("configMap")
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
            {
                refs.push(Reference::namespaced("ConfigMap", ns, name));
            }
            if let Some(name) = volume
                .get("secret")
                .and_then(|s| s.get("secretName"))
                .and_then(Value::as_str)
            {
                refs.push(Reference::namespaced("Secret", ns, name));
            }
            if let Some(claim) = volume
                .get("persistentVolumeClaim")
                .and_then(|p| p.get("claimName"))
                .and_then(Value::as_str)
            {
                refs.push(Reference::namespaced("PersistentVolumeClaim", ns, claim));
            }
        }
    }
    for key in ["containers", "initContainers"] {
        let containers = match spec.get(key).and_then(Value::as_array) {
            Some(c) => c,
            None => continue,
        };
        for container in containers {
            if let Some(env_from) = container.get("envFrom").and_then(Value::as_array) {
                for source in env_from {
                    if let Some(name) = source
                        .get("configMapRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(Reference::namespaced("ConfigMap", ns, name));
                    }
                    if let Some(name) = source
                        .get("secretRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(Reference::namespaced("Secret", ns, name));
                    }
                }
            }
            if let Some(env) = container.get("env").and_then(Value::as_array) {
                for var in env {
                    let value_from = match var.get("valueFrom") {
                        Some(v) => v,
                        None => continue,
                    };
                    if let Some(name) = value_from
                        .get("configMapKeyRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(Reference::namespaced("ConfigMap", ns, name));
                    }
                    if let Some(name) = value_from
                        .get("secretKeyRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(Reference::namespaced("Secret", ns, name));
                    }
                }
            }
        }
    }
}

/// True when `selector` is a subset of the workload's pod-template
/// labels. An empty or absent selector matches nothing.
pub fn selector_matches(selector: &serde_json::Map<String, Value>, workload: &K8sObject) -> bool {
    if selector.is_empty() {
        return false;
    }
    let labels = match workload.pod_template_labels() {
        Some(l) => l,
        None => return false,
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use piceli_core::Origin;
    use serde_json::json;

    fn obj(raw: Value) -> K8sObject {
        K8sObject::new(raw, Origin::Api).expect("valid object")
    }

    #[test]
    fn ranks_follow_the_precedence_table() {
        assert!(kind_rank("Namespace") < kind_rank("Role"));
        assert!(kind_rank("Role") < kind_rank("RoleBinding"));
        assert!(kind_rank("RoleBinding") < kind_rank("ConfigMap"));
        assert!(kind_rank("ConfigMap") < kind_rank("PersistentVolumeClaim"));
        assert!(kind_rank("PersistentVolumeClaim") < kind_rank("Deployment"));
        assert!(kind_rank("Deployment") < kind_rank("Service"));
        assert!(kind_rank("Service") < kind_rank("CronJob"));
        assert!(kind_rank("CronJob") < kind_rank("HorizontalPodAutoscaler"));
        // CRDs deploy with the workloads
        assert_eq!(kind_rank("Certificate"), kind_rank("Deployment"));
    }

    #[test]
    fn binding_references_role_and_subjects() {
        let rb = obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": {"name": "rb", "namespace": "demo"},
            "roleRef": {"kind": "Role", "name": "reader"},
            "subjects": [
                {"kind": "ServiceAccount", "name": "app-sa"},
                {"kind": "User", "name": "alice"}
            ]
        }));
        let refs = extract_references(&rb);
        assert!(refs.contains(&Reference::cluster("Namespace", "demo")));
        assert!(refs.contains(&Reference::namespaced("Role", Some("demo"), "reader")));
        assert!(refs.contains(&Reference::namespaced("ServiceAccount", Some("demo"), "app-sa")));
        // non-ServiceAccount subjects carry no edge
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn workload_references_cover_volumes_env_and_sa() {
        let d = obj(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "demo"},
            "spec": {"template": {"spec": {
                "serviceAccountName": "web-sa",
                "volumes": [
                    {"name": "cfg", "configMap": {"name": "web-cm"}},
                    {"name": "creds", "secret": {"secretName": "web-secret"}},
                    {"name": "data", "persistentVolumeClaim": {"claimName": "web-data"}}
                ],
                "containers": [{
                    "name": "web",
                    "image": "nginx",
                    "envFrom": [{"configMapRef": {"name": "env-cm"}}],
                    "env": [{"name": "TOKEN", "valueFrom": {"secretKeyRef": {"name": "token-secret", "key": "t"}}}]
                }]
            }}}
        }));
        let refs = extract_references(&d);
        for expected in [
            Reference::namespaced("ServiceAccount", Some("demo"), "web-sa"),
            Reference::namespaced("ConfigMap", Some("demo"), "web-cm"),
            Reference::namespaced("Secret", Some("demo"), "web-secret"),
            Reference::namespaced("PersistentVolumeClaim", Some("demo"), "web-data"),
            Reference::namespaced("ConfigMap", Some("demo"), "env-cm"),
            Reference::namespaced("Secret", Some("demo"), "token-secret"),
        ] {
            assert!(refs.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn pvc_references_its_storage_class() {
        let pvc = obj(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "data", "namespace": "demo"},
            "spec": {"storageClassName": "fast"}
        }));
        let refs = extract_references(&pvc);
        assert!(refs.contains(&Reference::cluster("StorageClass", "fast")));
    }

    #[test]
    fn autoscaler_references_its_target() {
        let hpa = obj(json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": {"name": "hpa", "namespace": "demo"},
            "spec": {"scaleTargetRef": {"kind": "Deployment", "name": "web"}}
        }));
        let refs = extract_references(&hpa);
        assert!(refs.contains(&Reference::namespaced("Deployment", Some("demo"), "web")));
    }

    #[test]
    fn selector_subset_semantics() {
        let d = obj(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "demo"},
            "spec": {"template": {"metadata": {"labels": {"app": "web", "tier": "front"}}, "spec": {}}}
        }));
        let matching = json!({"app": "web"});
        let broader = json!({"app": "web", "zone": "eu"});
        assert!(selector_matches(matching.as_object().unwrap(), &d));
        assert!(!selector_matches(broader.as_object().unwrap(), &d));
        assert!(!selector_matches(&serde_json::Map::new(), &d));
    }
}
