//! Server-behavior tables: ignored paths, known defaults, set-valued
//! sequence keys, and immutability rules. Kept as data so they can
//! grow per cluster version without touching the comparator.

use piceli_core::{Path, PathElem};
use serde_json::Value;

/// Kind-agnostic server-managed paths, prefix-matched. Content under
/// these never participates in action selection.
const IGNORED_PREFIXES: &[&[&str]] = &[
    &["metadata", "creationTimestamp"],
    &["metadata", "resourceVersion"],
    &["metadata", "uid"],
    &["metadata", "generation"],
    &["metadata", "selfLink"],
    &["metadata", "managedFields"],
    &["metadata", "finalizers"],
    &["metadata", "labels", "kubernetes.io/metadata.name"],
    &["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"],
    &["spec", "finalizers"],
    &["status"],
];

/// Kind-specific extensions to the ignored set.
const KIND_IGNORED_PREFIXES: &[(&str, &[&str])] = &[
    ("Service", &["spec", "clusterIP"]),
    ("Service", &["spec", "clusterIPs"]),
    ("PersistentVolumeClaim", &["metadata", "annotations", "pv.kubernetes.io/bind-completed"]),
    ("PersistentVolumeClaim", &["metadata", "annotations", "pv.kubernetes.io/bound-by-controller"]),
];

pub fn is_ignored(kind: &str, path: &Path, desired: Option<&Value>) -> bool {
    let matches_prefix = |prefix: &[&str]| {
        path.len() >= prefix.len()
            && path
                .elements()
                .iter()
                .zip(prefix.iter())
                .all(|(elem, key)| matches!(elem, PathElem::Key(k) if k == key))
    };
    if IGNORED_PREFIXES.iter().any(|p| matches_prefix(p)) {
        return true;
    }
    if KIND_IGNORED_PREFIXES
        .iter()
        .any(|(k, p)| *k == kind && matches_prefix(p))
    {
        return true;
    }
    // ownerReferences are server-managed unless the caller sets them.
    if matches_prefix(&["metadata", "ownerReferences"]) {
        let desired_empty = match desired {
            None | Some(Value::Null) => true,
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        return desired_empty;
    }
    false
}

/// Known server defaults: `(kind or any, exact path, expected value)`.
/// `kind = None` applies to every kind; `value = None` accepts any
/// live value at the path. Unknown combinations fall through to
/// Differing.
const DEFAULTED_PATHS: &[(Option<&str>, &[&str], Option<&str>)] = &[
    (Some("StorageClass"), &["reclaimPolicy"], Some("Delete")),
    (Some("StorageClass"), &["volumeBindingMode"], Some("Immediate")),
    (Some("PersistentVolumeClaim"), &["spec", "storageClassName"], None),
    (Some("PersistentVolumeClaim"), &["spec", "volumeMode"], None),
    (Some("Service"), &["spec", "type"], Some("ClusterIP")),
    (Some("Service"), &["spec", "sessionAffinity"], Some("None")),
    (Some("Service"), &["spec", "internalTrafficPolicy"], Some("Cluster")),
    (Some("Service"), &["spec", "ipFamilies"], None),
    (Some("Service"), &["spec", "ipFamilyPolicy"], None),
    (Some("Deployment"), &["spec", "progressDeadlineSeconds"], Some("600")),
    (Some("Deployment"), &["spec", "revisionHistoryLimit"], Some("10")),
    (Some("Deployment"), &["spec", "strategy"], None),
    (Some("Namespace"), &["spec", "finalizers"], None),
    (None, &["spec", "template", "spec", "restartPolicy"], Some("Always")),
    (None, &["spec", "template", "spec", "dnsPolicy"], Some("ClusterFirst")),
    (None, &["spec", "template", "spec", "schedulerName"], Some("default-scheduler")),
    (None, &["spec", "template", "spec", "terminationGracePeriodSeconds"], Some("30")),
];

/// Live-only value at `path` that the server is known to have filled
/// in for this kind.
pub fn is_server_default(kind: &str, path: &Path, live: &Value) -> bool {
    DEFAULTED_PATHS.iter().any(|(rule_kind, rule_path, expected)| {
        if rule_kind.is_some_and(|k| k != kind) {
            return false;
        }
        if !path_is_exactly(path, rule_path) {
            return false;
        }
        match expected {
            None => true,
            Some(want) => value_matches(live, want),
        }
    })
}

fn path_is_exactly(path: &Path, keys: &[&str]) -> bool {
    path.len() == keys.len()
        && path
            .elements()
            .iter()
            .zip(keys.iter())
            .all(|(elem, key)| matches!(elem, PathElem::Key(k) if k == key))
}

fn value_matches(live: &Value, want: &str) -> bool {
    match live {
        Value::String(s) => s == want,
        other => other.to_string() == want,
    }
}

/// Scalar keys whose values are Kubernetes quantities.
pub const RESOURCE_KEYS: &[&str] = &["cpu", "memory", "ephemeral-storage", "storage"];

/// How a sequence at a given mapping key compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqKind {
    /// Element order is meaningful; compare index by index.
    Positional,
    /// Set-valued, elements identified by the named fields.
    Keyed(&'static [&'static str]),
    /// Set-valued scalars or keyless mappings; compare as a multiset.
    Multiset,
}

pub fn sequence_kind(last_key: Option<&str>) -> SeqKind {
    match last_key {
        Some(
            "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "volumeMounts"
            | "env" | "ports" | "imagePullSecrets",
        ) => SeqKind::Keyed(&["name"]),
        Some("subjects") => SeqKind::Keyed(&["kind", "name"]),
        Some("finalizers" | "rules" | "accessModes") => SeqKind::Multiset,
        _ => SeqKind::Positional,
    }
}

/// Kinds whose spec cannot be patched at all: any difference means
/// delete-then-create.
const IMMUTABLE_KINDS: &[&str] = &["Job", "PersistentVolume", "StorageClass"];

/// `(kind, forbidden path prefix)`: a differing path under the prefix
/// mandates replacement.
const IMMUTABLE_PREFIXES: &[(&str, &[&str])] = &[
    ("Job", &["spec", "selector"]),
    ("Job", &["spec", "template"]),
    ("Job", &["spec", "completions"]),
    ("Service", &["spec", "selector"]),
    ("Deployment", &["spec", "selector"]),
    ("StatefulSet", &["spec", "selector"]),
    ("StatefulSet", &["spec", "serviceName"]),
    ("StatefulSet", &["spec", "volumeClaimTemplates"]),
];

pub fn kind_is_immutable(kind: &str) -> bool {
    IMMUTABLE_KINDS.contains(&kind)
}

/// True when a difference at `path` cannot be patched for `kind`.
pub fn path_is_immutable(kind: &str, path: &Path) -> bool {
    if IMMUTABLE_PREFIXES
        .iter()
        .any(|(k, prefix)| *k == kind && path.starts_with(&Path::keys(prefix.iter().copied())))
    {
        return true;
    }
    // PVC spec is immutable after creation except resources, for
    // bound-claim resizing.
    if kind == "PersistentVolumeClaim" {
        if let Some(PathElem::Key(first)) = path.elements().first() {
            if first == "spec" {
                return !matches!(
                    path.elements().get(1),
                    Some(PathElem::Key(second)) if second == "resources"
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_subtree_is_ignored_for_every_kind() {
        assert!(is_ignored("Deployment", &Path::keys(["status", "readyReplicas"]), None));
        assert!(is_ignored("ConfigMap", &Path::keys(["metadata", "managedFields"]), None));
        assert!(!is_ignored("ConfigMap", &Path::keys(["data", "status"]), None));
    }

    #[test]
    fn owner_references_ignored_only_when_desired_is_silent() {
        let path = Path::keys(["metadata", "ownerReferences"]);
        assert!(is_ignored("ConfigMap", &path, None));
        assert!(is_ignored("ConfigMap", &path, Some(&json!([]))));
        assert!(!is_ignored("ConfigMap", &path, Some(&json!([{"kind": "Deployment"}]))));
    }

    #[test]
    fn storage_class_defaults_require_the_expected_value() {
        let p = Path::keys(["reclaimPolicy"]);
        assert!(is_server_default("StorageClass", &p, &json!("Delete")));
        assert!(!is_server_default("StorageClass", &p, &json!("Retain")));
        assert!(!is_server_default("ConfigMap", &p, &json!("Delete")));
    }

    #[test]
    fn pvc_storage_class_default_accepts_any_value() {
        let p = Path::keys(["spec", "storageClassName"]);
        assert!(is_server_default("PersistentVolumeClaim", &p, &json!("standard")));
        assert!(is_server_default("PersistentVolumeClaim", &p, &json!("fast")));
    }

    #[test]
    fn immutability_rules_cover_kinds_and_prefixes() {
        assert!(kind_is_immutable("Job"));
        assert!(!kind_is_immutable("Deployment"));
        let image = Path::keys(["spec", "template", "spec", "containers"])
            .push(PathElem::Index(0))
            .key("image");
        assert!(path_is_immutable("Job", &image));
        assert!(!path_is_immutable("Deployment", &image));
        assert!(path_is_immutable("Service", &Path::keys(["spec", "selector", "app"])));
        assert!(path_is_immutable(
            "PersistentVolumeClaim",
            &Path::keys(["spec", "accessModes"])
        ));
        assert!(!path_is_immutable(
            "PersistentVolumeClaim",
            &Path::keys(["spec", "resources", "requests", "storage"])
        ));
    }
}
