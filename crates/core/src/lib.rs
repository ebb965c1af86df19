//! Piceli core types: canonical Kubernetes objects, identities, and
//! spec-tree paths shared by the planner, comparator, and executor.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod path;

pub use path::{Path, PathElem};

/// Identity of a Kubernetes object within a deployment: the
/// `(group, version, kind, namespace, name)` tuple. `namespace` is
/// `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    /// GVK key, e.g. `v1/ConfigMap` or `apps/v1/Deployment`.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Stable ordering key used for deterministic tie-breaking.
    pub fn sort_key(&self) -> (&str, &str, &str) {
        (
            self.kind.as_str(),
            self.namespace.as_deref().unwrap_or(""),
            self.name.as_str(),
        )
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

/// Where an object came from. Diagnostic only; never drives behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Parsed out of a serialized manifest on disk.
    Yaml { path: String },
    /// Emitted by a user code module (template lineage).
    Module { module: String, attr: String },
    /// Constructed programmatically through the library API.
    Api,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Yaml { path } => write!(f, "yaml:{}", path),
            Origin::Module { module, attr } => write!(f, "module:{}.{}", module, attr),
            Origin::Api => write!(f, "api"),
        }
    }
}

/// Errors raised while admitting raw documents into the model.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("malformed object ({origin}): {reason}")]
    MalformedObject { reason: String, origin: Origin },
}

/// A loader-normalized Kubernetes object: the raw wire JSON tree plus
/// its origin tag. Immutable after construction; key order in the tree
/// is preserved so diagnostic output stays stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sObject {
    raw: Value,
    origin: Origin,
}

impl K8sObject {
    /// Admit a raw document. Rejects anything without `apiVersion`,
    /// `kind`, and `metadata.name`.
    pub fn new(raw: Value, origin: Origin) -> Result<Self, CoreError> {
        let malformed = |reason: &str| CoreError::MalformedObject {
            reason: reason.to_string(),
            origin: origin.clone(),
        };
        if !raw.is_object() {
            return Err(malformed("document is not a mapping"));
        }
        if raw.get("apiVersion").and_then(Value::as_str).is_none() {
            return Err(malformed("missing apiVersion"));
        }
        if raw.get("kind").and_then(Value::as_str).is_none() {
            return Err(malformed("missing kind"));
        }
        if raw
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(malformed("missing metadata.name"));
        }
        Ok(Self { raw, origin })
    }

    /// Same document re-homed into `namespace` when it does not set one
    /// explicitly. Explicit `metadata.namespace` always wins.
    pub fn with_default_namespace(&self, namespace: &str) -> Self {
        if self.namespace().is_some() {
            return self.clone();
        }
        let mut raw = self.raw.clone();
        if let Some(meta) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
        Self { raw, origin: self.origin.clone() }
    }

    pub fn id(&self) -> ObjectId {
        let (group, version) = self.group_version();
        ObjectId {
            group,
            version,
            kind: self.kind().to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn kind(&self) -> &str {
        self.raw.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
    }

    fn group_version(&self) -> (String, String) {
        let api_version = self.raw.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        }
    }

    pub fn labels(&self) -> Option<&serde_json::Map<String, Value>> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
    }

    pub fn annotations(&self) -> Option<&serde_json::Map<String, Value>> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(Value::as_object)
    }

    /// The full wire JSON tree, as the cluster transport submits it.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The pod spec carried by this object, wherever its kind nests it:
    /// `spec.template.spec` for Deployment/StatefulSet/DaemonSet/Job,
    /// `spec.jobTemplate.spec.template.spec` for CronJob, `spec` for a
    /// bare Pod.
    pub fn pod_spec(&self) -> Option<&Value> {
        match self.kind() {
            "Pod" => self.raw.get("spec"),
            "CronJob" => self
                .raw
                .get("spec")?
                .get("jobTemplate")?
                .get("spec")?
                .get("template")?
                .get("spec"),
            _ => self.raw.get("spec")?.get("template")?.get("spec"),
        }
    }

    /// Labels on the pod template, used for Service selector matching.
    pub fn pod_template_labels(&self) -> Option<&serde_json::Map<String, Value>> {
        let template = match self.kind() {
            "Pod" => self.raw.get("metadata")?,
            "CronJob" => self
                .raw
                .get("spec")?
                .get("jobTemplate")?
                .get("spec")?
                .get("template")?
                .get("metadata")?,
            _ => self.raw.get("spec")?.get("template")?.get("metadata")?,
        };
        template.get("labels").and_then(Value::as_object)
    }

    /// `serviceAccountName` from the pod spec, if any.
    pub fn service_account_name(&self) -> Option<&str> {
        self.pod_spec()?
            .get("serviceAccountName")
            .and_then(Value::as_str)
    }

    /// Container images across regular and init containers.
    pub fn container_images(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(spec) = self.pod_spec() {
            for key in ["containers", "initContainers"] {
                if let Some(containers) = spec.get(key).and_then(Value::as_array) {
                    for c in containers {
                        if let Some(image) = c.get("image").and_then(Value::as_str) {
                            out.push(image);
                        }
                    }
                }
            }
        }
        out
    }
}

pub mod prelude {
    pub use super::{K8sObject, ObjectId, Origin, Path, PathElem};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> K8sObject {
        K8sObject::new(
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "demo", "labels": {"app": "web"}},
                "spec": {
                    "template": {
                        "metadata": {"labels": {"app": "web"}},
                        "spec": {
                            "serviceAccountName": "web-sa",
                            "containers": [{"name": "web", "image": "nginx:1.25"}],
                            "initContainers": [{"name": "init", "image": "busybox:1.36"}]
                        }
                    }
                }
            }),
            Origin::Api,
        )
        .expect("valid deployment")
    }

    #[test]
    fn identity_splits_group_and_version() {
        let id = deployment().id();
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");
        assert_eq!(id.kind, "Deployment");
        assert_eq!(id.namespace.as_deref(), Some("demo"));
        assert_eq!(id.gvk_key(), "apps/v1/Deployment");
        assert_eq!(id.to_string(), "apps/v1/Deployment demo/web");
    }

    #[test]
    fn core_group_has_empty_prefix() {
        let ns = K8sObject::new(
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "demo"}}),
            Origin::Api,
        )
        .unwrap();
        let id = ns.id();
        assert_eq!(id.group, "");
        assert_eq!(id.gvk_key(), "v1/Namespace");
        assert_eq!(id.to_string(), "v1/Namespace demo");
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let missing_kind = json!({"apiVersion": "v1", "metadata": {"name": "x"}});
        let err = K8sObject::new(missing_kind, Origin::Api).unwrap_err();
        assert!(err.to_string().contains("missing kind"));

        let missing_name = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}});
        let err = K8sObject::new(missing_name, Origin::Api).unwrap_err();
        assert!(err.to_string().contains("missing metadata.name"));
    }

    #[test]
    fn default_namespace_never_overrides_explicit() {
        let d = deployment();
        let rehomed = d.with_default_namespace("other");
        assert_eq!(rehomed.namespace(), Some("demo"));

        let bare = K8sObject::new(
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}),
            Origin::Api,
        )
        .unwrap();
        assert_eq!(bare.with_default_namespace("other").namespace(), Some("other"));
    }

    #[test]
    fn pod_spec_accessors_cover_workload_shapes() {
        let d = deployment();
        assert_eq!(d.service_account_name(), Some("web-sa"));
        assert_eq!(d.container_images(), vec!["nginx:1.25", "busybox:1.36"]);
        assert_eq!(
            d.pod_template_labels().unwrap().get("app").unwrap(),
            &json!("web")
        );

        let cj = K8sObject::new(
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {"name": "tick"},
                "spec": {"jobTemplate": {"spec": {"template": {"spec": {
                    "containers": [{"name": "tick", "image": "alpine:3.19"}]
                }}}}}
            }),
            Origin::Api,
        )
        .unwrap();
        assert_eq!(cj.container_images(), vec!["alpine:3.19"]);
    }
}
