//! Piceli kubehub: the kube-backed cluster transport and discovery
//! cache consumed by the executor.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use piceli_core::ObjectId;
use piceli_exec::{ClusterClient, TransportError};

// Reuse a single kube Client across calls; TLS/config setup is costly.
static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

// GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (kube::core::ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

async fn get_kube_client() -> Result<Client> {
    KUBE_CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await
        .cloned()
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let key = if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    };
    if let Some(hit) = DISCOVERY_CACHE.read().expect("cache lock").get(&key).cloned() {
        return Ok(hit);
    }
    debug!(gvk = %key, "discovery cache miss");
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .expect("cache lock")
                    .insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn map_kube_error(e: kube::Error) -> TransportError {
    match e {
        kube::Error::Api(ae) => map_api_error(ae),
        kube::Error::HyperError(e) => TransportError::Transient(e.to_string()),
        kube::Error::Service(e) => TransportError::Transient(e.to_string()),
        other => TransportError::Terminal(other.to_string()),
    }
}

fn map_api_error(ae: ErrorResponse) -> TransportError {
    match ae.code {
        404 => TransportError::NotFound,
        408 | 409 | 425 | 429 => TransportError::Transient(ae.message),
        500..=599 => TransportError::Transient(ae.message),
        _ => TransportError::Terminal(ae.message),
    }
}

/// Cluster transport over dynamic kube APIs.
pub struct KubeClient;

impl KubeClient {
    /// Build the transport, establishing the shared client eagerly so
    /// configuration problems surface before the first level runs.
    pub async fn connect() -> Result<Self> {
        let _ = get_kube_client().await?;
        Ok(Self)
    }

    async fn api_for(&self, id: &ObjectId) -> Result<Api<DynamicObject>, TransportError> {
        let client = get_kube_client()
            .await
            .map_err(|e| TransportError::Terminal(e.to_string()))?;
        let gvk = GroupVersionKind {
            group: id.group.clone(),
            version: id.version.clone(),
            kind: id.kind.clone(),
        };
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk)
            .await
            .map_err(|e| TransportError::Terminal(e.to_string()))?;
        let api = if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::default_namespaced_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, id: &ObjectId) -> Result<Option<Value>, TransportError> {
        let api = self.api_for(id).await?;
        let obj = api.get_opt(&id.name).await.map_err(map_kube_error)?;
        match obj {
            Some(obj) => {
                let raw = serde_json::to_value(&obj)
                    .map_err(|e| TransportError::Terminal(e.to_string()))?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, id: &ObjectId, body: &Value) -> Result<(), TransportError> {
        let api = self.api_for(id).await?;
        let obj: DynamicObject = serde_json::from_value(body.clone())
            .map_err(|e| TransportError::Terminal(format!("body is not an object: {e}")))?;
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(map_kube_error)?;
        info!(id = %id, "created");
        Ok(())
    }

    async fn patch_merge(&self, id: &ObjectId, patch: &Value) -> Result<(), TransportError> {
        let api = self.api_for(id).await?;
        api.patch(&id.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(map_kube_error)?;
        info!(id = %id, "patched");
        Ok(())
    }

    async fn replace(&self, id: &ObjectId, body: &Value) -> Result<(), TransportError> {
        let api = self.api_for(id).await?;
        // PUT needs the current resourceVersion for optimistic concurrency.
        let current = api.get_opt(&id.name).await.map_err(map_kube_error)?;
        let rv = current.and_then(|o| o.metadata.resource_version);
        let mut body = body.clone();
        if let Some(rv) = rv {
            if let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("resourceVersion".to_string(), Value::String(rv));
            }
        }
        let obj: DynamicObject = serde_json::from_value(body)
            .map_err(|e| TransportError::Terminal(format!("body is not an object: {e}")))?;
        api.replace(&id.name, &PostParams::default(), &obj)
            .await
            .map_err(map_kube_error)?;
        info!(id = %id, "replaced");
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), TransportError> {
        let api = self.api_for(id).await?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(id = %id, "deleted");
                Ok(())
            }
            Err(e) => match map_kube_error(e) {
                TransportError::NotFound => Err(TransportError::NotFound),
                other => Err(other),
            },
        }
    }
}

/// Create the namespace when it is missing; `deploy run -c` calls this
/// before the first level.
pub async fn ensure_namespace(name: &str) -> Result<()> {
    use k8s_openapi::api::core::v1::Namespace;
    let client = get_kube_client().await?;
    let api: Api<Namespace> = Api::all(client);
    if api.get_opt(name).await?.is_some() {
        return Ok(());
    }
    let body: Namespace = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name}
    }))?;
    api.create(&PostParams::default(), &body)
        .await
        .with_context(|| format!("creating namespace {name}"))?;
    info!(namespace = %name, "namespace created");
    Ok(())
}
