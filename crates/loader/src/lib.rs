//! Piceli load: ingests serialized manifests from files and folders
//! into canonical objects. Programmatic objects enter through
//! `piceli_core` directly; this crate makes no assumption about the
//! caller's source mix.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use piceli_core::{K8sObject, Origin};

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse one file as a multi-document YAML stream. Empty documents are
/// skipped; anything that is not a Kubernetes object is an error.
pub fn load_file(path: &Path) -> Result<Vec<K8sObject>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let origin = Origin::Yaml { path: path.display().to_string() };
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("parsing {}", path.display()))?;
        if value.is_null() {
            continue;
        }
        let raw = serde_json::to_value(value)
            .with_context(|| format!("converting {} to JSON", path.display()))?;
        let obj = K8sObject::new(raw, origin.clone())
            .map_err(|e| anyhow!("{}: {}", path.display(), e))?;
        objects.push(obj);
    }
    debug!(path = %path.display(), count = objects.len(), "loaded manifests");
    Ok(objects)
}

/// Load every manifest under a folder. With `sub_elements` the walk
/// descends recursively; otherwise only direct children are read.
/// Files load in path order so repeated runs see the same sequence.
pub fn load_dir(path: &Path, sub_elements: bool) -> Result<Vec<K8sObject>> {
    let max_depth = if sub_elements { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_manifest(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    let mut objects = Vec::new();
    for file in files {
        objects.extend(load_file(&file)?);
    }
    Ok(objects)
}

/// Load from explicit files plus folder roots, in that order.
pub fn load_all(files: &[PathBuf], folders: &[PathBuf], sub_elements: bool) -> Result<Vec<K8sObject>> {
    let mut objects = Vec::new();
    for file in files {
        objects.extend(load_file(file)?);
    }
    for folder in folders {
        objects.extend(load_dir(folder, sub_elements)?);
    }
    Ok(objects)
}
