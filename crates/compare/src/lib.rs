//! Piceli compare: semantic diff of desired vs live spec trees and the
//! reconciliation decision built on top of it.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use piceli_core::{Path, PathElem};

pub mod planner;
pub mod quantity;
pub mod tables;

pub use planner::{decide, Action, Decision};
pub use quantity::quantities_equal;
use tables::{is_ignored, is_server_default, sequence_kind, SeqKind, RESOURCE_KEYS};

/// How one path compares between live and desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffClass {
    Equal,
    Ignored,
    Defaulted,
    Differing,
}

/// One classified path. Ignored and Defaulted entries carry a live
/// side only; Equal entries record the shared subtree once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: Path,
    pub class: DiffClass,
    pub live: Option<Value>,
    pub desired: Option<Value>,
}

/// Stable pre-order list of classified paths for one object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    /// True when any path actually differs.
    pub fn needs_action(&self) -> bool {
        self.entries.iter().any(|e| e.class == DiffClass::Differing)
    }

    pub fn differing(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| e.class == DiffClass::Differing)
    }

    /// A difference whose desired side is absent while live holds a
    /// value; a merge patch cannot express the removal reliably.
    pub fn is_lossy(&self) -> bool {
        self.differing().any(|e| e.desired.is_none())
    }

    /// Merge-patch body containing only the differing paths. Paths
    /// that descend into sequences fall back to the nearest mapping
    /// ancestor, since a merge patch replaces arrays wholesale.
    pub fn merge_patch(&self, desired_root: &Value) -> Value {
        let mut patch = Map::new();
        for entry in self.differing() {
            let keys: Vec<&str> = entry
                .path
                .elements()
                .iter()
                .take_while(|e| matches!(e, PathElem::Key(_)))
                .map(|e| match e {
                    PathElem::Key(k) => k.as_str(),
                    _ => unreachable!(),
                })
                .collect();
            let truncated = keys.len() != entry.path.len();
            let value = if truncated {
                lookup(desired_root, &keys).cloned().unwrap_or(Value::Null)
            } else {
                entry.desired.clone().unwrap_or(Value::Null)
            };
            insert_nested(&mut patch, &keys, value);
        }
        Value::Object(patch)
    }
}

fn lookup<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for key in keys {
        current = current.get(key)?;
    }
    Some(current)
}

fn insert_nested(patch: &mut Map<String, Value>, keys: &[&str], value: Value) {
    match keys {
        [] => {}
        [last] => {
            patch.insert((*last).to_string(), value);
        }
        [first, rest @ ..] => {
            let slot = patch
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Some(nested) = slot.as_object_mut() {
                insert_nested(nested, rest, value);
            }
        }
    }
}

/// Does the live object already satisfy the desired one? Classifies
/// every path of both trees in stable pre-order: desired keys first,
/// live-only keys after, per mapping.
pub fn compare(kind: &str, desired: &Value, live: &Value) -> Diff {
    let mut entries = Vec::new();
    diff_maps(
        kind,
        &Path::root(),
        desired.as_object(),
        live.as_object(),
        &mut entries,
    );
    Diff { entries }
}

fn diff_maps(
    kind: &str,
    prefix: &Path,
    desired: Option<&Map<String, Value>>,
    live: Option<&Map<String, Value>>,
    out: &mut Vec<DiffEntry>,
) {
    let empty = Map::new();
    let desired = desired.unwrap_or(&empty);
    let live = live.unwrap_or(&empty);
    let mut keys: Vec<&String> = desired.keys().collect();
    keys.extend(live.keys().filter(|k| !desired.contains_key(*k)));
    for key in keys {
        let path = prefix.key(key);
        classify_pair(kind, path, desired.get(key), live.get(key), out);
    }
}

fn classify_pair(
    kind: &str,
    path: Path,
    desired: Option<&Value>,
    live: Option<&Value>,
    out: &mut Vec<DiffEntry>,
) {
    if is_ignored(kind, &path, desired) {
        out.push(DiffEntry {
            path,
            class: DiffClass::Ignored,
            live: live.cloned(),
            desired: None,
        });
        return;
    }
    if desired.is_none() {
        if let Some(live_value) = live {
            if is_server_default(kind, &path, live_value) {
                out.push(DiffEntry {
                    path,
                    class: DiffClass::Defaulted,
                    live: Some(live_value.clone()),
                    desired: None,
                });
                return;
            }
        }
    }
    compare_values(kind, path, desired, live, out);
}

fn compare_values(
    kind: &str,
    path: Path,
    desired: Option<&Value>,
    live: Option<&Value>,
    out: &mut Vec<DiffEntry>,
) {
    if values_equal(&path, desired, live) {
        out.push(DiffEntry {
            path,
            class: DiffClass::Equal,
            live: live.cloned(),
            desired: desired.cloned(),
        });
        return;
    }
    // Mappings (and absent/null sides standing in for them) descend.
    if let (Some(d), Some(l)) = (map_like(desired), map_like(live)) {
        diff_maps(kind, &path, d, l, out);
        return;
    }
    if let (Some(Value::Array(d)), Some(Value::Array(l))) = (desired, live) {
        diff_sequence(kind, path, d, l, out);
        return;
    }
    out.push(DiffEntry {
        path,
        class: DiffClass::Differing,
        live: live.cloned(),
        desired: desired.cloned(),
    });
}

/// `None`/null stand in for an empty mapping so one-sided subtrees
/// still enumerate their paths.
#[allow(clippy::option_option)]
fn map_like(v: Option<&Value>) -> Option<Option<&Map<String, Value>>> {
    match v {
        None | Some(Value::Null) => Some(None),
        Some(Value::Object(m)) => Some(Some(m)),
        _ => None,
    }
}

fn values_equal(path: &Path, desired: Option<&Value>, live: Option<&Value>) -> bool {
    if desired == live {
        return true;
    }
    // Resource quantities compare by value: 500m == 0.5.
    if path.last_key().is_some_and(|k| RESOURCE_KEYS.contains(&k)) {
        if let (Some(Value::String(d)), Some(Value::String(l))) = (desired, live) {
            return quantities_equal(d, l);
        }
    }
    false
}

fn diff_sequence(
    kind: &str,
    path: Path,
    desired: &[Value],
    live: &[Value],
    out: &mut Vec<DiffEntry>,
) {
    match sequence_kind(path.last_key()) {
        SeqKind::Keyed(fields) if keyed_elements(desired, fields) && keyed_elements(live, fields) => {
            let desired_keyed = key_elements(desired, fields);
            let live_keyed = key_elements(live, fields);
            let mut seen: Vec<&str> = Vec::new();
            for (key, d_elem) in &desired_keyed {
                seen.push(key.as_str());
                let elem_path = path.push(PathElem::Id {
                    field: fields.join("+"),
                    value: key.clone(),
                });
                let l_elem = live_keyed
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| *v);
                compare_values(kind, elem_path, Some(*d_elem), l_elem, out);
            }
            for (key, l_elem) in &live_keyed {
                if seen.contains(&key.as_str()) {
                    continue;
                }
                let elem_path = path.push(PathElem::Id {
                    field: fields.join("+"),
                    value: key.clone(),
                });
                compare_values(kind, elem_path, None, Some(*l_elem), out);
            }
        }
        SeqKind::Multiset => {
            let class = if multiset_equal(desired, live) {
                DiffClass::Equal
            } else {
                DiffClass::Differing
            };
            out.push(DiffEntry {
                path,
                class,
                live: Some(Value::Array(live.to_vec())),
                desired: Some(Value::Array(desired.to_vec())),
            });
        }
        _ => {
            let longest = desired.len().max(live.len());
            for index in 0..longest {
                let elem_path = path.push(PathElem::Index(index));
                compare_values(kind, elem_path, desired.get(index), live.get(index), out);
            }
        }
    }
}

fn keyed_elements(elems: &[Value], fields: &[&str]) -> bool {
    elems.iter().all(|e| {
        fields
            .iter()
            .all(|f| e.get(f).and_then(Value::as_str).is_some())
    })
}

fn key_elements<'a>(elems: &'a [Value], fields: &[&str]) -> Vec<(String, &'a Value)> {
    elems
        .iter()
        .map(|e| {
            let key = fields
                .iter()
                .filter_map(|f| e.get(f).and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("/");
            (key, e)
        })
        .collect()
}

fn multiset_equal(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut unmatched: Vec<&Value> = b.iter().collect();
    for item in a {
        match unmatched.iter().position(|other| *other == item) {
            Some(pos) => {
                unmatched.swap_remove(pos);
            }
            None => return false,
        }
    }
    true
}
