//! Reconciliation planner: turns a comparator result into the minimal
//! cluster mutation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use piceli_core::{K8sObject, ObjectId};

use crate::tables::{kind_is_immutable, path_is_immutable};
use crate::{compare, Diff};

/// The mutation (or absence of one) chosen for a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    /// Live already satisfies desired.
    NoAction { id: ObjectId },
    /// No live object; submit the full desired body.
    Create { id: ObjectId, body: Value },
    /// Merge-patch carrying only the differing paths.
    Patch { id: ObjectId, patch: Value },
    /// Delete then create: immutable spec or lossy patch.
    Replace { id: ObjectId, body: Value },
}

impl Action {
    pub fn id(&self) -> &ObjectId {
        match self {
            Action::NoAction { id }
            | Action::Create { id, .. }
            | Action::Patch { id, .. }
            | Action::Replace { id, .. } => id,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Action::NoAction { .. })
    }

    /// Short verb for logs and tables.
    pub fn verb(&self) -> &'static str {
        match self {
            Action::NoAction { .. } => "no-action",
            Action::Create { .. } => "create",
            Action::Patch { .. } => "patch",
            Action::Replace { .. } => "replace",
        }
    }
}

/// The action plus the comparator evidence behind it (`None` when the
/// live object was absent and there was nothing to compare).
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub diff: Option<Diff>,
}

/// Choose the action for `desired` given the freshly read live object.
pub fn decide(desired: &K8sObject, live: Option<&Value>) -> Decision {
    let id = desired.id();
    let live = match live {
        Some(l) => l,
        None => {
            return Decision {
                action: Action::Create { id, body: desired.raw().clone() },
                diff: None,
            }
        }
    };
    let diff = compare(&id.kind, desired.raw(), live);
    let action = if !diff.needs_action() {
        Action::NoAction { id }
    } else if requires_replacement(&id.kind, &diff) {
        Action::Replace { id, body: desired.raw().clone() }
    } else {
        Action::Patch { id, patch: diff.merge_patch(desired.raw()) }
    };
    Decision { action, diff: Some(diff) }
}

/// Replacement is mandated by an immutable-spec kind, a differing path
/// under an immutable prefix, or a patch that would be lossy.
fn requires_replacement(kind: &str, diff: &Diff) -> bool {
    if kind_is_immutable(kind) {
        return true;
    }
    if diff.differing().any(|e| path_is_immutable(kind, &e.path)) {
        return true;
    }
    diff.is_lossy()
}
