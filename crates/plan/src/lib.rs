//! Piceli plan: derives a dependency graph from a set of canonical
//! objects and levels it into a deployment schedule.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use piceli_core::{K8sObject, ObjectId};

pub mod rules;

pub use rules::{extract_references, kind_rank, selector_matches, Reference};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(ObjectId),
    #[error("cycle detected: {}", .0.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
    CycleDetected(Vec<ObjectId>),
    #[error("dangling reference: {from} -> {reference}")]
    DanglingReference { from: ObjectId, reference: Reference },
}

/// Caller-supplied planning hints: explicit extra edges and references
/// that validation must treat as satisfied outside the input set.
#[derive(Debug, Clone, Default)]
pub struct DependencyHints {
    /// Identity -> identities it must be applied after.
    pub depends_on: BTreeMap<ObjectId, Vec<ObjectId>>,
    /// References satisfied by objects that pre-exist on the cluster.
    pub external: BTreeSet<Reference>,
}

impl DependencyHints {
    fn covers(&self, reference: &Reference) -> bool {
        self.external.iter().any(|hint| {
            hint.kind == reference.kind
                && hint.name == reference.name
                && (hint.namespace.is_none() || hint.namespace == reference.namespace)
        })
    }
}

/// Directed before-graph over canonical objects. An edge `A -> B`
/// (stored as `B depends on A`) means A must be applied before B.
#[derive(Debug, Default)]
pub struct DeploymentGraph {
    objects: BTreeMap<ObjectId, K8sObject>,
    deps: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Identities are globally unique within a deploy.
    pub fn add_node(&mut self, obj: K8sObject) -> Result<(), PlanError> {
        let id = obj.id();
        if self.objects.contains_key(&id) {
            return Err(PlanError::DuplicateIdentity(id));
        }
        self.deps.entry(id.clone()).or_default();
        self.objects.insert(id, obj);
        Ok(())
    }

    /// Record that `node` must be applied after `before`. Unknown
    /// identities on either side are dropped silently.
    pub fn add_dependency(&mut self, node: &ObjectId, before: &ObjectId) {
        if node == before || !self.objects.contains_key(node) || !self.objects.contains_key(before)
        {
            return;
        }
        debug!(node = %node, before = %before, "edge");
        self.deps.entry(node.clone()).or_default().insert(before.clone());
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn object(&self, id: &ObjectId) -> Option<&K8sObject> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn dependencies_of(&self, id: &ObjectId) -> impl Iterator<Item = &ObjectId> {
        self.deps.get(id).into_iter().flatten()
    }

    /// Reject cyclic graphs, reporting one witnessing cycle.
    pub fn validate(&self) -> Result<(), PlanError> {
        self.levels().map(|_| ())
    }

    /// Kahn level assignment with stable `(kind, namespace, name)`
    /// tie-breaking. Each node lands on the smallest level strictly
    /// above all of its predecessors. No partial output on cycles.
    pub fn levels(&self) -> Result<Vec<Vec<ObjectId>>, PlanError> {
        let mut placed: BTreeSet<ObjectId> = BTreeSet::new();
        let mut remaining: BTreeSet<ObjectId> = self.objects.keys().cloned().collect();
        let mut levels = Vec::new();
        while !remaining.is_empty() {
            let mut ready: Vec<ObjectId> = remaining
                .iter()
                .filter(|id| {
                    self.deps
                        .get(*id)
                        .map(|deps| deps.iter().all(|d| placed.contains(d)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(PlanError::CycleDetected(self.find_cycle(&remaining)));
            }
            ready.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            for id in &ready {
                remaining.remove(id);
                placed.insert(id.clone());
            }
            levels.push(ready);
        }
        Ok(levels)
    }

    /// Walk unplaced dependencies until a node repeats. Every node in
    /// `stuck` has at least one unplaced dependency, so the walk always
    /// proceeds and must close a loop.
    fn find_cycle(&self, stuck: &BTreeSet<ObjectId>) -> Vec<ObjectId> {
        let start = stuck.iter().next().cloned().unwrap_or_else(|| ObjectId {
            group: String::new(),
            version: String::new(),
            kind: String::new(),
            namespace: None,
            name: String::new(),
        });
        let mut stack = vec![start.clone()];
        let mut on_stack: HashMap<ObjectId, usize> = HashMap::from([(start, 0)]);
        loop {
            let current = match stack.last() {
                Some(c) => c.clone(),
                None => return Vec::new(),
            };
            let next = self
                .deps
                .get(&current)
                .and_then(|deps| deps.iter().find(|d| stuck.contains(*d)))
                .cloned();
            let next = match next {
                Some(n) => n,
                None => return stack,
            };
            if let Some(&pos) = on_stack.get(&next) {
                return stack[pos..].to_vec();
            }
            on_stack.insert(next.clone(), stack.len());
            stack.push(next);
        }
    }
}

/// A leveled deployment schedule plus the graph it came from.
#[derive(Debug)]
pub struct Plan {
    graph: DeploymentGraph,
    levels: Vec<Vec<ObjectId>>,
}

impl Plan {
    pub fn levels(&self) -> &[Vec<ObjectId>] {
        &self.levels
    }

    pub fn object(&self, id: &ObjectId) -> Option<&K8sObject> {
        self.graph.object(id)
    }

    pub fn graph(&self) -> &DeploymentGraph {
        &self.graph
    }

    pub fn object_count(&self) -> usize {
        self.graph.len()
    }

    /// Serializable view for `-o json` rendering.
    pub fn to_json(&self) -> Value {
        let levels: Vec<Vec<PlanRow>> = self
            .levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|id| PlanRow {
                        id: id.clone(),
                        origin: self
                            .object(id)
                            .map(|o| o.origin().to_string())
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .collect();
        serde_json::to_value(levels).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanRow {
    #[serde(flatten)]
    id: ObjectId,
    origin: String,
}

/// Build the deployment plan for `objects`: kind-rank edges, reference
/// edges, hint edges, then Kahn levels. With `validate`, unresolved
/// by-name references that are not hinted external fail the plan.
pub fn plan(
    objects: Vec<K8sObject>,
    hints: &DependencyHints,
    validate: bool,
) -> Result<Plan, PlanError> {
    let mut graph = DeploymentGraph::new();
    for obj in objects {
        graph.add_node(obj)?;
    }

    // Lookup for by-name reference resolution.
    let by_ref: HashMap<(String, Option<String>, String), ObjectId> = graph
        .objects
        .iter()
        .map(|(id, obj)| {
            (
                (
                    obj.kind().to_string(),
                    obj.namespace().map(str::to_string),
                    obj.name().to_string(),
                ),
                id.clone(),
            )
        })
        .collect();

    // Kind precedence: chain each object to every object of the
    // nearest populated lower rank, making populated ranks contiguous
    // levels in the absence of tighter references.
    let mut by_rank: BTreeMap<usize, Vec<ObjectId>> = BTreeMap::new();
    for id in graph.objects.keys() {
        by_rank.entry(kind_rank(&id.kind)).or_default().push(id.clone());
    }
    let ranks: Vec<usize> = by_rank.keys().copied().collect();
    for pair in ranks.windows(2) {
        let (lower, higher) = (&by_rank[&pair[0]], &by_rank[&pair[1]]);
        for node in higher.clone() {
            for before in lower.clone() {
                graph.add_dependency(&node, &before);
            }
        }
    }

    // By-name reference edges; unresolved references are collected for
    // validation and otherwise assumed to pre-exist on the cluster.
    let mut unresolved: Vec<(ObjectId, Reference)> = Vec::new();
    let extracted: Vec<(ObjectId, Vec<Reference>)> = graph
        .objects
        .iter()
        .map(|(id, obj)| (id.clone(), extract_references(obj)))
        .collect();
    for (id, refs) in extracted {
        for reference in refs {
            let key = (
                reference.kind.clone(),
                reference.namespace.clone(),
                reference.name.clone(),
            );
            match by_ref.get(&key) {
                Some(target) => graph.add_dependency(&id, target),
                // Namespaces are routinely created out of band.
                None if reference.kind != "Namespace" => unresolved.push((id.clone(), reference)),
                None => {}
            }
        }
    }

    // Service -> selected workload, same namespace only.
    let services: Vec<(ObjectId, serde_json::Map<String, Value>)> = graph
        .objects
        .iter()
        .filter(|(id, _)| id.kind == "Service")
        .filter_map(|(id, obj)| {
            obj.raw()
                .get("spec")
                .and_then(|s| s.get("selector"))
                .and_then(Value::as_object)
                .map(|sel| (id.clone(), sel.clone()))
        })
        .collect();
    for (svc_id, selector) in services {
        let selected: Vec<ObjectId> = graph
            .objects
            .iter()
            .filter(|(id, _)| {
                rules::is_selectable_workload(&id.kind) && id.namespace == svc_id.namespace
            })
            .filter(|(_, obj)| selector_matches(&selector, obj))
            .map(|(id, _)| id.clone())
            .collect();
        for workload in selected {
            graph.add_dependency(&svc_id, &workload);
        }
    }

    // Explicit caller hints.
    for (id, befores) in &hints.depends_on {
        for before in befores {
            graph.add_dependency(id, before);
        }
    }

    if validate {
        if let Some((from, reference)) = unresolved
            .into_iter()
            .find(|(_, reference)| !hints.covers(reference))
        {
            return Err(PlanError::DanglingReference { from, reference });
        }
    }

    let levels = graph.levels()?;
    Ok(Plan { graph, levels })
}
