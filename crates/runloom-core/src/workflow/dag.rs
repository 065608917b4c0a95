//! Dependency graph builder: inference, cycle detection, execution batches.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Edges come
//! from two sources: explicit `dependsOn` lists and references to other steps
//! found inside a step's serialized `request` (`{{ steps.<key> ... }}`).
//! Kahn-style generation peeling produces execution batches where every step
//! in a batch can run concurrently; steps still carrying in-degree when
//! peeling stalls are exactly the cycle members.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use runloom_types::workflow::StepDefinition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected among steps: {}", .keys.join(", "))]
    DependencyCycle { keys: Vec<String> },
}

/// Merged dependency map plus the batches derived from it.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Per step key: explicit `dependsOn` entries followed by inferred
    /// references, deduplicated.
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Topological generations; index 0 runs first, entries within a batch
    /// run in parallel.
    pub batches: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Dependencies of one step (empty for unknown keys).
    pub fn dependencies_of(&self, key: &str) -> &[String] {
        self.dependencies.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the full dependency graph for a definition's steps.
///
/// Inference scans each step's serialized request for `{{ steps.<key> ... }}`
/// and adds `<key>` to that step's dependencies when it names a *different*,
/// *known* step. References to unknown steps are ignored here; the validator
/// reports them as issues at version-creation time.
pub fn build_dependency_graph(steps: &[StepDefinition]) -> Result<DependencyGraph, GraphError> {
    let known: BTreeSet<&str> = steps.iter().map(|s| s.key.as_str()).collect();

    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for step in steps {
        let mut deps = step.depends_on.clone();

        let serialized = step.request.payload_json().to_string();
        for referenced in referenced_step_keys(&serialized) {
            if referenced == step.key {
                continue;
            }
            if known.contains(referenced.as_str()) && !deps.contains(&referenced) {
                deps.push(referenced);
            }
        }

        dependencies.insert(step.key.clone(), deps);
    }

    let nodes: Vec<(&str, &[String])> = steps
        .iter()
        .map(|s| (s.key.as_str(), dependencies[&s.key].as_slice()))
        .collect();
    let batches = compute_batches(&nodes)?;

    Ok(DependencyGraph {
        dependencies,
        batches,
    })
}

/// Compute execution batches from already-merged `(key, depends_on)` pairs.
///
/// Dependencies naming keys outside `nodes` are skipped (they contribute no
/// edge). Fails with [`GraphError::DependencyCycle`] listing every key left
/// unvisited when zero-in-degree peeling stalls before covering all nodes.
pub fn compute_batches(nodes: &[(&str, &[String])]) -> Result<Vec<Vec<String>>, GraphError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for &(key, _) in nodes {
        let idx = graph.add_node(key);
        index_of.insert(key, idx);
    }

    for &(key, deps) in nodes {
        let to = index_of[key];
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for dep in deps.iter() {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            if let Some(&from) = index_of.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n] == 0)
        .collect();

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut visited = 0usize;

    while !ready.is_empty() {
        let batch: Vec<String> = ready.iter().map(|&n| graph[n].to_string()).collect();
        visited += batch.len();

        let mut next: Vec<NodeIndex> = Vec::new();
        for &n in &ready {
            for child in graph.neighbors_directed(n, Direction::Outgoing) {
                let degree = in_degree
                    .get_mut(&child)
                    .map(|d| {
                        *d = d.saturating_sub(1);
                        *d
                    })
                    .unwrap_or(0);
                if degree == 0 {
                    next.push(child);
                }
            }
        }

        batches.push(batch);
        ready = next;
    }

    // Fewer visited keys than nodes means peeling stalled on a cycle.
    if visited < nodes.len() {
        let mut keys: Vec<String> = graph
            .node_indices()
            .filter(|n| in_degree[n] > 0)
            .map(|n| graph[n].to_string())
            .collect();
        keys.sort();
        return Err(GraphError::DependencyCycle { keys });
    }

    Ok(batches)
}

// ---------------------------------------------------------------------------
// Template reference scanning
// ---------------------------------------------------------------------------

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Extract every step key referenced as `{{ steps.<key> }}` or
/// `{{ steps.<key>.<path> }}` from a serialized request.
///
/// Whitespace-tolerant around the reference; the trailing path is optional.
/// Occurrences are returned in encounter order, duplicates included.
pub fn referenced_step_keys(serialized: &str) -> Vec<String> {
    scan_references(serialized, "steps.", true)
}

/// Extract every key referenced as `{{ <family><key> ... }}` from `text`.
///
/// `family` is the reference prefix including its dot (`steps.`, `input.`,
/// `secret.`). When `allow_path` is false, nothing may follow the key but
/// whitespace.
pub(crate) fn scan_references(text: &str, family: &str, allow_path: bool) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut keys = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'{' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }

        let mut j = i + 2;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if !bytes[j..].starts_with(family.as_bytes()) {
            i += 1;
            continue;
        }
        j += family.len();

        let start = j;
        while j < bytes.len() && is_key_byte(bytes[j]) {
            j += 1;
        }
        if j == start {
            i += 1;
            continue;
        }
        let key = &text[start..j];

        // After the key: either a `.path` segment (anything up to the close)
        // or only whitespace before `}}`.
        let mut k = j;
        if allow_path && k < bytes.len() && bytes[k] == b'.' {
            while k < bytes.len() && bytes[k] != b'}' {
                k += 1;
            }
        } else {
            while k < bytes.len() && bytes[k].is_ascii_whitespace() {
                k += 1;
            }
        }

        if k + 1 < bytes.len() && bytes[k] == b'}' && bytes[k + 1] == b'}' {
            keys.push(key.to_string());
            i = k + 2;
        } else {
            i += 1;
        }
    }

    keys
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
