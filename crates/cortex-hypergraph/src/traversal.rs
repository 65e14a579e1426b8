//! Graph algorithms over the dependency-edge overlays.
//!
//! Edges are `(id, id, attrs)` records held in an arena-style map, so cycle
//! detection and pathing are plain graph algorithms rather than structural
//! guarantees.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{debug, instrument};

use crate::models::{DependencyEdge, EdgeType};

/// Result of a weighted shortest-path query.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPath {
    /// Visited node ids, start to goal inclusive.
    pub nodes: Vec<String>,
    /// Accumulated cost, where each hop costs `1 / weight`.
    pub cost: f64,
}

/// Heap entry ordered by smallest cost first.
struct HeapEntry {
    cost: f64,
    node: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap on cost; ties broken on node id for
        // deterministic expansion order.
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Dijkstra over a dependency-edge overlay with hop cost `1 / weight`.
///
/// Heavier edges are cheaper to cross, so the search prefers strongly
/// observed dependencies. Returns `None` when `goal` is unreachable.
#[instrument(name = "traversal.shortest_path", skip(edges))]
pub fn shortest_path_weighted(
    edges: &HashMap<(String, String), DependencyEdge>,
    start: &str,
    goal: &str,
) -> Option<WeightedPath> {
    if start == goal {
        return Some(WeightedPath {
            nodes: vec![start.to_string()],
            cost: 0.0,
        });
    }

    let mut adjacency: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
    for edge in edges.values() {
        let weight = edge.weight() as f64;
        if weight <= 0.0 {
            continue;
        }
        adjacency
            .entry(edge.from_id.as_str())
            .or_default()
            .push((edge.to_id.as_str(), 1.0 / weight));
    }

    let mut distances: HashMap<String, f64> = HashMap::new();
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut heap = BinaryHeap::new();

    distances.insert(start.to_string(), 0.0);
    heap.push(HeapEntry {
        cost: 0.0,
        node: start.to_string(),
    });

    while let Some(HeapEntry { cost, node }) = heap.pop() {
        if cost > distances.get(&node).copied().unwrap_or(f64::INFINITY) {
            continue;
        }
        if node == goal {
            break;
        }

        for (neighbor, hop_cost) in adjacency.get(node.as_str()).into_iter().flatten() {
            let candidate = cost + hop_cost;
            if candidate < distances.get(*neighbor).copied().unwrap_or(f64::INFINITY) {
                distances.insert(neighbor.to_string(), candidate);
                parents.insert(neighbor.to_string(), node.clone());
                heap.push(HeapEntry {
                    cost: candidate,
                    node: neighbor.to_string(),
                });
            }
        }
    }

    let cost = *distances.get(goal)?;

    let mut path = vec![goal.to_string()];
    let mut current = goal.to_string();
    while let Some(parent) = parents.get(&current) {
        path.push(parent.clone());
        current = parent.clone();
    }
    if path.last().map(String::as_str) != Some(start) {
        return None;
    }
    path.reverse();

    debug!(hops = path.len() - 1, cost, "shortest path resolved");
    Some(WeightedPath { nodes: path, cost })
}

/// Whether inserting a `contains` edge `from → to` would close a cycle,
/// i.e. whether `from` is already reachable from `to` over `contains` edges.
pub fn contains_would_cycle(
    edges: &HashMap<(String, String), DependencyEdge>,
    from: &str,
    to: &str,
) -> bool {
    if from == to {
        return true;
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.values() {
        if edge.edge_type == EdgeType::Contains {
            adjacency
                .entry(edge.from_id.as_str())
                .or_default()
                .push(edge.to_id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut stack = vec![to];
    while let Some(node) = stack.pop() {
        if node == from {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        for next in adjacency.get(node).into_iter().flatten() {
            if !visited.contains(next) {
                stack.push(next);
            }
        }
    }
    false
}
