//! Phases: named, ordered buckets of handlers.
//!
//! A phase's internal order is never declared directly. Each handler carries
//! a `PhaseRule`, and [`Phase::resolve`] derives one total order satisfying
//! every rule:
//!
//! 1. `before`/`after` become edges of a directed graph over the handlers.
//!    Cycles are detected with three-colour DFS and reported with their path.
//! 2. Phase-first handlers get an edge to every other handler, phase-last
//!    handlers an edge from every other handler.
//! 3. Kahn's algorithm emits the order, always picking the ready handler
//!    declared earliest, so identical input yields identical output.
//! 4. Several phase-first (or phase-last) handlers must be totally ordered by
//!    their own constraints, otherwise the head (or tail) is ambiguous.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::ResolutionError;
use crate::handler::HandlerDescription;

/// A resolved phase. Its handler sequence satisfies every member's rule.
#[derive(Debug, Clone)]
pub struct Phase {
    name: String,
    handlers: Vec<Arc<HandlerDescription>>,
}

impl Phase {
    /// A phase with no handlers. Kept in chains so that handlers added later
    /// land at a stable position.
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// Orders `candidates` (given in declaration order) into a phase.
    ///
    /// # Errors
    ///
    /// Returns a `ResolutionError` on conflicting or cyclic rules, references
    /// to handlers outside the phase, duplicate handler names, or an
    /// ambiguous first/last position. No partial phase is produced.
    pub fn resolve(
        name: impl Into<String>,
        candidates: Vec<Arc<HandlerDescription>>,
    ) -> Result<Self, ResolutionError> {
        let name = name.into();
        let order = resolve_order(&name, &candidates)?;
        let handlers = order
            .into_iter()
            .map(|i| Arc::clone(&candidates[i]))
            .collect();
        Ok(Self { name, handlers })
    }

    /// Re-resolves this phase with one more handler appended to the
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Same as [`Phase::resolve`].
    pub fn with_handler(&self, handler: Arc<HandlerDescription>) -> Result<Self, ResolutionError> {
        let mut candidates = self.handlers.clone();
        candidates.push(handler);
        Self::resolve(self.name.clone(), candidates)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn handlers(&self) -> &[Arc<HandlerDescription>] {
        &self.handlers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Local names in execution order.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.local_name()).collect()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn resolve_order(
    phase: &str,
    candidates: &[Arc<HandlerDescription>],
) -> Result<Vec<usize>, ResolutionError> {
    let n = candidates.len();
    let names: Vec<&str> = candidates.iter().map(|c| c.local_name()).collect();

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, desc) in candidates.iter().enumerate() {
        let rule = &desc.rule;
        rule.validate(names[i])?;
        if rule.phase_name != phase {
            return Err(ResolutionError::RuleConflict {
                handler: names[i].to_string(),
                reason: format!(
                    "targets phase {:?} but was resolved into {phase:?}",
                    rule.phase_name
                ),
            });
        }
        if index.insert(names[i], i).is_some() {
            return Err(ResolutionError::DuplicateHandler {
                phase: phase.to_string(),
                handler: names[i].to_string(),
            });
        }
        if rule.is_sole() && n > 1 {
            return Err(ResolutionError::RuleConflict {
                handler: names[i].to_string(),
                reason: "a phase-first and phase-last handler must be alone in its phase"
                    .to_string(),
            });
        }
    }

    let lookup = |handler: usize, reference: &str| {
        index
            .get(reference)
            .copied()
            .ok_or_else(|| ResolutionError::UnknownHandler {
                phase: phase.to_string(),
                handler: names[handler].to_string(),
                reference: reference.to_string(),
            })
    };
    let conflict = |handler: usize, reason: String| ResolutionError::RuleConflict {
        handler: names[handler].to_string(),
        reason,
    };

    let is_first = |i: usize| candidates[i].rule.phase_first;
    let is_last = |i: usize| candidates[i].rule.phase_last;

    // Explicit edges: from -> to means `from` runs before `to`.
    let mut explicit: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, desc) in candidates.iter().enumerate() {
        if let Some(after) = desc.rule.after.as_deref() {
            let j = lookup(i, after)?;
            if is_first(i) && !is_first(j) {
                return Err(conflict(i, format!("phase-first handler cannot run after {after}")));
            }
            if is_last(j) && !is_last(i) {
                return Err(conflict(i, format!("cannot run after phase-last handler {after}")));
            }
            explicit[j].push(i);
        }
        if let Some(before) = desc.rule.before.as_deref() {
            let j = lookup(i, before)?;
            if is_last(i) && !is_last(j) {
                return Err(conflict(i, format!("phase-last handler cannot run before {before}")));
            }
            if is_first(j) && !is_first(i) {
                return Err(conflict(i, format!("cannot run before phase-first handler {before}")));
            }
            explicit[i].push(j);
        }
    }

    if let Some(cycle) = find_cycle(&explicit) {
        return Err(ResolutionError::Cycle {
            phase: phase.to_string(),
            path: cycle.into_iter().map(|i| names[i].to_string()).collect(),
        });
    }

    let mut graph = explicit.clone();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if (is_first(i) && !is_first(j)) || (is_last(j) && !is_last(i)) {
                graph[i].push(j);
            }
        }
    }

    let order = topological_order(&graph).ok_or_else(|| ResolutionError::Cycle {
        phase: phase.to_string(),
        path: names.iter().map(ToString::to_string).collect(),
    })?;

    let firsts: Vec<usize> = order.iter().copied().filter(|&i| is_first(i)).collect();
    if !totally_ordered(&explicit, &firsts) {
        return Err(ResolutionError::AmbiguousFirst {
            phase: phase.to_string(),
            handlers: firsts.iter().map(|&i| names[i].to_string()).collect(),
        });
    }
    let lasts: Vec<usize> = order.iter().copied().filter(|&i| is_last(i)).collect();
    if !totally_ordered(&explicit, &lasts) {
        return Err(ResolutionError::AmbiguousLast {
            phase: phase.to_string(),
            handlers: lasts.iter().map(|&i| names[i].to_string()).collect(),
        });
    }

    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Returns the nodes of one cycle (first node repeated at the end), if any.
fn find_cycle(graph: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(
        node: usize,
        graph: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Gray;
        path.push(node);
        for &next in &graph[node] {
            match marks[next] {
                Mark::Gray => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = visit(next, graph, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        path.pop();
        marks[node] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; graph.len()];
    let mut path = Vec::new();
    (0..graph.len()).find_map(|node| {
        if marks[node] == Mark::White {
            visit(node, graph, &mut marks, &mut path)
        } else {
            None
        }
    })
}

/// Kahn's algorithm with the lowest declaration index as tie-break.
/// `None` if the graph has a cycle.
fn topological_order(graph: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut in_degree = vec![0usize; graph.len()];
    for edges in graph {
        for &to in edges {
            in_degree[to] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..graph.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &to in &graph[node] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.insert(to);
            }
        }
    }

    (order.len() == graph.len()).then_some(order)
}

/// `true` if each element of `seq` reaches the next through `graph`.
fn totally_ordered(graph: &[Vec<usize>], seq: &[usize]) -> bool {
    seq.windows(2).all(|pair| reaches(graph, pair[0], pair[1]))
}

fn reaches(graph: &[Vec<usize>], from: usize, to: usize) -> bool {
    let mut seen = vec![false; graph.len()];
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        stack.extend(graph[node].iter().copied());
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
