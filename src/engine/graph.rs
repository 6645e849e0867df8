//! Dependency graph - topology, pre-checks, and the close cascade.
//!
//! Pure edge bookkeeping, no cell payloads. Each registered node carries:
//! - `dependents`: the nodes it reads, in declaration order
//! - `observers`: the nodes that read it, in attach order
//! - `repeat_targets`: dependents also reachable through another path
//!
//! The mirror invariant holds at every public-method boundary: `v` is in
//! `u.dependents` exactly when `u` is in `v.observers`.
//!
//! `bind` runs its three pre-checks (self-dependency, cycle, repeat
//! dependency) against the candidate edge set before committing anything;
//! a rejected bind leaves the graph untouched.

use std::collections::{HashMap, HashSet};

use crate::types::NodeId;

// =============================================================================
// Edge storage
// =============================================================================

#[derive(Debug, Default)]
struct EdgeSet {
    /// Nodes this node reads, in declaration order.
    dependents: Vec<NodeId>,
    /// Nodes that read this node, in attach order.
    observers: Vec<NodeId>,
    /// Dependents that are also reachable via another dependency path.
    repeat_targets: HashSet<NodeId>,
}

/// The dependency topology of one engine.
#[derive(Debug, Default)]
pub(crate) struct Graph {
    edges: HashMap<NodeId, EdgeSet>,
}

/// Successful bind: which targets turned out to be repeat dependencies.
#[derive(Debug, Default)]
pub(crate) struct BindOutcome {
    pub repeats: Vec<NodeId>,
}

/// Rejected bind: the target that would have closed a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleAt {
    pub target: NodeId,
}

impl Graph {
    /// Add a node with empty dependent and observer sets.
    pub fn register(&mut self, id: NodeId) {
        self.edges.entry(id).or_default();
    }

    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.edges.get(&id).map(|e| e.dependents.as_slice()).unwrap_or(&[])
    }

    pub fn observers(&self, id: NodeId) -> &[NodeId] {
        self.edges.get(&id).map(|e| e.observers.as_slice()).unwrap_or(&[])
    }

    pub fn is_repeat_target(&self, source: NodeId, target: NodeId) -> bool {
        self.edges
            .get(&source)
            .is_some_and(|e| e.repeat_targets.contains(&target))
    }

    /// Replace `source`'s dependent set with `targets`.
    ///
    /// Pre-checks, in order, all on the candidate set and before any
    /// mutation:
    ///
    /// 1. self-dependency: `source` among the targets is a cycle
    /// 2. cycle: some target already reaches `source` through committed
    ///    dependent edges
    /// 3. repeat dependency: a target reachable from a sibling target (or
    ///    listed twice) is recorded as a repeat, never an error
    ///
    /// On success the previous edges of `source` are dropped and the new
    /// ones installed; `source` is appended to each target's observer list
    /// in target order. On failure nothing changes.
    pub fn bind(
        &mut self,
        source: NodeId,
        targets: &[NodeId],
    ) -> Result<BindOutcome, CycleAt> {
        // (1) self-dependency
        if targets.contains(&source) {
            return Err(CycleAt { target: source });
        }

        // Stage: unique targets in declaration order; duplicates are the
        // trivial repeat case.
        let mut unique: Vec<NodeId> = Vec::with_capacity(targets.len());
        let mut repeats: Vec<NodeId> = Vec::new();
        for &t in targets {
            if unique.contains(&t) {
                if !repeats.contains(&t) {
                    repeats.push(t);
                }
            } else {
                unique.push(t);
            }
        }

        // (2) cycle: all candidate edges start at `source`, so a cycle
        // through the new set exists exactly when a target reaches back to
        // `source` through edges of other nodes.
        for &t in &unique {
            if self.reaches(t, source) {
                return Err(CycleAt { target: t });
            }
        }

        // (3) repeat: a second path to a target through a sibling.
        for (i, &t) in unique.iter().enumerate() {
            if repeats.contains(&t) {
                continue;
            }
            let via_sibling = unique
                .iter()
                .enumerate()
                .any(|(j, &s)| j != i && self.reaches(s, t));
            if via_sibling {
                repeats.push(t);
            }
        }

        // Commit.
        self.unbind(source);
        for &t in &unique {
            self.edges.entry(t).or_default().observers.push(source);
        }
        let entry = self.edges.entry(source).or_default();
        entry.dependents = unique;
        entry.repeat_targets = repeats.iter().copied().collect();

        Ok(BindOutcome { repeats })
    }

    /// Drop every outgoing dependency edge of `source`, removing it from
    /// each former target's observer list. Observers of `source` are kept.
    pub fn unbind(&mut self, source: NodeId) {
        let old = match self.edges.get_mut(&source) {
            Some(e) => {
                e.repeat_targets.clear();
                std::mem::take(&mut e.dependents)
            }
            None => return,
        };
        for t in old {
            if let Some(e) = self.edges.get_mut(&t) {
                e.observers.retain(|&o| o != source);
            }
        }
    }

    /// Remove a node entirely. The caller is responsible for removing the
    /// node's observers first (see [`Graph::observer_closure`]); this only
    /// detaches the node from its remaining upstream targets.
    pub fn remove(&mut self, id: NodeId) {
        self.unbind(id);
        self.edges.remove(&id);
    }

    /// Does `from` reach `to` by following dependent edges?
    ///
    /// Iterative DFS over the committed graph, O(V + E).
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if !visited.insert(n) {
                continue;
            }
            for &d in self.dependents(n) {
                if d == to {
                    return true;
                }
                stack.push(d);
            }
        }
        false
    }

    /// Every node reachable from `id` via observer edges, including `id`,
    /// in breadth-first order. This is both the close-cascade set and the
    /// affected set of a pulse rooted at `id`.
    pub fn observer_closure(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut order: Vec<NodeId> = Vec::new();
        let mut queue = std::collections::VecDeque::from([id]);
        while let Some(n) = queue.pop_front() {
            if !seen.insert(n) {
                continue;
            }
            order.push(n);
            for &o in self.observers(n) {
                queue.push_back(o);
            }
        }
        order
    }

    /// Drop all edges and nodes. Test support.
    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// Check the mirror invariant over the whole graph. Test support.
    #[cfg(test)]
    pub fn mirror_holds(&self) -> bool {
        self.edges.iter().all(|(&u, e)| {
            e.dependents
                .iter()
                .all(|v| self.observers(*v).contains(&u))
                && e.observers.iter().all(|v| self.dependents(*v).contains(&u))
        })
    }
}
