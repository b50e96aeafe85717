// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service dependency graph: cycle rejection and initialization ordering.
//!
//! Grounded on `original_source/components/system/src/service_dependencies.c`:
//! DFS-based cycle detection runs on every edge insertion, rejecting the
//! edge that would close a cycle rather than admitting the graph into a
//! broken state, and a separate DFS produces a dependencies-first
//! topological order.

use std::collections::{HashMap, HashSet};

use runtime_abi::{Error, PrincipalId, Result};

#[derive(Default)]
struct Node {
    depends_on: Vec<PrincipalId>,
    initialized: bool,
}

#[derive(Default)]
pub struct DependencyGraph {
    nodes: HashMap<PrincipalId, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` with no dependencies, if not already present. Called
    /// when a principal is registered so it appears in the topological
    /// order even with no edges.
    pub fn add_node(&mut self, id: PrincipalId) {
        self.nodes.entry(id).or_default();
    }

    pub fn remove_node(&mut self, id: PrincipalId) {
        self.nodes.remove(&id);
        for node in self.nodes.values_mut() {
            node.depends_on.retain(|d| *d != id);
        }
    }

    /// Declares that `id` depends on `depends_on`. Rejects the edge with
    /// [`Error::CircularDependency`] if it would close a cycle, leaving the
    /// graph unchanged (`spec.md` §4.5: "an edge that would close a cycle is
    /// refused, not merely flagged").
    pub fn add_dependency(&mut self, id: PrincipalId, depends_on: PrincipalId) -> Result<()> {
        self.nodes.entry(id).or_default();
        self.nodes.entry(depends_on).or_default();

        if self.nodes[&id].depends_on.contains(&depends_on) {
            return Ok(());
        }

        self.nodes.get_mut(&id).unwrap().depends_on.push(depends_on);

        if self.has_cycle_from(id) {
            self.nodes.get_mut(&id).unwrap().depends_on.pop();
            return Err(Error::CircularDependency);
        }

        Ok(())
    }

    fn has_cycle_from(&self, start: PrincipalId) -> bool {
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        self.has_cycle_dfs(start, &mut visited, &mut in_stack)
    }

    fn has_cycle_dfs(
        &self,
        id: PrincipalId,
        visited: &mut HashSet<PrincipalId>,
        in_stack: &mut HashSet<PrincipalId>,
    ) -> bool {
        if in_stack.contains(&id) {
            return true;
        }
        if visited.contains(&id) {
            return false;
        }
        visited.insert(id);
        in_stack.insert(id);

        if let Some(node) = self.nodes.get(&id) {
            for &dep in &node.depends_on {
                if self.has_cycle_dfs(dep, visited, in_stack) {
                    return true;
                }
            }
        }

        in_stack.remove(&id);
        false
    }

    /// Returns all registered principals in dependencies-first topological
    /// order.
    pub fn init_order(&self) -> Vec<PrincipalId> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for &id in self.nodes.keys() {
            self.topo_dfs(id, &mut visited, &mut order);
        }
        order
    }

    fn topo_dfs(&self, id: PrincipalId, visited: &mut HashSet<PrincipalId>, order: &mut Vec<PrincipalId>) {
        if !visited.insert(id) {
            return;
        }
        if let Some(node) = self.nodes.get(&id) {
            for &dep in &node.depends_on {
                self.topo_dfs(dep, visited, order);
            }
        }
        order.push(id);
    }

    /// Returns `Ok(())` if every dependency of `id` has been marked
    /// initialized, `Err(Error::DependencyFailed)` otherwise. An
    /// unregistered or dependency-free principal is always ready.
    pub fn check_ready(&self, id: PrincipalId) -> Result<()> {
        let Some(node) = self.nodes.get(&id) else {
            return Ok(());
        };
        for &dep in &node.depends_on {
            let ready = self.nodes.get(&dep).map(|d| d.initialized).unwrap_or(false);
            if !ready {
                return Err(Error::DependencyFailed);
            }
        }
        Ok(())
    }

    pub fn mark_initialized(&mut self, id: PrincipalId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.initialized = true;
        }
    }

    pub fn mark_uninitialized(&mut self, id: PrincipalId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.initialized = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_order_places_dependencies_first() {
        let mut g = DependencyGraph::new();
        let a = PrincipalId(1);
        let b = PrincipalId(2);
        let c = PrincipalId(3);
        g.add_dependency(c, b).unwrap();
        g.add_dependency(b, a).unwrap();

        let order = g.init_order();
        let pos = |id: PrincipalId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let mut g = DependencyGraph::new();
        let a = PrincipalId(1);
        let b = PrincipalId(2);
        g.add_dependency(a, b).unwrap();
        let err = g.add_dependency(b, a).unwrap_err();
        assert_eq!(err, Error::CircularDependency);
    }

    #[test]
    fn indirect_cycle_is_rejected_and_graph_is_unchanged() {
        let mut g = DependencyGraph::new();
        let a = PrincipalId(1);
        let b = PrincipalId(2);
        let c = PrincipalId(3);
        g.add_dependency(b, a).unwrap();
        g.add_dependency(c, b).unwrap();
        assert_eq!(g.add_dependency(a, c), Err(Error::CircularDependency));
        // a's dependency list must not retain the rejected edge.
        assert!(!g.nodes[&a].depends_on.contains(&c));
    }

    #[test]
    fn check_ready_reflects_dependency_initialization() {
        let mut g = DependencyGraph::new();
        let a = PrincipalId(1);
        let b = PrincipalId(2);
        g.add_dependency(b, a).unwrap();
        assert_eq!(g.check_ready(b), Err(Error::DependencyFailed));
        g.mark_initialized(a);
        assert_eq!(g.check_ready(b), Ok(()));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut g = DependencyGraph::new();
        let a = PrincipalId(1);
        assert_eq!(g.add_dependency(a, a), Err(Error::CircularDependency));
    }
}
