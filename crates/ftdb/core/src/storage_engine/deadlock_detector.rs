// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Deadlock Detection
//!
//! This module implements the wait-for graph used by the lock manager.
//! Every blocked lock request adds edges from the waiter to the transactions
//! holding conflicting locks; a cycle through the waiter is a deadlock, and
//! the youngest transaction in the cycle is chosen as the victim.

use std::collections::{HashMap, HashSet};

use crate::storage_engine::isolation::LockResource;
use crate::storage_engine::lib::TransactionId;

/// Represents a wait-for relationship between transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForEdge {
    /// Transaction that is waiting
    pub waiter: TransactionId,
    /// Transaction that is being waited for
    pub holder: TransactionId,
    /// Resource being waited for
    pub resource: LockResource,
}

impl WaitForEdge {
    pub fn new(waiter: TransactionId, holder: TransactionId, resource: LockResource) -> Self {
        Self { waiter, holder, resource }
    }
}

/// A cycle in the wait-for graph representing a deadlock
#[derive(Debug, Clone)]
pub struct DeadlockCycle {
    /// Transactions involved in the deadlock
    pub transactions: Vec<TransactionId>,
    /// Resources involved in the deadlock
    pub resources: Vec<LockResource>,
}

impl DeadlockCycle {
    /// Get the youngest transaction in the cycle (highest transaction ID)
    pub fn youngest_transaction(&self) -> TransactionId {
        self.transactions.iter().copied().max().unwrap_or(0)
    }
}

/// Wait-for graph for deadlock detection
#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// Edges in the wait-for graph
    edges: HashMap<TransactionId, Vec<WaitForEdge>>,
    /// Reverse mapping: transaction -> transactions waiting for it
    waiting_for: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitForGraph {
    /// Create a new wait-for graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a wait-for edge to the graph
    pub fn add_edge(&mut self, edge: WaitForEdge) {
        let edges = self.edges.entry(edge.waiter).or_default();
        if edges.iter().any(|e| e.holder == edge.holder && e.resource == edge.resource) {
            return;
        }
        self.waiting_for.entry(edge.holder).or_default().insert(edge.waiter);
        edges.push(edge);
    }

    /// Replaces every outgoing edge of `waiter` with edges to `holders`.
    pub fn set_waits(&mut self, waiter: TransactionId, holders: &[TransactionId], resource: &LockResource) {
        self.remove_waiter(waiter);
        for &holder in holders {
            self.add_edge(WaitForEdge::new(waiter, holder, resource.clone()));
        }
    }

    /// Remove the edges of a transaction that stopped waiting
    pub fn remove_waiter(&mut self, waiter: TransactionId) {
        if let Some(edges) = self.edges.remove(&waiter) {
            for edge in edges {
                if let Some(waiters) = self.waiting_for.get_mut(&edge.holder) {
                    waiters.remove(&waiter);
                    if waiters.is_empty() {
                        self.waiting_for.remove(&edge.holder);
                    }
                }
            }
        }
    }

    /// Remove all edges involving a transaction
    pub fn remove_transaction(&mut self, txn_id: TransactionId) {
        self.remove_waiter(txn_id);

        // Remove all edges where other transactions are waiting for this one
        if let Some(waiters) = self.waiting_for.remove(&txn_id) {
            for waiter in waiters {
                if let Some(edges) = self.edges.get_mut(&waiter) {
                    edges.retain(|edge| edge.holder != txn_id);
                    if edges.is_empty() {
                        self.edges.remove(&waiter);
                    }
                }
            }
        }
    }

    /// Finds a cycle reachable from `txn_id`, which is the only place a new edge can close one.
    pub fn find_cycle_from(&self, txn_id: TransactionId) -> Option<DeadlockCycle> {
        let mut deadlocks = Vec::new();
        self.dfs_detect_cycle(txn_id, &mut HashSet::new(), &mut HashSet::new(), &mut Vec::new(), &mut deadlocks);
        deadlocks.into_iter().next()
    }

    /// Depth-first search to detect cycles
    fn dfs_detect_cycle(
        &self,
        txn_id: TransactionId,
        visited: &mut HashSet<TransactionId>,
        recursion_stack: &mut HashSet<TransactionId>,
        current_path: &mut Vec<TransactionId>,
        deadlocks: &mut Vec<DeadlockCycle>,
    ) {
        visited.insert(txn_id);
        recursion_stack.insert(txn_id);
        current_path.push(txn_id);

        if let Some(edges) = self.edges.get(&txn_id) {
            for edge in edges {
                if !visited.contains(&edge.holder) {
                    self.dfs_detect_cycle(edge.holder, visited, recursion_stack, current_path, deadlocks);
                } else if recursion_stack.contains(&edge.holder) {
                    // Found a cycle
                    if let Some(cycle_start) = current_path.iter().position(|&x| x == edge.holder) {
                        let cycle_transactions = current_path[cycle_start..].to_vec();
                        let cycle_resources = self.get_resources_in_cycle(&cycle_transactions);
                        deadlocks.push(DeadlockCycle { transactions: cycle_transactions, resources: cycle_resources });
                    }
                }
            }
        }

        current_path.pop();
        recursion_stack.remove(&txn_id);
    }

    /// Get resources involved in a cycle
    fn get_resources_in_cycle(&self, transactions: &[TransactionId]) -> Vec<LockResource> {
        let mut resources = Vec::new();
        for &txn_id in transactions {
            for edge in self.edges.get(&txn_id).into_iter().flatten() {
                if transactions.contains(&edge.holder) && !resources.contains(&edge.resource) {
                    resources.push(edge.resource.clone());
                }
            }
        }
        resources
    }

    /// Number of transactions currently waiting
    pub fn waiter_count(&self) -> usize {
        self.edges.len()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::lib::DictionaryId;

    fn key(k: &str) -> LockResource {
        LockResource::Key { dictionary: DictionaryId(1), key: k.as_bytes().to_vec() }
    }

    #[test]
    fn test_youngest_transaction_is_victim() {
        let cycle = DeadlockCycle { transactions: vec![3, 7, 5], resources: vec![key("a")] };
        assert_eq!(cycle.youngest_transaction(), 7);
    }

    #[test]
    fn test_wait_for_graph_basic_operations() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(WaitForEdge::new(1, 2, key("x")));
        graph.add_edge(WaitForEdge::new(1, 2, key("x")));
        assert_eq!(graph.waiter_count(), 1);

        graph.set_waits(1, &[2, 3], &key("y"));
        graph.add_edge(WaitForEdge::new(2, 1, key("x")));
        assert_eq!(graph.find_cycle_from(1).unwrap().resources, vec![key("y"), key("x")]);

        graph.remove_transaction(2);
        assert_eq!(graph.waiter_count(), 1);
        assert!(graph.find_cycle_from(1).is_none());
        graph.remove_waiter(1);
        assert_eq!(graph.waiter_count(), 0);
    }

    #[test]
    fn test_simple_deadlock_detection() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(WaitForEdge::new(1, 2, key("y")));
        assert!(graph.find_cycle_from(1).is_none());

        graph.add_edge(WaitForEdge::new(2, 1, key("x")));
        let cycle = graph.find_cycle_from(2).unwrap();
        assert_eq!(cycle.youngest_transaction(), 2);
        assert_eq!(cycle.resources.len(), 2);
    }

    #[test]
    fn test_complex_deadlock_scenario() {
        let mut graph = WaitForGraph::new();
        // 1 -> 2 -> 3 -> 1 plus a bystander 4 -> 1
        graph.add_edge(WaitForEdge::new(4, 1, key("a")));
        graph.add_edge(WaitForEdge::new(1, 2, key("b")));
        graph.add_edge(WaitForEdge::new(2, 3, key("c")));
        graph.add_edge(WaitForEdge::new(3, 1, key("a")));

        let cycle = graph.find_cycle_from(4).unwrap();
        assert_eq!(cycle.transactions, vec![1, 2, 3]);
        assert_eq!(cycle.youngest_transaction(), 3);

        graph.remove_transaction(3);
        assert!(graph.find_cycle_from(4).is_none());
        assert!(graph.find_cycle_from(1).is_none());
    }
}
