//! Tensor lifetimes over a graph, computed once at compile time.

use std::collections::HashSet;

use crate::graph::{Graph, TensorId};

/// Per-node sets of tensors created and freed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    pub new: Vec<Vec<TensorId>>,
    pub free: Vec<Vec<TensorId>>,
}

impl Liveness {
    /// Walks `graph` backwards. A tensor is freed after the last node that
    /// touches it; graph outputs (results and what they forward) live on.
    pub fn compute(graph: &Graph) -> Self {
        let nodes = graph.nodes();
        let persistent: HashSet<TensorId> = graph
            .results()
            .flat_map(|n| std::iter::once(n.output).chain(n.inputs.iter().copied()))
            .collect();

        let mut live: HashSet<TensorId> = HashSet::new();
        let mut freed: HashSet<TensorId> = HashSet::new();
        let mut new = vec![Vec::new(); nodes.len()];
        let mut free = vec![Vec::new(); nodes.len()];

        for (index, node) in nodes.iter().enumerate().rev() {
            for &tensor in node.inputs.iter().chain(std::iter::once(&node.output)) {
                if !persistent.contains(&tensor) && freed.insert(tensor) {
                    free[index].push(tensor);
                    live.insert(tensor);
                }
            }
            if live.remove(&node.output) || persistent.contains(&node.output) {
                new[index].push(node.output);
            }
        }
        Self { new, free }
    }
}
