//! Call tree of sampled stacks, weighted by the energy the sampled thread
//! used in the same interval.

use powermetrics_types::{LoadBias, StackTrace};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct CallNode {
    pub address: u64,
    /// Energy of every sample whose stack passes through this node, in Wh.
    pub energy_wh: f64,
    /// Callees of `address`.
    pub children: Vec<CallNode>,
}

impl CallNode {
    fn new(address: u64) -> Self {
        Self {
            address,
            energy_wh: 0.0,
            children: Vec::new(),
        }
    }

    pub fn child(&self, address: u64) -> Option<&CallNode> {
        self.children.iter().find(|c| c.address == address)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktraceGraph {
    roots: Vec<CallNode>,
}

fn child_mut(nodes: &mut Vec<CallNode>, address: u64) -> &mut CallNode {
    let index = match nodes.iter().position(|n| n.address == address) {
        Some(index) => index,
        None => {
            nodes.push(CallNode::new(address));
            nodes.len() - 1
        }
    };
    &mut nodes[index]
}

impl BacktraceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outermost frames, the entry points every sampled call comes from.
    pub fn roots(&self) -> &[CallNode] {
        &self.roots
    }

    pub fn root(&self, address: u64) -> Option<&CallNode> {
        self.roots.iter().find(|n| n.address == address)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Merge a newest-first stack into the tree, starting from its outermost
    /// frame, and credit `energy_wh` to every node on its path. Nodes are keyed
    /// by their offset into the main image.
    pub fn insert(&mut self, trace: &StackTrace, bias: LoadBias, energy_wh: f64) {
        let mut addresses = trace.raw().rev().map(|address| bias.relative(address));
        let Some(outermost) = addresses.next() else {
            return;
        };
        let mut node = child_mut(&mut self.roots, outermost);
        node.energy_wh += energy_wh;
        for address in addresses {
            node = child_mut(&mut node.children, address);
            node.energy_wh += energy_wh;
        }
    }

    /// Energy per address, summed over every node that carries it.
    pub fn flat(&self) -> HashMap<u64, f64> {
        let mut totals = HashMap::new();
        let mut pending: Vec<&CallNode> = self.roots.iter().collect();
        while let Some(node) = pending.pop() {
            *totals.entry(node.address).or_insert(0.0) += node.energy_wh;
            pending.extend(node.children.iter());
        }
        totals
    }

    pub fn total_energy_wh(&self) -> f64 {
        self.roots.iter().map(|n| n.energy_wh).sum()
    }
}
