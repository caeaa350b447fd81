//! Sweep-group computation.
//!
//! Domains that reference each other through wrappers must finish marking
//! before either of them sweeps, so the collected domains are split into
//! strongly connected components of the domain reference graph. Tarjan's
//! algorithm is run with an explicit work stack so deep graphs cannot
//! overflow the native stack.

use crate::domain::DomainId;
use std::collections::{BTreeMap, BTreeSet};

/// Directed graph over collected domains.
#[derive(Debug, Default)]
pub(crate) struct DomainGraph {
    nodes: Vec<DomainId>,
    edges: BTreeMap<DomainId, BTreeSet<DomainId>>,
}

impl DomainGraph {
    pub(crate) fn new(nodes: impl IntoIterator<Item = DomainId>) -> Self {
        let nodes: Vec<DomainId> = nodes.into_iter().collect();
        DomainGraph {
            edges: nodes.iter().map(|id| (*id, BTreeSet::new())).collect(),
            nodes,
        }
    }

    /// Adds `from → to`; edges to domains outside the graph and self edges
    /// are ignored.
    pub(crate) fn add_edge(&mut self, from: DomainId, to: DomainId) {
        if from == to || !self.edges.contains_key(&to) {
            return;
        }
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.insert(to);
        }
    }

    /// Strongly connected components, ordered so that every edge points to
    /// the same or a later group.
    pub(crate) fn groups(&self) -> Vec<Vec<DomainId>> {
        let position: BTreeMap<DomainId, usize> =
            self.nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let successors: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|id| {
                self.edges
                    .get(id)
                    .into_iter()
                    .flatten()
                    .filter_map(|to| position.get(to).copied())
                    .collect()
            })
            .collect();

        let mut tarjan = Tarjan::new(self.nodes.len());
        for root in 0..self.nodes.len() {
            if tarjan.index[root].is_none() {
                tarjan.run(root, &successors);
            }
        }

        tarjan
            .components
            .into_iter()
            .rev()
            .map(|component| {
                let mut group: Vec<DomainId> =
                    component.into_iter().map(|i| self.nodes[i]).collect();
                group.sort();
                group
            })
            .collect()
    }
}

struct Tarjan {
    next_index: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    /// Completed components, sinks first
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    fn new(len: usize) -> Self {
        Tarjan {
            next_index: 0,
            index: vec![None; len],
            lowlink: vec![0; len],
            on_stack: vec![false; len],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;
    }

    fn run(&mut self, root: usize, successors: &[Vec<usize>]) {
        let mut work: Vec<(usize, usize)> = vec![(root, 0)];
        self.visit(root);

        while let Some(top) = work.last_mut() {
            let v = top.0;
            if let Some(&w) = successors[v].get(top.1) {
                top.1 += 1;
                match self.index[w] {
                    None => {
                        self.visit(w);
                        work.push((w, 0));
                    }
                    Some(w_index) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(w_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                self.lowlink[parent] = self.lowlink[parent].min(self.lowlink[v]);
            }
            if Some(self.lowlink[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }
}

/// Collapses every group into one.
pub(crate) fn merge_groups(groups: Vec<Vec<DomainId>>) -> Vec<Vec<DomainId>> {
    let mut merged: Vec<DomainId> = groups.into_iter().flatten().collect();
    if merged.is_empty() {
        return Vec::new();
    }
    merged.sort();
    vec![merged]
}
