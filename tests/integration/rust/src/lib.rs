//! Integration test suite for the compartment collector
//!
//! This crate drives `compartment_gc` end to end: scenario tests, property
//! tests over random object graphs, and helper-thread sweeping. The fixtures
//! here keep an index of everything a test allocated so survival can be
//! checked against plain graph reachability.

/// Re-export components for test convenience
pub mod components {
    pub use compartment_gc;
}

use compartment_gc::{AllocKind, CollectorContext, DomainId, GcConfig, GcResult, GcStats, ThingRef, Trace, Tracer};
use log::debug;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Installs `env_logger` for the test binary. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Payload of every test thing.
pub struct Node {
    pub index: usize,
    pub edges: Vec<ThingRef>,
    finalized: Arc<AtomicUsize>,
}

impl Trace for Node {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for edge in &self.edges {
            tracer.edge(*edge);
        }
    }

    fn finalize(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

/// A collector together with the things allocated through it.
pub struct Graph {
    pub gc: CollectorContext<Node>,
    things: Vec<ThingRef>,
    edges: Vec<Vec<usize>>,
    finalized: Arc<AtomicUsize>,
}

impl Graph {
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Ok(Graph {
            gc: CollectorContext::new(config)?,
            things: Vec::new(),
            edges: Vec::new(),
            finalized: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn single_threaded() -> GcResult<Self> {
        Self::new(GcConfig::single_threaded())
    }

    /// Allocates a node and returns its index.
    pub fn add_node(&mut self, domain: DomainId, kind: AllocKind) -> GcResult<usize> {
        let index = self.things.len();
        let node = Node {
            index,
            edges: Vec::new(),
            finalized: Arc::clone(&self.finalized),
        };
        let thing = self.gc.allocate(domain, kind, node)?;
        self.things.push(thing);
        self.edges.push(Vec::new());
        Ok(index)
    }

    pub fn add_nodes(&mut self, domain: DomainId, kind: AllocKind, count: usize) -> GcResult<Vec<usize>> {
        (0..count).map(|_| self.add_node(domain, kind)).collect()
    }

    pub fn add_edge(&mut self, from: usize, to: usize) -> GcResult<()> {
        let target = self.things[to];
        self.gc.with_thing_mut(self.things[from], |node| node.edges.push(target))?;
        self.edges[from].push(to);
        Ok(())
    }

    pub fn root(&mut self, index: usize) -> GcResult<()> {
        self.gc.add_root(self.things[index], &format!("node {}", index))
    }

    pub fn thing(&self, index: usize) -> ThingRef {
        self.things[index]
    }

    pub fn len(&self) -> usize {
        self.things.len()
    }

    pub fn is_empty(&self) -> bool {
        self.things.is_empty()
    }

    /// Finalizations observed so far.
    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Indices of things the collector still holds.
    pub fn surviving(&self) -> BTreeSet<usize> {
        (0..self.things.len())
            .filter(|&i| self.gc.contains(self.things[i]))
            .collect()
    }

    /// Indices reachable from `roots` over the recorded edges.
    pub fn reachable(&self, roots: &[usize]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                stack.extend(self.edges[index].iter().copied());
            }
        }
        seen
    }

    /// Runs debug slices of `work` units until the current collection
    /// finishes. Returns the number of slices.
    pub fn finish_in_slices(&mut self, work: u64) -> usize {
        let mut slices = 0;
        loop {
            self.gc.gc_debug_slice(true, work);
            slices += 1;
            if !self.gc.is_incremental_gc_in_progress() {
                debug!("collection finished after {} slices of {} units", slices, work);
                return slices;
            }
            assert!(slices < 100_000, "collection did not finish");
        }
    }

    /// Shuts the collector down. Returns its final statistics and the
    /// total number of finalizations.
    pub fn finish(self) -> (GcStats, usize) {
        let finalized = Arc::clone(&self.finalized);
        let stats = self.gc.finish_gc();
        (stats, finalized.load(Ordering::SeqCst))
    }
}
