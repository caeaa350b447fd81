//! Root registration.
//!
//! Roots come from two places:
//! - The [`RootTable`]: named roots and locked things registered by the
//!   embedder through the collector API
//! - An optional [`RootProvider`], standing in for stack scanning and for
//!   gray roots held by an external cycle collector

use crate::trace::{ThingRef, Tracer};
use std::collections::BTreeMap;

/// Pluggable source of roots.
///
/// A test harness returns explicit lists; an embedding with its own stack
/// scanner reports whatever it finds.
pub trait RootProvider {
    /// Reports roots that must be marked black.
    fn trace_roots(&mut self, tracer: &mut dyn Tracer);

    /// Reports roots that are only alive if an external holder says so.
    ///
    /// Things reachable only from here are marked gray.
    fn trace_gray_roots(&mut self, _tracer: &mut dyn Tracer) {}
}

/// Explicit root lists.
#[derive(Debug, Default, Clone)]
pub struct RootList {
    /// Marked black
    pub black: Vec<ThingRef>,
    /// Marked gray
    pub gray: Vec<ThingRef>,
}

impl RootProvider for RootList {
    fn trace_roots(&mut self, tracer: &mut dyn Tracer) {
        for thing in &self.black {
            tracer.edge(*thing);
        }
    }

    fn trace_gray_roots(&mut self, tracer: &mut dyn Tracer) {
        for thing in &self.gray {
            tracer.edge(*thing);
        }
    }
}

/// Named roots and lock counts.
#[derive(Debug, Default)]
pub(crate) struct RootTable {
    roots: BTreeMap<ThingRef, String>,
    locks: BTreeMap<ThingRef, usize>,
}

impl RootTable {
    /// Registers `thing` under `name`. Re-adding renames the root.
    pub(crate) fn add_root(&mut self, thing: ThingRef, name: impl Into<String>) {
        self.roots.insert(thing, name.into());
    }

    pub(crate) fn remove_root(&mut self, thing: ThingRef) -> bool {
        self.roots.remove(&thing).is_some()
    }

    pub(crate) fn root_name(&self, thing: ThingRef) -> Option<&str> {
        self.roots.get(&thing).map(String::as_str)
    }

    /// Increments the lock count; returns the new count.
    pub(crate) fn lock(&mut self, thing: ThingRef) -> usize {
        let count = self.locks.entry(thing).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrements the lock count; returns `None` if the thing was not locked.
    pub(crate) fn unlock(&mut self, thing: ThingRef) -> Option<usize> {
        let count = self.locks.get_mut(&thing)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.locks.remove(&thing);
        }
        Some(remaining)
    }

    pub(crate) fn is_locked(&self, thing: ThingRef) -> bool {
        self.locks.contains_key(&thing)
    }

    /// Every explicit root and locked thing.
    pub(crate) fn iter(&self) -> impl Iterator<Item = ThingRef> + '_ {
        self.roots.keys().chain(self.locks.keys()).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.roots.len()
    }
}

/// Tracer that appends gray roots to a bounded buffer.
///
/// Growth failure flips `failed` and drops everything buffered so far.
pub(crate) struct GrayRootBuffer<'a> {
    pub(crate) roots: &'a mut Vec<ThingRef>,
    pub(crate) limit: usize,
    pub(crate) failed: bool,
}

impl Tracer for GrayRootBuffer<'_> {
    fn edge(&mut self, target: ThingRef) {
        if self.failed {
            return;
        }
        if self.roots.len() >= self.limit || self.roots.try_reserve(1).is_err() {
            self.failed = true;
            self.roots.clear();
            return;
        }
        self.roots.push(target);
    }
}
