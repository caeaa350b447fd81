//! Arena finalization.
//!
//! Sweeping walks the arenas queued for a kind, finalizes every unmarked
//! thing and either returns the arena to its chunk (nothing survived) or
//! reinserts it into the domain's arena list. Foreground sweeping is
//! budgeted one arena at a time; background jobs run to completion on the
//! helper thread.

use crate::arena::FinalizeOutcome;
use crate::arena_list::ArenaList;
use crate::budget::SliceBudget;
use crate::chunk::MarkColor;
use crate::domain::DomainId;
use crate::heap::Heap;
use crate::kind::AllocKind;
use crate::trace::{ArenaAddr, ThingRef, Trace};
use std::collections::{BTreeSet, VecDeque};

/// Read-only view handed to sweep hooks.
pub trait SweepView {
    /// The domain whose hook is running.
    fn domain(&self) -> DomainId;

    /// Whether `thing` will be finalized by the current sweep.
    ///
    /// Things in domains that are not sweeping, and things allocated since
    /// their domain started sweeping, are never about to be finalized.
    fn is_about_to_be_finalized(&self, thing: ThingRef) -> bool;
}

pub(crate) struct HeapSweepView<'a, T> {
    pub(crate) heap: &'a Heap<T>,
    pub(crate) domain: DomainId,
    pub(crate) sweeping: &'a BTreeSet<DomainId>,
}

impl<T: Trace> SweepView for HeapSweepView<'_, T> {
    fn domain(&self) -> DomainId {
        self.domain
    }

    fn is_about_to_be_finalized(&self, thing: ThingRef) -> bool {
        is_about_to_be_finalized(self.heap, self.sweeping, thing)
    }
}

pub(crate) fn is_about_to_be_finalized<T: Trace>(
    heap: &Heap<T>,
    sweeping: &BTreeSet<DomainId>,
    thing: ThingRef,
) -> bool {
    let Some((domain, _)) = heap.owner(thing) else {
        return true;
    };
    if !sweeping.contains(&domain) {
        return false;
    }
    if heap.with_header(thing.arena(), |header| header.allocated_during_sweep) == Some(true) {
        return false;
    }
    !heap.is_marked(thing, MarkColor::Black)
}

/// Counters produced by finalizing arenas.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepTotals {
    pub(crate) finalized: usize,
    pub(crate) released: usize,
}

impl SweepTotals {
    pub(crate) fn add(&mut self, other: SweepTotals) {
        self.finalized += other.finalized;
        self.released += other.released;
    }
}

/// Finalizes one arena and files it: released when empty, otherwise
/// inserted into `dest`.
pub(crate) fn finalize_arena_into<T: Trace>(
    heap: &Heap<T>,
    addr: ArenaAddr,
    domain: DomainId,
    dest: &mut ArenaList,
    helper_sweeping: bool,
) -> SweepTotals {
    match heap.finalize_arena(addr) {
        FinalizeOutcome::Empty { finalized } => {
            heap.release_arena(addr, domain, helper_sweeping);
            SweepTotals { finalized, released: 1 }
        }
        FinalizeOutcome::Live { finalized, has_free } => {
            dest.insert(addr, has_free);
            SweepTotals { finalized, released: 0 }
        }
    }
}

/// Finalizes queued arenas of one kind until the queue is empty or the
/// budget runs out. Returns whether the queue was emptied.
pub(crate) fn finalize_queued<T: Trace>(
    heap: &Heap<T>,
    queue: &mut VecDeque<ArenaAddr>,
    dest: &mut ArenaList,
    domain: DomainId,
    kind: AllocKind,
    budget: &mut SliceBudget,
    totals: &mut SweepTotals,
) -> bool {
    while let Some(addr) = queue.pop_front() {
        totals.add(finalize_arena_into(heap, addr, domain, dest, false));
        budget.step(kind.things_per_arena());
        if budget.is_over_budget() {
            return false;
        }
    }
    true
}

/// Arenas of one domain and kind handed to the background sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SweepJob {
    pub(crate) domain: DomainId,
    pub(crate) kind: AllocKind,
    pub(crate) arenas: Vec<ArenaAddr>,
}

/// Result of one background job, merged back by the mutator.
#[derive(Debug)]
pub(crate) struct SweptArenas {
    pub(crate) domain: DomainId,
    pub(crate) kind: AllocKind,
    pub(crate) list: ArenaList,
    pub(crate) totals: SweepTotals,
}

/// Runs one job to completion.
pub(crate) fn sweep_job<T: Trace>(heap: &Heap<T>, job: SweepJob, helper_sweeping: bool) -> SweptArenas {
    let mut list = ArenaList::new();
    let mut totals = SweepTotals::default();
    for addr in job.arenas {
        totals.add(finalize_arena_into(heap, addr, job.domain, &mut list, helper_sweeping));
    }
    SweptArenas {
        domain: job.domain,
        kind: job.kind,
        list,
        totals,
    }
}
