//! Domains (compartments): isolation units that own arenas and track their
//! outgoing cross-domain references.

use crate::arena_list::ArenaLists;
use crate::sweep::SweepView;
use crate::trace::ThingRef;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a domain. Never reused within one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub(crate) u32);

impl DomainId {
    /// The shared atoms domain, created with every collector.
    pub const ATOMS: DomainId = DomainId(0);

    pub fn new(id: u32) -> Self {
        DomainId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_atoms(self) -> bool {
        self == Self::ATOMS
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-domain collection state.
///
/// A collected domain moves `NoGc → Mark ⇄ MarkGray → Sweep → Finished → NoGc`.
/// Once it reaches `Sweep` it cannot return to marking within the same
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainGcState {
    NoGc,
    Mark,
    MarkGray,
    Sweep,
    Finished,
}

impl DomainGcState {
    pub fn is_collecting(self) -> bool {
        self != DomainGcState::NoGc
    }

    pub fn is_marking(self) -> bool {
        matches!(self, DomainGcState::Mark | DomainGcState::MarkGray)
    }

    pub fn is_marking_black(self) -> bool {
        self == DomainGcState::Mark
    }

    pub fn is_marking_gray(self) -> bool {
        self == DomainGcState::MarkGray
    }

    pub fn is_sweeping(self) -> bool {
        self == DomainGcState::Sweep
    }

    fn can_transition_to(self, next: DomainGcState) -> bool {
        use DomainGcState::*;
        matches!(
            (self, next),
            (NoGc, Mark)
                | (Mark, MarkGray)
                | (MarkGray, Mark)
                | (Mark, Sweep)
                | (Sweep, Finished)
                | (Finished, NoGc)
                | (Mark, NoGc)
                | (MarkGray, NoGc)
        )
    }
}

/// What a cross-domain wrapper stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WrapperKind {
    Object,
    /// Cheap to recreate; dropped whenever sweeping starts.
    String,
    /// Keeps debugger and debuggee domains in the same sweep group.
    Debugger,
}

/// Key of a wrapper-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrossDomainKey {
    pub kind: WrapperKind,
    pub target: ThingRef,
}

/// How an incoming cross-domain edge was resolved during gray marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeColor {
    /// The wrapper turned black and its target was marked black.
    Black,
    /// The wrapper stayed gray and its target was marked gray.
    Gray,
    /// Recorded while the target domain was still marking black.
    Pending,
}

/// A gray reference into this domain found while its source domain was
/// marking gray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingEdge {
    pub source: DomainId,
    pub wrapper: ThingRef,
    pub target: ThingRef,
    pub color: EdgeColor,
}

/// Ephemeron: `value` is live whenever `key` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakEntry {
    pub key: ThingRef,
    pub value: ThingRef,
}

/// Callback run while a domain sweeps.
pub type SweepHook = Box<dyn FnMut(&dyn SweepView)>;

/// One isolation unit of the heap.
pub struct Domain {
    id: DomainId,
    name: String,
    is_system: bool,
    state: DomainGcState,
    pub(crate) scheduled: bool,
    pub(crate) needs_barrier: bool,
    /// Keeps the domain alive while it has no arenas
    pub(crate) hold: bool,
    pub(crate) maybe_alive: bool,
    pub(crate) scheduled_for_destruction: bool,
    pub(crate) arenas: ArenaLists,
    pub(crate) wrappers: BTreeMap<CrossDomainKey, ThingRef>,
    pub(crate) incoming: Vec<IncomingEdge>,
    pub(crate) weak_entries: Vec<WeakEntry>,
    pub(crate) sweep_hook: Option<SweepHook>,
    pub(crate) malloc_bytes: usize,
    pub(crate) malloc_trigger_bytes: usize,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("scheduled", &self.scheduled)
            .field("wrappers", &self.wrappers.len())
            .finish_non_exhaustive()
    }
}

impl Domain {
    pub(crate) fn new(id: DomainId, name: impl Into<String>, is_system: bool, malloc_trigger_bytes: usize) -> Self {
        Domain {
            id,
            name: name.into(),
            is_system,
            state: DomainGcState::NoGc,
            scheduled: false,
            needs_barrier: false,
            hold: true,
            maybe_alive: false,
            scheduled_for_destruction: false,
            arenas: ArenaLists::new(),
            wrappers: BTreeMap::new(),
            incoming: Vec::new(),
            weak_entries: Vec::new(),
            sweep_hook: None,
            malloc_bytes: 0,
            malloc_trigger_bytes,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn state(&self) -> DomainGcState {
        self.state
    }

    pub fn is_gc_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn needs_barrier(&self) -> bool {
        self.needs_barrier
    }

    /// Whether the embedder still holds the domain.
    pub fn is_held(&self) -> bool {
        self.hold
    }

    /// Set while marking when something outside the domain may still reach it.
    pub fn maybe_alive(&self) -> bool {
        self.maybe_alive
    }

    pub fn is_scheduled_for_destruction(&self) -> bool {
        self.scheduled_for_destruction
    }

    pub(crate) fn set_state(&mut self, next: DomainGcState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "domain {} cannot go from {:?} to {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Forgets a pending incoming edge recorded for `wrapper`.
    pub(crate) fn unlink_incoming(&mut self, wrapper: ThingRef) -> bool {
        let before = self.incoming.len();
        self.incoming.retain(|edge| edge.wrapper != wrapper);
        before != self.incoming.len()
    }

    /// Records a gray reference through `wrapper` unless it is already queued.
    pub(crate) fn delay_gray_edge(&mut self, source: DomainId, wrapper: ThingRef, target: ThingRef) {
        if self
            .incoming
            .iter()
            .any(|edge| edge.wrapper == wrapper && edge.target == target)
        {
            return;
        }
        self.incoming.push(IncomingEdge {
            source,
            wrapper,
            target,
            color: EdgeColor::Pending,
        });
    }

    pub(crate) fn drop_string_wrappers(&mut self) {
        self.wrappers.retain(|key, _| key.kind != WrapperKind::String);
    }
}

/// All domains of a collector, ordered by id.
pub type DomainMap = BTreeMap<DomainId, Domain>;
