//! Background helper thread.
//!
//! The helper finalizes background-eligible arenas after a collection and
//! maps chunks into the empty pool ahead of demand. The mutator drives it
//! through a small state machine guarded by a mutex and condition variable;
//! work is handed over as channel messages and swept arena lists come back
//! the same way, so the mutator only ever merges results it has received.

use crate::heap::Heap;
use crate::sweep::{sweep_job, SweepJob, SweptArenas};
use crate::trace::Trace;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What the helper thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    Idle,
    Sweeping,
    Allocating,
    /// The mutator asked a running allocation to stop
    CancelAllocation,
    Shutdown,
}

enum Request {
    Sweep(Vec<SweepJob>),
    Allocate,
    Shutdown,
}

struct Shared {
    state: Mutex<HelperState>,
    done: Condvar,
    /// Release all empty chunks and decommit once the current sweep ends
    shrink: AtomicBool,
}

impl Shared {
    fn finish(&self) {
        let mut state = self.state.lock();
        if *state != HelperState::Shutdown {
            *state = HelperState::Idle;
        }
        self.done.notify_all();
    }
}

pub(crate) struct HelperThread {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    results: Receiver<SweptArenas>,
    handle: Option<JoinHandle<()>>,
}

impl HelperThread {
    pub(crate) fn spawn<T: Trace + Send + 'static>(heap: Arc<Heap<T>>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(HelperState::Idle),
            done: Condvar::new(),
            shrink: AtomicBool::new(false),
        });
        let (request_tx, request_rx) = channel::unbounded();
        let (result_tx, result_rx) = channel::unbounded();

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("gc-helper".to_string())
            .spawn(move || run(heap, thread_shared, request_rx, result_tx))?;

        Ok(HelperThread {
            shared,
            requests: request_tx,
            results: result_rx,
            handle: Some(handle),
        })
    }

    pub(crate) fn state(&self) -> HelperState {
        *self.shared.state.lock()
    }

    pub(crate) fn is_sweeping(&self) -> bool {
        self.state() == HelperState::Sweeping
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("GC helper thread is gone");
            self.shared.finish();
        }
    }

    /// Hands finished-marking arenas to the helper.
    pub(crate) fn start_background_sweep(&self, jobs: Vec<SweepJob>, shrink: bool) {
        {
            let mut state = self.shared.state.lock();
            debug_assert_eq!(*state, HelperState::Idle);
            *state = HelperState::Sweeping;
        }
        if shrink {
            self.shared.shrink.store(true, Ordering::Release);
        }
        debug!("starting background sweep of {} jobs", jobs.len());
        self.send(Request::Sweep(jobs));
    }

    /// Asks the helper to release empty chunks and decommit free arenas.
    pub(crate) fn start_background_shrink(&self) {
        let mut state = self.shared.state.lock();
        match *state {
            HelperState::Idle => {
                *state = HelperState::Sweeping;
                self.shared.shrink.store(true, Ordering::Release);
                drop(state);
                self.send(Request::Sweep(Vec::new()));
            }
            HelperState::Sweeping => self.shared.shrink.store(true, Ordering::Release),
            // A running allocation means there is nothing to shrink.
            HelperState::Allocating | HelperState::CancelAllocation | HelperState::Shutdown => {}
        }
    }

    /// Starts mapping chunks ahead of demand if the helper has nothing else
    /// to do.
    pub(crate) fn start_background_allocation_if_idle(&self) {
        let mut state = self.shared.state.lock();
        if *state == HelperState::Idle {
            *state = HelperState::Allocating;
            drop(state);
            trace!("starting background chunk allocation");
            self.send(Request::Allocate);
        }
    }

    pub(crate) fn wait_background_sweep_end(&self) {
        let mut state = self.shared.state.lock();
        while *state == HelperState::Sweeping {
            self.shared.done.wait(&mut state);
        }
    }

    /// Waits for a sweep to finish and cancels a running allocation.
    pub(crate) fn wait_background_sweep_or_alloc_end(&self) {
        let mut state = self.shared.state.lock();
        if *state == HelperState::Allocating {
            *state = HelperState::CancelAllocation;
        }
        while matches!(*state, HelperState::Sweeping | HelperState::CancelAllocation) {
            self.shared.done.wait(&mut state);
        }
    }

    /// Swept lists that arrived since the last call.
    pub(crate) fn take_results(&self) -> Vec<SweptArenas> {
        self.results.try_iter().collect()
    }

    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.wait_background_sweep_or_alloc_end();
        *self.shared.state.lock() = HelperState::Shutdown;
        let _ = self.requests.send(Request::Shutdown);
        if handle.join().is_err() {
            warn!("GC helper thread panicked");
        }
        debug!("GC helper thread stopped");
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: Trace>(
    heap: Arc<Heap<T>>,
    shared: Arc<Shared>,
    requests: Receiver<Request>,
    results: Sender<SweptArenas>,
) {
    for request in requests.iter() {
        match request {
            Request::Sweep(jobs) => {
                for job in jobs {
                    if results.send(sweep_job(&heap, job, true)).is_err() {
                        break;
                    }
                }
                let shrink = shared.shrink.swap(false, Ordering::AcqRel);
                heap.expire_chunks(shrink);
                if shrink {
                    heap.decommit_arenas(&|| false);
                }
                shared.finish();
            }
            Request::Allocate => {
                loop {
                    if *shared.state.lock() != HelperState::Allocating {
                        break;
                    }
                    if !heap.want_background_allocation() || !heap.background_allocate() {
                        break;
                    }
                }
                shared.finish();
            }
            Request::Shutdown => break,
        }
    }
}
