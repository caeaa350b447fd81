//! Slice budgets.
//!
//! A budget bounds how much work one incremental slice may do. Long loops
//! call [`SliceBudget::step`] as they go and poll
//! [`SliceBudget::is_over_budget`]; checking the clock on every poll would be
//! too expensive, so time budgets only look at the clock once the step
//! counter runs out.

use std::time::{Duration, Instant};

/// Steps between clock checks for time-limited budgets.
const COUNTER_RESET: i64 = 1000;

/// How much work a slice may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Run to completion.
    Unlimited,
    /// Stop once this many milliseconds have elapsed.
    TimeMs(u64),
    /// Stop after this many units of work.
    Work(u64),
}

impl Budget {
    /// Decodes the signed encoding used by embedders: zero is unlimited,
    /// positive values are milliseconds, negative values `-n - 1` are `n`
    /// units of work.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Budget::Unlimited,
            ms if ms > 0 => Budget::TimeMs(ms as u64),
            work => Budget::Work((-(work + 1)) as u64),
        }
    }

    /// Inverse of [`from_raw`](Self::from_raw).
    pub fn to_raw(self) -> i64 {
        match self {
            Budget::Unlimited => 0,
            Budget::TimeMs(ms) => ms.min(i64::MAX as u64) as i64,
            Budget::Work(work) => -(work.min(i64::MAX as u64 - 1) as i64) - 1,
        }
    }
}

/// Running budget of one slice.
#[derive(Debug, Clone)]
pub struct SliceBudget {
    budget: Budget,
    deadline: Option<Instant>,
    counter: i64,
}

impl SliceBudget {
    pub fn new(budget: Budget) -> Self {
        match budget {
            Budget::Unlimited => Self::unlimited(),
            Budget::TimeMs(ms) => SliceBudget {
                budget,
                deadline: Some(Instant::now() + Duration::from_millis(ms)),
                counter: COUNTER_RESET,
            },
            Budget::Work(work) => SliceBudget {
                budget,
                deadline: None,
                counter: work.min(i64::MAX as u64) as i64,
            },
        }
    }

    pub fn unlimited() -> Self {
        SliceBudget {
            budget: Budget::Unlimited,
            deadline: None,
            counter: i64::MAX,
        }
    }

    /// Makes the rest of the slice unlimited.
    pub fn reset(&mut self) {
        *self = Self::unlimited();
    }

    pub fn is_unlimited(&self) -> bool {
        self.budget == Budget::Unlimited
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Accounts for `amount` units of work.
    #[inline]
    pub fn step(&mut self, amount: usize) {
        if !self.is_unlimited() {
            self.counter = self.counter.saturating_sub(amount as i64);
        }
    }

    pub fn is_over_budget(&mut self) -> bool {
        if self.counter > 0 {
            return false;
        }
        match (self.budget, self.deadline) {
            (Budget::Unlimited, _) => false,
            (Budget::TimeMs(_), Some(deadline)) => {
                if Instant::now() >= deadline {
                    true
                } else {
                    self.counter = COUNTER_RESET;
                    false
                }
            }
            _ => true,
        }
    }
}
