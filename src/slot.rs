//! Memoization slot for one derivation
//!
//! A slot is `Absent`, `Pending` (one shared in-flight computation) or
//! `Resolved`. Successes stay resolved until cleared; failures put the slot
//! back to `Absent` so the next request starts over.

use crate::error::DuckResult;
use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Shared handle every waiter of a derivation awaits
pub type SharedResult<T> = Shared<BoxFuture<'static, DuckResult<T>>>;

/// Observable status of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Absent,
    Pending,
    Resolved,
}

enum SlotState<T> {
    Absent,
    Pending(SharedResult<T>),
    Resolved(T),
}

/// One memoized derivation
///
/// The epoch identifies the computation currently in the slot, so a
/// computation that finishes after the slot was cleared or restarted cannot
/// overwrite newer state.
pub struct Slot<T> {
    state: SlotState<T>,
    epoch: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: SlotState::Absent,
            epoch: 0,
        }
    }
}

impl<T> Slot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn status(&self) -> SlotStatus {
        match self.state {
            SlotState::Absent => SlotStatus::Absent,
            SlotState::Pending(_) => SlotStatus::Pending,
            SlotState::Resolved(_) => SlotStatus::Resolved,
        }
    }

    /// Handle for a resolved or pending slot; `None` when absent
    pub fn current(&self) -> Option<SharedResult<T>> {
        match &self.state {
            SlotState::Absent => None,
            SlotState::Pending(handle) => Some(handle.clone()),
            SlotState::Resolved(value) => {
                let value = value.clone();
                Some(async move { Ok(value) }.boxed().shared())
            }
        }
    }

    /// Reserve the epoch for a computation about to start
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Install the in-flight computation for `epoch`
    pub fn set_pending(&mut self, epoch: u64, handle: SharedResult<T>) {
        if epoch == self.epoch {
            self.state = SlotState::Pending(handle);
        }
    }

    /// Record the outcome of the computation for `epoch`
    ///
    /// Returns false when the slot has moved on and the outcome was dropped.
    pub fn settle(&mut self, epoch: u64, result: &DuckResult<T>) -> bool {
        if epoch != self.epoch || !matches!(self.state, SlotState::Pending(_)) {
            return false;
        }
        self.state = match result {
            Ok(value) => SlotState::Resolved(value.clone()),
            Err(_) => SlotState::Absent,
        };
        true
    }

    /// Drop any in-memory result; an in-flight computation keeps running but
    /// will not land here
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.state = SlotState::Absent;
    }
}
