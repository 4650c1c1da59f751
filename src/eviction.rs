//! Two-tier eviction
//!
//! Every entry carries one timer. Access re-arms it with the memory timeout;
//! when it fires the entry is demoted to disk-only (or removed outright when
//! it has nothing on disk worth keeping), and the same timer is re-armed with
//! the disk timeout.
//!
//! # Entry States
//!
//! | State | In-memory results | Render files | In index |
//! |-------|-------------------|--------------|----------|
//! | Active | kept | kept | yes |
//! | MemoryEvicted | dropped | kept | yes |
//! | Removed | dropped | deleted | no |
//!
//! Timers go through the [`Scheduler`] trait so tests can drive time with
//! [`ManualScheduler`] instead of waiting on the wall clock.

use crate::config::schema::CacheConfig;
use crate::error::{DuckError, DuckResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Callback run when a timer fires
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancelable handle to a scheduled callback
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Prevent the callback from running if it has not fired yet
    pub fn cancel(self) {
        (self.cancel)()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimerHandle")
    }
}

/// Runs callbacks after a delay
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Scheduler backed by tokio timers
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Bind to the runtime the caller is running in
    pub fn new() -> DuckResult<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DuckError::Internal(format!("no tokio runtime for scheduler: {}", e)))?;
        Ok(Self { handle })
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), TimerTask>,
}

/// Deterministic scheduler driven by [`ManualScheduler::advance`]
///
/// Virtual time starts at zero. Callbacks run on the thread calling
/// `advance`, in deadline order, and may schedule further timers.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of timers that have neither fired nor been canceled
    pub fn pending(&self) -> usize {
        self.lock().timers.len()
    }

    /// Move virtual time forward, firing every timer that comes due
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        loop {
            let task = {
                let mut state = self.lock();
                let due = state
                    .timers
                    .first_key_value()
                    .map(|(&(deadline, _), _)| deadline)
                    .filter(|deadline| *deadline <= target);
                match due {
                    Some(deadline) => {
                        state.now = deadline;
                        state.timers.pop_first().map(|(_, task)| task)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let slot = {
            let mut state = self.lock();
            let slot = (state.now + delay, state.next_id);
            state.next_id += 1;
            state.timers.insert(slot, task);
            slot
        };

        let weak = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .timers
                    .remove(&slot);
            }
        })
    }
}

/// Residency of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionState {
    Active,
    MemoryEvicted,
    Removed,
}

impl fmt::Display for EvictionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::MemoryEvicted => write!(f, "memory-evicted"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Outcome of the memory timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryExpiry {
    /// A derivation is still running; re-arm the memory timer
    KeepAlive,
    /// Drop in-memory results, keep render files, arm the disk timer
    Demote,
    /// Drop in-memory results and remove the entry now
    Remove,
}

/// Eviction timeouts and policy variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub memory_timeout: Duration,
    pub disk_timeout: Duration,
    /// Wait out the disk timer even when no render was ever produced
    pub retain_without_artifacts: bool,
}

impl EvictionPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            memory_timeout: config.memory_timeout(),
            disk_timeout: config.disk_timeout(),
            retain_without_artifacts: config.retain_without_artifacts,
        }
    }

    /// Decide what the memory timer does for an entry
    pub fn on_memory_expiry(&self, in_flight: bool, has_artifacts: bool) -> MemoryExpiry {
        if in_flight {
            MemoryExpiry::KeepAlive
        } else if has_artifacts || self.retain_without_artifacts {
            MemoryExpiry::Demote
        } else {
            MemoryExpiry::Remove
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// The single timer owned by a cache entry
///
/// Each arm bumps a generation number; a callback that fires with a stale
/// generation must do nothing, which covers a cancel racing the callback.
#[derive(Debug, Default)]
pub struct EvictionTimer {
    generation: u64,
    handle: Option<TimerHandle>,
}

impl EvictionTimer {
    /// Replace any armed timer; `task` receives the new generation
    pub fn arm<F>(&mut self, scheduler: &dyn Scheduler, delay: Duration, task: F) -> u64
    where
        F: FnOnce(u64) -> TimerTask,
    {
        self.disarm();
        self.generation += 1;
        self.handle = Some(scheduler.schedule_after(delay, task(self.generation)));
        self.generation
    }

    /// Cancel the armed timer, if any
    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }

    /// Whether a callback armed with `generation` is still the live one
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    /// Forget the handle of a timer that has fired
    pub fn fired(&mut self) {
        self.handle = None;
    }
}
