//! Derivation cache
//!
//! [`Cache`] owns the key → entry index and computes per-key artifacts on
//! demand:
//!
//! ```text
//! source ──┬── check (diagnostics)
//!          └── compile ── audio ── image
//! ```
//!
//! Each derivation is single-flight: concurrent requests for the same key
//! share one computation, which runs as its own tokio task so a caller going
//! away does not abort work other callers are waiting on. Successes are
//! memoized until memory eviction; failures are never memoized.

use crate::config::Config;
use crate::error::{DuckError, DuckResult, ErrorKind, Stage, Tool};
use crate::eviction::{
    EvictionPolicy, EvictionState, EvictionTimer, MemoryExpiry, Scheduler, TimerTask,
};
use crate::identity::{compute_key, CacheKey};
use crate::process::{ToolError, ToolOutput};
use crate::slot::{SharedResult, Slot, SlotStatus};
use crate::store::{ArtifactKind, ArtifactStore};
use crate::toolchain::{parse_diagnostics, Toolchain};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

/// Result of checking a piece of source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Cache key of the checked source
    pub hash: String,
    /// Compiler messages, `None` when the source is clean
    pub errors: Option<String>,
}

impl Diagnostics {
    pub fn is_clean(&self) -> bool {
        self.errors.is_none()
    }
}

/// Tunables for a [`Cache`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub policy: EvictionPolicy,
    /// Deadline for audio and image rendering
    pub process_timeout: Duration,
    /// Size of the external job pool
    pub max_concurrent_jobs: usize,
}

impl CacheOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: EvictionPolicy::from_config(&config.cache),
            process_timeout: config.tools.process_timeout(),
            max_concurrent_jobs: config.cache.max_concurrent_jobs.max(1),
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Mutable state of one entry, guarded by the entry's mutex
#[derive(Default)]
struct EntryState {
    source_path: Option<PathBuf>,
    source: Slot<PathBuf>,
    diagnostics: Slot<Diagnostics>,
    audio: Slot<PathBuf>,
    image: Slot<PathBuf>,
    audio_path: Option<PathBuf>,
    image_path: Option<PathBuf>,
    eviction: Option<EvictionState>,
    timer: EvictionTimer,
}

impl EntryState {
    fn source_slot(&mut self) -> &mut Slot<PathBuf> {
        &mut self.source
    }

    fn diagnostics_slot(&mut self) -> &mut Slot<Diagnostics> {
        &mut self.diagnostics
    }

    fn audio_slot(&mut self) -> &mut Slot<PathBuf> {
        &mut self.audio
    }

    fn image_slot(&mut self) -> &mut Slot<PathBuf> {
        &mut self.image
    }

    fn eviction(&self) -> EvictionState {
        self.eviction.unwrap_or(EvictionState::Active)
    }

    fn in_flight(&self) -> bool {
        [
            self.source.status(),
            self.diagnostics.status(),
            self.audio.status(),
            self.image.status(),
        ]
        .contains(&SlotStatus::Pending)
    }

    fn has_artifacts(&self) -> bool {
        self.audio_path.is_some() || self.image_path.is_some()
    }

    fn clear_slots(&mut self) {
        self.source.clear();
        self.diagnostics.clear();
        self.audio.clear();
        self.image.clear();
    }

    fn artifact_path(&mut self, kind: ArtifactKind) -> &mut Option<PathBuf> {
        match kind {
            ArtifactKind::Audio => &mut self.audio_path,
            ArtifactKind::Image => &mut self.image_path,
        }
    }
}

/// One cache entry, shared between the index and running derivations
struct CacheEntry {
    key: CacheKey,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of an entry, for status output and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub state: EvictionState,
    pub source: SlotStatus,
    pub diagnostics: SlotStatus,
    pub audio: SlotStatus,
    pub image: SlotStatus,
    pub source_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
}

type SlotSelector<T> = fn(&mut EntryState) -> &mut Slot<T>;

struct CacheInner {
    entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
    store: ArtifactStore,
    toolchain: Arc<dyn Toolchain>,
    scheduler: Arc<dyn Scheduler>,
    options: CacheOptions,
    jobs: Semaphore,
}

/// Handle to the derivation cache; cheap to clone
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Create a cache over an existing store
    pub fn new(
        store: ArtifactStore,
        toolchain: Arc<dyn Toolchain>,
        scheduler: Arc<dyn Scheduler>,
        options: CacheOptions,
    ) -> Self {
        debug!(
            "Creating cache with {} toolchain, memory timeout {:?}, disk timeout {:?}",
            toolchain.name(),
            options.policy.memory_timeout,
            options.policy.disk_timeout
        );
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                jobs: Semaphore::new(options.max_concurrent_jobs),
                store,
                toolchain,
                scheduler,
                options,
            }),
        }
    }

    /// Create a cache from configuration, making sure its directories exist
    pub async fn open(
        config: &Config,
        toolchain: Arc<dyn Toolchain>,
        scheduler: Arc<dyn Scheduler>,
    ) -> DuckResult<Self> {
        let store = ArtifactStore::from_config(config);
        store.ensure_dirs().await?;
        Ok(Self::new(
            store,
            toolchain,
            scheduler,
            CacheOptions::from_config(config),
        ))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    // Index

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create the entry for a key and mark it accessed
    ///
    /// The returned entry is active with its memory timer armed. Reviving
    /// happens under the index lock, so an expiry racing this call either
    /// loses to the new timer generation or leaves a removed entry that is
    /// replaced here.
    fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(key) {
            if self.revive(existing) {
                return existing.clone();
            }
        }

        debug!("Creating cache entry: {}", key);
        let entry = Arc::new(CacheEntry::new(key.clone()));
        self.revive(&entry);
        entries.insert(key.clone(), entry.clone());
        entry
    }

    /// Remove an entry from the index unless it was already replaced
    fn detach(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries();
        if entries
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&entry.key);
        }
    }

    /// Number of entries in the index
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Inspect an entry without counting as an access
    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        let entry = self.entries().get(key).cloned()?;
        let state = entry.lock();
        Some(EntrySnapshot {
            key: entry.key.clone(),
            state: state.eviction(),
            source: state.source.status(),
            diagnostics: state.diagnostics.status(),
            audio: state.audio.status(),
            image: state.image.status(),
            source_path: state.source_path.clone(),
            audio_path: state.audio_path.clone(),
            image_path: state.image_path.clone(),
        })
    }

    // Eviction

    /// Record an access: back to active, memory timer restarted
    fn touch(&self, entry: &Arc<CacheEntry>) {
        self.revive(entry);
    }

    /// Mark an entry active and restart its memory timer; false if it was
    /// already removed
    fn revive(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut state = entry.lock();
        if state.eviction() == EvictionState::Removed {
            return false;
        }
        state.eviction = Some(EvictionState::Active);
        let timeout = self.inner.options.policy.memory_timeout;
        self.arm(entry, &mut state, timeout, Self::on_memory_expiry);
        true
    }

    fn arm(
        &self,
        entry: &Arc<CacheEntry>,
        state: &mut EntryState,
        delay: Duration,
        on_fire: fn(&Cache, &Arc<CacheEntry>, u64),
    ) {
        let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(entry);
        let scheduler = self.inner.scheduler.as_ref();
        state.timer.arm(scheduler, delay, move |generation| -> TimerTask {
            Box::new(move || {
                if let (Some(inner), Some(entry)) = (cache.upgrade(), target.upgrade()) {
                    on_fire(&Cache { inner }, &entry, generation);
                }
            })
        });
    }

    fn on_memory_expiry(&self, entry: &Arc<CacheEntry>, generation: u64) {
        let mut state = entry.lock();
        if !state.timer.is_current(generation) || state.eviction() != EvictionState::Active {
            return;
        }
        state.timer.fired();

        let policy = self.inner.options.policy;
        let decision = policy.on_memory_expiry(state.in_flight(), state.has_artifacts());
        match decision {
            MemoryExpiry::KeepAlive => {
                debug!("Derivation in flight, keeping in memory: {}", entry.key);
                self.arm(entry, &mut state, policy.memory_timeout, Self::on_memory_expiry);
            }
            MemoryExpiry::Demote => {
                info!("Clearing from memory: {}", entry.key);
                state.clear_slots();
                state.eviction = Some(EvictionState::MemoryEvicted);
                self.arm(entry, &mut state, policy.disk_timeout, Self::on_disk_expiry);
            }
            MemoryExpiry::Remove => {
                info!("Clearing from memory: {}", entry.key);
                state.clear_slots();
                state.eviction = Some(EvictionState::Removed);
                drop(state);
                self.detach(entry);
            }
        }
    }

    fn on_disk_expiry(&self, entry: &Arc<CacheEntry>, generation: u64) {
        let mut state = entry.lock();
        if !state.timer.is_current(generation) || state.eviction() != EvictionState::MemoryEvicted {
            return;
        }
        state.timer.fired();

        info!("Clearing from disk: {}", entry.key);
        let files = [state.audio_path.take(), state.image_path.take()];
        state.eviction = Some(EvictionState::Removed);
        drop(state);

        for path in files.iter().flatten() {
            self.inner.store.remove(path);
        }
        self.detach(entry);
    }

    // Single-flight

    /// Return the slot's resolved or pending handle, or start `compute`
    fn derive<T>(
        &self,
        entry: &Arc<CacheEntry>,
        stage: Stage,
        select: SlotSelector<T>,
        compute: impl FnOnce() -> BoxFuture<'static, DuckResult<T>>,
    ) -> SharedResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut guard = entry.lock();
        let slot = select(&mut *guard);
        if let Some(handle) = slot.current() {
            debug!("Reusing {} from cache: {}", stage, entry.key);
            return handle;
        }

        let epoch = slot.next_epoch();
        let work = compute();

        let cache = self.clone();
        let owner = entry.clone();
        let task = tokio::spawn(async move {
            let result = work.await;
            cache.settle(&owner, select, epoch, &result);
            result
        });

        let cache = self.clone();
        let owner = entry.clone();
        let handle = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let err = DuckError::Internal(format!("{} derivation aborted: {}", stage, e));
                    cache.settle(&owner, select, epoch, &Err(err.clone()));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        slot.set_pending(epoch, handle.clone());
        handle
    }

    fn settle<T>(
        &self,
        entry: &Arc<CacheEntry>,
        select: SlotSelector<T>,
        epoch: u64,
        result: &DuckResult<T>,
    ) where
        T: Clone + Send + Sync + 'static,
    {
        select(&mut *entry.lock()).settle(epoch, result);
        self.touch(entry);
    }

    async fn acquire_job(&self) -> DuckResult<SemaphorePermit<'_>> {
        self.inner
            .jobs
            .acquire()
            .await
            .map_err(|_| DuckError::Internal("job pool closed".to_string()))
    }

    // Source

    /// Persist source text and return its key
    pub async fn submit(&self, source: &[u8]) -> DuckResult<CacheKey> {
        let key = compute_key(source);
        let entry = self.entry(&key);
        let source: Arc<[u8]> = Arc::from(source);

        let first = self.write_source(&entry, source.clone()).await;
        match first {
            // A bare-hash lookup was in flight and found nothing; write now
            Err(DuckError::NotFound { .. }) => self.write_source(&entry, source).await?,
            other => other?,
        };
        Ok(key)
    }

    async fn write_source(&self, entry: &Arc<CacheEntry>, source: Arc<[u8]>) -> DuckResult<PathBuf> {
        let cache = self.clone();
        let owner = entry.clone();
        self.derive(entry, Stage::Source, EntryState::source_slot, move || {
            async move {
                info!("Write duck: {}", owner.key);
                let path = cache
                    .inner
                    .store
                    .write_source(&owner.key, &source)
                    .await
                    .inspect_err(|e| warn!(key = %owner.key, error = %e, "Error saving code"))?;
                owner.lock().source_path = Some(path.clone());
                Ok(path)
            }
            .boxed()
        })
        .await
    }

    /// Validate a candidate key and make sure an entry exists for it
    pub fn lookup(&self, candidate: &str) -> DuckResult<CacheKey> {
        let key = CacheKey::parse(candidate)?;
        self.entry(&key);
        Ok(key)
    }

    /// Path of the persisted source; `NotFound` if it does not exist
    pub async fn source(&self, key: &CacheKey) -> DuckResult<PathBuf> {
        let entry = self.entry(key);
        self.source_ready(&entry).await
    }

    /// Persisted source text; bytes that are not UTF-8 are replaced
    pub async fn read_source(&self, key: &CacheKey) -> DuckResult<String> {
        let path = self.source(key).await?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| DuckError::disk(format!("reading source {}", path.display()), e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn source_ready(&self, entry: &Arc<CacheEntry>) -> DuckResult<PathBuf> {
        self.touch(entry);
        let cache = self.clone();
        let owner = entry.clone();
        self.derive(entry, Stage::Source, EntryState::source_slot, move || {
            async move { cache.locate_source(&owner).await }.boxed()
        })
        .await
    }

    async fn locate_source(&self, entry: &Arc<CacheEntry>) -> DuckResult<PathBuf> {
        debug!("Load duck: {}", entry.key);
        if self.inner.store.source_exists(&entry.key).await? {
            let path = self.inner.store.source_path(&entry.key);
            entry.lock().source_path = Some(path.clone());
            Ok(path)
        } else {
            warn!(key = %entry.key, "Source not found");
            Err(DuckError::NotFound {
                key: entry.key.to_string(),
            })
        }
    }

    // Diagnostics

    /// Check the source stored under `key`
    pub async fn check(&self, key: &CacheKey) -> DuckResult<Diagnostics> {
        let entry = self.entry(key);
        let cache = self.clone();
        let owner = entry.clone();
        self.derive(&entry, Stage::Check, EntryState::diagnostics_slot, move || {
            async move { cache.run_check(&owner).await }.boxed()
        })
        .await
    }

    /// Submit source and check it
    pub async fn check_source(&self, source: &[u8]) -> DuckResult<Diagnostics> {
        let key = self.submit(source).await?;
        self.check(&key).await
    }

    async fn run_check(&self, entry: &Arc<CacheEntry>) -> DuckResult<Diagnostics> {
        let source = self.source_ready(entry).await?;
        let _permit = self.acquire_job().await?;

        debug!("Checking syntax: {}", entry.key);
        let output = self
            .inner
            .toolchain
            .check(&source)
            .await
            .map_err(|e| self.tool_error(&entry.key, Stage::Check, Tool::Compiler, e))?;

        if output.success() {
            return Ok(Diagnostics {
                hash: entry.key.to_string(),
                errors: None,
            });
        }

        match self.compile_failure(&entry.key, Stage::Check, &output) {
            DuckError::Diagnostic { message, .. } => Ok(Diagnostics {
                hash: entry.key.to_string(),
                errors: Some(message),
            }),
            other => Err(other),
        }
    }

    // Renders

    /// Rendered audio for `key`, compiling and encoding it if needed
    pub async fn audio(&self, key: &CacheKey) -> DuckResult<PathBuf> {
        let entry = self.entry(key);
        self.audio_of(&entry).await
    }

    /// Rendered waveform image for `key`, rendering audio first if needed
    pub async fn image(&self, key: &CacheKey) -> DuckResult<PathBuf> {
        let entry = self.entry(key);
        let cache = self.clone();
        let owner = entry.clone();
        self.derive(&entry, Stage::Image, EntryState::image_slot, move || {
            async move { cache.render_image(&owner).await }.boxed()
        })
        .await
    }

    async fn audio_of(&self, entry: &Arc<CacheEntry>) -> DuckResult<PathBuf> {
        self.touch(entry);
        let cache = self.clone();
        let owner = entry.clone();
        self.derive(entry, Stage::Audio, EntryState::audio_slot, move || {
            async move { cache.render_audio(&owner).await }.boxed()
        })
        .await
    }

    fn recorded_artifact(&self, entry: &CacheEntry, kind: ArtifactKind) -> Option<PathBuf> {
        entry.lock().artifact_path(kind).clone()
    }

    fn record_artifact(&self, entry: &CacheEntry, kind: ArtifactKind, path: Option<PathBuf>) {
        *entry.lock().artifact_path(kind) = path;
    }

    /// A render kept on disk across memory eviction
    async fn reload(&self, entry: &CacheEntry, kind: ArtifactKind) -> Option<PathBuf> {
        let path = self.recorded_artifact(entry, kind)?;
        if self.inner.store.artifact_exists(&path).await {
            info!("Reloading {} from disk: {}", kind, entry.key);
            Some(path)
        } else {
            debug!("Recorded {} is gone from disk: {}", kind, path.display());
            self.record_artifact(entry, kind, None);
            None
        }
    }

    async fn render_audio(&self, entry: &Arc<CacheEntry>) -> DuckResult<PathBuf> {
        if let Some(path) = self.reload(entry, ArtifactKind::Audio).await {
            return Ok(path);
        }

        let key = &entry.key;
        let store = &self.inner.store;
        let source = self.source_ready(entry).await?;
        let _permit = self.acquire_job().await?;

        let executable = store.scratch_executable(key);
        info!("Generate audio: {} => {}", key, store.render_path(key, ArtifactKind::Audio).display());

        let compiled = self
            .inner
            .toolchain
            .compile(&source, executable.path())
            .await
            .map_err(|e| self.tool_error(key, Stage::Audio, Tool::Compiler, e))?;
        if !compiled.success() {
            return Err(self.compile_failure(key, Stage::Audio, &compiled));
        }
        executable.make_executable().await?;

        let staging = store.staging_render(key, ArtifactKind::Audio);
        let encoded = self
            .inner
            .toolchain
            .encode_audio(executable.path(), staging.path(), self.inner.options.process_timeout)
            .await
            .map_err(|e| self.tool_error(key, Stage::Audio, Tool::Encoder, e));
        drop(executable);

        let encoded = encoded?;
        if !encoded.success() {
            warn!(key = %key, exit_code = ?encoded.consumer.exit_code, "Encoding failed");
            return Err(DuckError::EncodingFailure {
                key: key.to_string(),
                stage: Stage::Audio,
                exit_code: encoded.consumer.exit_code,
                signal: encoded.consumer.signal,
                stderr: encoded.stderr(),
            });
        }

        let path = store.commit_render(staging, key, ArtifactKind::Audio).await?;
        self.record_artifact(entry, ArtifactKind::Audio, Some(path.clone()));
        Ok(path)
    }

    async fn render_image(&self, entry: &Arc<CacheEntry>) -> DuckResult<PathBuf> {
        if let Some(path) = self.reload(entry, ArtifactKind::Image).await {
            return Ok(path);
        }

        let audio = self.audio_of(entry).await?;

        let key = &entry.key;
        let store = &self.inner.store;
        let _permit = self.acquire_job().await?;

        let staging = store.staging_render(key, ArtifactKind::Image);
        info!("Generate image: {} => {}", key, store.render_path(key, ArtifactKind::Image).display());

        let output = self
            .inner
            .toolchain
            .render_waveform(&audio, staging.path(), self.inner.options.process_timeout)
            .await
            .map_err(|e| self.tool_error(key, Stage::Image, Tool::Renderer, e))?;
        if !output.success() {
            warn!(key = %key, exit_code = ?output.exit_code, "Image generation failed");
            return Err(DuckError::EncodingFailure {
                key: key.to_string(),
                stage: Stage::Image,
                exit_code: output.exit_code,
                signal: output.signal,
                stderr: output.stderr,
            });
        }

        let path = store.commit_render(staging, key, ArtifactKind::Image).await?;
        self.record_artifact(entry, ArtifactKind::Image, Some(path.clone()));
        Ok(path)
    }

    // Error mapping

    /// Classify a nonzero compiler exit
    fn compile_failure(&self, key: &CacheKey, stage: Stage, output: &ToolOutput) -> DuckError {
        match parse_diagnostics(&output.stderr) {
            Some(message) => {
                warn!(key = %key, %stage, "Compilation failed");
                DuckError::Diagnostic {
                    key: key.to_string(),
                    stage,
                    message,
                }
            }
            None => {
                error!(key = %key, %stage, exit_code = ?output.exit_code, "Internal compiler error");
                DuckError::InternalCompiler {
                    key: key.to_string(),
                    stage,
                    exit_code: output.exit_code,
                    stderr: output.stderr.clone(),
                }
            }
        }
    }

    fn tool_error(&self, key: &CacheKey, stage: Stage, tool: Tool, err: ToolError) -> DuckError {
        let mapped = match (tool, err) {
            (_, ToolError::Spawn { program, source }) => {
                DuckError::spawn(tool, program, stage, source)
            }
            (Tool::Compiler, ToolError::TimedOut { deadline }) => DuckError::InternalCompiler {
                key: key.to_string(),
                stage,
                exit_code: None,
                stderr: format!("compiler did not finish within {:?}", deadline),
            },
            (Tool::Compiler, ToolError::Io { context, source }) => DuckError::InternalCompiler {
                key: key.to_string(),
                stage,
                exit_code: None,
                stderr: format!("{}: {}", context, source),
            },
            (_, ToolError::TimedOut { deadline }) => DuckError::EncodingTimeout {
                key: key.to_string(),
                stage,
                deadline,
            },
            (_, ToolError::Io { context, source }) => DuckError::EncodingFailure {
                key: key.to_string(),
                stage,
                exit_code: None,
                signal: None,
                stderr: format!("{}: {}", context, source),
            },
        };
        if mapped.kind() == ErrorKind::InternalCompilerError {
            error!(key = %key, %stage, error = %mapped, "Compiler failed to run");
        } else {
            warn!(key = %key, %stage, error = %mapped, "External tool failed");
        }
        mapped
    }
}
