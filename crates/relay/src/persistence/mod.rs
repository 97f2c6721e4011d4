// Durable canvas snapshot store.
//
// One authoritative snapshot per canvas id lives in memory. Mutations mark
// it dirty and (re)start a debounce timer; when the timer fires the snapshot
// is written on a blocking worker. At most one write per id is in flight.
// Every mutation bumps a generation counter so a finished write can tell
// whether newer data arrived while it ran.

pub mod files;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use canvasync_common::types::{CanvasSnapshot, Stroke, StrokePoint, DEFAULT_CANVAS_ID};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::memory::GovernorHandle;
use crate::metrics;
use crate::validation::{validate_snapshot, Limits, ValidationError};

pub use files::CanvasFiles;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("canvas `{0}` is not loaded")]
    NotLoaded(String),
    #[error("invalid canvas state: {0}")]
    Invalid(#[from] ValidationError),
    #[error("canvas write failed: {0:#}")]
    Write(anyhow::Error),
    #[error("persistence worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Drawing mutations replayed onto a cached snapshot. Stroke ids are
/// client-chosen, so strokes are addressed by owner and id together.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasCommand {
    StartStroke(Stroke),
    AppendPoint { owner_id: String, stroke_id: String, point: StrokePoint, sequence: u64 },
    EndStroke { owner_id: String, stroke_id: String, forced: bool, at: DateTime<Utc>, sequence: u64 },
    Clear { sequence: u64 },
}

impl CanvasCommand {
    /// Server sequence the command was issued under.
    pub fn sequence(&self) -> u64 {
        match self {
            Self::StartStroke(stroke) => stroke.server_sequence,
            Self::AppendPoint { sequence, .. } | Self::EndStroke { sequence, .. } | Self::Clear { sequence } => {
                *sequence
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written { bytes: u64 },
    /// Nothing newer than the last durable write.
    Clean,
    /// Another write for this id holds the guard.
    InFlight,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub cached: Vec<String>,
    pub dirty: Vec<String>,
    pub in_flight: Vec<String>,
    pub flushes: u64,
    pub failures: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

struct CachedCanvas {
    snapshot: CanvasSnapshot,
    generation: u64,
    persisted_generation: u64,
    /// Pending debounce timer and the token identifying it.
    pending: Option<(u64, JoinHandle<()>)>,
    writing: bool,
}

impl CachedCanvas {
    fn new(snapshot: CanvasSnapshot) -> Self {
        Self { snapshot, generation: 0, persisted_generation: 0, pending: None, writing: false }
    }

    fn is_dirty(&self) -> bool {
        self.generation > self.persisted_generation
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.snapshot.last_modified = Utc::now();
    }
}

#[derive(Default)]
struct StoreState {
    canvases: HashMap<String, CachedCanvas>,
    next_timer: u64,
    flushes: u64,
    failures: u64,
    last_flush_at: Option<DateTime<Utc>>,
}

struct StoreInner {
    files: CanvasFiles,
    limits: Limits,
    debounce: Duration,
    governor: Option<GovernorHandle>,
    state: Mutex<StoreState>,
}

/// Cloneable handle to the snapshot store.
#[derive(Clone)]
pub struct CanvasStore {
    inner: Arc<StoreInner>,
}

impl CanvasStore {
    pub fn new(files: CanvasFiles, limits: Limits, debounce: Duration) -> Self {
        Self::build(files, limits, debounce, None)
    }

    /// Non-default canvases are registered with the governor so idle clean
    /// ones can be dropped from memory under pressure.
    pub fn with_governor(
        files: CanvasFiles,
        limits: Limits,
        debounce: Duration,
        governor: GovernorHandle,
    ) -> Self {
        Self::build(files, limits, debounce, Some(governor))
    }

    fn build(
        files: CanvasFiles,
        limits: Limits,
        debounce: Duration,
        governor: Option<GovernorHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                files,
                limits,
                debounce,
                governor,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn files(&self) -> &CanvasFiles {
        &self.inner.files
    }

    // ── Load path ──────────────────────────────────────────────────

    /// Cache, then disk, then a fresh empty snapshot. Unreadable disk
    /// state is logged and treated as absent.
    pub async fn load(&self, canvas_id: &str) -> Result<CanvasSnapshot, PersistenceError> {
        if let Some(snapshot) = self.snapshot(canvas_id) {
            return Ok(snapshot);
        }

        let files = self.inner.files.clone();
        let limits = self.inner.limits;
        let id = canvas_id.to_string();
        let from_disk = tokio::task::spawn_blocking(move || files.read(&id, &limits)).await?;
        let loaded = match from_disk {
            Ok(Some(snapshot)) => {
                debug!(canvas_id, strokes = snapshot.strokes.len(), "canvas loaded from disk");
                snapshot
            }
            Ok(None) => CanvasSnapshot::empty(canvas_id),
            Err(error) => {
                warn!(canvas_id, error = %format!("{error:#}"), "ignoring unreadable canvas file");
                CanvasSnapshot::empty(canvas_id)
            }
        };

        // Another caller may have filled the cache while we were reading.
        let (snapshot, inserted) = {
            let mut state = self.state();
            match state.canvases.get(canvas_id) {
                Some(existing) => (existing.snapshot.clone(), false),
                None => {
                    state.canvases.insert(canvas_id.to_string(), CachedCanvas::new(loaded.clone()));
                    (loaded, true)
                }
            }
        };
        if inserted {
            self.register_with_governor(canvas_id);
        }
        Ok(snapshot)
    }

    /// Cached snapshot without touching disk.
    pub fn snapshot(&self, canvas_id: &str) -> Option<CanvasSnapshot> {
        let snapshot = self.state().canvases.get(canvas_id).map(|cached| cached.snapshot.clone());
        if snapshot.is_some() {
            if let Some(governor) = &self.inner.governor {
                governor.touch(&resource_id(canvas_id));
            }
        }
        snapshot
    }

    fn register_with_governor(&self, canvas_id: &str) {
        let Some(governor) = &self.inner.governor else { return };
        if canvas_id == DEFAULT_CANVAS_ID {
            return;
        }
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let id = canvas_id.to_string();
        governor.register(resource_id(canvas_id), move || {
            if let Some(inner) = weak.upgrade() {
                let store = CanvasStore { inner };
                if !store.evict(&id) {
                    store.register_with_governor(&id);
                }
            }
        });
    }

    /// Drop a clean, idle canvas from memory. Dirty or in-flight canvases
    /// stay cached.
    pub fn evict(&self, canvas_id: &str) -> bool {
        let mut state = self.state();
        let evictable = state
            .canvases
            .get(canvas_id)
            .is_some_and(|cached| !cached.is_dirty() && !cached.writing && cached.pending.is_none());
        if evictable {
            state.canvases.remove(canvas_id);
            debug!(canvas_id, "evicted cached canvas");
        }
        evictable
    }

    // ── Mutations ──────────────────────────────────────────────────

    pub fn apply(&self, canvas_id: &str, command: CanvasCommand) -> Result<(), PersistenceError> {
        {
            let mut state = self.state();
            let cached = state
                .canvases
                .get_mut(canvas_id)
                .ok_or_else(|| PersistenceError::NotLoaded(canvas_id.to_string()))?;
            let snapshot = &mut cached.snapshot;
            // Recorded even when the target stroke is gone, so a restart
            // never reissues a sequence peers have already seen.
            snapshot.last_sequence = snapshot.last_sequence.max(command.sequence());
            match command {
                CanvasCommand::StartStroke(stroke) => snapshot.strokes.push(stroke),
                CanvasCommand::AppendPoint { owner_id, stroke_id, point, .. } => {
                    match snapshot.stroke_mut(&owner_id, &stroke_id) {
                        Some(stroke) if !stroke.completed => stroke.points.push(point),
                        _ => debug!(canvas_id, owner_id, stroke_id, "point for unknown or closed stroke"),
                    }
                }
                CanvasCommand::EndStroke { owner_id, stroke_id, forced, at, .. } => {
                    match snapshot.stroke_mut(&owner_id, &stroke_id) {
                        Some(stroke) => stroke.finish(forced, at),
                        None => debug!(canvas_id, owner_id, stroke_id, "end for unknown stroke"),
                    }
                }
                CanvasCommand::Clear { .. } => {
                    snapshot.strokes.clear();
                    snapshot.image_data = None;
                }
            }
            cached.touch();
        }
        self.schedule_flush(canvas_id);
        Ok(())
    }

    /// Replace the cached snapshot with a client-provided state.
    pub fn save_canvas_state(
        &self,
        canvas_id: &str,
        mut snapshot: CanvasSnapshot,
    ) -> Result<(), PersistenceError> {
        snapshot.canvas_id = canvas_id.to_string();
        validate_snapshot(&snapshot, &self.inner.limits)?;
        let inserted = {
            let mut state = self.state();
            match state.canvases.get_mut(canvas_id) {
                Some(cached) => {
                    snapshot.last_sequence = snapshot.last_sequence.max(cached.snapshot.last_sequence);
                    cached.snapshot = snapshot;
                    cached.touch();
                    false
                }
                None => {
                    let mut cached = CachedCanvas::new(snapshot);
                    cached.touch();
                    state.canvases.insert(canvas_id.to_string(), cached);
                    true
                }
            }
        };
        if inserted {
            self.register_with_governor(canvas_id);
        }
        self.schedule_flush(canvas_id);
        Ok(())
    }

    // ── Flushing ───────────────────────────────────────────────────

    /// Restart the debounce timer for `canvas_id`.
    fn schedule_flush(&self, canvas_id: &str) {
        let mut state = self.state();
        state.next_timer += 1;
        let token = state.next_timer;
        let Some(cached) = state.canvases.get_mut(canvas_id) else { return };
        if let Some((_, previous)) = cached.pending.take() {
            previous.abort();
        }

        let store = self.clone();
        let id = canvas_id.to_string();
        let debounce = self.inner.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Once the timer is claimed it can no longer be aborted mid-write.
            if !store.claim_timer(&id, token) {
                return;
            }
            if let Err(error) = store.flush(&id).await {
                error!(canvas_id = %id, error = %error, "debounced canvas flush failed");
            }
        });
        cached.pending = Some((token, handle));
    }

    fn claim_timer(&self, canvas_id: &str, token: u64) -> bool {
        let mut state = self.state();
        match state.canvases.get_mut(canvas_id) {
            Some(cached) if cached.pending.as_ref().is_some_and(|(current, _)| *current == token) => {
                cached.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Write the cached snapshot now unless another write holds the guard.
    /// When newer data arrives during the write, another flush is scheduled.
    pub async fn flush(&self, canvas_id: &str) -> Result<FlushOutcome, PersistenceError> {
        let (snapshot, generation) = {
            let mut state = self.state();
            let cached = state
                .canvases
                .get_mut(canvas_id)
                .ok_or_else(|| PersistenceError::NotLoaded(canvas_id.to_string()))?;
            if cached.writing {
                debug!(canvas_id, "flush skipped, write already in flight");
                return Ok(FlushOutcome::InFlight);
            }
            if !cached.is_dirty() {
                return Ok(FlushOutcome::Clean);
            }
            cached.writing = true;
            (cached.snapshot.clone(), cached.generation)
        };

        let started = Instant::now();
        let files = self.inner.files.clone();
        let result = match tokio::task::spawn_blocking(move || files.write(&snapshot)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(error)) => Err(PersistenceError::Write(error)),
            Err(join_error) => Err(PersistenceError::Worker(join_error)),
        };

        let still_dirty = {
            let mut state = self.state();
            match &result {
                Ok(_) => {
                    state.flushes += 1;
                    state.last_flush_at = Some(Utc::now());
                }
                Err(_) => state.failures += 1,
            }
            match state.canvases.get_mut(canvas_id) {
                Some(cached) => {
                    cached.writing = false;
                    if result.is_ok() {
                        cached.persisted_generation = cached.persisted_generation.max(generation);
                    }
                    cached.is_dirty()
                }
                None => false,
            }
        };

        metrics::record_canvas_flush(result.as_ref().ok().copied());
        if still_dirty {
            self.schedule_flush(canvas_id);
        }

        let bytes = result?;
        debug!(
            canvas_id,
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "canvas flushed"
        );
        Ok(FlushOutcome::Written { bytes })
    }

    /// Flush every dirty canvas, waiting out in-flight writes, bounded by
    /// `timeout`. Returns the ids still dirty when the wait ended.
    pub async fn flush_all(&self, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let dirty = self.cancel_timers_and_list_dirty();
            if dirty.is_empty() {
                return dirty;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = dirty.len(), "flush deadline reached with dirty canvases");
                return dirty;
            }

            let mut waiting = false;
            for canvas_id in &dirty {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout(remaining, self.flush(canvas_id)).await {
                    Ok(Ok(FlushOutcome::InFlight)) => waiting = true,
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        error!(canvas_id = %canvas_id, error = %error, "shutdown flush failed");
                        waiting = true;
                    }
                    Err(_) => waiting = true,
                }
            }
            if waiting {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    fn cancel_timers_and_list_dirty(&self) -> Vec<String> {
        let mut state = self.state();
        let mut dirty = Vec::new();
        for (canvas_id, cached) in state.canvases.iter_mut() {
            if let Some((_, handle)) = cached.pending.take() {
                handle.abort();
            }
            if cached.is_dirty() {
                dirty.push(canvas_id.clone());
            }
        }
        dirty.sort();
        dirty
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Copy every durable canvas into the backup set and prune each set to
    /// `retention` entries.
    pub async fn backup_all(&self, retention: usize) -> Result<usize, PersistenceError> {
        let files = self.inner.files.clone();
        let copied = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let mut copied = 0;
            for canvas_id in files.list_canvas_ids()? {
                if files.backup(&canvas_id)?.is_some() {
                    copied += 1;
                }
                let removed = files.prune_backups(&canvas_id, retention)?;
                if removed > 0 {
                    debug!(canvas_id = %canvas_id, removed, "pruned old backups");
                }
            }
            Ok(copied)
        })
        .await?
        .map_err(PersistenceError::Write)?;
        info!(copied, "canvas backup complete");
        Ok(copied)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state();
        let mut cached = Vec::new();
        let mut dirty = Vec::new();
        let mut in_flight = Vec::new();
        for (canvas_id, canvas) in &state.canvases {
            cached.push(canvas_id.clone());
            if canvas.is_dirty() {
                dirty.push(canvas_id.clone());
            }
            if canvas.writing {
                in_flight.push(canvas_id.clone());
            }
        }
        cached.sort();
        dirty.sort();
        in_flight.sort();
        StoreStats {
            cached,
            dirty,
            in_flight,
            flushes: state.flushes,
            failures: state.failures,
            last_flush_at: state.last_flush_at,
        }
    }
}

fn resource_id(canvas_id: &str) -> String {
    format!("canvas:{canvas_id}")
}

/// Periodic backup loop; exits when `shutdown` flips to true.
pub fn spawn_backup_task(
    store: CanvasStore,
    interval: Duration,
    retention: usize,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = store.backup_all(retention).await {
                        error!(error = %error, "canvas backup failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
