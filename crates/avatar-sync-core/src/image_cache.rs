//! Content-addressed, chunk-scoped cache of decoded overlay images.
//!
//! Entries are keyed by [`CacheKey`] and owned by one or more chunk indices.
//! An entry exists ("cached") as soon as its bytes are handed over; it only
//! becomes usable ("decoded") once a background worker has decoded it. The
//! two are tracked separately so a frame is never treated as ready in the
//! window between allocation and decode completion.
//!
//! Decoding runs on a small pool of worker threads fed over a crossbeam
//! channel. Results are published under a short-held lock and announced as
//! [`CacheEvent`]s that the tick thread drains.
//!
//! Every decode job carries a ticket. A completion is only applied if the
//! entry it was issued for still exists and still carries that ticket, so
//! evicting or clearing an entry while its decode is in flight can never
//! resurrect it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::diagnostics::EngineMetrics;
use crate::error::EngineError;
use crate::types::{CacheKey, DecodedImage, ImageHandle};

/// Turns encoded image bytes into pixels. Called on worker threads.
pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, EngineError>;
}

/// Decodes PNG and JPEG payloads to RGBA8 with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterDecoder;

impl ImageDecoder for RasterDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, EngineError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| EngineError::DecodeFailed(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage::new(width, height, rgba.into_raw()))
    }
}

/// Resolution state of one key as seen by playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// No entry for the key
    Missing,
    /// Bytes received, decode in flight
    Decoding,
    /// Decoded and drawable
    Ready,
    /// Decode failed; this key will not become ready unless new bytes arrive
    Failed,
}

impl FrameStatus {
    /// True once the key has reached a final state (ready or failed).
    pub fn is_resolved(self) -> bool {
        matches!(self, FrameStatus::Ready | FrameStatus::Failed)
    }
}

/// Announcements from the cache to the tick thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Decoded { key: CacheKey },
    DecodeFailed { key: CacheKey, reason: String },
    /// Every key of a watched chunk has resolved
    ChunkPopulated { chunk_index: u32 },
}

struct CacheNotice {
    generation: u64,
    event: CacheEvent,
}

enum EntryState {
    Decoding,
    Decoded(ImageHandle),
    Failed,
}

struct CacheEntry {
    state: EntryState,
    /// Chunks that reference this key; the entry lives while any remain
    owners: Vec<u32>,
    cost: usize,
    ticket: u64,
}

impl CacheEntry {
    fn status(&self) -> FrameStatus {
        match self.state {
            EntryState::Decoding => FrameStatus::Decoding,
            EntryState::Decoded(_) => FrameStatus::Ready,
            EntryState::Failed => FrameStatus::Failed,
        }
    }

    fn add_owner(&mut self, chunk_index: u32) {
        if !self.owners.contains(&chunk_index) {
            self.owners.push(chunk_index);
        }
    }
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    total_bytes: usize,
    /// Watched chunks and the keys they still wait on
    watches: HashMap<u32, HashSet<CacheKey>>,
}

impl CacheState {
    /// Removes `key` from every watch, returning chunks that became fully populated.
    fn resolve_watches(&mut self, key: &CacheKey) -> Vec<u32> {
        let mut populated = Vec::new();
        for (chunk_index, pending) in self.watches.iter_mut() {
            if pending.remove(key) && pending.is_empty() {
                populated.push(*chunk_index);
            }
        }
        for chunk_index in &populated {
            self.watches.remove(chunk_index);
        }
        populated
    }
}

enum WorkerJob {
    Decode {
        key: CacheKey,
        bytes: Bytes,
        ticket: u64,
    },
    Evict(Vec<u32>),
    Stop,
}

struct CacheShared {
    state: Mutex<CacheState>,
    decoder: Arc<dyn ImageDecoder>,
    metrics: EngineMetrics,
    generation: AtomicU64,
    next_ticket: AtomicU64,
    in_flight: AtomicUsize,
    events: Sender<CacheNotice>,
    max_entries: usize,
    max_bytes: usize,
}

impl CacheShared {
    fn issue_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, generation: u64, events: impl IntoIterator<Item = CacheEvent>) {
        for event in events {
            let _ = self.events.send(CacheNotice { generation, event });
        }
    }

    fn is_current(&self, key: &CacheKey, ticket: u64) -> bool {
        let state = self.state.lock();
        matches!(
            state.entries.peek(key),
            Some(entry) if entry.ticket == ticket && matches!(entry.state, EntryState::Decoding)
        )
    }

    /// Applies a decode result if its entry is still waiting on this ticket.
    fn complete(&self, key: CacheKey, ticket: u64, result: Result<DecodedImage, EngineError>) {
        let mut events = Vec::new();
        let mut evicted = Vec::new();
        let generation;
        {
            let mut state = self.state.lock();
            generation = self.generation.load(Ordering::Acquire);

            let applied = match state.entries.peek_mut(&key) {
                Some(entry)
                    if entry.ticket == ticket && matches!(entry.state, EntryState::Decoding) =>
                {
                    match result {
                        Ok(image) => {
                            let cost = image.byte_cost();
                            entry.state = EntryState::Decoded(Arc::new(image));
                            entry.cost = cost;
                            Some(Ok(cost))
                        }
                        Err(e) => {
                            entry.state = EntryState::Failed;
                            Some(Err(e.to_string()))
                        }
                    }
                }
                _ => None,
            };

            let resolved = applied.is_some();
            match applied {
                Some(Ok(cost)) => {
                    state.total_bytes += cost;
                    state.entries.promote(&key);
                    tracing::trace!("Decoded overlay {}", key);
                    events.push(CacheEvent::Decoded { key: key.clone() });
                }
                Some(Err(reason)) => {
                    tracing::warn!("Overlay {} failed to decode: {}", key, reason);
                    self.metrics.record_decode_failure();
                    events.push(CacheEvent::DecodeFailed {
                        key: key.clone(),
                        reason,
                    });
                }
                None => {
                    tracing::debug!("Discarding stale decode completion for {}", key);
                    self.metrics.record_stale_completion();
                }
            }

            if resolved {
                events.extend(
                    state
                        .resolve_watches(&key)
                        .into_iter()
                        .map(|chunk_index| CacheEvent::ChunkPopulated { chunk_index }),
                );
                evicted = self.enforce_bounds(&mut state);
            }
        }
        drop(evicted);
        self.emit(generation, events);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drops least-recently-used entries until both bounds hold.
    fn enforce_bounds(&self, state: &mut CacheState) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while (state.entries.len() > self.max_entries || state.total_bytes > self.max_bytes)
            && state.entries.len() > 1
        {
            let Some((key, entry)) = state.entries.pop_lru() else {
                break;
            };
            state.total_bytes = state.total_bytes.saturating_sub(entry.cost);
            self.metrics.record_pressure_eviction();
            tracing::debug!("Cache pressure evicted {}", key);
            evicted.push(entry);
        }
        evicted
    }

    fn evict(&self, chunk_indices: &[u32]) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut state = self.state.lock();
            let doomed: Vec<CacheKey> = state
                .entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    let before = entry.owners.len();
                    entry.owners.retain(|o| !chunk_indices.contains(o));
                    (before > 0 && entry.owners.is_empty()).then(|| key.clone())
                })
                .collect();

            let mut removed = Vec::with_capacity(doomed.len());
            for key in &doomed {
                if let Some(entry) = state.entries.pop(key) {
                    state.total_bytes = state.total_bytes.saturating_sub(entry.cost);
                    removed.push(entry);
                }
            }
            for chunk_index in chunk_indices {
                state.watches.remove(chunk_index);
            }
            removed
        };
        if !removed.is_empty() {
            tracing::debug!(
                "Evicted {} overlay images for chunks {:?}",
                removed.len(),
                chunk_indices
            );
        }
        removed.len()
    }
}

/// Thread-safe image cache with background decode workers.
pub struct ImageCache {
    shared: Arc<CacheShared>,
    jobs: Sender<WorkerJob>,
    events: Receiver<CacheNotice>,
    workers: Vec<JoinHandle<()>>,
}

impl ImageCache {
    /// Creates a cache and spawns `config.decode_workers` decode threads.
    pub fn new(config: &EngineConfig, decoder: Arc<dyn ImageDecoder>, metrics: EngineMetrics) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<WorkerJob>();

        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                watches: HashMap::new(),
            }),
            decoder,
            metrics,
            generation: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            events: events_tx,
            max_entries: config.cache_max_entries.max(1),
            max_bytes: config.cache_max_bytes.max(1),
        });

        let mut workers = Vec::new();
        for i in 0..config.decode_workers.max(1) {
            let shared = Arc::clone(&shared);
            let jobs = jobs_rx.clone();
            match thread::Builder::new()
                .name(format!("overlay-decode-{i}"))
                .spawn(move || decode_loop(shared, jobs))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!("Failed to spawn decode worker: {}", e),
            }
        }
        if workers.is_empty() {
            tracing::warn!("No decode workers running, decoding on the caller thread");
        }

        Self {
            shared,
            jobs: jobs_tx,
            events: events_rx,
            workers,
        }
    }

    /// Stores encoded bytes for `key` and schedules a decode.
    ///
    /// If the key is already decoding or decoded, only the owner is added.
    /// A previously failed key is retried with the new bytes.
    pub fn put(&self, key: CacheKey, bytes: Bytes, chunk_owner: u32) {
        let ticket = {
            let mut state = self.shared.state.lock();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.add_owner(chunk_owner);
                match entry.state {
                    EntryState::Decoding | EntryState::Decoded(_) => return,
                    EntryState::Failed => {
                        entry.state = EntryState::Decoding;
                        entry.ticket = self.shared.issue_ticket();
                        entry.ticket
                    }
                }
            } else {
                let ticket = self.shared.issue_ticket();
                state.entries.put(
                    key.clone(),
                    CacheEntry {
                        state: EntryState::Decoding,
                        owners: vec![chunk_owner],
                        cost: 0,
                        ticket,
                    },
                );
                drop(self.shared.enforce_bounds(&mut state));
                ticket
            }
        };

        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.workers.is_empty() {
            let result = self.shared.decoder.decode(&bytes);
            self.shared.complete(key, ticket, result);
        } else {
            let _ = self.jobs.send(WorkerJob::Decode { key, bytes, ticket });
        }
    }

    /// Stores an already decoded image. Any decode in flight for the key is
    /// superseded.
    pub fn put_decoded(&self, key: CacheKey, image: ImageHandle, chunk_owner: u32) {
        let mut events = vec![CacheEvent::Decoded { key: key.clone() }];
        let generation;
        let evicted = {
            let mut state = self.shared.state.lock();
            generation = self.shared.generation.load(Ordering::Acquire);
            let cost = image.byte_cost();
            let ticket = self.shared.issue_ticket();
            let previous_cost = match state.entries.get_mut(&key) {
                Some(entry) => {
                    entry.add_owner(chunk_owner);
                    let previous = entry.cost;
                    entry.state = EntryState::Decoded(image);
                    entry.cost = cost;
                    entry.ticket = ticket;
                    previous
                }
                None => {
                    state.entries.put(
                        key.clone(),
                        CacheEntry {
                            state: EntryState::Decoded(image),
                            owners: vec![chunk_owner],
                            cost,
                            ticket,
                        },
                    );
                    0
                }
            };
            state.total_bytes = state.total_bytes.saturating_sub(previous_cost) + cost;
            events.extend(
                state
                    .resolve_watches(&key)
                    .into_iter()
                    .map(|chunk_index| CacheEvent::ChunkPopulated { chunk_index }),
            );
            self.shared.enforce_bounds(&mut state)
        };
        drop(evicted);
        self.shared.emit(generation, events);
    }

    /// Returns the decoded image for `key`, marking it recently used.
    pub fn get(&self, key: &CacheKey) -> Option<ImageHandle> {
        let mut state = self.shared.state.lock();
        match state.entries.get(key) {
            Some(CacheEntry {
                state: EntryState::Decoded(image),
                ..
            }) => Some(Arc::clone(image)),
            _ => None,
        }
    }

    pub fn status(&self, key: &CacheKey) -> FrameStatus {
        let state = self.shared.state.lock();
        state
            .entries
            .peek(key)
            .map_or(FrameStatus::Missing, CacheEntry::status)
    }

    /// True iff the key is both cached and decoded.
    pub fn is_ready(&self, key: &CacheKey) -> bool {
        self.status(key) == FrameStatus::Ready
    }

    /// True if an entry exists for the key, decoded or not.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shared.state.lock().entries.contains(key)
    }

    /// Releases the given chunks' ownership. Entries left without an owner
    /// are dropped. Returns the number of entries removed.
    pub fn evict(&self, chunk_indices: &[u32]) -> usize {
        self.shared.evict(chunk_indices)
    }

    /// Same as [`ImageCache::evict`], run on a decode worker.
    pub fn evict_async(&self, chunk_indices: Vec<u32>) {
        if self.workers.is_empty() {
            self.shared.evict(&chunk_indices);
        } else if let Err(e) = self.jobs.send(WorkerJob::Evict(chunk_indices)) {
            if let WorkerJob::Evict(chunk_indices) = e.into_inner() {
                self.shared.evict(&chunk_indices);
            }
        }
    }

    /// Drops every entry and watch, and invalidates all pending events and
    /// in-flight decodes.
    pub fn clear_all(&self) {
        let old = {
            let mut state = self.shared.state.lock();
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            state.total_bytes = 0;
            state.watches.clear();
            std::mem::replace(&mut state.entries, LruCache::unbounded())
        };
        tracing::debug!("Cache cleared ({} entries)", old.len());
    }

    /// Registers `chunk_index` as an owner of `keys` and tracks when all of
    /// them have resolved. Emits [`CacheEvent::ChunkPopulated`] immediately
    /// if they already have.
    pub fn watch_chunk<'a>(&self, chunk_index: u32, keys: impl IntoIterator<Item = &'a CacheKey>) {
        let generation;
        let populated = {
            let mut state = self.shared.state.lock();
            generation = self.shared.generation.load(Ordering::Acquire);
            let mut pending = HashSet::new();
            for key in keys {
                match state.entries.peek_mut(key) {
                    Some(entry) => {
                        entry.add_owner(chunk_index);
                        if !entry.status().is_resolved() {
                            pending.insert(key.clone());
                        }
                    }
                    None => {
                        pending.insert(key.clone());
                    }
                }
            }
            if pending.is_empty() {
                true
            } else {
                state.watches.insert(chunk_index, pending);
                false
            }
        };
        if populated {
            self.shared
                .emit(generation, [CacheEvent::ChunkPopulated { chunk_index }]);
        }
    }

    /// Takes all events published since the last call, skipping those from
    /// before the most recent [`ImageCache::clear_all`].
    pub fn drain_events(&self) -> Vec<CacheEvent> {
        let generation = self.generation();
        self.events
            .try_iter()
            .filter(|notice| notice.generation == generation)
            .map(|notice| notice.event)
            .collect()
    }

    /// Decodes queued or running, including stale ones.
    pub fn pending_decodes(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by decoded images.
    pub fn total_bytes(&self) -> usize {
        self.shared.state.lock().total_bytes
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.jobs.send(WorkerJob::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn decode_loop(shared: Arc<CacheShared>, jobs: Receiver<WorkerJob>) {
    while let Ok(job) = jobs.recv() {
        match job {
            WorkerJob::Decode { key, bytes, ticket } => {
                if !shared.is_current(&key, ticket) {
                    shared.metrics.record_stale_completion();
                    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
                let result = shared.decoder.decode(&bytes);
                shared.complete(key, ticket, result);
            }
            WorkerJob::Evict(chunk_indices) => {
                shared.evict(&chunk_indices);
            }
            WorkerJob::Stop => break,
        }
    }
    tracing::trace!("Decode worker exiting");
}
