use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use model::{Cell, CellBounds, CellKey, Element, GridError, GridLayout, VolatileArray};

#[cfg(test)]
mod tests;

/// Everything an ArraySource needs to read one rectangular block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    pub key: CellKey,
    pub origin: [u64; 3],
    pub shape: [u32; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    NotFound,
    Io(String),
    Timeout,
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::NotFound => write!(f, "cell not found in source"),
            SourceError::Io(message) => write!(f, "source i/o error: {message}"),
            SourceError::Timeout => write!(f, "source timed out"),
        }
    }
}

/// Reads raw element blocks for cells. May block on I/O; must be safe to
/// call concurrently for distinct keys. Per-key call ordering is not
/// required of implementors.
pub trait ArraySource<T: Element>: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<Box<[T]>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub worker_threads: usize,
    pub max_load_retries: u32,
    pub work_queue_capacity: usize,
    pub retry_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 128 << 20,
            worker_threads: 3,
            max_load_retries: 3,
            work_queue_capacity: 1024,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStartError {
    ZeroByteBound,
    ZeroWorkerThreads,
    ZeroQueueCapacity,
    ZeroLoadRetries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    CellLoaded(CellKey),
    LoadFailed(CellKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Grid(GridError),
    NotFound,
    LoadFailed(SourceError),
    Timeout,
}

impl From<GridError> for CacheError {
    fn from(error: GridError) -> Self {
        CacheError::Grid(error)
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Grid(error) => write!(f, "{error}"),
            CacheError::NotFound => write!(f, "cell not found"),
            CacheError::LoadFailed(error) => write!(f, "load failed: {error}"),
            CacheError::Timeout => write!(f, "blocking get timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkItem {
    key: CellKey,
    ticket: u64,
}

struct CacheEntry<T> {
    cell: Arc<Cell<T>>,
    last_access: u64,
    bytes: usize,
}

struct CacheState<T> {
    cells: HashMap<CellKey, CacheEntry<T>>,
    // key -> ticket of the load currently in flight; completion installs
    // only if its ticket is still current
    in_flight: HashMap<CellKey, u64>,
    // keys parked after retry exhaustion or NotFound; re-armed by invalidate
    failed: HashMap<CellKey, SourceError>,
    resident_bytes: usize,
    max_bytes: usize,
    access_counter: u64,
    next_ticket: u64,
}

struct CacheShared<T> {
    state: Mutex<CacheState<T>>,
    loaded: Condvar,
    events: Sender<CacheEvent>,
    grid: GridLayout,
    max_load_retries: u32,
    retry_backoff: Duration,
}

impl<T: Element> CacheShared<T> {
    fn lock_state(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().expect("cache state lock poisoned")
    }
}

/// Bounded mapping from CellKey to loaded cells over one grid level.
///
/// Misses return zero-filled placeholder cells immediately and schedule a
/// background load; at most one load is in flight per key; least recently
/// accessed cells are evicted once the resident byte size exceeds the bound.
pub struct LoadingCache<T: Element> {
    shared: Arc<CacheShared<T>>,
    work_sender: Option<Sender<WorkItem>>,
    stop_requested: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl<T: Element> LoadingCache<T> {
    /// Spawns the load workers. `events` receives a notification for every
    /// installed cell and every exhausted load; several caches may share one
    /// sender.
    pub fn start(
        config: CacheConfig,
        grid: GridLayout,
        source: Arc<dyn ArraySource<T>>,
        events: Sender<CacheEvent>,
    ) -> Result<Self, CacheStartError> {
        if config.max_bytes == 0 {
            return Err(CacheStartError::ZeroByteBound);
        }
        if config.worker_threads == 0 {
            return Err(CacheStartError::ZeroWorkerThreads);
        }
        if config.work_queue_capacity == 0 {
            return Err(CacheStartError::ZeroQueueCapacity);
        }
        if config.max_load_retries == 0 {
            return Err(CacheStartError::ZeroLoadRetries);
        }

        let (work_sender, work_receiver) = bounded(config.work_queue_capacity);
        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                cells: HashMap::new(),
                in_flight: HashMap::new(),
                failed: HashMap::new(),
                resident_bytes: 0,
                max_bytes: config.max_bytes,
                access_counter: 0,
                next_ticket: 0,
            }),
            loaded: Condvar::new(),
            events,
            grid,
            max_load_retries: config.max_load_retries,
            retry_backoff: config.retry_backoff,
        });
        let stop_requested = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_threads);
        for worker_index in 0..config.worker_threads {
            let shared = Arc::clone(&shared);
            let source = Arc::clone(&source);
            let work_receiver: Receiver<WorkItem> = work_receiver.clone();
            let stop_requested = Arc::clone(&stop_requested);
            let handle = std::thread::Builder::new()
                .name(format!("cell-loader-{worker_index}"))
                .spawn(move || load_worker_loop(shared, source, work_receiver, stop_requested))
                .expect("spawn cell loader thread");
            workers.push(handle);
        }

        Ok(Self {
            shared,
            work_sender: Some(work_sender),
            stop_requested,
            workers,
        })
    }

    pub fn grid(&self) -> GridLayout {
        self.shared.grid
    }

    /// Resident cell, or a fresh zero-filled placeholder with a background
    /// load scheduled. Never blocks.
    pub fn get(&self, key: CellKey) -> Result<Arc<Cell<T>>, GridError> {
        let bounds = self.shared.grid.cell_bounds(key.cell_index())?;
        let mut state = self.shared.lock_state();
        state.access_counter += 1;
        let stamp = state.access_counter;
        if let Some(entry) = state.cells.get_mut(&key) {
            entry.last_access = stamp;
            return Ok(Arc::clone(&entry.cell));
        }
        self.maybe_schedule(&mut state, key);
        drop(state);
        Ok(placeholder_cell(key, bounds))
    }

    /// As `get`, but waits for the load to finish. Used by final-quality
    /// passes only; interactive rendering must stay on `get`.
    pub fn get_blocking(&self, key: CellKey, timeout: Duration) -> Result<Arc<Cell<T>>, CacheError> {
        let _ = self.shared.grid.cell_bounds(key.cell_index())?;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        loop {
            state.access_counter += 1;
            let stamp = state.access_counter;
            if let Some(entry) = state.cells.get_mut(&key) {
                entry.last_access = stamp;
                return Ok(Arc::clone(&entry.cell));
            }
            if let Some(error) = state.failed.get(&key) {
                return Err(match error {
                    SourceError::NotFound => CacheError::NotFound,
                    other => CacheError::LoadFailed(other.clone()),
                });
            }
            self.maybe_schedule(&mut state, key);
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::Timeout);
            }
            let (guard, _) = self
                .shared
                .loaded
                .wait_timeout(state, deadline - now)
                .expect("cache state lock poisoned");
            state = guard;
        }
    }

    /// Drops the resident cell and the failure record for `key`, and
    /// abandons a racing in-flight load so it cannot reinstall stale data.
    pub fn invalidate(&self, key: CellKey) {
        let mut state = self.shared.lock_state();
        if let Some(entry) = state.cells.remove(&key) {
            state.resident_bytes -= entry.bytes;
        }
        state.failed.remove(&key);
        state.in_flight.remove(&key);
    }

    /// Drops every resident cell and failure record (explicit data change).
    pub fn invalidate_all(&self) {
        let mut state = self.shared.lock_state();
        state.cells.clear();
        state.resident_bytes = 0;
        state.failed.clear();
        state.in_flight.clear();
    }

    pub fn set_max_bytes(&self, max_bytes: usize) {
        assert!(max_bytes > 0, "cache byte bound must be at least 1");
        let mut state = self.shared.lock_state();
        state.max_bytes = max_bytes;
        evict_to_bound(&mut state);
    }

    pub fn max_bytes(&self) -> usize {
        self.shared.lock_state().max_bytes
    }

    pub fn resident_bytes(&self) -> usize {
        self.shared.lock_state().resident_bytes
    }

    pub fn resident_cells(&self) -> usize {
        self.shared.lock_state().cells.len()
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.shared.lock_state().cells.contains_key(&key)
    }

    fn maybe_schedule(&self, state: &mut CacheState<T>, key: CellKey) {
        if state.in_flight.contains_key(&key) || state.failed.contains_key(&key) {
            return;
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.in_flight.insert(key, ticket);
        let sender = self
            .work_sender
            .as_ref()
            .expect("work queue alive while cache is alive");
        match sender.try_send(WorkItem { key, ticket }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // a later get retries the schedule
                state.in_flight.remove(&key);
                log::debug!("load queue full, dropped schedule for {key:?}");
            }
            Err(TrySendError::Disconnected(_)) => {
                state.in_flight.remove(&key);
            }
        }
    }
}

impl<T: Element> Drop for LoadingCache<T> {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        // disconnect the queue so parked workers wake up
        self.work_sender.take();
        for handle in self.workers.drain(..) {
            handle.join().expect("join cell loader thread");
        }
    }
}

fn placeholder_cell<T: Element>(key: CellKey, bounds: CellBounds) -> Arc<Cell<T>> {
    let len = bounds.shape[0] as usize * bounds.shape[1] as usize * bounds.shape[2] as usize;
    Arc::new(Cell::new(
        key,
        bounds.origin,
        bounds.shape,
        VolatileArray::placeholder(len),
    ))
}

fn evict_to_bound<T>(state: &mut CacheState<T>) {
    while state.resident_bytes > state.max_bytes {
        let victim = state
            .cells
            .iter()
            .filter(|(key, _)| !state.in_flight.contains_key(key))
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| *key);
        let Some(victim) = victim else {
            return;
        };
        if let Some(entry) = state.cells.remove(&victim) {
            state.resident_bytes -= entry.bytes;
            log::trace!("evicted {victim:?} ({} bytes)", entry.bytes);
        }
    }
}

fn load_worker_loop<T: Element>(
    shared: Arc<CacheShared<T>>,
    source: Arc<dyn ArraySource<T>>,
    work_receiver: Receiver<WorkItem>,
    stop_requested: Arc<AtomicBool>,
) {
    while let Ok(item) = work_receiver.recv() {
        if stop_requested.load(Ordering::Acquire) {
            break;
        }
        let bounds = match shared.grid.cell_bounds(item.key.cell_index()) {
            Ok(bounds) => bounds,
            Err(_) => {
                shared.lock_state().in_flight.remove(&item.key);
                continue;
            }
        };
        let request = LoadRequest {
            key: item.key,
            origin: bounds.origin,
            shape: bounds.shape,
        };
        let expected_len =
            bounds.shape[0] as usize * bounds.shape[1] as usize * bounds.shape[2] as usize;

        let mut attempt = 1;
        let result = loop {
            let result = match source.load(&request) {
                Ok(data) if data.len() != expected_len => Err(SourceError::Io(format!(
                    "source returned {} elements, expected {expected_len}",
                    data.len()
                ))),
                other => other,
            };
            match result {
                Err(SourceError::Io(message)) if attempt < shared.max_load_retries => {
                    log::warn!(
                        "load attempt {attempt} failed for {:?}: {message}",
                        item.key
                    );
                    std::thread::sleep(shared.retry_backoff * attempt);
                    attempt += 1;
                    if stop_requested.load(Ordering::Acquire) {
                        break Err(SourceError::Io(message));
                    }
                }
                other => break other,
            }
        };

        let mut state = shared.lock_state();
        if state.in_flight.get(&item.key) != Some(&item.ticket) {
            // invalidated while loading; discard the result
            continue;
        }
        state.in_flight.remove(&item.key);
        match result {
            Ok(data) => {
                let bytes = data.len() * std::mem::size_of::<T>();
                let cell = Arc::new(Cell::new(
                    item.key,
                    bounds.origin,
                    bounds.shape,
                    VolatileArray::loaded(data),
                ));
                state.access_counter += 1;
                let stamp = state.access_counter;
                if let Some(previous) = state.cells.insert(
                    item.key,
                    CacheEntry {
                        cell,
                        last_access: stamp,
                        bytes,
                    },
                ) {
                    state.resident_bytes -= previous.bytes;
                }
                state.resident_bytes += bytes;
                state.failed.remove(&item.key);
                evict_to_bound(&mut state);
                drop(state);
                shared.loaded.notify_all();
                let _ = shared.events.send(CacheEvent::CellLoaded(item.key));
            }
            Err(error) => {
                log::warn!("load failed for {:?}: {error}", item.key);
                state.failed.insert(item.key, error);
                drop(state);
                shared.loaded.notify_all();
                let _ = shared.events.send(CacheEvent::LoadFailed(item.key));
            }
        }
    }
}
