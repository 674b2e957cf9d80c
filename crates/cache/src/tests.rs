use super::*;
use model::{ChannelId, LevelId, TimepointId};
use std::sync::atomic::AtomicUsize;

fn test_grid() -> GridLayout {
    GridLayout::new([8, 8, 1], [2, 2, 1])
}

fn key(cell_index: u64) -> CellKey {
    CellKey::new(ChannelId(0), TimepointId(0), LevelId(0), cell_index)
}

fn config() -> CacheConfig {
    CacheConfig {
        max_bytes: 1 << 20,
        worker_threads: 2,
        max_load_retries: 3,
        work_queue_capacity: 64,
        retry_backoff: Duration::from_millis(1),
    }
}

/// Fills every cell with its cell index and counts load invocations.
struct CountingSource {
    loads: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    fn new(delay: Duration) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            delay,
        }
    }

    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ArraySource<u8> for CountingSource {
    fn load(&self, request: &LoadRequest) -> Result<Box<[u8]>, SourceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let len =
            request.shape[0] as usize * request.shape[1] as usize * request.shape[2] as usize;
        Ok(vec![request.key.cell_index() as u8; len].into_boxed_slice())
    }
}

struct FailingSource {
    attempts: AtomicUsize,
    error: SourceError,
}

impl FailingSource {
    fn new(error: SourceError) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            error,
        }
    }
}

impl ArraySource<u8> for FailingSource {
    fn load(&self, _request: &LoadRequest) -> Result<Box<[u8]>, SourceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

fn start_cache(
    config: CacheConfig,
    source: Arc<dyn ArraySource<u8>>,
) -> (LoadingCache<u8>, Receiver<CacheEvent>) {
    let (events_sender, events_receiver) = crossbeam_channel::unbounded();
    let cache =
        LoadingCache::start(config, test_grid(), source, events_sender).expect("start cache");
    (cache, events_receiver)
}

#[test]
fn miss_returns_invalid_placeholder_with_correct_bounds() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(100)));
    let (cache, _events) = start_cache(config(), source);

    let cell = cache.get(key(5)).expect("in-range key");
    assert!(!cell.is_valid());
    assert_eq!(cell.origin(), [2, 2, 0]);
    assert_eq!(cell.shape(), [2, 2, 1]);
    assert_eq!(cell.array().data(), &[0, 0, 0, 0]);
}

#[test]
fn out_of_range_key_is_a_grid_error() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let (cache, _events) = start_cache(config(), source);
    assert_eq!(
        cache.get(key(16)).err(),
        Some(GridError::CellIndexOutOfBounds)
    );
}

#[test]
fn get_blocking_returns_the_loaded_cell() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let (cache, _events) = start_cache(config(), source);

    let cell = cache
        .get_blocking(key(7), Duration::from_secs(5))
        .expect("load completes");
    assert!(cell.is_valid());
    assert_eq!(cell.array().data(), &[7, 7, 7, 7]);
}

#[test]
fn get_is_idempotent_before_and_after_the_load() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(50)));
    let (cache, _events) = start_cache(config(), source);

    let first = cache.get(key(3)).expect("in-range key");
    let second = cache.get(key(3)).expect("in-range key");
    assert_eq!(first.array().data(), second.array().data());
    assert!(!first.is_valid() && !second.is_valid());

    let loaded = cache
        .get_blocking(key(3), Duration::from_secs(5))
        .expect("load completes");
    let again = cache.get(key(3)).expect("in-range key");
    assert!(Arc::ptr_eq(&loaded, &again));
}

#[test]
fn concurrent_gets_issue_exactly_one_load() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(30)));
    let (cache, _events) = start_cache(config(), Arc::clone(&source) as _);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let cell = cache.get(key(9)).expect("in-range key");
                assert_eq!(cell.shape(), [2, 2, 1]);
            });
        }
    });
    let cell = cache
        .get_blocking(key(9), Duration::from_secs(5))
        .expect("load completes");
    assert!(cell.is_valid());
    assert_eq!(source.load_count(), 1);
}

#[test]
fn eviction_removes_exactly_the_least_recently_used_cells() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    // cells are 4 bytes each; room for 4 resident cells
    let mut config = config();
    config.max_bytes = 16;
    let (cache, _events) = start_cache(config, source);

    for index in 0..4 {
        cache
            .get_blocking(key(index), Duration::from_secs(5))
            .expect("load completes");
    }
    // refresh 0 and 1 so 2 becomes the oldest
    cache.get(key(0)).expect("in-range key");
    cache.get(key(1)).expect("in-range key");

    cache
        .get_blocking(key(4), Duration::from_secs(5))
        .expect("load completes");

    assert!(cache.resident_bytes() <= 16);
    assert!(cache.contains(key(0)));
    assert!(cache.contains(key(1)));
    assert!(!cache.contains(key(2)));
    assert!(cache.contains(key(3)));
    assert!(cache.contains(key(4)));
}

/// Keys 0 and 1 load slowly, everything else instantly.
struct MixedSpeedSource {
    delay: Duration,
}

impl ArraySource<u8> for MixedSpeedSource {
    fn load(&self, request: &LoadRequest) -> Result<Box<[u8]>, SourceError> {
        if request.key.cell_index() < 2 {
            std::thread::sleep(self.delay);
        }
        let len =
            request.shape[0] as usize * request.shape[1] as usize * request.shape[2] as usize;
        Ok(vec![request.key.cell_index() as u8; len].into_boxed_slice())
    }
}

#[test]
fn eviction_pressure_never_touches_in_flight_loads() {
    let source = Arc::new(MixedSpeedSource {
        delay: Duration::from_millis(150),
    });
    // room for two 4-byte cells, three workers so fast loads bypass slow ones
    let mut config = config();
    config.max_bytes = 8;
    config.worker_threads = 3;
    let (cache, _events) = start_cache(config, source);

    // park two slow loads on their workers
    let _ = cache.get(key(0)).expect("in-range key");
    let _ = cache.get(key(1)).expect("in-range key");

    // churn installs past the byte bound while 0 and 1 are still in flight
    for index in 2..6 {
        cache
            .get_blocking(key(index), Duration::from_secs(5))
            .expect("load completes");
    }
    assert!(cache.resident_bytes() <= 8);

    // the in-flight loads survive the churn and still install fresh data
    let slow_a = cache
        .get_blocking(key(0), Duration::from_secs(5))
        .expect("slow load completes");
    let slow_b = cache
        .get_blocking(key(1), Duration::from_secs(5))
        .expect("slow load completes");
    assert!(slow_a.is_valid());
    assert!(slow_b.is_valid());
    assert_eq!(slow_a.array().data(), &[0, 0, 0, 0]);
    assert_eq!(slow_b.array().data(), &[1, 1, 1, 1]);
    assert!(cache.resident_bytes() <= 8);
}

#[test]
fn set_max_bytes_evicts_immediately() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let (cache, _events) = start_cache(config(), source);

    for index in 0..4 {
        cache
            .get_blocking(key(index), Duration::from_secs(5))
            .expect("load completes");
    }
    assert_eq!(cache.resident_cells(), 4);

    cache.set_max_bytes(8);
    assert!(cache.resident_bytes() <= 8);
    assert_eq!(cache.resident_cells(), 2);
    assert!(cache.contains(key(2)));
    assert!(cache.contains(key(3)));
}

#[test]
fn io_failures_are_retried_then_parked() {
    let source = Arc::new(FailingSource::new(SourceError::Io("disk gone".into())));
    let (cache, _events) = start_cache(config(), Arc::clone(&source) as _);

    let result = cache.get_blocking(key(0), Duration::from_secs(5));
    assert_eq!(
        result.err(),
        Some(CacheError::LoadFailed(SourceError::Io("disk gone".into())))
    );
    assert_eq!(source.attempts.load(Ordering::SeqCst), 3);

    // parked: further gets do not reschedule
    let _ = cache.get(key(0)).expect("in-range key");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(source.attempts.load(Ordering::SeqCst), 3);

    // invalidate re-arms the key
    cache.invalidate(key(0));
    let result = cache.get_blocking(key(0), Duration::from_secs(5));
    assert!(matches!(result, Err(CacheError::LoadFailed(_))));
    assert_eq!(source.attempts.load(Ordering::SeqCst), 6);
}

#[test]
fn not_found_is_not_retried() {
    let source = Arc::new(FailingSource::new(SourceError::NotFound));
    let (cache, _events) = start_cache(config(), Arc::clone(&source) as _);

    let result = cache.get_blocking(key(2), Duration::from_secs(5));
    assert_eq!(result.err(), Some(CacheError::NotFound));
    assert_eq!(source.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn blocking_get_times_out_on_a_slow_source() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(500)));
    let (cache, _events) = start_cache(config(), source);

    let result = cache.get_blocking(key(0), Duration::from_millis(20));
    assert_eq!(result.err(), Some(CacheError::Timeout));
}

#[test]
fn loaded_cells_are_announced_on_the_event_channel() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let (cache, events) = start_cache(config(), source);

    cache
        .get_blocking(key(11), Duration::from_secs(5))
        .expect("load completes");
    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("event arrives");
    assert_eq!(event, CacheEvent::CellLoaded(key(11)));
}

#[test]
fn invalidate_drops_the_resident_cell() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let (cache, _events) = start_cache(config(), Arc::clone(&source) as _);

    cache
        .get_blocking(key(1), Duration::from_secs(5))
        .expect("load completes");
    assert!(cache.contains(key(1)));

    cache.invalidate(key(1));
    assert!(!cache.contains(key(1)));
    assert_eq!(cache.resident_bytes(), 0);

    let cell = cache.get(key(1)).expect("in-range key");
    assert!(!cell.is_valid());
}

#[test]
fn zero_configuration_is_rejected_at_start() {
    let source: Arc<dyn ArraySource<u8>> = Arc::new(CountingSource::new(Duration::ZERO));
    let (events, _receiver) = crossbeam_channel::unbounded();

    let mut bad = config();
    bad.max_bytes = 0;
    assert_eq!(
        LoadingCache::start(bad, test_grid(), Arc::clone(&source), events.clone()).err(),
        Some(CacheStartError::ZeroByteBound)
    );

    let mut bad = config();
    bad.worker_threads = 0;
    assert_eq!(
        LoadingCache::start(bad, test_grid(), Arc::clone(&source), events.clone()).err(),
        Some(CacheStartError::ZeroWorkerThreads)
    );

    let mut bad = config();
    bad.work_queue_capacity = 0;
    assert_eq!(
        LoadingCache::start(bad, test_grid(), Arc::clone(&source), events.clone()).err(),
        Some(CacheStartError::ZeroQueueCapacity)
    );

    let mut bad = config();
    bad.max_load_retries = 0;
    assert_eq!(
        LoadingCache::start(bad, test_grid(), Arc::clone(&source), events).err(),
        Some(CacheStartError::ZeroLoadRetries)
    );
}
