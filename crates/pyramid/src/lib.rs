use std::sync::Arc;
use std::time::Duration;

use cache::{ArraySource, CacheConfig, CacheError, CacheEvent, CacheStartError, LoadingCache};
use crossbeam_channel::Receiver;
use model::{Cell, CellKey, ChannelId, Element, GridError, GridLayout, LevelId, TimepointId};

/// Per-axis downsampling of one resolution level relative to level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSpec {
    pub downsampling: [u32; 3],
}

impl LevelSpec {
    pub fn isotropic(factor: u32) -> Self {
        Self {
            downsampling: [factor, factor, factor],
        }
    }

    /// Source pixels covered per screen pixel when this level is shown 1:1.
    pub fn pixel_size(&self) -> f64 {
        self.downsampling[0].max(self.downsampling[1]) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PyramidStartError {
    EmptyLevels,
    InvalidSlack,
    ZeroDownsampling,
    Cache(CacheStartError),
}

impl From<CacheStartError> for PyramidStartError {
    fn from(error: CacheStartError) -> Self {
        PyramidStartError::Cache(error)
    }
}

struct PyramidLevel<T: Element> {
    spec: LevelSpec,
    grid: GridLayout,
    cache: LoadingCache<T>,
}

/// One logical image (channel, timepoint) as a resolution pyramid, with one
/// LoadingCache per level over a shared ArraySource. Level 0 is full
/// resolution.
pub struct MultiResolutionSource<T: Element> {
    channel: ChannelId,
    timepoint: TimepointId,
    levels: Vec<PyramidLevel<T>>,
    slack: f64,
    events: Receiver<CacheEvent>,
}

impl<T: Element> MultiResolutionSource<T> {
    pub fn new(
        channel: ChannelId,
        timepoint: TimepointId,
        full_dims: [u64; 3],
        cell_shape: [u32; 3],
        level_specs: &[LevelSpec],
        cache_config: CacheConfig,
        slack: f64,
        source: Arc<dyn ArraySource<T>>,
    ) -> Result<Self, PyramidStartError> {
        if level_specs.is_empty() {
            return Err(PyramidStartError::EmptyLevels);
        }
        if !slack.is_finite() || slack <= 0.0 {
            return Err(PyramidStartError::InvalidSlack);
        }
        let (events_sender, events_receiver) = crossbeam_channel::unbounded();
        let mut levels = Vec::with_capacity(level_specs.len());
        for spec in level_specs {
            if spec.downsampling.contains(&0) {
                return Err(PyramidStartError::ZeroDownsampling);
            }
            let grid = GridLayout::new(model::level_dims(full_dims, spec.downsampling), cell_shape);
            let cache = LoadingCache::start(
                cache_config,
                grid,
                Arc::clone(&source),
                events_sender.clone(),
            )?;
            levels.push(PyramidLevel {
                spec: *spec,
                grid,
                cache,
            });
        }
        Ok(Self {
            channel,
            timepoint,
            levels,
            slack,
            events: events_receiver,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn timepoint(&self) -> TimepointId {
        self.timepoint
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn grid(&self, level: usize) -> GridLayout {
        self.level(level).grid
    }

    pub fn downsampling(&self, level: usize) -> [u32; 3] {
        self.level(level).spec.downsampling
    }

    /// Loaded-cell / failed-load notifications from every level, merged into
    /// one stream.
    pub fn events(&self) -> Receiver<CacheEvent> {
        self.events.clone()
    }

    pub fn key(&self, level: usize, cell_index: u64) -> CellKey {
        assert!(level < self.levels.len(), "level {level} out of range");
        assert!(level <= u8::MAX as usize, "level {level} exceeds key budget");
        CellKey::new(
            self.channel,
            self.timepoint,
            LevelId(level as u8),
            cell_index,
        )
    }

    /// Possibly-stale cell: resident data or a placeholder with a load
    /// scheduled. Never blocks.
    pub fn cell(&self, level: usize, cell_index: u64) -> Result<Arc<Cell<T>>, GridError> {
        self.level(level).cache.get(self.key(level, cell_index))
    }

    /// Fresh cell: waits for the load. Export/batch paths only.
    pub fn cell_blocking(
        &self,
        level: usize,
        cell_index: u64,
        timeout: Duration,
    ) -> Result<Arc<Cell<T>>, CacheError> {
        self.level(level)
            .cache
            .get_blocking(self.key(level, cell_index), timeout)
    }

    /// Element covering `point` (level coordinates). Placeholder data reads
    /// as the zero element.
    pub fn sample(&self, level: usize, point: [u64; 3]) -> Result<T, GridError> {
        let grid = self.level(level).grid;
        let cell_index = grid.cell_index_for_point(point)?;
        let cell = self.cell(level, cell_index)?;
        if !cell.is_valid() {
            return Ok(T::ZERO);
        }
        Ok(cell.value_at(point).unwrap_or(T::ZERO))
    }

    /// The coarsest level whose pixel size stays within `screen_ratio`
    /// (source pixels per screen pixel) times the slack factor. The bound is
    /// inclusive, so a level sitting exactly on the threshold is chosen over
    /// a finer one; between equally coarse levels the higher index wins.
    /// Falls back to the finest level when nothing qualifies.
    pub fn best_level_for(&self, screen_ratio: f64) -> usize {
        let threshold = screen_ratio * self.slack;
        let mut best: Option<usize> = None;
        for (level, entry) in self.levels.iter().enumerate() {
            let pixel_size = entry.spec.pixel_size();
            if pixel_size > threshold {
                continue;
            }
            match best {
                Some(current) if pixel_size < self.levels[current].spec.pixel_size() => {}
                _ => best = Some(level),
            }
        }
        best.unwrap_or_else(|| self.finest_level())
    }

    /// Drops all resident cells on every level.
    pub fn invalidate_all(&self) {
        for level in &self.levels {
            level.cache.invalidate_all();
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.cache.resident_bytes())
            .sum()
    }

    fn finest_level(&self) -> usize {
        let mut finest = 0;
        for (level, entry) in self.levels.iter().enumerate().skip(1) {
            if entry.spec.pixel_size() < self.levels[finest].spec.pixel_size() {
                finest = level;
            }
        }
        finest
    }

    fn level(&self, level: usize) -> &PyramidLevel<T> {
        assert!(level < self.levels.len(), "level {level} out of range");
        &self.levels[level]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{LoadRequest, SourceError};

    /// Fills every cell with `level * 100 + cell_index`.
    struct StubSource;

    impl ArraySource<u16> for StubSource {
        fn load(&self, request: &LoadRequest) -> Result<Box<[u16]>, SourceError> {
            let len =
                request.shape[0] as usize * request.shape[1] as usize * request.shape[2] as usize;
            let value =
                request.key.level().0 as u16 * 100 + request.key.cell_index() as u16;
            Ok(vec![value; len].into_boxed_slice())
        }
    }

    fn pyramid(slack: f64) -> MultiResolutionSource<u16> {
        MultiResolutionSource::new(
            ChannelId(1),
            TimepointId(0),
            [16, 16, 1],
            [2, 2, 1],
            &[
                LevelSpec::isotropic(1),
                LevelSpec::isotropic(2),
                LevelSpec::isotropic(4),
                LevelSpec::isotropic(8),
            ],
            CacheConfig::default(),
            slack,
            Arc::new(StubSource),
        )
        .expect("start pyramid")
    }

    #[test]
    fn levels_get_their_own_grids() {
        let pyramid = pyramid(1.0);
        assert_eq!(pyramid.num_levels(), 4);
        assert_eq!(pyramid.grid(0).dims(), [16, 16, 1]);
        assert_eq!(pyramid.grid(1).dims(), [8, 8, 1]);
        assert_eq!(pyramid.grid(2).dims(), [4, 4, 1]);
        assert_eq!(pyramid.grid(3).dims(), [2, 2, 1]);
    }

    #[test]
    fn keys_carry_channel_timepoint_and_level() {
        let pyramid = pyramid(1.0);
        let key = pyramid.key(2, 5);
        assert_eq!(key.channel(), ChannelId(1));
        assert_eq!(key.timepoint(), TimepointId(0));
        assert_eq!(key.level(), LevelId(2));
        assert_eq!(key.cell_index(), 5);
    }

    #[test]
    fn sample_reads_zero_until_the_cell_is_fresh() {
        let pyramid = pyramid(1.0);
        // first touch schedules the load and reads the placeholder
        let early = pyramid.sample(1, [3, 3, 0]).expect("point in level");
        assert!(early == 0 || early == 105);

        pyramid
            .cell_blocking(1, 5, Duration::from_secs(5))
            .expect("load completes");
        assert_eq!(pyramid.sample(1, [3, 3, 0]), Ok(105));
    }

    #[test]
    fn best_level_picks_the_coarsest_qualifying_level() {
        let pyramid = pyramid(1.0);
        // pixel sizes are [1, 2, 4, 8]
        assert_eq!(pyramid.best_level_for(1.0), 0);
        assert_eq!(pyramid.best_level_for(1.9), 0);
        assert_eq!(pyramid.best_level_for(2.0), 1);
        assert_eq!(pyramid.best_level_for(5.0), 2);
        assert_eq!(pyramid.best_level_for(8.0), 3);
        assert_eq!(pyramid.best_level_for(100.0), 3);
    }

    #[test]
    fn best_level_falls_back_to_the_finest_level() {
        let pyramid = pyramid(1.0);
        assert_eq!(pyramid.best_level_for(0.5), 0);
    }

    #[test]
    fn slack_widens_the_qualification_threshold() {
        let pyramid = pyramid(2.0);
        // ratio 1.0 with slack 2.0 admits pixel size 2
        assert_eq!(pyramid.best_level_for(1.0), 1);
    }

    #[test]
    fn invalidate_all_drops_every_level() {
        let pyramid = pyramid(1.0);
        pyramid
            .cell_blocking(0, 0, Duration::from_secs(5))
            .expect("load completes");
        pyramid
            .cell_blocking(2, 0, Duration::from_secs(5))
            .expect("load completes");
        assert!(pyramid.resident_bytes() > 0);

        pyramid.invalidate_all();
        assert_eq!(pyramid.resident_bytes(), 0);
    }

    #[test]
    fn empty_level_list_is_rejected() {
        let result = MultiResolutionSource::<u16>::new(
            ChannelId(0),
            TimepointId(0),
            [16, 16, 1],
            [2, 2, 1],
            &[],
            CacheConfig::default(),
            1.0,
            Arc::new(StubSource),
        );
        assert!(matches!(result.err(), Some(PyramidStartError::EmptyLevels)));
    }
}
