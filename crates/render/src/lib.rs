use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitvec::prelude::{BitVec, Lsb0};
use cache::CacheError;
use model::{CellKey, Element, GridError, GridLayout};
use pyramid::MultiResolutionSource;


/// Cooperative cancellation flag shared between the requester of a render
/// pass and the pass itself. Checked once per cell, never per pixel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Complete,
    PartialCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    Grid(GridError),
    LoadFailed { key: CellKey, error: cache::SourceError },
    Timeout { key: CellKey },
}

impl From<GridError> for RenderError {
    fn from(error: GridError) -> Self {
        RenderError::Grid(error)
    }
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Grid(error) => write!(f, "{error}"),
            RenderError::LoadFailed { key, error } => {
                write!(f, "load failed for {key:?}: {error}")
            }
            RenderError::Timeout { key } => write!(f, "load timed out for {key:?}"),
        }
    }
}

/// Interactive passes never block on missing cells; blocking passes resolve
/// every cell or fail, and exist for export/batch paths only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Interactive,
    Blocking(Duration),
}

/// Maps screen pixels to global full-resolution coordinates: a uniform
/// scale, a translation, and the global z coordinate of the displayed slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerTransform {
    pub offset: [f64; 2],
    pub scale: f64,
    pub slice: u64,
}

impl ViewerTransform {
    pub const IDENTITY: Self = Self {
        offset: [0.0, 0.0],
        scale: 1.0,
        slice: 0,
    };

    pub fn screen_to_global(&self, x: f64, y: f64) -> [f64; 2] {
        [x / self.scale + self.offset[0], y / self.scale + self.offset[1]]
    }

    pub fn global_to_screen(&self, global: [f64; 2]) -> [f64; 2] {
        [
            (global[0] - self.offset[0]) * self.scale,
            (global[1] - self.offset[1]) * self.scale,
        ]
    }

    /// Source pixels covered by one screen pixel.
    pub fn screen_ratio(&self) -> f64 {
        1.0 / self.scale
    }
}

/// Which cells of the current pass have been resolved with fresh data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellCoverage {
    bits: BitVec<usize, Lsb0>,
    covered: usize,
}

impl CellCoverage {
    fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
            covered: 0,
        }
    }

    fn mark(&mut self, index: usize) {
        let was_covered = self.bits[index];
        self.bits.set(index, true);
        self.covered += !was_covered as usize;
    }

    pub fn is_covered(&self, index: usize) -> bool {
        self.bits[index]
    }

    pub fn covered(&self) -> usize {
        self.covered
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.covered == self.bits.len()
    }
}

/// Pixel buffer owned by one render pass at a time. Pixels are packed ARGB.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    transform: ViewerTransform,
    coverage: CellCoverage,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32, transform: ViewerTransform) -> Self {
        assert!(width > 0 && height > 0, "render target must not be empty");
        assert!(
            transform.scale.is_finite() && transform.scale > 0.0,
            "viewer transform scale must be finite and positive"
        );
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
            transform,
            coverage: CellCoverage::new(0),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn transform(&self) -> ViewerTransform {
        self.transform
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u32) {
        self.pixels[y as usize * self.width as usize + x as usize] = value;
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    pub fn coverage(&self) -> &CellCoverage {
        &self.coverage
    }

    /// Seeds this target with the pixels of a previously completed pass over
    /// the same viewport, so a refinement pass starts from coarse data
    /// instead of placeholders.
    pub fn adopt_backing(&mut self, previous: &RenderTarget) {
        assert_eq!(
            (self.width, self.height),
            (previous.width, previous.height),
            "backing target has a different size"
        );
        assert_eq!(
            self.transform, previous.transform,
            "backing target has a different viewport"
        );
        self.pixels.copy_from_slice(&previous.pixels);
    }

    fn begin_pass(&mut self, cell_count: usize) {
        self.coverage = CellCoverage::new(cell_count);
    }

    fn mark_covered(&mut self, index: usize) {
        self.coverage.mark(index);
    }
}

pub fn argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// Straight (non-premultiplied) alpha blend of `value` over `accum`:
/// `out = ((255 - a) * accum + a * value) / 255` per channel, where `a` is
/// the alpha of `value`.
pub fn composite_over(accum: u32, value: u32) -> u32 {
    let a = (value >> 24) & 0xff;
    let mut out = 0u32;
    for shift in [0, 8, 16, 24] {
        let accum_channel = (accum >> shift) & 0xff;
        let value_channel = (value >> shift) & 0xff;
        let blended = ((255 - a) * accum_channel + a * value_channel) / 255;
        out |= blended.min(255) << shift;
    }
    out
}

/// Whether a cell produced pixels from fresh data or was skipped because
/// only placeholder data is resident so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRenderStatus {
    Rendered,
    Placeholder,
}

/// One renderable image source: a resolution pyramid plus the conversion
/// from its element type to packed ARGB. Object-safe so sources with
/// different element types can be composited in one pass.
pub trait RenderSource: Send + Sync {
    fn num_levels(&self) -> usize;
    fn grid(&self, level: usize) -> GridLayout;
    fn downsampling(&self, level: usize) -> [u32; 3];
    fn best_level(&self, screen_ratio: f64) -> usize;
    fn render_cell(
        &self,
        level: usize,
        cell_index: u64,
        target: &mut RenderTarget,
        first_source: bool,
        mode: RenderMode,
    ) -> Result<CellRenderStatus, RenderError>;
}

/// Adapts a MultiResolutionSource plus an element-to-ARGB converter to the
/// RenderSource seam. The converter must be total for its element type.
pub struct PyramidSource<T: Element, F> {
    pyramid: Arc<MultiResolutionSource<T>>,
    convert: F,
}

impl<T, F> PyramidSource<T, F>
where
    T: Element,
    F: Fn(T) -> u32 + Send + Sync,
{
    pub fn new(pyramid: Arc<MultiResolutionSource<T>>, convert: F) -> Self {
        Self { pyramid, convert }
    }

    pub fn pyramid(&self) -> &Arc<MultiResolutionSource<T>> {
        &self.pyramid
    }
}

impl<T, F> RenderSource for PyramidSource<T, F>
where
    T: Element,
    F: Fn(T) -> u32 + Send + Sync,
{
    fn num_levels(&self) -> usize {
        self.pyramid.num_levels()
    }

    fn grid(&self, level: usize) -> GridLayout {
        self.pyramid.grid(level)
    }

    fn downsampling(&self, level: usize) -> [u32; 3] {
        self.pyramid.downsampling(level)
    }

    fn best_level(&self, screen_ratio: f64) -> usize {
        self.pyramid.best_level_for(screen_ratio)
    }

    fn render_cell(
        &self,
        level: usize,
        cell_index: u64,
        target: &mut RenderTarget,
        first_source: bool,
        mode: RenderMode,
    ) -> Result<CellRenderStatus, RenderError> {
        let grid = self.pyramid.grid(level);
        let bounds = grid.cell_bounds(cell_index)?;
        let cell = match mode {
            RenderMode::Interactive => self.pyramid.cell(level, cell_index)?,
            RenderMode::Blocking(timeout) => self
                .pyramid
                .cell_blocking(level, cell_index, timeout)
                .map_err(|error| {
                    let key = self.pyramid.key(level, cell_index);
                    match error {
                        CacheError::Grid(grid_error) => RenderError::Grid(grid_error),
                        CacheError::Timeout => RenderError::Timeout { key },
                        CacheError::NotFound => RenderError::LoadFailed {
                            key,
                            error: cache::SourceError::NotFound,
                        },
                        CacheError::LoadFailed(source_error) => RenderError::LoadFailed {
                            key,
                            error: source_error,
                        },
                    }
                })?,
        };
        if !cell.is_valid() {
            // leave the backing pixels alone; a repaint fills this in later
            return Ok(CellRenderStatus::Placeholder);
        }

        let downsampling = self.pyramid.downsampling(level);
        let transform = target.transform();
        let level_slice = transform.slice / downsampling[2] as u64;
        if level_slice < bounds.origin[2]
            || level_slice >= bounds.origin[2] + bounds.shape[2] as u64
        {
            return Ok(CellRenderStatus::Rendered);
        }

        // screen-space bounding box of the cell, clamped to the target
        let global_min = [
            (bounds.origin[0] * downsampling[0] as u64) as f64,
            (bounds.origin[1] * downsampling[1] as u64) as f64,
        ];
        let global_max = [
            ((bounds.origin[0] + bounds.shape[0] as u64) * downsampling[0] as u64) as f64,
            ((bounds.origin[1] + bounds.shape[1] as u64) * downsampling[1] as u64) as f64,
        ];
        let screen_min = transform.global_to_screen(global_min);
        let screen_max = transform.global_to_screen(global_max);
        let x0 = screen_min[0].floor().max(0.0) as u32;
        let y0 = screen_min[1].floor().max(0.0) as u32;
        let x1 = (screen_max[0].ceil().max(0.0) as u32).min(target.width());
        let y1 = (screen_max[1].ceil().max(0.0) as u32).min(target.height());

        for screen_y in y0..y1 {
            for screen_x in x0..x1 {
                let global = transform
                    .screen_to_global(screen_x as f64 + 0.5, screen_y as f64 + 0.5);
                if global[0] < 0.0 || global[1] < 0.0 {
                    continue;
                }
                let point = [
                    global[0] as u64 / downsampling[0] as u64,
                    global[1] as u64 / downsampling[1] as u64,
                    level_slice,
                ];
                let Some(value) = cell.value_at(point) else {
                    continue;
                };
                let converted = (self.convert)(value);
                if first_source {
                    target.set_pixel(screen_x, screen_y, converted);
                } else {
                    let accum = target.pixel(screen_x, screen_y);
                    target.set_pixel(screen_x, screen_y, composite_over(accum, converted));
                }
            }
        }
        Ok(CellRenderStatus::Rendered)
    }
}

/// Half-open level-coordinate region visible through the target's viewport.
fn visible_region(target: &RenderTarget, downsampling: [u32; 3]) -> ([u64; 3], [u64; 3]) {
    let transform = target.transform();
    let near = transform.screen_to_global(0.0, 0.0);
    let far = transform.screen_to_global(target.width() as f64, target.height() as f64);
    let global_min = [near[0].min(far[0]).max(0.0), near[1].min(far[1]).max(0.0)];
    let global_max = [near[0].max(far[0]).max(0.0), near[1].max(far[1]).max(0.0)];
    let level_slice = transform.slice / downsampling[2] as u64;
    let min = [
        (global_min[0] / downsampling[0] as f64).floor() as u64,
        (global_min[1] / downsampling[1] as f64).floor() as u64,
        level_slice,
    ];
    let max = [
        (global_max[0] / downsampling[0] as f64).ceil() as u64,
        (global_max[1] / downsampling[1] as f64).ceil() as u64,
        level_slice + 1,
    ];
    (min, max)
}

/// Walks the cells of every source intersecting the viewport at the given
/// per-source levels and fills the target. Sources composite in slice order;
/// the cancel token is checked before each cell, so a cancelled pass leaves
/// only whole, fully written cells behind and returns immediately.
pub fn render_into(
    target: &mut RenderTarget,
    sources: &[&dyn RenderSource],
    levels: &[usize],
    mode: RenderMode,
    cancel: &CancelToken,
) -> Result<RenderOutcome, RenderError> {
    assert_eq!(
        sources.len(),
        levels.len(),
        "one level must be given per source"
    );
    let mut cell_lists: Vec<Vec<u64>> = Vec::with_capacity(sources.len());
    for (source, &level) in sources.iter().zip(levels) {
        let grid = source.grid(level);
        let (min, max) = visible_region(target, source.downsampling(level));
        cell_lists.push(grid.cells_intersecting(min, max).collect());
    }
    target.begin_pass(cell_lists.iter().map(Vec::len).sum());

    let mut coverage_index = 0;
    for (source_index, (source, &level)) in sources.iter().zip(levels).enumerate() {
        for &cell_index in &cell_lists[source_index] {
            if cancel.is_cancelled() {
                return Ok(RenderOutcome::PartialCancelled);
            }
            let status =
                source.render_cell(level, cell_index, target, source_index == 0, mode)?;
            if status == CellRenderStatus::Rendered {
                target.mark_covered(coverage_index);
            }
            coverage_index += 1;
        }
    }
    Ok(RenderOutcome::Complete)
}
