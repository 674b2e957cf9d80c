use static_assertions::const_assert;

const CHANNEL_BITS: u64 = 8;
const TIME_BITS: u64 = 16;
const LEVEL_BITS: u64 = 8;
const CELL_BITS: u64 = 32;

const CELL_SHIFT: u64 = 0;
const LEVEL_SHIFT: u64 = CELL_BITS;
const TIME_SHIFT: u64 = CELL_BITS + LEVEL_BITS;
const CHANNEL_SHIFT: u64 = CELL_BITS + LEVEL_BITS + TIME_BITS;

const CHANNEL_MASK: u64 = (1 << CHANNEL_BITS) - 1;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;
const CELL_MASK: u64 = (1 << CELL_BITS) - 1;

const_assert!(CHANNEL_BITS + TIME_BITS + LEVEL_BITS + CELL_BITS == 64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u8);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimepointId(pub u16);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LevelId(pub u8);

/// Identity of one grid cell across the whole session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey(u64);

impl CellKey {
    /// CellKey:
    /// | channel (8) | timepoint (16) | level (8) | cell index (32) |
    /// 63          56 55            40 39       32 31              0

    pub fn new(channel: ChannelId, timepoint: TimepointId, level: LevelId, cell_index: u64) -> Self {
        let channel = channel.0 as u64;
        let timepoint = timepoint.0 as u64;
        let level = level.0 as u64;
        CellKey(
            (channel & CHANNEL_MASK) << CHANNEL_SHIFT
                | (timepoint & TIME_MASK) << TIME_SHIFT
                | (level & LEVEL_MASK) << LEVEL_SHIFT
                | (cell_index & CELL_MASK) << CELL_SHIFT,
        )
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId(((self.0 >> CHANNEL_SHIFT) & CHANNEL_MASK) as u8)
    }

    pub fn timepoint(&self) -> TimepointId {
        TimepointId(((self.0 >> TIME_SHIFT) & TIME_MASK) as u16)
    }

    pub fn level(&self) -> LevelId {
        LevelId(((self.0 >> LEVEL_SHIFT) & LEVEL_MASK) as u8)
    }

    pub fn cell_index(&self) -> u64 {
        (self.0 >> CELL_SHIFT) & CELL_MASK
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One numeric element kind a cell array can carry.
pub trait Element: Copy + Send + Sync + 'static {
    const ZERO: Self;
}

impl Element for u8 {
    const ZERO: Self = 0;
}
impl Element for u16 {
    const ZERO: Self = 0;
}
impl Element for u32 {
    const ZERO: Self = 0;
}
impl Element for i16 {
    const ZERO: Self = 0;
}
impl Element for f32 {
    const ZERO: Self = 0.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridError {
    CellIndexOutOfBounds,
    PointOutOfBounds,
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridError::CellIndexOutOfBounds => write!(f, "cell index out of grid bounds"),
            GridError::PointOutOfBounds => write!(f, "point out of level bounds"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBounds {
    pub origin: [u64; 3],
    pub shape: [u32; 3],
}

/// Partition of one resolution level into fixed-shape cells.
///
/// Cell index <-> cell grid position is a row-major mixed-radix bijection
/// (x fastest). Cells on the upper boundary are truncated to the level
/// dimensions, everything else has the full cell shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    dims: [u64; 3],
    cell_shape: [u32; 3],
    grid_dims: [u64; 3],
}

impl GridLayout {
    pub fn new(dims: [u64; 3], cell_shape: [u32; 3]) -> Self {
        for axis in 0..3 {
            assert!(dims[axis] > 0, "level dimension {axis} must be at least 1");
            assert!(
                cell_shape[axis] > 0,
                "cell shape component {axis} must be at least 1"
            );
        }
        let grid_dims = [
            dims[0].div_ceil(cell_shape[0] as u64),
            dims[1].div_ceil(cell_shape[1] as u64),
            dims[2].div_ceil(cell_shape[2] as u64),
        ];
        let num_cells = grid_dims[0]
            .checked_mul(grid_dims[1])
            .and_then(|n| n.checked_mul(grid_dims[2]))
            .expect("grid cell count overflow");
        assert!(
            num_cells <= CELL_MASK + 1,
            "grid cell count {num_cells} exceeds the cell index budget"
        );
        Self {
            dims,
            cell_shape,
            grid_dims,
        }
    }

    pub fn dims(&self) -> [u64; 3] {
        self.dims
    }

    pub fn cell_shape(&self) -> [u32; 3] {
        self.cell_shape
    }

    pub fn grid_dims(&self) -> [u64; 3] {
        self.grid_dims
    }

    pub fn num_cells(&self) -> u64 {
        self.grid_dims[0] * self.grid_dims[1] * self.grid_dims[2]
    }

    pub fn cell_pos(&self, index: u64) -> Result<[u64; 3], GridError> {
        if index >= self.num_cells() {
            return Err(GridError::CellIndexOutOfBounds);
        }
        let x = index % self.grid_dims[0];
        let rest = index / self.grid_dims[0];
        let y = rest % self.grid_dims[1];
        let z = rest / self.grid_dims[1];
        Ok([x, y, z])
    }

    pub fn cell_index(&self, pos: [u64; 3]) -> Result<u64, GridError> {
        for axis in 0..3 {
            if pos[axis] >= self.grid_dims[axis] {
                return Err(GridError::CellIndexOutOfBounds);
            }
        }
        Ok((pos[2] * self.grid_dims[1] + pos[1]) * self.grid_dims[0] + pos[0])
    }

    pub fn cell_bounds(&self, index: u64) -> Result<CellBounds, GridError> {
        let pos = self.cell_pos(index)?;
        let mut origin = [0u64; 3];
        let mut shape = [0u32; 3];
        for axis in 0..3 {
            origin[axis] = pos[axis] * self.cell_shape[axis] as u64;
            let remaining = self.dims[axis] - origin[axis];
            shape[axis] = remaining.min(self.cell_shape[axis] as u64) as u32;
        }
        Ok(CellBounds { origin, shape })
    }

    pub fn cell_index_for_point(&self, point: [u64; 3]) -> Result<u64, GridError> {
        for axis in 0..3 {
            if point[axis] >= self.dims[axis] {
                return Err(GridError::PointOutOfBounds);
            }
        }
        let pos = [
            point[0] / self.cell_shape[0] as u64,
            point[1] / self.cell_shape[1] as u64,
            point[2] / self.cell_shape[2] as u64,
        ];
        self.cell_index(pos)
    }

    /// Cells overlapping the half-open region `[min, max)` in level
    /// coordinates, in row-major order (x fastest). The region is clamped to
    /// the level bounds; a region entirely outside yields nothing.
    pub fn cells_intersecting(&self, min: [u64; 3], max: [u64; 3]) -> CellsIntersecting {
        let mut min_cell = [0u64; 3];
        let mut max_cell = [0u64; 3];
        for axis in 0..3 {
            let clamped_max = max[axis].min(self.dims[axis]);
            if min[axis] >= clamped_max {
                return CellsIntersecting::empty();
            }
            min_cell[axis] = min[axis] / self.cell_shape[axis] as u64;
            max_cell[axis] = (clamped_max - 1) / self.cell_shape[axis] as u64;
        }
        CellsIntersecting {
            grid_dims: self.grid_dims,
            min_cell,
            max_cell,
            next: Some(min_cell),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CellsIntersecting {
    grid_dims: [u64; 3],
    min_cell: [u64; 3],
    max_cell: [u64; 3],
    next: Option<[u64; 3]>,
}

impl CellsIntersecting {
    fn empty() -> Self {
        Self {
            grid_dims: [1, 1, 1],
            min_cell: [0, 0, 0],
            max_cell: [0, 0, 0],
            next: None,
        }
    }
}

impl Iterator for CellsIntersecting {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let pos = self.next?;
        let index = (pos[2] * self.grid_dims[1] + pos[1]) * self.grid_dims[0] + pos[0];
        let mut advanced = pos;
        advanced[0] += 1;
        if advanced[0] > self.max_cell[0] {
            advanced[0] = self.min_cell[0];
            advanced[1] += 1;
            if advanced[1] > self.max_cell[1] {
                advanced[1] = self.min_cell[1];
                advanced[2] += 1;
                if advanced[2] > self.max_cell[2] {
                    self.next = None;
                    return Some(index);
                }
            }
        }
        self.next = Some(advanced);
        Some(index)
    }
}

/// Element buffer plus a validity flag. An invalid array is a zero-filled
/// placeholder of the right length; its contents must not be trusted for
/// anything beyond display as "no data yet". Valid arrays are write-once.
#[derive(Debug, Clone)]
pub struct VolatileArray<T> {
    data: Box<[T]>,
    valid: bool,
}

impl<T: Element> VolatileArray<T> {
    pub fn loaded(data: Box<[T]>) -> Self {
        Self { data, valid: true }
    }

    pub fn placeholder(len: usize) -> Self {
        Self {
            data: vec![T::ZERO; len].into_boxed_slice(),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An immutable grid-aligned tile. Refresh is replacement, never in-place
/// mutation, so cells can be shared freely between the cache and readers.
#[derive(Debug, Clone)]
pub struct Cell<T> {
    key: CellKey,
    origin: [u64; 3],
    shape: [u32; 3],
    array: VolatileArray<T>,
}

impl<T: Element> Cell<T> {
    pub fn new(key: CellKey, origin: [u64; 3], shape: [u32; 3], array: VolatileArray<T>) -> Self {
        let expected = shape[0] as usize * shape[1] as usize * shape[2] as usize;
        assert_eq!(
            array.len(),
            expected,
            "cell array length does not match cell shape"
        );
        Self {
            key,
            origin,
            shape,
            array,
        }
    }

    pub fn key(&self) -> CellKey {
        self.key
    }

    pub fn origin(&self) -> [u64; 3] {
        self.origin
    }

    pub fn shape(&self) -> [u32; 3] {
        self.shape
    }

    pub fn array(&self) -> &VolatileArray<T> {
        &self.array
    }

    pub fn is_valid(&self) -> bool {
        self.array.is_valid()
    }

    /// Element at a level-coordinate point, or None outside this cell.
    pub fn value_at(&self, point: [u64; 3]) -> Option<T> {
        let mut local = [0usize; 3];
        for axis in 0..3 {
            if point[axis] < self.origin[axis] {
                return None;
            }
            let offset = point[axis] - self.origin[axis];
            if offset >= self.shape[axis] as u64 {
                return None;
            }
            local[axis] = offset as usize;
        }
        let index =
            (local[2] * self.shape[1] as usize + local[1]) * self.shape[0] as usize + local[0];
        Some(self.array.data()[index])
    }
}

/// Level dimensions after per-axis downsampling of the full-resolution
/// interval, rounding partial source pixels up.
pub fn level_dims(full_dims: [u64; 3], downsampling: [u32; 3]) -> [u64; 3] {
    [
        full_dims[0].div_ceil(downsampling[0] as u64),
        full_dims[1].div_ceil(downsampling[1] as u64),
        full_dims[2].div_ceil(downsampling[2] as u64),
    ]
}
