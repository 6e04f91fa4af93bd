use rand::Rng;
use serde::Serialize;

/// Stable identifier of an agent inside one arena.
pub type AgentId = u32;

/// An integer grid coordinate: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }

    /// Sum of absolute row and column differences.
    pub fn manhattan(self, other: Point) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    pub fn offset(self, dx: i32, dy: i32) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

/// Content of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Pickup,
    Agent(AgentId),
}

/// The arena grid: a fixed-size row-major array of cells.
#[derive(Debug, Clone)]
pub struct Grid {
    pub rows: usize,
    pub cols: usize,
    cells: Vec<Cell>,
}

impl Grid {
    /// Create an empty grid.
    pub fn new(rows: usize, cols: usize) -> Self {
        Grid {
            rows,
            cols,
            cells: vec![Cell::Empty; rows * cols],
        }
    }

    #[inline]
    fn index(&self, p: Point) -> Option<usize> {
        if self.contains(p) {
            Some(p.y as usize * self.cols + p.x as usize)
        } else {
            None
        }
    }

    /// Returns true if `p` lies inside the grid.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= 0 && p.y >= 0 && (p.x as usize) < self.cols && (p.y as usize) < self.rows
    }

    /// Cell at `p`, or `None` when out of bounds.
    pub fn get(&self, p: Point) -> Option<Cell> {
        self.index(p).map(|i| self.cells[i])
    }

    /// Overwrite the cell at `p`. Returns false (and does nothing) when out of bounds.
    pub fn set(&mut self, p: Point, cell: Cell) -> bool {
        match self.index(p) {
            Some(i) => {
                self.cells[i] = cell;
                true
            }
            None => false,
        }
    }

    pub fn is_empty_at(&self, p: Point) -> bool {
        self.get(p) == Some(Cell::Empty)
    }

    /// A uniformly random cell of the grid.
    pub fn random_point<R: Rng>(&self, rng: &mut R) -> Point {
        let y = rng.gen_range(0..self.rows) as i32;
        let x = rng.gen_range(0..self.cols) as i32;
        Point::new(x, y)
    }

    /// Rejection-sample a uniformly random empty cell.
    /// Returns `None` when the grid has no empty cell left.
    pub fn random_empty_point<R: Rng>(&self, rng: &mut R) -> Option<Point> {
        if !self.cells.iter().any(|c| *c == Cell::Empty) {
            return None;
        }
        loop {
            let p = self.random_point(rng);
            if self.is_empty_at(p) {
                return Some(p);
            }
        }
    }

    /// All cells in row-major order with their coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (Point, Cell)> + '_ {
        self.cells.iter().enumerate().map(move |(i, cell)| {
            let p = Point::new((i % self.cols) as i32, (i / self.cols) as i32);
            (p, *cell)
        })
    }

    /// Find where an agent currently stands.
    pub fn locate(&self, id: AgentId) -> Option<Point> {
        self.iter()
            .find(|(_, c)| *c == Cell::Agent(id))
            .map(|(p, _)| p)
    }

    pub fn count_pickups(&self) -> usize {
        self.cells.iter().filter(|c| **c == Cell::Pickup).count()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
