use dilemma_types::{AgentId, Direction, Position};

/// At or below this many living agents the playable area loses its last
/// column and row.
pub(crate) const SHRINK_ALIVE_THRESHOLD: u32 = 4;

/// What lies one step away from a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    OutOfBounds,
    Empty,
    Occupied(AgentId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Option<AgentId>>,
}

impl Grid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width as usize * height as usize],
        }
    }

    /// Square grid sized for `population` agents.
    pub fn for_population(population: u32) -> Self {
        let side = grid_side(population);
        Self::new(side, side)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn occupant(&self, position: Position) -> Option<AgentId> {
        self.cell_index(position).and_then(|idx| self.cells[idx])
    }

    pub fn in_bounds(&self, position: Position) -> bool {
        position.x < self.width && position.y < self.height
    }

    /// Occupied cells in row-major order.
    pub fn occupied(&self) -> impl Iterator<Item = (Position, AgentId)> + '_ {
        let width = self.width as usize;
        self.cells.iter().enumerate().filter_map(move |(idx, cell)| {
            cell.map(|id| (Position::new((idx % width) as u32, (idx / width) as u32), id))
        })
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().flatten().count()
    }

    pub fn clear(&mut self) {
        self.cells.fill(None);
    }

    /// Puts `id` on an empty in-bounds cell. Returns false otherwise.
    pub(crate) fn place(&mut self, position: Position, id: AgentId) -> bool {
        let Some(idx) = self.cell_index(position) else {
            return false;
        };
        if self.cells[idx].is_some() {
            return false;
        }
        self.cells[idx] = Some(id);
        true
    }

    /// Empties the cell if `id` is the one standing there.
    pub(crate) fn vacate(&mut self, position: Position, id: AgentId) -> bool {
        match self.cell_index(position) {
            Some(idx) if self.cells[idx] == Some(id) => {
                self.cells[idx] = None;
                true
            }
            _ => false,
        }
    }

    /// Von Neumann neighbours of `(x, y)` indexed like [`Direction::ALL`].
    ///
    /// With `alive` at or below [`SHRINK_ALIVE_THRESHOLD`] the last column and
    /// row are treated as out of bounds for rightward and downward steps.
    pub fn find_neighbors(&self, position: Position, alive: u32) -> [Neighbor; 4] {
        Direction::ALL.map(|direction| self.neighbor(position, direction, alive))
    }

    pub fn neighbor(&self, position: Position, direction: Direction, alive: u32) -> Neighbor {
        match self.step(position, direction, alive) {
            Some(target) => match self.occupant(target) {
                Some(id) => Neighbor::Occupied(id),
                None => Neighbor::Empty,
            },
            None => Neighbor::OutOfBounds,
        }
    }

    /// Target cell of a step, or `None` when that step leaves the playable area.
    pub fn step(&self, position: Position, direction: Direction, alive: u32) -> Option<Position> {
        let shrink = u32::from(alive <= SHRINK_ALIVE_THRESHOLD);
        let Position { x, y } = position;
        let target = match direction {
            Direction::Left => Position::new(x.checked_sub(1)?, y),
            Direction::Up => Position::new(x, y.checked_sub(1)?),
            Direction::Right => {
                if x.saturating_add(1 + shrink) >= self.width {
                    return None;
                }
                Position::new(x + 1, y)
            }
            Direction::Down => {
                if y.saturating_add(1 + shrink) >= self.height {
                    return None;
                }
                Position::new(x, y + 1)
            }
        };
        self.in_bounds(target).then_some(target)
    }

    fn cell_index(&self, position: Position) -> Option<usize> {
        if !self.in_bounds(position) {
            return None;
        }
        Some(position.y as usize * self.width as usize + position.x as usize)
    }
}

/// `round(sqrt(population) * 1.5)`
pub fn grid_side(population: u32) -> u32 {
    (f64::from(population).sqrt() * 1.5).round() as u32
}
