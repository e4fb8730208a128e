use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::Position;

/// A generic 2D grid structure.
///
/// Stores elements of type `T` in a flat vector using row-major order.
/// The environment keeps one grid for agent occupancy and one for the cells
/// claimed while a step is being resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    /// Creates a new grid with the specified dimensions, filled with default values.
    ///
    /// # Panics
    ///
    /// Panics if `width * height` overflows `usize`.
    pub fn new(width: usize, height: usize) -> Self
    where
        T: Default + Clone,
    {
        let size = width.checked_mul(height).expect("Grid size overflow");
        Grid {
            width,
            height,
            cells: vec![T::default(); size],
        }
    }

    /// Returns the width of the grid.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the height of the grid.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    fn coords_to_index(&self, x: usize, y: usize) -> Option<usize> {
        if self.is_valid(x, y) {
            Some(y * self.width + x)
        } else {
            None
        }
    }

    /// Checks if the given coordinates are within the grid boundaries.
    #[inline]
    pub fn is_valid(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    /// Moves `position` by a signed offset.
    ///
    /// Returns `None` when the result would leave the grid on any side.
    pub fn offset(&self, position: Position, dx: isize, dy: isize) -> Option<Position> {
        let x = position.x.checked_add_signed(dx)?;
        let y = position.y.checked_add_signed(dy)?;
        self.is_valid(x, y).then_some(Position { x, y })
    }

    /// Gets an immutable reference to the cell at the given position.
    ///
    /// Returns `None` if the position is out of bounds.
    pub fn get(&self, position: Position) -> Option<&T> {
        let index = self.coords_to_index(position.x, position.y)?;
        self.cells.get(index)
    }

    /// Overwrites every cell with `value`.
    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.cells.fill(value);
    }

    /// Returns an iterator that yields `(Position, &T)` for each cell in row-major order.
    pub fn enumerate(&self) -> impl Iterator<Item = (Position, &T)> {
        let width = self.width;
        self.cells.iter().enumerate().map(move |(index, cell)| {
            let position = Position {
                x: index % width,
                y: index / width,
            };
            (position, cell)
        })
    }
}

impl<T> Index<Position> for Grid<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: Position) -> &Self::Output {
        match self.coords_to_index(index.x, index.y) {
            Some(idx) => &self.cells[idx],
            None => panic!(
                "Grid index ({}, {}) out of bounds for grid size ({}, {})",
                index.x, index.y, self.width, self.height
            ),
        }
    }
}

impl<T> IndexMut<Position> for Grid<T> {
    #[inline]
    fn index_mut(&mut self, index: Position) -> &mut Self::Output {
        let (width, height) = (self.width, self.height);
        match self.coords_to_index(index.x, index.y) {
            Some(idx) => &mut self.cells[idx],
            None => panic!(
                "Grid index ({}, {}) out of bounds for grid size ({}, {})",
                index.x, index.y, width, height
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_stays_inside_bounds() {
        let grid: Grid<bool> = Grid::new(3, 3);
        let corner = Position::new(0, 0);

        assert_eq!(grid.offset(corner, -1, 0), None);
        assert_eq!(grid.offset(corner, 0, -1), None);
        assert_eq!(grid.offset(corner, 1, 0), Some(Position::new(1, 0)));
        assert_eq!(grid.offset(Position::new(2, 2), 0, 1), None);
    }

    #[test]
    fn enumerate_is_row_major() {
        let mut grid: Grid<u8> = Grid::new(2, 2);
        grid[Position::new(1, 0)] = 7;

        let cells: Vec<_> = grid.enumerate().map(|(p, v)| (p, *v)).collect();
        assert_eq!(cells[1], (Position::new(1, 0), 7));
        assert_eq!(cells[2].0, Position::new(0, 1));
    }

    #[test]
    fn fill_resets_every_cell() {
        let mut grid: Grid<Option<usize>> = Grid::new(2, 3);
        grid[Position::new(1, 2)] = Some(4);
        grid.fill(None);
        assert!(grid.enumerate().all(|(_, cell)| cell.is_none()));
        assert_eq!(grid.get(Position::new(2, 0)), None);
    }
}
