//! Dense row-major matrices.

use std::{
    fmt,
    ops::{Index, IndexMut},
};

/// A dense, row-major, two-dimensional matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T> Matrix<T> {
    /// Returns the elements as a mutable row-major slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Returns the elements as a row-major slice.
    pub fn as_slice(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns the number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Creates a new matrix filled with a single element.
    pub fn from_element(element: T, rows: usize, cols: usize) -> Self
    where
        T: Clone,
    {
        Self::new_unchecked(vec![element; rows * cols], rows, cols)
    }

    /// Returns an element, or `None` if out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col)
        } else {
            None
        }
    }

    /// Returns a mutable element, or `None` if out of bounds.
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if row < self.rows && col < self.cols {
            self.data.get_mut(row * self.cols + col)
        } else {
            None
        }
    }

    /// Returns an iterator over the values of a single column, top to bottom.
    pub fn iter_col(&self, col: usize) -> impl Iterator<Item = &T> + Clone + '_ {
        self.data.iter().skip(col).step_by(self.cols.max(1)).take(self.rows)
    }

    /// Creates a new matrix from row-major data, checking that the shape fits.
    pub fn new<D>(data: D, rows: usize, cols: usize) -> Result<Self, ShapeError>
    where
        Vec<T>: From<D>,
    {
        let data = Vec::from(data);

        if data.len() == rows * cols {
            Ok(Self::new_unchecked::<Vec<T>>(data, rows, cols))
        } else {
            Err(ShapeError {
                rows,
                cols,
                n: data.len(),
            })
        }
    }

    /// Creates a new matrix from row-major data without checking the shape.
    pub fn new_unchecked<D>(data: D, rows: usize, cols: usize) -> Self
    where
        Vec<T>: From<D>,
    {
        Self {
            data: Vec::from(data),
            rows,
            cols,
        }
    }

    /// Returns a single row.
    ///
    /// # Panics
    ///
    /// Panics if the row is out of bounds.
    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Returns the number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl<T> Index<[usize; 2]> for Matrix<T> {
    type Output = T;

    fn index(&self, [row, col]: [usize; 2]) -> &Self::Output {
        self.get(row, col).expect("index out of bounds")
    }
}

impl<T> IndexMut<[usize; 2]> for Matrix<T> {
    fn index_mut(&mut self, [row, col]: [usize; 2]) -> &mut Self::Output {
        self.get_mut(row, col).expect("index out of bounds")
    }
}

/// An error when the number of elements does not match the requested shape.
#[derive(Debug)]
pub struct ShapeError {
    rows: usize,
    cols: usize,
    n: usize,
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ShapeError { rows, cols, n } = self;
        write!(
            f,
            "cannot construct {rows}x{cols} matrix from {n} elements"
        )
    }
}

impl std::error::Error for ShapeError {}
