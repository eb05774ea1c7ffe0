//! Rectangular sample storage shared by every pipeline stage
//!
//! A [`SampleBuffer`] is a rows × cols grid stored row-major in one flat
//! vector. The last row may carry `excess` trailing cells that are not part
//! of the payload; this is how a transmit burst whose length is not a
//! multiple of the radio's samples-per-buffer is laid out.
//!
//! ```text
//!            cols
//!        ┌───────────┐
//!  row 0 │ x x x x x │
//!  row 1 │ x x x x x │
//!  row 2 │ x x x . . │  <- excess = 2
//!        └───────────┘
//! ```
//!
//! Radios never see the buffer itself, only a [`BufferView`] or
//! [`BufferViewMut`] borrowed from it for the duration of one call.

use std::ops::{Index, IndexMut};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::io::{write_raw_file, RawSample};

/// Errors raised when sizing, slicing or persisting a buffer
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("excess samples ({excess}) must be smaller than the row length ({cols})")]
    InvalidExcess { excess: usize, cols: usize },

    #[error("rows {start}..{end} out of range for a buffer with {rows} rows")]
    RowOutOfRange { start: usize, end: usize, rows: usize },

    #[error("buffer would hold no samples")]
    Empty,

    #[error("buffer I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Dimensions of a radar buffer: `rows` rows of `cols` samples with `excess`
/// unused cells at the end of the final row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferShape {
    pub rows: usize,
    pub cols: usize,
    pub excess: usize,
}

impl BufferShape {
    /// Create a validated shape.
    pub fn new(rows: usize, cols: usize, excess: usize) -> Result<Self, BufferError> {
        let shape = Self { rows, cols, excess };
        shape.validate()?;
        Ok(shape)
    }

    /// Shape holding `total_samples` in rows of `samples_per_buffer`,
    /// padding the final row with excess cells when needed.
    pub fn for_samples(samples_per_buffer: usize, total_samples: usize) -> Self {
        if samples_per_buffer == 0 || total_samples == 0 {
            return Self {
                rows: 0,
                cols: samples_per_buffer,
                excess: 0,
            };
        }

        if total_samples % samples_per_buffer == 0 {
            Self {
                rows: total_samples / samples_per_buffer,
                cols: samples_per_buffer,
                excess: 0,
            }
        } else {
            let rows = total_samples / samples_per_buffer + 1;
            Self {
                rows,
                cols: samples_per_buffer,
                excess: rows * samples_per_buffer - total_samples,
            }
        }
    }

    /// Shape of a transmit buffer carrying `num_chirps` chirps of
    /// `samples_per_chirp` samples each. When one chirp fills exactly one
    /// radio buffer, each chirp gets its own row.
    pub fn for_chirps(samples_per_buffer: usize, samples_per_chirp: usize, num_chirps: usize) -> Self {
        if samples_per_buffer == samples_per_chirp {
            Self {
                rows: num_chirps,
                cols: samples_per_buffer,
                excess: 0,
            }
        } else {
            Self::for_samples(samples_per_buffer, samples_per_chirp * num_chirps)
        }
    }

    /// Total number of cells, including excess
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the shape holds no cells
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of payload cells (`rows·cols − excess`)
    pub fn valid_len(&self) -> usize {
        self.len().saturating_sub(self.excess)
    }

    fn validate(&self) -> Result<(), BufferError> {
        let ok = if self.rows == 0 || self.cols == 0 {
            self.excess == 0
        } else {
            self.excess < self.cols
        };

        if ok {
            Ok(())
        } else {
            Err(BufferError::InvalidExcess {
                excess: self.excess,
                cols: self.cols,
            })
        }
    }
}

/// Row-major 2-D sample container
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer<T> {
    data: Vec<T>,
    shape: BufferShape,
}

impl<T: Clone + Default> SampleBuffer<T> {
    /// Allocate a zeroed `rows × cols` buffer with no excess.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![T::default(); rows * cols],
            shape: BufferShape {
                rows,
                cols,
                excess: 0,
            },
        }
    }

    /// Allocate a zeroed buffer from a radar buffer shape.
    pub fn with_shape(shape: BufferShape) -> Result<Self, BufferError> {
        shape.validate()?;
        Ok(Self {
            data: vec![T::default(); shape.len()],
            shape,
        })
    }

    /// Re-dimension the buffer. Existing cells are kept in flat order,
    /// new cells are zeroed.
    pub fn resize(&mut self, rows: usize, cols: usize, excess: usize) -> Result<(), BufferError> {
        let shape = BufferShape::new(rows, cols, excess)?;
        self.data.resize(shape.len(), T::default());
        self.shape = shape;
        Ok(())
    }

    /// Copy `source` into the buffer starting at (0, 0).
    ///
    /// With `copy_until_full` the source is replayed cyclically until every
    /// payload cell is written; otherwise copying stops when the source runs
    /// out and the remaining cells keep their previous contents. Returns the
    /// number of cells written.
    pub fn load_cyclic(&mut self, source: &[T], copy_until_full: bool) -> usize {
        let valid = self.shape.valid_len();
        if valid == 0 || source.is_empty() {
            return 0;
        }

        if copy_until_full {
            for (dst, src) in self.data[..valid].iter_mut().zip(source.iter().cycle()) {
                *dst = src.clone();
            }
            valid
        } else {
            let n = valid.min(source.len());
            self.data[..n].clone_from_slice(&source[..n]);
            n
        }
    }

    /// Reset every cell to `T::default()`.
    pub fn clear(&mut self) {
        self.data.fill(T::default());
    }
}

impl<T> SampleBuffer<T> {
    pub fn shape(&self) -> BufferShape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    pub fn excess(&self) -> usize {
        self.shape.excess
    }

    /// Number of payload cells
    pub fn valid_len(&self) -> usize {
        self.shape.valid_len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, row: usize) -> &[T] {
        let cols = self.shape.cols;
        &self.data[row * cols..(row + 1) * cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let cols = self.shape.cols;
        &mut self.data[row * cols..(row + 1) * cols]
    }

    /// All cells in row-major order, including excess
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Payload cells only
    pub fn valid_samples(&self) -> &[T] {
        &self.data[..self.shape.valid_len()]
    }

    /// Borrow the whole buffer read-only.
    pub fn view(&self) -> BufferView<'_, T> {
        BufferView {
            data: &self.data,
            cols: self.shape.cols,
            excess: self.shape.excess,
        }
    }

    /// Borrow the whole buffer for writing.
    pub fn view_mut(&mut self) -> BufferViewMut<'_, T> {
        BufferViewMut {
            data: &mut self.data,
            cols: self.shape.cols,
        }
    }

    /// Borrow `count` rows starting at `start`.
    pub fn rows_view(&self, start: usize, count: usize) -> Result<BufferView<'_, T>, BufferError> {
        let range = self.row_range(start, count)?;
        let includes_last = start + count == self.shape.rows;
        Ok(BufferView {
            data: &self.data[range],
            cols: self.shape.cols,
            excess: if includes_last { self.shape.excess } else { 0 },
        })
    }

    /// Borrow `count` rows starting at `start` for writing.
    pub fn rows_view_mut(&mut self, start: usize, count: usize) -> Result<BufferViewMut<'_, T>, BufferError> {
        let range = self.row_range(start, count)?;
        Ok(BufferViewMut {
            data: &mut self.data[range],
            cols: self.shape.cols,
        })
    }

    fn row_range(&self, start: usize, count: usize) -> Result<std::ops::Range<usize>, BufferError> {
        let end = start + count;
        if end > self.shape.rows {
            return Err(BufferError::RowOutOfRange {
                start,
                end,
                rows: self.shape.rows,
            });
        }
        let cols = self.shape.cols;
        Ok(start * cols..end * cols)
    }
}

impl<T: RawSample> SampleBuffer<T> {
    /// Persist every cell (excess included) as raw native-endian values.
    pub fn write_raw(&self, path: impl AsRef<Path>) -> Result<(), BufferError> {
        write_raw_file(path, &self.data)?;
        Ok(())
    }
}

impl<T> Index<(usize, usize)> for SampleBuffer<T> {
    type Output = T;

    fn index(&self, (row, col): (usize, usize)) -> &T {
        debug_assert!(col < self.shape.cols);
        &self.data[row * self.shape.cols + col]
    }
}

impl<T> IndexMut<(usize, usize)> for SampleBuffer<T> {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
        debug_assert!(col < self.shape.cols);
        &mut self.data[row * self.shape.cols + col]
    }
}

// ---------------------------------------------------------------------------
// Borrowed views
// ---------------------------------------------------------------------------

/// Read-only borrow of whole rows of a [`SampleBuffer`]
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a, T> {
    data: &'a [T],
    cols: usize,
    excess: usize,
}

impl<'a, T> BufferView<'a, T> {
    /// Wrap a flat slice as rows of `cols` samples. Trailing cells that do
    /// not fill a row are ignored.
    pub fn from_slice(data: &'a [T], cols: usize) -> Self {
        let usable = if cols == 0 { 0 } else { data.len() / cols * cols };
        Self {
            data: &data[..usable],
            cols,
            excess: 0,
        }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, row: usize) -> &'a [T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    /// Cells that carry payload (excess of the final row dropped)
    pub fn valid_samples(&self) -> &'a [T] {
        &self.data[..self.data.len() - self.excess]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Mutable borrow of whole rows of a [`SampleBuffer`]
#[derive(Debug)]
pub struct BufferViewMut<'a, T> {
    data: &'a mut [T],
    cols: usize,
}

impl<'a, T> BufferViewMut<'a, T> {
    pub fn from_slice(data: &'a mut [T], cols: usize) -> Self {
        let usable = if cols == 0 { 0 } else { data.len() / cols * cols };
        Self {
            data: &mut data[..usable],
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IQSample;

    #[test]
    fn test_shape_for_samples() {
        assert_eq!(
            BufferShape::for_samples(100, 300),
            BufferShape { rows: 3, cols: 100, excess: 0 }
        );
        assert_eq!(
            BufferShape::for_samples(100, 250),
            BufferShape { rows: 3, cols: 100, excess: 50 }
        );
        assert_eq!(BufferShape::for_samples(100, 0).rows, 0);
    }

    #[test]
    fn test_shape_for_chirps() {
        // One chirp per radio buffer: one row per chirp
        let shape = BufferShape::for_chirps(512, 512, 8);
        assert_eq!(shape, BufferShape { rows: 8, cols: 512, excess: 0 });

        // 3 chirps of 300 samples in rows of 400: 900 samples, 3 rows, 300 excess
        let shape = BufferShape::for_chirps(400, 300, 3);
        assert_eq!(shape, BufferShape { rows: 3, cols: 400, excess: 300 });
        assert_eq!(shape.valid_len(), 900);
    }

    #[test]
    fn test_invalid_excess_rejected() {
        assert!(BufferShape::new(2, 4, 4).is_err());
        assert!(BufferShape::new(0, 4, 1).is_err());
        assert!(BufferShape::new(2, 4, 3).is_ok());

        let mut buf: SampleBuffer<f64> = SampleBuffer::new(2, 4);
        assert!(matches!(
            buf.resize(2, 4, 7),
            Err(BufferError::InvalidExcess { excess: 7, cols: 4 })
        ));
        // Failed resize leaves the buffer untouched
        assert_eq!(buf.shape(), BufferShape { rows: 2, cols: 4, excess: 0 });
    }

    #[test]
    fn test_load_single_copy_keeps_tail() {
        let mut buf = SampleBuffer::new(2, 3);
        buf.load_cyclic(&[9.0; 6], false);
        let written = buf.load_cyclic(&[1.0, 2.0, 3.0, 4.0], false);

        assert_eq!(written, 4);
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0, 4.0, 9.0, 9.0]);
    }

    #[test]
    fn test_load_copy_until_full_wraps() {
        let mut buf = SampleBuffer::new(2, 4);
        let written = buf.load_cyclic(&[1, 2, 3], true);

        assert_eq!(written, 8);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_load_respects_excess() {
        let mut buf = SampleBuffer::with_shape(BufferShape::new(2, 4, 3).unwrap()).unwrap();
        let written = buf.load_cyclic(&[7, 8], true);

        assert_eq!(written, 5);
        assert_eq!(buf.as_slice(), &[7, 8, 7, 8, 7, 0, 0, 0]);
        assert_eq!(buf.valid_samples(), &[7, 8, 7, 8, 7]);
    }

    #[test]
    fn test_load_into_empty_is_noop() {
        let mut buf: SampleBuffer<i32> = SampleBuffer::new(0, 0);
        assert_eq!(buf.load_cyclic(&[1, 2, 3], true), 0);

        let mut buf: SampleBuffer<i32> = SampleBuffer::new(2, 2);
        assert_eq!(buf.load_cyclic(&[], true), 0);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_indexing_and_clear() {
        let mut buf: SampleBuffer<IQSample> = SampleBuffer::new(3, 2);
        buf[(2, 1)] = IQSample::new(1.0, -1.0);

        assert_eq!(buf.row(2)[1], IQSample::new(1.0, -1.0));
        assert_eq!(buf.as_slice()[5], IQSample::new(1.0, -1.0));

        buf.clear();
        assert!(buf.as_slice().iter().all(|s| *s == IQSample::new(0.0, 0.0)));
    }

    #[test]
    fn test_views() {
        let mut buf = SampleBuffer::new(4, 2);
        buf.load_cyclic(&[0, 1, 2, 3, 4, 5, 6, 7], false);

        {
            let mut view = buf.rows_view_mut(1, 2).unwrap();
            assert_eq!(view.rows(), 2);
            view.row_mut(1)[0] = 40;
        }
        assert_eq!(buf[(2, 0)], 40);

        let view = buf.rows_view(2, 2).unwrap();
        assert_eq!(view.rows(), 2);
        assert_eq!(view.row(1), &[6, 7]);

        assert!(matches!(
            buf.rows_view(3, 2),
            Err(BufferError::RowOutOfRange { start: 3, end: 5, rows: 4 })
        ));
    }

    #[test]
    fn test_view_from_slice_drops_partial_row() {
        let data = [1, 2, 3, 4, 5];
        let view = BufferView::from_slice(&data, 2);
        assert_eq!(view.rows(), 2);
        assert_eq!(view.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_view_excess_only_on_last_row() {
        let mut buf = SampleBuffer::with_shape(BufferShape::new(2, 3, 1).unwrap()).unwrap();
        buf.load_cyclic(&[1, 2, 3, 4, 5], false);

        assert_eq!(buf.view().valid_samples(), &[1, 2, 3, 4, 5]);
        assert_eq!(buf.rows_view(0, 1).unwrap().valid_samples(), &[1, 2, 3]);
        assert_eq!(buf.rows_view(1, 1).unwrap().valid_samples(), &[4, 5]);
    }
}
