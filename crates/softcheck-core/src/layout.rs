use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — Memory layout of a tensor (shape + strides + offset)
//
// The layout decouples the logical shape of a tensor from the order its data
// sits in storage. Softmax must give the same answer whatever that order is,
// so the suite deliberately feeds it layouts that are not row-major:
//
//   contiguous  [2, 3] strides [3, 1]   C order, the default
//   fortran     [2, 3] strides [1, 2]   column-major, same logical values
//   transposed  [3, 2] strides [1, 3]   a free view of a [2, 3] tensor
//   broadcast   [2, 3] strides [1, 0]   a [2, 1] reduction stretched back
//
// Kernels that want flat rows call `is_contiguous()` and copy when it fails.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Column-major layout for the given shape.
    pub fn fortran(shape: Shape) -> Self {
        let strides = shape.stride_fortran();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// A layout is contiguous if its strides equal the row-major strides and
    /// it starts at offset 0. Size-1 dims are ignored since their stride is
    /// never used.
    pub fn is_contiguous(&self) -> bool {
        if self.offset != 0 {
            return false;
        }
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Transpose two dimensions by swapping shape and strides. No data moves.
    ///
    /// Example: [2, 3, 4] transpose(0, 2) → [4, 3, 2]
    ///          strides [12, 4, 1]         → [1, 4, 12]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// View this layout as the larger shape `target` without copying.
    ///
    /// Dims are aligned from the right. A dim that already matches keeps its
    /// stride, a size-1 dim or a missing leading dim gets stride 0.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if dst.len() < src.len() {
            return Err(Error::msg(format!(
                "cannot broadcast {} to lower-rank shape {}",
                self.shape, target
            )));
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for (i, &d) in dst.iter().enumerate() {
            if i < lead {
                continue;
            }
            let s = src[i - lead];
            if s == d {
                strides[i] = self.strides[i - lead];
            } else if s != 1 {
                return Err(Error::msg(format!(
                    "cannot broadcast {} to {}: dim {} has size {}",
                    self.shape, target, i, s
                )));
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// flat_index = offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over the storage index of every element, in logical
    /// (row-major) order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter — storage indices of a layout in logical order
//
// For a contiguous layout this counts 0, 1, 2, ... For a fortran or
// transposed layout it jumps around storage following the strides.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        self.current
            .iter()
            .zip(self.strides.iter())
            .fold(self.offset, |acc, (&i, &s)| acc + i * s)
    }

    // Rightmost dimension moves fastest.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
