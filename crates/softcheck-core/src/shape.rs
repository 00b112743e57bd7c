use std::fmt;

// Shape — N-dimensional shape
//
//   Scalar: Shape([])           0 dims, 1 element
//   Row:    Shape([1, 2])       the stability-probe fixture
//   Batch:  Shape([2, 3, 2, 3]) the rank-4 fixture
//
// Softmax reduces along one axis, so besides element counts and strides the
// shape also answers "how many independent rows does axis d split me into"
// (outer * inner) and "what does the keep-dim reduction look like".

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major (C-order) strides. For [2, 3, 4] this is [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for i in (0..self.rank()).rev() {
            strides[i] = acc;
            acc *= self.0[i];
        }
        strides
    }

    /// Column-major (Fortran-order) strides. For [2, 3, 4] this is [1, 2, 6].
    pub fn stride_fortran(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for i in 0..self.rank() {
            strides[i] = acc;
            acc *= self.0[i];
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// The shape after reducing `dim` with keep-dim semantics: [2, 3, 4] → [2, 1, 4].
    pub fn reduced(&self, dim: usize) -> crate::Result<Shape> {
        self.dim(dim)?;
        let mut dims = self.0.clone();
        dims[dim] = 1;
        Ok(Shape(dims))
    }

    /// The shape with `dim` removed: [2, 3, 4] → [2, 4].
    pub fn squeezed(&self, dim: usize) -> crate::Result<Shape> {
        self.dim(dim)?;
        let mut dims = self.0.clone();
        dims.remove(dim);
        Ok(Shape(dims))
    }

    /// Split the shape around `dim` into `(outer, len, inner)`.
    ///
    /// In row-major order, element `(o, k, i)` of the reduction lives at
    /// `(o * len + k) * inner + i`. Every (o, i) pair is one independent row.
    pub fn split_at_dim(&self, dim: usize) -> crate::Result<(usize, usize, usize)> {
        let len = self.dim(dim)?;
        let outer = self.0[..dim].iter().product();
        let inner = self.0[dim + 1..].iter().product();
        Ok((outer, len, inner))
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy rules: align from the right, dims are compatible if equal or one
    /// of them is 1, missing leading dims count as 1.
    ///
    ///   [2, 3] and [2, 1]   → [2, 3]   (keep-dim reduction broadcast back)
    ///   [3] and [4]         → Error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(crate::Error::msg(format!(
                    "shapes {} and {} are not broadcast-compatible (dim {} from right: {} vs {})",
                    lhs, rhs, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let you write Shape::from((2, 3)) instead of Shape::new(vec![2, 3])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
