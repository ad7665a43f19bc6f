//! Row-major shape arithmetic shared by the structural and reduction kernels.

pub type Shape = Vec<usize>;
pub type Coordinate = Vec<usize>;

pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

#[inline]
pub fn linear_index(coord: &[usize], strides: &[usize]) -> usize {
    coord.iter().zip(strides).map(|(c, s)| c * s).sum()
}

/// Coordinate of linear index `index` in `shape`.
pub fn coordinate_of(mut index: usize, shape: &[usize]) -> Coordinate {
    let mut coord = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        let dim = shape[axis].max(1);
        coord[axis] = index % dim;
        index /= dim;
    }
    coord
}

/// Iterates the coordinates of `shape` in row-major order.
pub struct CoordinateIter {
    shape: Shape,
    next: Option<Coordinate>,
}

impl CoordinateIter {
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.contains(&0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for CoordinateIter {
    type Item = Coordinate;

    fn next(&mut self) -> Option<Coordinate> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        let mut axis = succ.len();
        loop {
            if axis == 0 {
                break;
            }
            axis -= 1;
            succ[axis] += 1;
            if succ[axis] < self.shape[axis] {
                self.next = Some(succ);
                break;
            }
            succ[axis] = 0;
        }
        Some(current)
    }
}

/// Drops the listed axes from `coord`.
pub fn project(coord: &[usize], axes: &[usize]) -> Coordinate {
    coord
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, &c)| c)
        .collect()
}

/// Drops the listed axes from `shape`.
pub fn reduce_shape(shape: &[usize], axes: &[usize]) -> Shape {
    project(shape, axes)
}

/// `shape` with the leading (batch) axis folded to 1.
pub fn packed_shape(shape: &[usize]) -> Shape {
    let mut packed = shape.to_vec();
    if let Some(first) = packed.first_mut() {
        *first = 1;
    }
    packed
}
