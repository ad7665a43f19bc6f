//! Kernels that only move values: broadcast, reshape, slice, reverse,
//! concat and pad.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::shape::{Shape, coordinate_of, linear_index, project, row_major_strides, shape_size};

/// Builds an output of `out_shape` by pulling each element from `input` at
/// the index `source` maps its output coordinate to.
fn gather<T, F>(input: &[T], out_shape: &[usize], source: F) -> Vec<T>
where
    T: Clone + Send + Sync,
    F: Fn(&[usize]) -> usize + Sync,
{
    (0..shape_size(out_shape))
        .into_par_iter()
        .map(|i| input[source(&coordinate_of(i, out_shape))].clone())
        .collect()
}

fn check_len<T>(op: &str, input: &[T], shape: &[usize]) -> HeResult<()> {
    if input.len() != shape_size(shape) {
        return Err(HeError::validation(format!(
            "{op}: {} values for shape {shape:?}",
            input.len()
        )));
    }
    Ok(())
}

/// Replicates `input` along the `axes` of `out_shape` that it lacks.
pub fn broadcast<T: Clone + Send + Sync>(
    input: &[T],
    in_shape: &[usize],
    out_shape: &[usize],
    axes: &[usize],
) -> HeResult<Vec<T>> {
    check_len("Broadcast", input, in_shape)?;
    let kept: Shape = project(out_shape, axes);
    if kept != in_shape {
        return Err(HeError::validation(format!(
            "Broadcast: {in_shape:?} does not fit {out_shape:?} along {axes:?}"
        )));
    }
    let strides = row_major_strides(in_shape);
    Ok(gather(input, out_shape, |coord| {
        linear_index(&project(coord, axes), &strides)
    }))
}

/// Reads `input` with its axes permuted by `input_order` and lays the result
/// out in `out_shape`.
pub fn reshape<T: Clone + Send + Sync>(
    input: &[T],
    in_shape: &[usize],
    input_order: &[usize],
    out_shape: &[usize],
) -> HeResult<Vec<T>> {
    check_len("Reshape", input, in_shape)?;
    let mut order_sorted = input_order.to_vec();
    order_sorted.sort_unstable();
    if order_sorted != (0..in_shape.len()).collect::<Vec<_>>() {
        return Err(HeError::validation(format!(
            "Reshape: {input_order:?} is not a permutation of {} axes",
            in_shape.len()
        )));
    }
    if shape_size(out_shape) != input.len() {
        return Err(HeError::validation(format!(
            "Reshape: cannot view {in_shape:?} as {out_shape:?}"
        )));
    }
    let transposed: Shape = input_order.iter().map(|&a| in_shape[a]).collect();
    let strides = row_major_strides(in_shape);
    Ok((0..input.len())
        .into_par_iter()
        .map(|i| {
            let t = coordinate_of(i, &transposed);
            let mut coord = vec![0; in_shape.len()];
            for (k, &axis) in input_order.iter().enumerate() {
                coord[axis] = t[k];
            }
            input[linear_index(&coord, &strides)].clone()
        })
        .collect())
}

pub fn slice_shape(lower: &[usize], upper: &[usize], strides: &[usize]) -> Shape {
    lower
        .iter()
        .zip(upper)
        .zip(strides)
        .map(|((&l, &u), &s)| u.saturating_sub(l).div_ceil(s.max(1)))
        .collect()
}

pub fn slice<T: Clone + Send + Sync>(
    input: &[T],
    in_shape: &[usize],
    lower: &[usize],
    upper: &[usize],
    strides: &[usize],
) -> HeResult<Vec<T>> {
    check_len("Slice", input, in_shape)?;
    let rank = in_shape.len();
    if lower.len() != rank || upper.len() != rank || strides.len() != rank {
        return Err(HeError::validation("Slice: bounds rank mismatch"));
    }
    for axis in 0..rank {
        if lower[axis] > upper[axis] || upper[axis] > in_shape[axis] || strides[axis] == 0 {
            return Err(HeError::validation(format!(
                "Slice: bad bounds [{}, {}) step {} on axis {axis} of {}",
                lower[axis], upper[axis], strides[axis], in_shape[axis]
            )));
        }
    }
    let out_shape = slice_shape(lower, upper, strides);
    let in_strides = row_major_strides(in_shape);
    Ok(gather(input, &out_shape, |coord| {
        let src: Vec<usize> = coord
            .iter()
            .enumerate()
            .map(|(axis, &c)| lower[axis] + c * strides[axis])
            .collect();
        linear_index(&src, &in_strides)
    }))
}

pub fn reverse<T: Clone + Send + Sync>(
    input: &[T],
    shape: &[usize],
    axes: &[usize],
) -> HeResult<Vec<T>> {
    check_len("Reverse", input, shape)?;
    if let Some(&bad) = axes.iter().find(|&&a| a >= shape.len()) {
        return Err(HeError::validation(format!(
            "Reverse: axis {bad} out of range for {shape:?}"
        )));
    }
    let strides = row_major_strides(shape);
    Ok(gather(input, shape, |coord| {
        let src: Vec<usize> = coord
            .iter()
            .enumerate()
            .map(|(axis, &c)| {
                if axes.contains(&axis) {
                    shape[axis] - 1 - c
                } else {
                    c
                }
            })
            .collect();
        linear_index(&src, &strides)
    }))
}

/// Joins `inputs` along `axis`. Returns the values and the output shape.
pub fn concat<T: Clone + Send + Sync>(
    inputs: &[(&[T], &[usize])],
    axis: usize,
) -> HeResult<(Vec<T>, Shape)> {
    let Some((_, first)) = inputs.first() else {
        return Err(HeError::validation("Concat: no inputs"));
    };
    if axis >= first.len() {
        return Err(HeError::validation(format!(
            "Concat: axis {axis} out of range for {first:?}"
        )));
    }
    let mut offsets = Vec::with_capacity(inputs.len());
    let mut total = 0;
    for (values, shape) in inputs {
        check_len("Concat", values, shape)?;
        let same_rest = shape.len() == first.len()
            && (0..shape.len()).all(|a| a == axis || shape[a] == first[a]);
        if !same_rest {
            return Err(HeError::validation(format!(
                "Concat: {shape:?} does not line up with {first:?} on axis {axis}"
            )));
        }
        offsets.push(total);
        total += shape[axis];
    }
    let mut out_shape = first.to_vec();
    out_shape[axis] = total;

    let values = (0..shape_size(&out_shape))
        .into_par_iter()
        .map(|i| {
            let mut coord = coordinate_of(i, &out_shape);
            let k = offsets
                .iter()
                .rposition(|&start| start <= coord[axis])
                .unwrap_or(0);
            coord[axis] -= offsets[k];
            let (values, shape) = inputs[k];
            values[linear_index(&coord, &row_major_strides(shape))].clone()
        })
        .collect();
    Ok((values, out_shape))
}

/// Surrounds `input` with `fill`. Returns the values and the output shape.
pub fn pad<T: Clone + Send + Sync>(
    input: &[T],
    in_shape: &[usize],
    below: &[usize],
    above: &[usize],
    fill: &T,
) -> HeResult<(Vec<T>, Shape)> {
    check_len("Pad", input, in_shape)?;
    if below.len() != in_shape.len() || above.len() != in_shape.len() {
        return Err(HeError::validation("Pad: padding rank mismatch"));
    }
    let out_shape: Shape = (0..in_shape.len())
        .map(|a| below[a] + in_shape[a] + above[a])
        .collect();
    let strides = row_major_strides(in_shape);
    let values = (0..shape_size(&out_shape))
        .into_par_iter()
        .map(|i| {
            let coord = coordinate_of(i, &out_shape);
            let inside = coord
                .iter()
                .enumerate()
                .all(|(a, &c)| c >= below[a] && c < below[a] + in_shape[a]);
            if inside {
                let src: Vec<usize> =
                    coord.iter().enumerate().map(|(a, &c)| c - below[a]).collect();
                input[linear_index(&src, &strides)].clone()
            } else {
                fill.clone()
            }
        })
        .collect();
    Ok((values, out_shape))
}
