//! Generalized dot product over trailing/leading axes.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::{Accumulator, scalar_multiply};
use crate::kernel::{flags, zero};
use crate::scheme::HeScheme;
use crate::shape::{
    CoordinateIter, Shape, coordinate_of, linear_index, row_major_strides, shape_size,
};
use crate::value::HeValue;

/// Output shape of contracting the last `reduction_axes` axes of `arg0`
/// with the first `reduction_axes` axes of `arg1`.
pub fn dot_shape(
    arg0_shape: &[usize],
    arg1_shape: &[usize],
    reduction_axes: usize,
) -> HeResult<Shape> {
    if reduction_axes > arg0_shape.len() || reduction_axes > arg1_shape.len() {
        return Err(HeError::validation(format!(
            "Dot: {reduction_axes} reduction axes for {arg0_shape:?} . {arg1_shape:?}"
        )));
    }
    let split = arg0_shape.len() - reduction_axes;
    if arg0_shape[split..] != arg1_shape[..reduction_axes] {
        return Err(HeError::validation(format!(
            "Dot: reduction axes of {arg0_shape:?} and {arg1_shape:?} differ"
        )));
    }
    Ok(arg0_shape[..split]
        .iter()
        .chain(&arg1_shape[reduction_axes..])
        .copied()
        .collect())
}

pub fn dot<S: HeScheme>(
    scheme: &S,
    arg0: &[HeValue<S::Ciphertext>],
    arg0_shape: &[usize],
    arg1: &[HeValue<S::Ciphertext>],
    arg1_shape: &[usize],
    reduction_axes: usize,
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    let out_shape = dot_shape(arg0_shape, arg1_shape, reduction_axes)?;
    if arg0.len() != shape_size(arg0_shape) || arg1.len() != shape_size(arg1_shape) {
        return Err(HeError::validation("Dot: operand sizes do not match shapes"));
    }
    let split0 = arg0_shape.len() - reduction_axes;
    let reduction_shape = &arg0_shape[split0..];
    let strides0 = row_major_strides(arg0_shape);
    let strides1 = row_major_strides(arg1_shape);

    let (cipher0, cp0) = flags(arg0);
    let (cipher1, cp1) = flags(arg1);
    let empty = || zero(cipher0 || cipher1, cp0 || cp1);

    let values = (0..shape_size(&out_shape))
        .into_par_iter()
        .map(|i| {
            let out = coordinate_of(i, &out_shape);
            let mut acc = Accumulator::new();
            for r in CoordinateIter::new(reduction_shape) {
                let c0: Vec<usize> = out[..split0].iter().chain(&r).copied().collect();
                let c1: Vec<usize> = r.iter().chain(&out[split0..]).copied().collect();
                let product = scalar_multiply(
                    scheme,
                    &arg0[linear_index(&c0, &strides0)],
                    &arg1[linear_index(&c1, &strides1)],
                )?;
                acc.add(scheme, product)?;
            }
            Ok(acc.finish(empty()))
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}
