use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::Accumulator;
use crate::kernel::{flags, zero};
use crate::scheme::HeScheme;
use crate::shape::{CoordinateIter, Shape, linear_index, project, reduce_shape, row_major_strides};
use crate::value::HeValue;

/// Sums `input` over `axes`. Returns the values and the reduced shape.
pub fn sum<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    in_shape: &[usize],
    axes: &[usize],
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    if let Some(&bad) = axes.iter().find(|&&a| a >= in_shape.len()) {
        return Err(HeError::validation(format!(
            "Sum: axis {bad} out of range for {in_shape:?}"
        )));
    }
    let out_shape = reduce_shape(in_shape, axes);
    let out_strides = row_major_strides(&out_shape);

    // Contributors per output element, in input order.
    let mut sources = vec![Vec::new(); out_shape.iter().product()];
    for (i, coord) in CoordinateIter::new(in_shape).enumerate() {
        sources[linear_index(&project(&coord, axes), &out_strides)].push(i);
    }

    let (cipher, cp) = flags(input);
    let values = sources
        .par_iter()
        .map(|indices| {
            let mut acc = Accumulator::new();
            for &i in indices {
                acc.add(scheme, input[i].clone())?;
            }
            Ok(acc.finish(zero(cipher, cp)))
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}
