//! N-d convolution with strides, window dilation, padding and data dilation.
//!
//! Data is `[N, C_in, d_1..d_k]`, filters `[C_out, C_in, f_1..f_k]`, output
//! `[N, C_out, o_1..o_k]`.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::{Accumulator, scalar_multiply};
use crate::kernel::{flags, zero};
use crate::scheme::HeScheme;
use crate::shape::{
    CoordinateIter, Shape, coordinate_of, linear_index, row_major_strides, shape_size,
};
use crate::value::HeValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionParams {
    pub window_strides: Vec<usize>,
    pub window_dilation: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
    pub data_dilation: Vec<usize>,
}

impl ConvolutionParams {
    /// Unit strides and dilations, no padding.
    pub fn unit(spatial_rank: usize) -> Self {
        Self {
            window_strides: vec![1; spatial_rank],
            window_dilation: vec![1; spatial_rank],
            padding_below: vec![0; spatial_rank],
            padding_above: vec![0; spatial_rank],
            data_dilation: vec![1; spatial_rank],
        }
    }

    fn check(&self, spatial_rank: usize) -> HeResult<()> {
        let lens = [
            self.window_strides.len(),
            self.window_dilation.len(),
            self.padding_below.len(),
            self.padding_above.len(),
            self.data_dilation.len(),
        ];
        if lens.iter().any(|&l| l != spatial_rank) {
            return Err(HeError::validation(format!(
                "Convolution: parameters do not have {spatial_rank} spatial axes"
            )));
        }
        let positive = self
            .window_strides
            .iter()
            .chain(&self.window_dilation)
            .chain(&self.data_dilation)
            .all(|&v| v > 0);
        if !positive {
            return Err(HeError::validation(
                "Convolution: strides and dilations must be positive",
            ));
        }
        Ok(())
    }
}

/// Extent of `dim` elements spread `dilation` apart.
pub(crate) fn dilated(dim: usize, dilation: usize) -> usize {
    if dim == 0 { 0 } else { (dim - 1) * dilation + 1 }
}

/// Maps a position in the padded, dilated input back to an input index.
/// `None` for padding and for the holes data dilation leaves.
pub(crate) fn source_position(
    padded: usize,
    padding_below: usize,
    data_dilation: usize,
    dim: usize,
) -> Option<usize> {
    let pos = padded.checked_sub(padding_below)?;
    if pos % data_dilation != 0 {
        return None;
    }
    let idx = pos / data_dilation;
    (idx < dim).then_some(idx)
}

pub fn convolution_shape(
    data_shape: &[usize],
    filter_shape: &[usize],
    params: &ConvolutionParams,
) -> HeResult<Shape> {
    if data_shape.len() < 3 || data_shape.len() != filter_shape.len() {
        return Err(HeError::validation(format!(
            "Convolution: data {data_shape:?} and filters {filter_shape:?} need equal rank >= 3"
        )));
    }
    if data_shape[1] != filter_shape[1] {
        return Err(HeError::validation(format!(
            "Convolution: {} input channels but filters expect {}",
            data_shape[1], filter_shape[1]
        )));
    }
    let spatial = data_shape.len() - 2;
    params.check(spatial)?;
    let mut out = vec![data_shape[0], filter_shape[0]];
    for a in 0..spatial {
        let span = dilated(data_shape[a + 2], params.data_dilation[a])
            + params.padding_below[a]
            + params.padding_above[a];
        let window = dilated(filter_shape[a + 2], params.window_dilation[a]);
        if window == 0 || window > span {
            return Err(HeError::validation(format!(
                "Convolution: window {window} does not fit in {span} on spatial axis {a}"
            )));
        }
        out.push((span - window) / params.window_strides[a] + 1);
    }
    Ok(out)
}

pub fn convolution<S: HeScheme>(
    scheme: &S,
    data: &[HeValue<S::Ciphertext>],
    data_shape: &[usize],
    filters: &[HeValue<S::Ciphertext>],
    filter_shape: &[usize],
    params: &ConvolutionParams,
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    let out_shape = convolution_shape(data_shape, filter_shape, params)?;
    if data.len() != shape_size(data_shape) || filters.len() != shape_size(filter_shape) {
        return Err(HeError::validation("Convolution: operand sizes do not match shapes"));
    }
    let spatial = data_shape.len() - 2;
    let data_strides = row_major_strides(data_shape);
    let filter_strides = row_major_strides(filter_shape);
    // Each filter tap walks C_in and the spatial window.
    let tap_shape: Shape = filter_shape[1..].to_vec();

    let (cipher_d, cp_d) = flags(data);
    let (cipher_f, cp_f) = flags(filters);

    let values = (0..shape_size(&out_shape))
        .into_par_iter()
        .map(|i| {
            let out = coordinate_of(i, &out_shape);
            let (batch, out_channel) = (out[0], out[1]);
            let mut acc = Accumulator::new();
            'taps: for tap in CoordinateIter::new(&tap_shape) {
                let mut data_coord = Vec::with_capacity(data_shape.len());
                data_coord.push(batch);
                data_coord.push(tap[0]);
                for a in 0..spatial {
                    let padded = out[a + 2] * params.window_strides[a]
                        + tap[a + 1] * params.window_dilation[a];
                    match source_position(
                        padded,
                        params.padding_below[a],
                        params.data_dilation[a],
                        data_shape[a + 2],
                    ) {
                        Some(idx) => data_coord.push(idx),
                        None => continue 'taps,
                    }
                }
                let mut filter_coord = Vec::with_capacity(filter_shape.len());
                filter_coord.push(out_channel);
                filter_coord.extend_from_slice(&tap);
                let product = scalar_multiply(
                    scheme,
                    &data[linear_index(&data_coord, &data_strides)],
                    &filters[linear_index(&filter_coord, &filter_strides)],
                )?;
                acc.add(scheme, product)?;
            }
            Ok(acc.finish(zero(cipher_d || cipher_f, cp_d || cp_f)))
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimCiphertext, SimulatedCkks};

    fn plain(values: impl IntoIterator<Item = f64>) -> Vec<HeValue<SimCiphertext>> {
        values.into_iter().map(|v| HeValue::plain_scalar(v, false)).collect()
    }

    fn scalars(values: &[HeValue<SimCiphertext>]) -> Vec<f64> {
        values.iter().map(|v| v.known_scalar().unwrap()).collect()
    }

    fn scheme() -> SimulatedCkks {
        SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap()
    }

    #[test]
    fn valid_2d_convolution() {
        let data = plain((1..=9).map(f64::from));
        let filters = plain([1.0, 0.0, 0.0, 1.0]);
        let (out, shape) = convolution(
            &scheme(),
            &data,
            &[1, 1, 3, 3],
            &filters,
            &[1, 1, 2, 2],
            &ConvolutionParams::unit(2),
        )
        .unwrap();
        assert_eq!(shape, vec![1, 1, 2, 2]);
        assert_eq!(scalars(&out), vec![6.0, 8.0, 12.0, 14.0]);
    }

    #[test]
    fn padding_and_stride() {
        let data = plain([1.0, 2.0, 3.0]);
        let filters = plain([1.0, 1.0, 1.0]);
        let params = ConvolutionParams {
            window_strides: vec![2],
            padding_below: vec![1],
            padding_above: vec![1],
            ..ConvolutionParams::unit(1)
        };
        let (out, shape) =
            convolution(&scheme(), &data, &[1, 1, 3], &filters, &[1, 1, 3], &params).unwrap();
        assert_eq!(shape, vec![1, 1, 2]);
        assert_eq!(scalars(&out), vec![3.0, 5.0]);
    }

    #[test]
    fn window_and_data_dilation() {
        let data = plain([1.0, 2.0, 3.0, 4.0, 5.0]);
        let filters = plain([1.0, 1.0]);
        let params = ConvolutionParams {
            window_dilation: vec![2],
            ..ConvolutionParams::unit(1)
        };
        let (out, _) =
            convolution(&scheme(), &data, &[1, 1, 5], &filters, &[1, 1, 2], &params).unwrap();
        assert_eq!(scalars(&out), vec![4.0, 6.0, 8.0]);

        let params = ConvolutionParams {
            data_dilation: vec![2],
            ..ConvolutionParams::unit(1)
        };
        // Dilated data is [1, _, 2]; every window sees exactly one value.
        let (out, shape) =
            convolution(&scheme(), &plain([1.0, 2.0]), &[1, 1, 2], &filters, &[1, 1, 2], &params)
                .unwrap();
        assert_eq!(shape, vec![1, 1, 2]);
        assert_eq!(scalars(&out), vec![1.0, 2.0]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let params = ConvolutionParams::unit(1);
        assert!(convolution_shape(&[1, 2, 4], &[1, 3, 2], &params).is_err());
    }
}
