//! Average and max pooling over `[N, C, d_1..d_k]` data.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::{Accumulator, scalar_multiply};
use crate::kernel::{flags, zero};
use crate::scheme::HeScheme;
use crate::shape::{
    CoordinateIter, Shape, coordinate_of, linear_index, row_major_strides, shape_size,
};
use crate::value::{self, HePlaintext, HeValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub window_shape: Vec<usize>,
    pub window_strides: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
}

impl PoolParams {
    /// Non-overlapping windows without padding.
    pub fn new(window_shape: Vec<usize>) -> Self {
        let rank = window_shape.len();
        Self {
            window_strides: window_shape.clone(),
            window_shape,
            padding_below: vec![0; rank],
            padding_above: vec![0; rank],
        }
    }

    pub fn strides(mut self, strides: Vec<usize>) -> Self {
        self.window_strides = strides;
        self
    }

    pub fn padding(mut self, below: Vec<usize>, above: Vec<usize>) -> Self {
        self.padding_below = below;
        self.padding_above = above;
        self
    }
}

pub fn pool_shape(data_shape: &[usize], params: &PoolParams) -> HeResult<Shape> {
    if data_shape.len() < 3 {
        return Err(HeError::validation(format!(
            "Pool: data {data_shape:?} needs [N, C, spatial..]"
        )));
    }
    let spatial = data_shape.len() - 2;
    let lens = [
        params.window_shape.len(),
        params.window_strides.len(),
        params.padding_below.len(),
        params.padding_above.len(),
    ];
    if lens.iter().any(|&l| l != spatial) {
        return Err(HeError::validation(format!(
            "Pool: parameters do not have {spatial} spatial axes"
        )));
    }
    let mut out = data_shape[..2].to_vec();
    for a in 0..spatial {
        let span = data_shape[a + 2] + params.padding_below[a] + params.padding_above[a];
        let (window, stride) = (params.window_shape[a], params.window_strides[a]);
        if window == 0 || stride == 0 || window > span {
            return Err(HeError::validation(format!(
                "Pool: window {window} stride {stride} does not fit in {span} on spatial axis {a}"
            )));
        }
        out.push((span - window) / stride + 1);
    }
    Ok(out)
}

/// For each window, the input indices it covers and how many padded
/// positions it also spans.
struct Window {
    indices: Vec<usize>,
    padded: usize,
}

fn window_at(
    out: &[usize],
    data_shape: &[usize],
    params: &PoolParams,
    strides: &[usize],
) -> Window {
    let spatial = data_shape.len() - 2;
    let mut indices = Vec::new();
    let mut padded = 0;
    for offset in CoordinateIter::new(&params.window_shape) {
        let mut coord = vec![out[0], out[1]];
        let mut inside = true;
        for a in 0..spatial {
            let pos = out[a + 2] * params.window_strides[a] + offset[a];
            match pos.checked_sub(params.padding_below[a]) {
                Some(p) if p < data_shape[a + 2] => coord.push(p),
                _ => {
                    inside = false;
                    break;
                }
            }
        }
        if inside {
            indices.push(linear_index(&coord, strides));
        } else {
            padded += 1;
        }
    }
    Window { indices, padded }
}

/// Input indices of every pooling window, in output row-major order.
pub fn pool_windows(
    data_shape: &[usize],
    params: &PoolParams,
) -> HeResult<(Vec<Vec<usize>>, Shape)> {
    let out_shape = pool_shape(data_shape, params)?;
    let strides = row_major_strides(data_shape);
    let windows = CoordinateIter::new(&out_shape)
        .map(|out| window_at(&out, data_shape, params, &strides).indices)
        .collect();
    Ok((windows, out_shape))
}

pub fn avg_pool<S: HeScheme>(
    scheme: &S,
    data: &[HeValue<S::Ciphertext>],
    data_shape: &[usize],
    params: &PoolParams,
    include_padding: bool,
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    let out_shape = pool_shape(data_shape, params)?;
    if data.len() != shape_size(data_shape) {
        return Err(HeError::validation("AvgPool: data size does not match shape"));
    }
    let strides = row_major_strides(data_shape);
    let (cipher, cp) = flags(data);

    let values = (0..shape_size(&out_shape))
        .into_par_iter()
        .map(|i| {
            let out = coordinate_of(i, &out_shape);
            let window = window_at(&out, data_shape, params, &strides);
            let count = if include_padding {
                window.indices.len() + window.padded
            } else {
                window.indices.len()
            };
            if count == 0 {
                return Err(HeError::validation(format!(
                    "AvgPool: window at {out:?} covers no elements"
                )));
            }
            let mut acc = Accumulator::new();
            for &idx in &window.indices {
                acc.add(scheme, data[idx].clone())?;
            }
            let sum = acc.finish(zero(cipher, cp));
            scalar_multiply(scheme, &sum, &HeValue::plain_scalar(1.0 / count as f64, cp))
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}

/// Slot-wise maximum of plaintexts.
pub fn max_plain(values: &[HePlaintext], batch_size: usize) -> HePlaintext {
    let cp = values.iter().any(|p| p.complex_packing());
    let max = (0..batch_size)
        .map(|slot| {
            values
                .iter()
                .map(|p| p.get(slot))
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect();
    HePlaintext::new(max, cp)
}

/// Max pooling by decrypting locally. Only for setups without a client.
pub fn max_pool<S: HeScheme>(
    scheme: &S,
    data: &[HeValue<S::Ciphertext>],
    data_shape: &[usize],
    params: &PoolParams,
    batch_size: usize,
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    let (windows, out_shape) = pool_windows(data_shape, params)?;
    if data.len() != shape_size(data_shape) {
        return Err(HeError::validation("MaxPool: data size does not match shape"));
    }
    let values = windows
        .par_iter()
        .map(|window| {
            if window.is_empty() {
                return Err(HeError::validation("MaxPool: window covers no elements"));
            }
            let candidates = window
                .iter()
                .map(|&idx| value::to_plaintext(scheme, &data[idx], batch_size))
                .collect::<HeResult<Vec<_>>>()?;
            let max = max_plain(&candidates, batch_size);
            if window.iter().any(|&idx| data[idx].is_ciphertext()) {
                Ok(HeValue::Ciphertext(value::encrypt(scheme, &max, false)?))
            } else {
                Ok(HeValue::Plaintext(max))
            }
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimCiphertext, SimulatedCkks};
    use approx::assert_abs_diff_eq;

    fn grid() -> Vec<HeValue<SimCiphertext>> {
        (1..=9).map(|v| HeValue::plain_scalar(f64::from(v), false)).collect()
    }

    fn scheme() -> SimulatedCkks {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        s.generate_keys().unwrap();
        s
    }

    #[test]
    fn windows_skip_padding() {
        let params = PoolParams::new(vec![2, 2]).strides(vec![1, 1]);
        let (windows, shape) = pool_windows(&[1, 1, 3, 3], &params).unwrap();
        assert_eq!(shape, vec![1, 1, 2, 2]);
        assert_eq!(windows[0], vec![0, 1, 3, 4]);
        assert_eq!(windows[3], vec![4, 5, 7, 8]);

        let params = PoolParams::new(vec![2, 2]).padding(vec![0, 0], vec![1, 1]);
        let (windows, shape) = pool_windows(&[1, 1, 3, 3], &params).unwrap();
        assert_eq!(shape, vec![1, 1, 2, 2]);
        assert_eq!(windows[3], vec![8]);
    }

    #[test]
    fn avg_pool_with_and_without_padding_in_count() {
        let s = scheme();
        let params = PoolParams::new(vec![2, 2]).padding(vec![0, 0], vec![1, 1]);
        let (out, _) = avg_pool(&s, &grid(), &[1, 1, 3, 3], &params, false).unwrap();
        let got: Vec<f64> = out.iter().map(|v| v.known_scalar().unwrap()).collect();
        assert_eq!(got, vec![3.0, 4.5, 7.5, 9.0]);

        let (out, _) = avg_pool(&s, &grid(), &[1, 1, 3, 3], &params, true).unwrap();
        let got: Vec<f64> = out.iter().map(|v| v.known_scalar().unwrap()).collect();
        assert_eq!(got, vec![3.0, 2.25, 3.75, 2.25]);
    }

    #[test]
    fn local_max_pool_over_ciphertexts() {
        let s = scheme();
        let data: Vec<_> = [1.0, 5.0, -2.0, 3.0]
            .iter()
            .map(|&v| HeValue::encrypted(s.encrypt(&[v, -v], false).unwrap(), false))
            .collect();
        let params = PoolParams::new(vec![2]);
        let (out, shape) = max_pool(&s, &data, &[1, 1, 4], &params, 2).unwrap();
        assert_eq!(shape, vec![1, 1, 2]);
        let first = value::to_plaintext(&s, &out[0], 2).unwrap();
        assert_abs_diff_eq!(first.values()[0], 5.0, epsilon = 1e-3);
        assert_abs_diff_eq!(first.values()[1], -1.0, epsilon = 1e-3);
        let second = value::to_plaintext(&s, &out[1], 2).unwrap();
        assert_abs_diff_eq!(second.values()[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(second.values()[1], 2.0, epsilon = 1e-3);
    }
}
