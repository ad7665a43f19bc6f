use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::{scalar_add, scalar_multiply};
use crate::scheme::HeScheme;
use crate::shape::{coordinate_of, shape_size};
use crate::value::HeValue;

fn channel_constants<C>(
    name: &str,
    values: &[HeValue<C>],
    channels: usize,
) -> HeResult<Vec<f64>> {
    if values.len() != channels {
        return Err(HeError::validation(format!(
            "BatchNormInference: {name} has {} values for {channels} channels",
            values.len()
        )));
    }
    values
        .iter()
        .map(|v| match v {
            HeValue::Plaintext(p) => p.known_scalar().ok_or_else(|| {
                HeError::unsupported("BatchNormInference", format!("batched {name}"))
            }),
            HeValue::Ciphertext(_) => Err(HeError::unsupported(
                "BatchNormInference",
                format!("encrypted {name}"),
            )),
        })
        .collect()
}

/// Inference-mode batch normalization along channel axis 1:
/// `gamma * (x - mean) / sqrt(var + eps) + beta`, folded into one multiply
/// and one add per element.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm_inference<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    shape: &[usize],
    gamma: &[HeValue<S::Ciphertext>],
    beta: &[HeValue<S::Ciphertext>],
    mean: &[HeValue<S::Ciphertext>],
    variance: &[HeValue<S::Ciphertext>],
    eps: f64,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    if shape.len() < 2 || input.len() != shape_size(shape) {
        return Err(HeError::validation(format!(
            "BatchNormInference: input shape {shape:?} needs a channel axis"
        )));
    }
    let channels = shape[1];
    let gamma = channel_constants("gamma", gamma, channels)?;
    let beta = channel_constants("beta", beta, channels)?;
    let mean = channel_constants("mean", mean, channels)?;
    let variance = channel_constants("variance", variance, channels)?;

    let folded: Vec<(f64, f64)> = (0..channels)
        .map(|c| {
            let scale = gamma[c] / (variance[c] + eps).sqrt();
            (scale, beta[c] - mean[c] * scale)
        })
        .collect();

    input
        .par_iter()
        .enumerate()
        .map(|(i, x)| {
            let channel = coordinate_of(i, shape)[1];
            let (scale, shift) = folded[channel];
            let cp = x.complex_packing();
            let scaled = scalar_multiply(scheme, x, &HeValue::plain_scalar(scale, cp))?;
            scalar_add(scheme, &scaled, &HeValue::plain_scalar(shift, cp))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimCiphertext, SimulatedCkks};
    use crate::value;
    use approx::assert_abs_diff_eq;

    fn plain(values: &[f64]) -> Vec<HeValue<SimCiphertext>> {
        values.iter().map(|&v| HeValue::plain_scalar(v, false)).collect()
    }

    #[test]
    fn normalizes_per_channel() {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        s.generate_keys().unwrap();
        let input = vec![
            HeValue::encrypted(s.encrypt(&[3.0], false).unwrap(), false),
            HeValue::encrypted(s.encrypt(&[10.0], false).unwrap(), false),
        ];
        let out = batch_norm_inference(
            &s,
            &input,
            &[1, 2],
            &plain(&[2.0, 1.0]),
            &plain(&[1.0, 0.0]),
            &plain(&[1.0, 6.0]),
            &plain(&[4.0, 16.0]),
            0.0,
        )
        .unwrap();
        // (3 - 1) / 2 * 2 + 1 and (10 - 6) / 4.
        let first = value::to_plaintext(&s, &out[0], 1).unwrap().get(0);
        let second = value::to_plaintext(&s, &out[1], 1).unwrap().get(0);
        assert_abs_diff_eq!(first, 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(second, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn encrypted_statistics_are_unsupported() {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        s.generate_keys().unwrap();
        let enc = vec![HeValue::encrypted(s.encrypt(&[1.0], false).unwrap(), false)];
        let one = plain(&[1.0]);
        let err = batch_norm_inference(&s, &one, &[1, 1], &enc, &one, &one, &one, 1e-5)
            .unwrap_err();
        assert!(matches!(err, HeError::UnsupportedCombination { .. }));
    }
}
