//! Ops with no homomorphic circuit: divide, minimum, power, exp, softmax
//! and max reduction.
//!
//! Ciphertext operands are decrypted, the op is computed slot-wise in the
//! clear and the result is re-encrypted. This needs the secret key on the
//! server, so it only runs when no client is attached. Known ciphertexts
//! stay known. A ciphertext divided by a plaintext is evaluated
//! homomorphically as a multiply by the reciprocal.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::kernel::arith::scalar_multiply;
use crate::kernel::flags;
use crate::kernel::pool::max_plain;
use crate::scheme::HeScheme;
use crate::shape::{CoordinateIter, Shape, linear_index, project, reduce_shape, row_major_strides};
use crate::value::{self, HePlaintext, HeValue};

/// Input positions folded into each output element of a reduction.
fn reduction_groups(
    op: &str,
    in_shape: &[usize],
    axes: &[usize],
) -> HeResult<(Vec<Vec<usize>>, Shape)> {
    if let Some(&bad) = axes.iter().find(|&&a| a >= in_shape.len()) {
        return Err(HeError::validation(format!(
            "{op}: axis {bad} out of range for {in_shape:?}"
        )));
    }
    let out_shape = reduce_shape(in_shape, axes);
    let out_strides = row_major_strides(&out_shape);
    let mut groups = vec![Vec::new(); out_shape.iter().product()];
    for (i, coord) in CoordinateIter::new(in_shape).enumerate() {
        groups[linear_index(&project(&coord, axes), &out_strides)].push(i);
    }
    Ok((groups, out_shape))
}

/// Wraps a cleartext result as the kind its operands call for.
fn finish<S: HeScheme>(
    scheme: &S,
    plain: HePlaintext,
    cipher: bool,
) -> HeResult<HeValue<S::Ciphertext>> {
    if cipher {
        Ok(HeValue::Ciphertext(value::encrypt(scheme, &plain, false)?))
    } else {
        Ok(HeValue::Plaintext(plain))
    }
}

fn plain_binary(a: &HePlaintext, b: &HePlaintext, f: impl Fn(f64, f64) -> f64) -> HePlaintext {
    let len = a.values().len().max(b.values().len());
    let values = (0..len).map(|i| f(a.get(i), b.get(i))).collect();
    HePlaintext::new(values, a.complex_packing() || b.complex_packing())
}

fn scalar_binary<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
    b: &HeValue<S::Ciphertext>,
    batch_size: usize,
    f: impl Fn(f64, f64) -> f64,
) -> HeResult<HeValue<S::Ciphertext>> {
    let cp = a.complex_packing() || b.complex_packing();
    match (a, b) {
        (HeValue::Plaintext(x), HeValue::Plaintext(y)) => {
            Ok(HeValue::Plaintext(plain_binary(x, y, f)))
        }
        _ => match (a.known_scalar(), b.known_scalar()) {
            (Some(x), Some(y)) => Ok(HeValue::known(f(x, y), cp)),
            _ => {
                let x = value::to_plaintext(scheme, a, batch_size)?;
                let y = value::to_plaintext(scheme, b, batch_size)?;
                finish(scheme, plain_binary(&x, &y, f), true)
            }
        },
    }
}

fn binary<S: HeScheme>(
    op: &str,
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
    batch_size: usize,
    f: impl Fn(f64, f64) -> f64 + Sync,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    if a.len() != b.len() {
        return Err(HeError::validation(format!(
            "{op}: operand sizes differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    a.par_iter()
        .zip(b)
        .map(|(x, y)| scalar_binary(scheme, x, y, batch_size, &f))
        .collect()
}

pub fn scalar_divide<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
    b: &HeValue<S::Ciphertext>,
    batch_size: usize,
) -> HeResult<HeValue<S::Ciphertext>> {
    match (a, b) {
        (HeValue::Ciphertext(c), HeValue::Plaintext(p)) if c.known_scalar().is_none() => {
            let inverse = p.values().iter().map(|v| 1.0 / v).collect();
            let inverse = HeValue::plain(inverse, p.complex_packing());
            scalar_multiply(scheme, a, &inverse)
        }
        _ => scalar_binary(scheme, a, b, batch_size, |x, y| x / y),
    }
}

pub fn divide<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    if a.len() != b.len() {
        return Err(HeError::validation(format!(
            "Divide: operand sizes differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    a.par_iter()
        .zip(b)
        .map(|(x, y)| scalar_divide(scheme, x, y, batch_size))
        .collect()
}

pub fn minimum<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    binary("Minimum", scheme, a, b, batch_size, f64::min)
}

/// `a` raised to `b`, slot-wise.
pub fn power<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    binary("Power", scheme, a, b, batch_size, f64::powf)
}

pub fn exp<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    input
        .par_iter()
        .map(|v| match v {
            HeValue::Plaintext(p) => Ok(HeValue::plain(
                p.values().iter().map(|x| x.exp()).collect(),
                p.complex_packing(),
            )),
            HeValue::Ciphertext(c) => match c.known_scalar() {
                Some(k) => Ok(HeValue::known(k.exp(), c.complex_packing())),
                None => {
                    let plain = value::decrypt(scheme, c, batch_size)?;
                    let out = HePlaintext::new(
                        plain.values().iter().map(|x| x.exp()).collect(),
                        plain.complex_packing(),
                    );
                    finish(scheme, out, true)
                }
            },
        })
        .collect()
}

/// Maximum of `input` over `axes`. Returns the values and the reduced shape.
pub fn max<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    in_shape: &[usize],
    axes: &[usize],
    batch_size: usize,
) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
    let (groups, out_shape) = reduction_groups("Max", in_shape, axes)?;
    let values = groups
        .par_iter()
        .map(|group| {
            if group.is_empty() {
                return Err(HeError::validation("Max: reduction covers no elements"));
            }
            let known: Option<Vec<f64>> =
                group.iter().map(|&i| input[i].known_scalar()).collect();
            let cipher = group.iter().any(|&i| input[i].is_ciphertext());
            if let (Some(known), true) = (known, cipher) {
                let cp = group.iter().any(|&i| input[i].complex_packing());
                let max = known.into_iter().fold(f64::NEG_INFINITY, f64::max);
                return Ok(HeValue::known(max, cp));
            }
            let candidates = group
                .iter()
                .map(|&i| value::to_plaintext(scheme, &input[i], batch_size))
                .collect::<HeResult<Vec<_>>>()?;
            finish(scheme, max_plain(&candidates, batch_size), cipher)
        })
        .collect::<HeResult<Vec<_>>>()?;
    Ok((values, out_shape))
}

/// Softmax over `axes`: each element is `exp(x - max) / sum(exp(x - max))`
/// within its reduction group, slot by slot.
pub fn softmax<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    shape: &[usize],
    axes: &[usize],
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    let (groups, _) = reduction_groups("Softmax", shape, axes)?;
    let plain = input
        .par_iter()
        .map(|v| value::to_plaintext(scheme, v, batch_size))
        .collect::<HeResult<Vec<_>>>()?;

    let mut out = vec![Vec::with_capacity(batch_size); input.len()];
    for group in &groups {
        for slot in 0..batch_size {
            let max = group
                .iter()
                .map(|&i| plain[i].get(slot))
                .fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = group.iter().map(|&i| (plain[i].get(slot) - max).exp()).sum();
            for &i in group {
                out[i].push((plain[i].get(slot) - max).exp() / total);
            }
        }
    }

    let (cipher, cp) = flags(input);
    out.into_par_iter()
        .map(|values| finish(scheme, HePlaintext::new(values, cp), cipher))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimCiphertext, SimulatedCkks};
    use approx::assert_abs_diff_eq;

    fn scheme() -> SimulatedCkks {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        s.generate_keys().unwrap();
        s
    }

    fn plain(values: &[f64]) -> Vec<HeValue<SimCiphertext>> {
        values.iter().map(|&v| HeValue::plain_scalar(v, false)).collect()
    }

    fn scalars(values: &[HeValue<SimCiphertext>]) -> Vec<f64> {
        values.iter().map(|v| v.known_scalar().unwrap()).collect()
    }

    #[test]
    fn plain_binary_ops() {
        let s = scheme();
        let a = plain(&[6.0, -2.0, 2.0]);
        let b = plain(&[3.0, 4.0, -1.0]);
        assert_eq!(scalars(&divide(&s, &a, &b, 1).unwrap()), vec![2.0, -0.5, -2.0]);
        assert_eq!(scalars(&minimum(&s, &a, &b, 1).unwrap()), vec![3.0, -2.0, -1.0]);
        assert_eq!(scalars(&power(&s, &a, &b, 1).unwrap()), vec![216.0, 16.0, 0.5]);
        assert!(minimum(&s, &a, &b[..2], 1).is_err());
    }

    #[test]
    fn known_values_stay_known() {
        let s = scheme();
        let out = exp(&s, &[HeValue::known(0.0, false)], 4).unwrap();
        assert_eq!(out[0].known_scalar(), Some(1.0));
        assert!(out[0].is_ciphertext());

        let out = minimum(&s, &[HeValue::known(3.0, false)], &plain(&[1.0]), 4).unwrap();
        assert_eq!(out[0].known_scalar(), Some(1.0));
        assert!(out[0].is_ciphertext());
    }

    #[test]
    fn cipher_divided_by_plain_multiplies_by_the_reciprocal() {
        let s = scheme();
        let ct = HeValue::encrypted(s.encrypt(&[3.0, -8.0], false).unwrap(), false);
        let out = scalar_divide(&s, &ct, &HeValue::plain(vec![2.0, 4.0], false), 2).unwrap();
        let HeValue::Ciphertext(c) = &out else {
            panic!("expected a ciphertext");
        };
        assert!(s.scale(c.as_encrypted().unwrap()) > s.default_scale());
        let got = value::to_plaintext(&s, &out, 2).unwrap();
        assert_abs_diff_eq!(got.values()[0], 1.5, epsilon = 1e-3);
        assert_abs_diff_eq!(got.values()[1], -2.0, epsilon = 1e-3);
    }

    #[test]
    fn max_reduces_rows_of_ciphertexts() {
        let s = scheme();
        let input: Vec<_> = [1.0, 7.0, -2.0, -5.0, -1.0, -9.0]
            .iter()
            .map(|&v| HeValue::encrypted(s.encrypt(&[v], false).unwrap(), false))
            .collect();
        let (out, shape) = max(&s, &input, &[2, 3], &[1], 1).unwrap();
        assert_eq!(shape, vec![2]);
        assert!(out.iter().all(|v| v.is_ciphertext()));
        let got: Vec<f64> = out
            .iter()
            .map(|v| value::to_plaintext(&s, v, 1).unwrap().values()[0])
            .collect();
        assert_abs_diff_eq!(got[0], 7.0, epsilon = 1e-3);
        assert_abs_diff_eq!(got[1], -1.0, epsilon = 1e-3);
        assert!(max(&s, &input, &[2, 3], &[2], 1).is_err());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let s = scheme();
        let input = plain(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let out = softmax(&s, &input, &[2, 3], &[1], 1).unwrap();
        let got = scalars(&out);
        let denom = 1f64.exp() + 2f64.exp() + 3f64.exp();
        assert_abs_diff_eq!(got[0], 1f64.exp() / denom, epsilon = 1e-12);
        assert_abs_diff_eq!(got[2], 3f64.exp() / denom, epsilon = 1e-12);
        assert_abs_diff_eq!(got[3..].iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(got[4], 1.0 / 3.0, epsilon = 1e-12);
    }
}
