//! Scale and modulus-chain bookkeeping.
//!
//! Binary ciphertext operations need both operands at the same chain index
//! and scale. Multiplications square the scale; the product is rescaled
//! lazily, once, right before something consumes it.

use rayon::prelude::*;
use tracing::trace;

use crate::errors::{HeResult, PrecisionError};
use crate::scheme::HeScheme;
use crate::tensor::HeTensor;
use crate::value::HeValue;

/// Two scales closer than this factor are treated as equal.
pub const RESCALE_TOLERANCE: f64 = 1.02;

pub fn within_rescale_tolerance(scale0: f64, scale1: f64) -> bool {
    scale0 / scale1 <= RESCALE_TOLERANCE && scale1 / scale0 <= RESCALE_TOLERANCE
}

/// Relabels `b`'s scale to `a`'s when they agree within tolerance.
pub fn match_scale<S: HeScheme>(
    scheme: &S,
    a: &S::Ciphertext,
    b: &mut S::Ciphertext,
) -> HeResult<()> {
    let (scale_a, scale_b) = (scheme.scale(a), scheme.scale(b));
    if !within_rescale_tolerance(scale_a, scale_b) {
        return Err(PrecisionError::ScaleMismatch {
            expected: scale_a,
            actual: scale_b,
        }
        .into());
    }
    scheme.set_scale(b, scale_a);
    Ok(())
}

/// Whether `scale` is far enough above `other` that dropping the prime at
/// `chain_index` brings them closer.
fn rescale_helps<S: HeScheme>(scheme: &S, chain_index: usize, scale: f64, other: f64) -> bool {
    match scheme.prime_at(chain_index) {
        Some(prime) if chain_index > 0 => scale / other > (prime as f64).sqrt(),
        _ => false,
    }
}

/// Matches chain index and scale of two ciphertexts in place.
///
/// Each step lowers one operand by one level: the higher one when the
/// chain indices differ, otherwise the one with the larger scale. An
/// operand whose scale is well above the other's is rescaled, anything
/// else is mod-switched.
pub fn match_modulus_and_scale<S: HeScheme>(
    scheme: &S,
    a: &mut S::Ciphertext,
    b: &mut S::Ciphertext,
) -> HeResult<()> {
    loop {
        let (chain_a, chain_b) = (scheme.chain_index(a), scheme.chain_index(b));
        let (scale_a, scale_b) = (scheme.scale(a), scheme.scale(b));
        if chain_a == chain_b {
            let (larger, high, low) = if scale_a > scale_b {
                (&mut *a, scale_a, scale_b)
            } else {
                (&mut *b, scale_b, scale_a)
            };
            if !rescale_helps(scheme, chain_a, high, low) {
                break;
            }
            scheme.rescale_to_next(larger)?;
            continue;
        }
        let (higher, chain, own, other) = if chain_a > chain_b {
            (&mut *a, chain_a, scale_a, scale_b)
        } else {
            (&mut *b, chain_b, scale_b, scale_a)
        };
        if rescale_helps(scheme, chain, own, other) {
            scheme.rescale_to_next(higher)?;
        } else {
            scheme.mod_switch_to_next(higher)?;
        }
    }
    match_scale(scheme, a, b)
}

/// Mod-switches every encrypted value down to the smallest chain index
/// present. Returns that index, or `None` if nothing is encrypted.
pub fn match_to_smallest_chain_index<S: HeScheme>(
    scheme: &S,
    values: &mut [HeValue<S::Ciphertext>],
) -> HeResult<Option<usize>> {
    let smallest = values
        .iter()
        .filter_map(|v| match v {
            HeValue::Ciphertext(c) => c.as_encrypted(),
            HeValue::Plaintext(_) => None,
        })
        .map(|ct| scheme.chain_index(ct))
        .min();
    let Some(target) = smallest else {
        return Ok(None);
    };
    values.par_iter_mut().try_for_each(|v| match v {
        HeValue::Ciphertext(c) => match c.as_encrypted_mut() {
            Some(ct) => scheme.mod_switch_to(ct, target),
            None => Ok(()),
        },
        HeValue::Plaintext(_) => Ok(()),
    })?;
    Ok(Some(target))
}

/// Whether `ct` still carries the scale of an unrescaled product.
fn needs_rescale<S: HeScheme>(scheme: &S, ct: &S::Ciphertext) -> bool {
    let chain = scheme.chain_index(ct);
    if chain == 0 {
        return false;
    }
    match scheme.prime_at(chain) {
        Some(prime) => scheme.scale(ct) / scheme.default_scale() > (prime as f64).sqrt(),
        None => false,
    }
}

/// Rescales every encrypted, non-known value whose scale is above nominal.
/// Values at chain index 0 are left alone. Returns how many were rescaled.
pub fn rescale_values<S: HeScheme>(
    scheme: &S,
    values: &mut [HeValue<S::Ciphertext>],
) -> HeResult<usize> {
    values
        .par_iter_mut()
        .map(|v| {
            let ct = match v {
                HeValue::Ciphertext(c) => c.as_encrypted_mut(),
                HeValue::Plaintext(_) => None,
            };
            match ct {
                Some(ct) if needs_rescale(scheme, ct) => {
                    scheme.rescale_to_next(ct)?;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
        .sum::<HeResult<usize>>()
}

/// Performs a pending lazy rescale of `tensor`, at most once.
pub fn rescale_tensor<S: HeScheme>(
    scheme: &S,
    tensor: &mut HeTensor<S::Ciphertext>,
) -> HeResult<()> {
    if !tensor.pending_rescale() {
        return Ok(());
    }
    let count = rescale_values(scheme, tensor.data_mut())?;
    trace!(tensor = tensor.name(), count, "lazy rescale");
    tensor.set_pending_rescale(false);
    Ok(())
}
