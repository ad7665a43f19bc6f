//! Op kernels over `HeValue` slices laid out row-major.
//!
//! Shapes passed to kernels are storage shapes: for packed tensors the
//! batch axis is already folded to 1 and batch values live in the slots.

pub mod activation;
pub mod arith;
pub mod batch_norm;
pub mod convolution;
pub mod dot;
pub mod nonlinear;
pub mod pool;
pub mod reduce;
pub mod structural;

use crate::value::HeValue;

/// Additive identity of the right kind for an empty reduction.
pub(crate) fn zero<C>(cipher: bool, complex_packing: bool) -> HeValue<C> {
    if cipher {
        HeValue::known(0.0, complex_packing)
    } else {
        HeValue::plain_scalar(0.0, complex_packing)
    }
}

/// Whether any value is a ciphertext, and whether any uses complex packing.
pub(crate) fn flags<C>(values: &[HeValue<C>]) -> (bool, bool) {
    values.iter().fold((false, false), |(cipher, cp), v| {
        (cipher || v.is_ciphertext(), cp || v.complex_packing())
    })
}
