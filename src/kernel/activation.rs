//! Non-polynomial activations evaluated in the clear.
//!
//! The local path decrypts, applies, and re-encrypts. It is insecure and
//! only used when no client is attached; otherwise the
//! [`crate::activation`] coordinator sends the elements out.

use rayon::prelude::*;

use crate::errors::HeResult;
use crate::scheme::HeScheme;
use crate::value::{self, HePlaintext, HeValue};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    /// Relu clipped to `[0, bound]`.
    BoundedRelu(f64),
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::BoundedRelu(bound) => x.max(0.0).min(bound),
        }
    }

    /// Function name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Relu => "Relu",
            Activation::BoundedRelu(_) => "BoundedRelu",
        }
    }

    pub fn bound(self) -> Option<f64> {
        match self {
            Activation::Relu => None,
            Activation::BoundedRelu(bound) => Some(bound),
        }
    }

    /// Inverse of [`Activation::name`].
    pub fn from_wire(name: &str, bound: Option<f64>) -> Option<Self> {
        match (name, bound) {
            ("Relu", _) => Some(Activation::Relu),
            ("BoundedRelu", Some(bound)) => Some(Activation::BoundedRelu(bound)),
            _ => None,
        }
    }

    pub fn apply_plain(self, plain: &HePlaintext) -> HePlaintext {
        HePlaintext::new(
            plain.values().iter().map(|&v| self.apply(v)).collect(),
            plain.complex_packing(),
        )
    }
}

pub fn activate_local<S: HeScheme>(
    scheme: &S,
    input: &[HeValue<S::Ciphertext>],
    activation: Activation,
    batch_size: usize,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    input
        .par_iter()
        .map(|v| match v {
            HeValue::Plaintext(p) => Ok(HeValue::Plaintext(activation.apply_plain(p))),
            HeValue::Ciphertext(c) => match c.known_scalar() {
                Some(k) => Ok(HeValue::known(activation.apply(k), c.complex_packing())),
                None => {
                    let plain = value::decrypt(scheme, c, batch_size)?;
                    let out = value::encrypt(scheme, &activation.apply_plain(&plain), false)?;
                    Ok(HeValue::Ciphertext(out))
                }
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimulatedCkks};
    use approx::assert_abs_diff_eq;

    #[test]
    fn relu_and_bounded_relu() {
        assert_eq!(Activation::Relu.apply(-1.0), 0.0);
        assert_eq!(Activation::Relu.apply(2.5), 2.5);
        assert_eq!(Activation::BoundedRelu(6.0).apply(7.0), 6.0);
        assert_eq!(Activation::BoundedRelu(6.0).apply(-7.0), 0.0);
        assert_eq!(
            Activation::from_wire("BoundedRelu", Some(6.0)),
            Some(Activation::BoundedRelu(6.0))
        );
        assert_eq!(Activation::from_wire("BoundedRelu", None), None);
    }

    #[test]
    fn local_path_reencrypts() {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        s.generate_keys().unwrap();
        let input = vec![
            HeValue::encrypted(s.encrypt(&[-1.0, 2.0], false).unwrap(), false),
            HeValue::known(-3.0, false),
            HeValue::plain(vec![4.0, -4.0], false),
        ];
        let out = activate_local(&s, &input, Activation::Relu, 2).unwrap();
        let first = value::to_plaintext(&s, &out[0], 2).unwrap();
        assert_abs_diff_eq!(first.values()[0], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(first.values()[1], 2.0, epsilon = 1e-3);
        assert_eq!(out[1].known_scalar(), Some(0.0));
        assert_eq!(out[2].as_plaintext().unwrap().values(), &[4.0, 0.0]);
    }
}
