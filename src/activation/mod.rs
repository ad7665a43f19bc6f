//! Secure evaluation of non-polynomial ops with the client's help.
//!
//! The server sends masked ciphertexts; the client decrypts, evaluates the
//! function through a [`SecureComputation`], re-encrypts and replies.

pub mod coordinator;
pub mod mask;
pub mod session;

pub use coordinator::ActivationCoordinator;
pub use mask::GcMasks;
pub use session::{ServerSession, SessionPhase};

use crate::errors::{HeResult, ProtocolError};
use crate::kernel::activation::Activation;
use mask::{remask, unmask};

/// Client-side evaluation of a masked function.
pub trait SecureComputation: Send + Sync {
    /// Applies `activation` to every element of `inputs`.
    fn activate(
        &self,
        activation: Activation,
        inputs: &[Vec<f64>],
        masks: &GcMasks,
    ) -> HeResult<Vec<Vec<f64>>>;

    /// Slot-wise maximum over `candidates`.
    fn max(&self, candidates: &[Vec<f64>], masks: &GcMasks) -> HeResult<Vec<f64>>;
}

/// Stand-in for a garbled circuit run between the two parties.
///
/// The masks reach it as the garbler's circuit inputs; it removes the input
/// masks, evaluates, and adds the output masks. Not secure.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessGarbler;

impl SecureComputation for InProcessGarbler {
    fn activate(
        &self,
        activation: Activation,
        inputs: &[Vec<f64>],
        masks: &GcMasks,
    ) -> HeResult<Vec<Vec<f64>>> {
        masks.check(inputs.len(), inputs.len())?;
        Ok(inputs
            .iter()
            .enumerate()
            .map(|(i, masked)| {
                let y: Vec<f64> = unmask(masked, masks.input_at(i))
                    .into_iter()
                    .map(|x| activation.apply(x))
                    .collect();
                remask(&y, masks.output_at(i))
            })
            .collect())
    }

    fn max(&self, candidates: &[Vec<f64>], masks: &GcMasks) -> HeResult<Vec<f64>> {
        masks.check(candidates.len(), 1)?;
        let unmasked: Vec<Vec<f64>> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| unmask(c, masks.input_at(i)))
            .collect();
        Ok(remask(&slotwise_max(&unmasked), masks.output_at(0)))
    }
}

/// Evaluation in the clear, for sessions without garbled circuits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

impl SecureComputation for Plain {
    fn activate(
        &self,
        activation: Activation,
        inputs: &[Vec<f64>],
        masks: &GcMasks,
    ) -> HeResult<Vec<Vec<f64>>> {
        reject_masks(masks)?;
        Ok(inputs
            .iter()
            .map(|x| x.iter().map(|&v| activation.apply(v)).collect())
            .collect())
    }

    fn max(&self, candidates: &[Vec<f64>], masks: &GcMasks) -> HeResult<Vec<f64>> {
        reject_masks(masks)?;
        Ok(slotwise_max(candidates))
    }
}

fn reject_masks(masks: &GcMasks) -> HeResult<()> {
    if masks.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::malformed("masks sent without garbled circuits").into())
    }
}

fn slotwise_max(values: &[Vec<f64>]) -> Vec<f64> {
    let slots = values.iter().map(Vec::len).max().unwrap_or(0);
    (0..slots)
        .map(|s| {
            values
                .iter()
                .filter_map(|v| v.get(s).copied())
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn garbler_unmasks_and_remasks() {
        let masks = GcMasks {
            input: Some(vec![vec![10.0, -10.0]]),
            output: Some(vec![vec![0.5, 0.25]]),
        };
        // Masked inputs of (-1, 2).
        let out = InProcessGarbler
            .activate(Activation::Relu, &[vec![9.0, -8.0]], &masks)
            .unwrap();
        assert_abs_diff_eq!(out[0][0], 0.5);
        assert_abs_diff_eq!(out[0][1], 2.25);
    }

    #[test]
    fn garbler_max_over_masked_candidates() {
        let masks = GcMasks {
            input: Some(vec![vec![1.0], vec![-1.0], vec![0.0]]),
            output: Some(vec![vec![3.0]]),
        };
        let out = InProcessGarbler
            .max(&[vec![2.0], vec![4.0], vec![-7.0]], &masks)
            .unwrap();
        assert_eq!(out, vec![8.0]);
    }

    #[test]
    fn plain_refuses_masks() {
        let masks = GcMasks {
            input: Some(vec![vec![1.0]]),
            output: None,
        };
        assert!(Plain.activate(Activation::Relu, &[vec![1.0]], &masks).is_err());
        let out = Plain
            .activate(Activation::BoundedRelu(1.0), &[vec![-1.0, 0.5, 3.0]], &GcMasks::default())
            .unwrap();
        assert_eq!(out, vec![vec![0.0, 0.5, 1.0]]);
    }
}
