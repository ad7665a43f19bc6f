//! Additive masks hiding activation inputs and outputs from the client.

use rand::Rng;

use crate::errors::{HeError, HeResult};
use crate::math::uniform_reals;

/// Masks are drawn uniformly from `[-DEFAULT_MASK_BOUND, DEFAULT_MASK_BOUND)`.
pub const DEFAULT_MASK_BOUND: f64 = 100.0;

/// Per-element masks of one request, each holding one value per batch slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcMasks {
    pub input: Option<Vec<Vec<f64>>>,
    pub output: Option<Vec<Vec<f64>>>,
}

impl GcMasks {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }

    /// Draws fresh masks for `count` elements of `batch_size` slots.
    pub fn sample<R: Rng + ?Sized>(
        count: usize,
        batch_size: usize,
        mask_inputs: bool,
        mask_outputs: bool,
        rng: &mut R,
    ) -> HeResult<Self> {
        let mut draw = |enabled: bool| -> HeResult<Option<Vec<Vec<f64>>>> {
            if !enabled {
                return Ok(None);
            }
            (0..count)
                .map(|_| uniform_reals(DEFAULT_MASK_BOUND, batch_size, rng))
                .collect::<HeResult<Vec<_>>>()
                .map(Some)
        };
        let input = draw(mask_inputs)?;
        let output = draw(mask_outputs)?;
        Ok(Self { input, output })
    }

    /// Masks for elements `start..start + len`.
    pub fn window(&self, start: usize, len: usize) -> Self {
        let cut = |m: &Option<Vec<Vec<f64>>>| {
            m.as_ref()
                .map(|v| v.iter().skip(start).take(len).cloned().collect())
        };
        Self {
            input: cut(&self.input),
            output: cut(&self.output),
        }
    }

    pub(crate) fn input_at(&self, idx: usize) -> Option<&[f64]> {
        self.input.as_ref().and_then(|m| m.get(idx)).map(Vec::as_slice)
    }

    pub(crate) fn output_at(&self, idx: usize) -> Option<&[f64]> {
        self.output.as_ref().and_then(|m| m.get(idx)).map(Vec::as_slice)
    }

    /// Checks both mask sets cover `inputs` and `outputs` elements.
    pub(crate) fn check(&self, inputs: usize, outputs: usize) -> HeResult<()> {
        let bad = |m: &Option<Vec<Vec<f64>>>, n: usize| m.as_ref().is_some_and(|v| v.len() != n);
        if bad(&self.input, inputs) || bad(&self.output, outputs) {
            return Err(HeError::validation(format!(
                "masks do not cover {inputs} inputs and {outputs} outputs"
            )));
        }
        Ok(())
    }
}

/// `a - b` slot by slot.
pub(crate) fn unmask(values: &[f64], mask: Option<&[f64]>) -> Vec<f64> {
    match mask {
        Some(m) => values.iter().zip(m).map(|(v, r)| v - r).collect(),
        None => values.to_vec(),
    }
}

/// `a + b` slot by slot.
pub(crate) fn remask(values: &[f64], mask: Option<&[f64]>) -> Vec<f64> {
    match mask {
        Some(m) => values.iter().zip(m).map(|(v, s)| v + s).collect(),
        None => values.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn masks_are_fresh_and_bounded() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let a = GcMasks::sample(3, 2, true, true, &mut rng).unwrap();
        let b = GcMasks::sample(3, 2, true, true, &mut rng).unwrap();
        assert_ne!(a, b);
        let input = a.input.as_ref().unwrap();
        assert_eq!(input.len(), 3);
        assert!(input.iter().flatten().all(|v| v.abs() <= DEFAULT_MASK_BOUND));
        assert!(GcMasks::sample(3, 2, false, false, &mut rng).unwrap().is_empty());
    }

    #[test]
    fn window_and_unmask() {
        let masks = GcMasks {
            input: Some(vec![vec![1.0], vec![2.0], vec![3.0]]),
            output: None,
        };
        let w = masks.window(1, 2);
        assert_eq!(w.input_at(0), Some(&[2.0][..]));
        assert_eq!(w.output_at(0), None);
        assert_eq!(unmask(&[5.0], w.input_at(1)), vec![2.0]);
        assert_eq!(remask(&[5.0], Some(&[1.5])), vec![6.5]);
        assert!(w.check(2, 2).is_ok());
        assert!(w.check(3, 2).is_err());
    }
}
