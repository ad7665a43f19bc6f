//! Canonical embedding between CKKS slot vectors and polynomial coefficients.
//!
//! A polynomial `m(X)` in `R[X]/(X^n + 1)` is evaluated at the primitive
//! `2n`-th roots `psi^(2j+1)`, `j = 0..n`. Writing `psi^(2j+1)` as
//! `psi * omega^j` turns the evaluation into a length-`n` DFT of the twisted
//! coefficients `a_k * psi^k`, so both directions run through `rustfft`.
//!
//! Slot `h` lives at the root `psi^(5^h mod 2n)`; its conjugate sits at the
//! mirrored evaluation index `n - 1 - j`. Filling both keeps the coefficients
//! real.

use std::f64::consts::PI;
use std::sync::Arc;

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use super::{EncodingError, EncodingResult};

/// Exponent of the root backing slot `h`: `5^h mod 2n`.
fn slot_exponent(h: usize, degree: usize) -> u64 {
    let modulus = (2 * degree) as u64;
    let mut acc = 1u64;
    for _ in 0..h {
        acc = (acc * 5) % modulus;
    }
    acc
}

/// Accepted input views for the slot builder.
#[derive(Clone, Copy, Debug)]
pub enum SlotInput<'a> {
    Real(&'a [f64]),
    Complex(&'a [Complex64]),
}

impl SlotInput<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            SlotInput::Real(values) => values.len(),
            SlotInput::Complex(values) => values.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Complex64 {
        match self {
            SlotInput::Real(values) => Complex64::new(values[idx], 0.0),
            SlotInput::Complex(values) => values[idx],
        }
    }
}

impl<'a> From<&'a [f64]> for SlotInput<'a> {
    fn from(values: &'a [f64]) -> Self {
        SlotInput::Real(values)
    }
}

impl<'a> From<&'a [Complex64]> for SlotInput<'a> {
    fn from(values: &'a [Complex64]) -> Self {
        SlotInput::Complex(values)
    }
}

/// Slot encoder for a ring of runtime degree `n`.
#[derive(Clone)]
pub struct SlotEncoder {
    degree: usize,
    psi_pows: Vec<Complex64>,
    /// Evaluation index (into the length-`n` DFT output) of each slot.
    slot_index: Vec<usize>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for SlotEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotEncoder")
            .field("degree", &self.degree)
            .finish()
    }
}

impl SlotEncoder {
    pub fn new(degree: usize) -> EncodingResult<Self> {
        if degree < 4 || !degree.is_power_of_two() {
            return Err(EncodingError::InvalidRingDegree { degree });
        }
        let psi = Complex64::from_polar(1.0, PI / degree as f64);
        let mut psi_pows = Vec::with_capacity(degree);
        let mut current = Complex64::new(1.0, 0.0);
        for _ in 0..degree {
            psi_pows.push(current);
            current *= psi;
        }

        let slot_index = (0..degree / 2)
            .map(|h| ((slot_exponent(h, degree) - 1) / 2) as usize)
            .collect();

        let mut planner = FftPlanner::new();
        Ok(Self {
            degree,
            psi_pows,
            slot_index,
            forward: planner.plan_fft_forward(degree),
            inverse: planner.plan_fft_inverse(degree),
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Maximum number of complex values held by one polynomial.
    pub fn slot_count(&self) -> usize {
        self.degree / 2
    }

    /// Encodes up to `n/2` slot values at `scale` into rounded coefficients.
    ///
    /// Missing trailing slots are zero.
    pub fn encode(
        &self,
        values: SlotInput<'_>,
        scale: f64,
    ) -> EncodingResult<Vec<f64>> {
        let n = self.degree;
        if values.len() > self.slot_count() {
            return Err(EncodingError::InputTooLong {
                got: values.len(),
                max: self.slot_count(),
            });
        }

        let mut evals = vec![Complex64::new(0.0, 0.0); n];
        for h in 0..values.len() {
            let z = values.get(h) * scale;
            let j = self.slot_index[h];
            evals[j] = z;
            evals[n - 1 - j] = z.conj();
        }

        // Inverse of the positive-exponent evaluation DFT.
        self.forward.process(&mut evals);
        let inv_n = (n as f64).recip();
        let coeffs = evals
            .iter()
            .zip(self.psi_pows.iter())
            .map(|(e, psi_k)| (*e * psi_k.conj() * inv_n).re.round())
            .collect();
        Ok(coeffs)
    }

    /// Evaluates coefficients back into `n/2` slot values divided by `scale`.
    pub fn decode(&self, coeffs: &[f64], scale: f64) -> Vec<Complex64> {
        let n = self.degree;
        let mut twisted: Vec<Complex64> = coeffs
            .iter()
            .zip(self.psi_pows.iter())
            .map(|(&a, psi_k)| *psi_k * a)
            .collect();
        twisted.resize(n, Complex64::new(0.0, 0.0));

        self.inverse.process(&mut twisted);
        self.slot_index
            .iter()
            .map(|&j| twisted[j] / scale)
            .collect()
    }
}
