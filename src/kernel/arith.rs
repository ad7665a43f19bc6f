//! Elementwise arithmetic over `HeValue`, with the known-value fast path.
//!
//! Every function matches all operand combinations exhaustively. Known
//! ciphertexts and plaintext scalars never reach the scheme when the result
//! is itself known; a zero factor short-circuits the multiply entirely.

use rayon::prelude::*;

use crate::errors::{HeError, HeResult};
use crate::precision::match_modulus_and_scale;
use crate::scheme::HeScheme;
use crate::value::{HePlaintext, HeValue};

enum Operand<'a, C> {
    Encrypted(&'a C),
    Known(f64),
    Plain(&'a HePlaintext),
}

fn view<C>(value: &HeValue<C>) -> Operand<'_, C> {
    match value {
        HeValue::Plaintext(p) => Operand::Plain(p),
        HeValue::Ciphertext(c) => match c.as_encrypted() {
            Some(ct) => Operand::Encrypted(ct),
            None => Operand::Known(c.known_scalar().unwrap_or(0.0)),
        },
    }
}

fn plain_binary(
    a: &HePlaintext,
    b: &HePlaintext,
    f: impl Fn(f64, f64) -> f64,
) -> HePlaintext {
    let len = a.values().len().max(b.values().len());
    let values = (0..len).map(|i| f(a.get(i), b.get(i))).collect();
    HePlaintext::new(values, a.complex_packing() || b.complex_packing())
}

fn plain_map(p: &HePlaintext, f: impl Fn(f64) -> f64) -> Vec<f64> {
    p.values().iter().map(|&v| f(v)).collect()
}

/// Encrypts cleartext that turned out not to be a single known value.
fn materialize<S: HeScheme>(
    scheme: &S,
    values: Vec<f64>,
    complex_packing: bool,
) -> HeResult<HeValue<S::Ciphertext>> {
    Ok(HeValue::encrypted(
        scheme.encrypt(&values, complex_packing)?,
        complex_packing,
    ))
}

pub fn scalar_add<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
    b: &HeValue<S::Ciphertext>,
) -> HeResult<HeValue<S::Ciphertext>> {
    let cp = a.complex_packing() || b.complex_packing();
    let enc = |ct| Ok(HeValue::encrypted(ct, cp));
    match (view(a), view(b)) {
        (Operand::Plain(x), Operand::Plain(y)) => {
            Ok(HeValue::Plaintext(plain_binary(x, y, |p, q| p + q)))
        }
        (Operand::Known(x), Operand::Known(y)) => Ok(HeValue::known(x + y, cp)),
        (Operand::Encrypted(c), Operand::Known(k))
        | (Operand::Known(k), Operand::Encrypted(c)) => {
            if k == 0.0 {
                enc(c.clone())
            } else {
                enc(scheme.add_plain(c, &[k], cp)?)
            }
        }
        (Operand::Encrypted(x), Operand::Encrypted(y)) => {
            let (mut x, mut y) = (x.clone(), y.clone());
            match_modulus_and_scale(scheme, &mut x, &mut y)?;
            enc(scheme.add(&x, &y)?)
        }
        (Operand::Encrypted(c), Operand::Plain(p))
        | (Operand::Plain(p), Operand::Encrypted(c)) => {
            if p.known_scalar() == Some(0.0) {
                enc(c.clone())
            } else {
                enc(scheme.add_plain(c, p.values(), cp)?)
            }
        }
        (Operand::Known(k), Operand::Plain(p))
        | (Operand::Plain(p), Operand::Known(k)) => match p.known_scalar() {
            Some(q) => Ok(HeValue::known(k + q, cp)),
            None => materialize(scheme, plain_map(p, |v| v + k), cp),
        },
    }
}

pub fn scalar_subtract<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
    b: &HeValue<S::Ciphertext>,
) -> HeResult<HeValue<S::Ciphertext>> {
    let cp = a.complex_packing() || b.complex_packing();
    let enc = |ct| Ok(HeValue::encrypted(ct, cp));
    match (view(a), view(b)) {
        (Operand::Plain(x), Operand::Plain(y)) => {
            Ok(HeValue::Plaintext(plain_binary(x, y, |p, q| p - q)))
        }
        (Operand::Known(x), Operand::Known(y)) => Ok(HeValue::known(x - y, cp)),
        (Operand::Encrypted(c), Operand::Known(k)) => {
            if k == 0.0 {
                enc(c.clone())
            } else {
                enc(scheme.sub_plain(c, &[k], cp)?)
            }
        }
        (Operand::Known(k), Operand::Encrypted(c)) => {
            let negated = scheme.negate(c)?;
            if k == 0.0 {
                enc(negated)
            } else {
                enc(scheme.add_plain(&negated, &[k], cp)?)
            }
        }
        (Operand::Encrypted(x), Operand::Encrypted(y)) => {
            let (mut x, mut y) = (x.clone(), y.clone());
            match_modulus_and_scale(scheme, &mut x, &mut y)?;
            enc(scheme.sub(&x, &y)?)
        }
        (Operand::Encrypted(c), Operand::Plain(p)) => {
            if p.known_scalar() == Some(0.0) {
                enc(c.clone())
            } else {
                enc(scheme.sub_plain(c, p.values(), cp)?)
            }
        }
        (Operand::Plain(p), Operand::Encrypted(c)) => {
            let negated = scheme.negate(c)?;
            if p.known_scalar() == Some(0.0) {
                enc(negated)
            } else {
                enc(scheme.add_plain(&negated, p.values(), cp)?)
            }
        }
        (Operand::Known(k), Operand::Plain(p)) => match p.known_scalar() {
            Some(q) => Ok(HeValue::known(k - q, cp)),
            None => materialize(scheme, plain_map(p, |v| k - v), cp),
        },
        (Operand::Plain(p), Operand::Known(k)) => match p.known_scalar() {
            Some(q) => Ok(HeValue::known(q - k, cp)),
            None => materialize(scheme, plain_map(p, |v| v - k), cp),
        },
    }
}

pub fn scalar_multiply<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
    b: &HeValue<S::Ciphertext>,
) -> HeResult<HeValue<S::Ciphertext>> {
    let cp = a.complex_packing() || b.complex_packing();
    let enc = |ct| Ok(HeValue::encrypted(ct, cp));
    match (view(a), view(b)) {
        (Operand::Plain(x), Operand::Plain(y)) => {
            Ok(HeValue::Plaintext(plain_binary(x, y, |p, q| p * q)))
        }
        (Operand::Known(x), Operand::Known(y)) => Ok(HeValue::known(x * y, cp)),
        (Operand::Encrypted(c), Operand::Known(k))
        | (Operand::Known(k), Operand::Encrypted(c)) => {
            if k == 0.0 {
                Ok(HeValue::known(0.0, cp))
            } else {
                enc(scheme.multiply_plain(c, &[k], cp)?)
            }
        }
        (Operand::Encrypted(x), Operand::Encrypted(y)) => {
            if cp {
                return Err(HeError::unsupported(
                    "Multiply",
                    "cipher x cipher with complex packing",
                ));
            }
            let (mut x, mut y) = (x.clone(), y.clone());
            match_modulus_and_scale(scheme, &mut x, &mut y)?;
            enc(scheme.multiply(&x, &y)?)
        }
        (Operand::Encrypted(c), Operand::Plain(p))
        | (Operand::Plain(p), Operand::Encrypted(c)) => {
            if p.known_scalar() == Some(0.0) {
                Ok(HeValue::known(0.0, cp))
            } else {
                enc(scheme.multiply_plain(c, p.values(), cp)?)
            }
        }
        (Operand::Known(k), Operand::Plain(p))
        | (Operand::Plain(p), Operand::Known(k)) => match p.known_scalar() {
            Some(q) => Ok(HeValue::known(k * q, cp)),
            None if k == 0.0 => Ok(HeValue::known(0.0, cp)),
            None => materialize(scheme, plain_map(p, |v| v * k), cp),
        },
    }
}

pub fn scalar_negate<S: HeScheme>(
    scheme: &S,
    a: &HeValue<S::Ciphertext>,
) -> HeResult<HeValue<S::Ciphertext>> {
    let cp = a.complex_packing();
    match view(a) {
        Operand::Plain(p) => Ok(HeValue::plain(plain_map(p, |v| -v), cp)),
        Operand::Known(k) => Ok(HeValue::known(-k, cp)),
        Operand::Encrypted(c) => Ok(HeValue::encrypted(scheme.negate(c)?, cp)),
    }
}

fn elementwise<S: HeScheme>(
    op: &str,
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
    f: fn(
        &S,
        &HeValue<S::Ciphertext>,
        &HeValue<S::Ciphertext>,
    ) -> HeResult<HeValue<S::Ciphertext>>,
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    if a.len() != b.len() {
        return Err(HeError::validation(format!(
            "{op} operands have {} and {} elements",
            a.len(),
            b.len()
        )));
    }
    a.par_iter()
        .zip(b.par_iter())
        .map(|(x, y)| f(scheme, x, y))
        .collect()
}

pub fn add<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    elementwise("Add", scheme, a, b, scalar_add)
}

pub fn subtract<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    elementwise("Subtract", scheme, a, b, scalar_subtract)
}

pub fn multiply<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
    b: &[HeValue<S::Ciphertext>],
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    elementwise("Multiply", scheme, a, b, scalar_multiply)
}

pub fn negate<S: HeScheme>(
    scheme: &S,
    a: &[HeValue<S::Ciphertext>],
) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
    a.par_iter().map(|x| scalar_negate(scheme, x)).collect()
}

/// Running sum that takes its first term as-is.
pub struct Accumulator<C> {
    acc: Option<HeValue<C>>,
}

impl<C: Clone> Accumulator<C> {
    pub fn new() -> Self {
        Self { acc: None }
    }

    pub fn add<S: HeScheme<Ciphertext = C>>(
        &mut self,
        scheme: &S,
        term: HeValue<C>,
    ) -> HeResult<()> {
        self.acc = Some(match self.acc.take() {
            None => term,
            Some(acc) => scalar_add(scheme, &acc, &term)?,
        });
        Ok(())
    }

    /// The sum, or `empty` when nothing was added.
    pub fn finish(self, empty: HeValue<C>) -> HeValue<C> {
        self.acc.unwrap_or(empty)
    }
}

impl<C: Clone> Default for Accumulator<C> {
    fn default() -> Self {
        Self::new()
    }
}
