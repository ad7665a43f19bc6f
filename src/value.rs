//! Tagged HE values: plaintext or ciphertext, with a known-value fast path.

use crate::errors::{HeError, HeResult};
use crate::scheme::HeScheme;
use crate::tensor::ElementType;

/// Cleartext slot values.
///
/// A single value is a scalar that applies to every batch slot; otherwise
/// there is one value per batch slot.
#[derive(Debug, Clone, PartialEq)]
pub struct HePlaintext {
    values: Vec<f64>,
    complex_packing: bool,
}

impl HePlaintext {
    pub fn new(values: Vec<f64>, complex_packing: bool) -> Self {
        Self {
            values,
            complex_packing,
        }
    }

    pub fn scalar(value: f64, complex_packing: bool) -> Self {
        Self::new(vec![value], complex_packing)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn complex_packing(&self) -> bool {
        self.complex_packing
    }

    /// The common value when every slot holds the same number.
    pub fn known_scalar(&self) -> Option<f64> {
        let (first, rest) = self.values.split_first()?;
        rest.iter().all(|v| v == first).then_some(*first)
    }

    /// Value for batch slot `idx`, broadcasting scalars.
    pub fn get(&self, idx: usize) -> f64 {
        match self.values.as_slice() {
            [v] => *v,
            values => values.get(idx).copied().unwrap_or(0.0),
        }
    }

    /// Expands to `batch_size` values.
    pub fn expand(&self, batch_size: usize) -> Vec<f64> {
        (0..batch_size).map(|i| self.get(i)).collect()
    }
}

#[derive(Debug, Clone)]
pub enum CipherInner<C> {
    Encrypted(C),
    /// Provably equal to this scalar in every slot; nothing was encrypted.
    Known(f64),
}

#[derive(Debug, Clone)]
pub struct HeCiphertext<C> {
    inner: CipherInner<C>,
    complex_packing: bool,
}

impl<C> HeCiphertext<C> {
    pub fn encrypted(ct: C, complex_packing: bool) -> Self {
        Self {
            inner: CipherInner::Encrypted(ct),
            complex_packing,
        }
    }

    pub fn known(value: f64, complex_packing: bool) -> Self {
        Self {
            inner: CipherInner::Known(value),
            complex_packing,
        }
    }

    pub fn inner(&self) -> &CipherInner<C> {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut CipherInner<C> {
        &mut self.inner
    }

    pub fn into_inner(self) -> CipherInner<C> {
        self.inner
    }

    pub fn complex_packing(&self) -> bool {
        self.complex_packing
    }

    pub fn known_scalar(&self) -> Option<f64> {
        match self.inner {
            CipherInner::Known(v) => Some(v),
            CipherInner::Encrypted(_) => None,
        }
    }

    pub fn as_encrypted(&self) -> Option<&C> {
        match &self.inner {
            CipherInner::Encrypted(ct) => Some(ct),
            CipherInner::Known(_) => None,
        }
    }

    pub fn as_encrypted_mut(&mut self) -> Option<&mut C> {
        match &mut self.inner {
            CipherInner::Encrypted(ct) => Some(ct),
            CipherInner::Known(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HeValue<C> {
    Plaintext(HePlaintext),
    Ciphertext(HeCiphertext<C>),
}

impl<C> HeValue<C> {
    pub fn plain(values: Vec<f64>, complex_packing: bool) -> Self {
        HeValue::Plaintext(HePlaintext::new(values, complex_packing))
    }

    pub fn plain_scalar(value: f64, complex_packing: bool) -> Self {
        HeValue::Plaintext(HePlaintext::scalar(value, complex_packing))
    }

    pub fn known(value: f64, complex_packing: bool) -> Self {
        HeValue::Ciphertext(HeCiphertext::known(value, complex_packing))
    }

    pub fn encrypted(ct: C, complex_packing: bool) -> Self {
        HeValue::Ciphertext(HeCiphertext::encrypted(ct, complex_packing))
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self, HeValue::Plaintext(_))
    }

    pub fn is_ciphertext(&self) -> bool {
        matches!(self, HeValue::Ciphertext(_))
    }

    pub fn is_known_value(&self) -> bool {
        self.known_scalar().is_some()
    }

    pub fn known_scalar(&self) -> Option<f64> {
        match self {
            HeValue::Plaintext(p) => p.known_scalar(),
            HeValue::Ciphertext(c) => c.known_scalar(),
        }
    }

    pub fn complex_packing(&self) -> bool {
        match self {
            HeValue::Plaintext(p) => p.complex_packing(),
            HeValue::Ciphertext(c) => c.complex_packing(),
        }
    }

    /// Short tag used in dispatch error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            HeValue::Plaintext(_) => "plain",
            HeValue::Ciphertext(_) => "cipher",
        }
    }

    pub fn as_plaintext(&self) -> Option<&HePlaintext> {
        match self {
            HeValue::Plaintext(p) => Some(p),
            HeValue::Ciphertext(_) => None,
        }
    }
}

/// Encodes cleartext values of `element_type` into a plaintext.
pub fn encode(
    values: &[f64],
    element_type: ElementType,
    complex_packing: bool,
) -> HePlaintext {
    HePlaintext::new(
        values.iter().map(|&v| element_type.cast(v)).collect(),
        complex_packing,
    )
}

/// Decodes `batch_size` values of `element_type` from a plaintext.
pub fn decode(
    plain: &HePlaintext,
    element_type: ElementType,
    batch_size: usize,
) -> Vec<f64> {
    plain
        .expand(batch_size)
        .into_iter()
        .map(|v| element_type.cast(v))
        .collect()
}

/// Encrypts a plaintext at the top of the modulus chain.
///
/// With `known_zero_fast_path`, an all-zero plaintext becomes `Known(0)`
/// without touching the scheme.
pub fn encrypt<S: HeScheme>(
    scheme: &S,
    plain: &HePlaintext,
    known_zero_fast_path: bool,
) -> HeResult<HeCiphertext<S::Ciphertext>> {
    if known_zero_fast_path && plain.known_scalar() == Some(0.0) {
        return Ok(HeCiphertext::known(0.0, plain.complex_packing()));
    }
    if plain.values().is_empty() {
        return Err(HeError::validation("cannot encrypt an empty plaintext"));
    }
    let ct = scheme.encrypt(plain.values(), plain.complex_packing())?;
    Ok(HeCiphertext::encrypted(ct, plain.complex_packing()))
}

/// Decrypts `batch_size` slot values.
pub fn decrypt<S: HeScheme>(
    scheme: &S,
    cipher: &HeCiphertext<S::Ciphertext>,
    batch_size: usize,
) -> HeResult<HePlaintext> {
    let values = match cipher.inner() {
        CipherInner::Known(v) => vec![*v; batch_size],
        CipherInner::Encrypted(ct) => {
            scheme.decrypt(ct, batch_size, cipher.complex_packing())?
        }
    };
    Ok(HePlaintext::new(values, cipher.complex_packing()))
}

/// Returns the value as a plaintext, decrypting ciphertexts.
pub fn to_plaintext<S: HeScheme>(
    scheme: &S,
    value: &HeValue<S::Ciphertext>,
    batch_size: usize,
) -> HeResult<HePlaintext> {
    match value {
        HeValue::Plaintext(p) => Ok(p.clone()),
        HeValue::Ciphertext(c) => decrypt(scheme, c, batch_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimulatedCkks};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn scheme() -> SimulatedCkks {
        let s = SimulatedCkks::from_parameters(EncryptionParameters::default())
            .unwrap();
        s.generate_keys().unwrap();
        s
    }

    #[test]
    fn known_scalar_detection() {
        assert_eq!(HePlaintext::new(vec![2.0, 2.0], false).known_scalar(), Some(2.0));
        assert_eq!(HePlaintext::new(vec![2.0, 1.0], false).known_scalar(), None);
        assert_eq!(HePlaintext::new(vec![], false).known_scalar(), None);
        let v: HeValue<()> = HeValue::known(0.0, false);
        assert!(v.is_known_value() && v.is_ciphertext());
    }

    #[test]
    fn zero_encrypts_to_known_only_with_fast_path() {
        let s = scheme();
        let zero = HePlaintext::scalar(0.0, false);
        let fast = encrypt(&s, &zero, true).unwrap();
        assert_eq!(fast.known_scalar(), Some(0.0));
        let full = encrypt(&s, &zero, false).unwrap();
        assert!(full.as_encrypted().is_some());
        let a = decrypt(&s, &fast, 3).unwrap();
        let b = decrypt(&s, &full, 3).unwrap();
        for (x, y) in a.values().iter().zip(b.values()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn encrypt_decrypt_batch() {
        let s = scheme();
        let plain = HePlaintext::new(vec![1.0, -2.0, 3.5], false);
        let ct = encrypt(&s, &plain, true).unwrap();
        let out = decrypt(&s, &ct, 3).unwrap();
        for (x, y) in plain.values().iter().zip(out.values()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    proptest! {
        #[test]
        fn plaintext_encode_decode_is_exact(
            values in prop::collection::vec(-1e6f64..1e6, 1..32)
        ) {
            let plain = encode(&values, ElementType::F64, false);
            prop_assert_eq!(decode(&plain, ElementType::F64, values.len()), values);
        }

        #[test]
        fn f32_encode_decode_is_exact_for_f32_inputs(
            values in prop::collection::vec(-1e6f32..1e6, 1..32)
        ) {
            let wide: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            let plain = encode(&wide, ElementType::F32, false);
            prop_assert_eq!(decode(&plain, ElementType::F32, wide.len()), wide);
        }
    }
}
