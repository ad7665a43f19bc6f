//! Encryption parameters for the leveled CKKS scheme.
//!
//! The coefficient modulus is a list of NTT-friendly primes. The last prime
//! is the special prime reserved for key switching; data ciphertexts live on
//! the remaining primes, so a fresh ciphertext sits at chain index
//! `coeff_modulus.len() - 2` and each rescale drops one prime until chain
//! index 0.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{HeError, HeResult};
use crate::math::coeff_modulus_primes;

pub const SCHEME_NAME: &str = "HE_SEAL";

const VALID_DEGREES: [usize; 6] = [1024, 2048, 4096, 8192, 16384, 32768];

/// Largest total coefficient-modulus bit count for each degree and security
/// level, from the homomorphic encryption security standard.
fn max_total_bits(degree: usize, security_level: u32) -> Option<u32> {
    let table: [u32; 6] = match security_level {
        128 => [27, 54, 109, 218, 438, 881],
        192 => [19, 37, 75, 152, 305, 611],
        256 => [14, 29, 58, 118, 237, 476],
        _ => return None,
    };
    VALID_DEGREES
        .iter()
        .position(|&d| d == degree)
        .map(|idx| table[idx])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    scheme_name: String,
    poly_modulus_degree: usize,
    coeff_modulus_bits: Vec<u32>,
    coeff_modulus: Vec<u64>,
    security_level: u32,
    scale: f64,
    complex_packing: bool,
    noise_std_dev: f64,
}

impl EncryptionParameters {
    pub fn builder() -> EncryptionParametersBuilder {
        EncryptionParametersBuilder::new()
    }

    pub fn poly_modulus_degree(&self) -> usize {
        self.poly_modulus_degree
    }

    pub fn coeff_modulus(&self) -> &[u64] {
        &self.coeff_modulus
    }

    pub fn coeff_modulus_bits(&self) -> &[u32] {
        &self.coeff_modulus_bits
    }

    pub fn security_level(&self) -> u32 {
        self.security_level
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn complex_packing(&self) -> bool {
        self.complex_packing
    }

    pub fn noise_std_dev(&self) -> f64 {
        self.noise_std_dev
    }

    /// Total bit count of all primes, special prime included.
    pub fn total_coeff_modulus_bits(&self) -> u32 {
        self.coeff_modulus_bits.iter().sum()
    }

    /// Primes usable by data ciphertexts (the special prime excluded).
    pub fn data_primes(&self) -> &[u64] {
        match self.coeff_modulus.len() {
            0 | 1 => &self.coeff_modulus,
            n => &self.coeff_modulus[..n - 1],
        }
    }

    /// Chain index of a freshly encrypted ciphertext.
    pub fn top_chain_index(&self) -> usize {
        self.data_primes().len().saturating_sub(1)
    }

    /// Number of real values one ciphertext can hold.
    pub fn slot_capacity(&self) -> usize {
        let slots = self.poly_modulus_degree / 2;
        if self.complex_packing { 2 * slots } else { slots }
    }

    /// Checks degree, prime chain and security level.
    pub fn validate(&self) -> HeResult<()> {
        if self.scheme_name != SCHEME_NAME {
            return Err(HeError::invalid_parameter(format!(
                "invalid scheme name {}",
                self.scheme_name
            )));
        }
        if !VALID_DEGREES.contains(&self.poly_modulus_degree) {
            return Err(HeError::invalid_parameter(
                "poly_modulus_degree must be 1024, 2048, 4096, 8192, 16384, 32768",
            ));
        }
        if self.coeff_modulus.is_empty()
            || self.coeff_modulus.len() != self.coeff_modulus_bits.len()
        {
            return Err(HeError::invalid_parameter(
                "coefficient modulus must hold one prime per bit size",
            ));
        }
        if self.security_level != 0 {
            let max_bits =
                max_total_bits(self.poly_modulus_degree, self.security_level)
                    .ok_or_else(|| {
                        HeError::invalid_parameter(
                            "security_level must be 0, 128, 192, 256",
                        )
                    })?;
            let total = self.total_coeff_modulus_bits();
            if total > max_bits {
                return Err(HeError::invalid_parameter(format!(
                    "{total} modulus bits exceed {max_bits} allowed for \
                     {}-bit security at degree {}",
                    self.security_level, self.poly_modulus_degree
                )));
            }
        }
        if !(self.scale.is_finite() && self.scale > 1.0) {
            return Err(HeError::invalid_parameter(format!(
                "scale {} must be greater than 1",
                self.scale
            )));
        }
        Ok(())
    }

    /// Parses the JSON configuration format:
    /// `{"scheme_name", "poly_modulus_degree", "security_level",
    /// "coeff_modulus": [bits...], "scale"?, "complex_packing"?}`.
    pub fn from_json_str(json: &str) -> HeResult<Self> {
        let config: ParameterConfig = serde_json::from_str(json)?;
        if config.scheme_name != SCHEME_NAME {
            return Err(HeError::invalid_parameter(format!(
                "parsed scheme name {} is not {SCHEME_NAME}",
                config.scheme_name
            )));
        }
        let mut builder = EncryptionParametersBuilder::new()
            .poly_modulus_degree(config.poly_modulus_degree)
            .coeff_modulus_bits(config.coeff_modulus)
            .security_level(config.security_level)
            .complex_packing(config.complex_packing.unwrap_or(false));
        if let Some(scale) = config.scale.filter(|s| *s != 0.0) {
            builder = builder.scale(scale);
        }
        builder.build()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> HeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl Default for EncryptionParameters {
    /// Degree 1024 with five 30-bit primes and no security check.
    fn default() -> Self {
        let degree = 1024;
        let bits = vec![30; 5];
        let coeff_modulus =
            coeff_modulus_primes(degree as u64, &bits).unwrap_or_default();
        let scale = default_scale(&coeff_modulus, &bits);
        Self {
            scheme_name: SCHEME_NAME.to_string(),
            poly_modulus_degree: degree,
            coeff_modulus_bits: bits,
            coeff_modulus,
            security_level: 0,
            scale,
            complex_packing: false,
            noise_std_dev: 3.2,
        }
    }
}

/// Scale matching the first prime dropped by rescaling.
fn default_scale(coeff_modulus: &[u64], bits: &[u32]) -> f64 {
    match coeff_modulus.len() {
        0 => 0.0,
        1 => 2f64.powi((bits[0] / 2) as i32),
        n => coeff_modulus[n - 2] as f64,
    }
}

#[derive(Deserialize)]
struct ParameterConfig {
    scheme_name: String,
    poly_modulus_degree: usize,
    security_level: u32,
    coeff_modulus: Vec<u32>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    complex_packing: Option<bool>,
}

pub struct EncryptionParametersBuilder {
    poly_modulus_degree: Option<usize>,
    coeff_modulus_bits: Option<Vec<u32>>,
    security_level: Option<u32>,
    scale: Option<f64>,
    complex_packing: Option<bool>,
    noise_std_dev: Option<f64>,
}

impl Default for EncryptionParametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionParametersBuilder {
    pub fn new() -> Self {
        Self {
            poly_modulus_degree: None,
            coeff_modulus_bits: None,
            security_level: None,
            scale: None,
            complex_packing: None,
            noise_std_dev: None,
        }
    }

    pub fn poly_modulus_degree(mut self, degree: usize) -> Self {
        self.poly_modulus_degree = Some(degree);
        self
    }

    pub fn coeff_modulus_bits(mut self, bits: Vec<u32>) -> Self {
        self.coeff_modulus_bits = Some(bits);
        self
    }

    pub fn security_level(mut self, level: u32) -> Self {
        self.security_level = Some(level);
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn complex_packing(mut self, enabled: bool) -> Self {
        self.complex_packing = Some(enabled);
        self
    }

    pub fn noise_std_dev(mut self, std_dev: f64) -> Self {
        self.noise_std_dev = Some(std_dev);
        self
    }

    pub fn build(self) -> HeResult<EncryptionParameters> {
        let degree = self.poly_modulus_degree.unwrap_or(1024);
        let bits = self.coeff_modulus_bits.unwrap_or_else(|| vec![30; 5]);
        if !degree.is_power_of_two() {
            return Err(HeError::invalid_parameter(format!(
                "poly_modulus_degree {degree} is not a power of two"
            )));
        }
        let coeff_modulus = coeff_modulus_primes(degree as u64, &bits)
            .ok_or_else(|| {
                HeError::invalid_parameter(format!(
                    "cannot build coefficient modulus {bits:?} for degree {degree}"
                ))
            })?;
        let scale = self
            .scale
            .unwrap_or_else(|| default_scale(&coeff_modulus, &bits));

        let params = EncryptionParameters {
            scheme_name: SCHEME_NAME.to_string(),
            poly_modulus_degree: degree,
            coeff_modulus_bits: bits,
            coeff_modulus,
            security_level: self.security_level.unwrap_or(0),
            scale,
            complex_packing: self.complex_packing.unwrap_or(false),
            noise_std_dev: self.noise_std_dev.unwrap_or(3.2),
        };
        params.validate()?;
        Ok(params)
    }
}
