//! Simulated CKKS backend.
//!
//! **Not secure.** A ciphertext stores the scaled slot values of its message
//! in the clear, tagged with the id of the key pair that "encrypted" it. What
//! the simulation keeps from a real leveled CKKS library is the numeric
//! behavior the engine has to manage:
//!
//! - plaintexts go through the canonical embedding with coefficient rounding;
//! - encryption adds rounded Gaussian noise in the coefficient domain;
//! - multiplication multiplies scales and needs the relinearization key;
//! - rescaling divides values and scale by the prime being dropped;
//! - binary operations require equal chain index and scale;
//! - scales and encoded values must fit in the remaining modulus bits.

use std::sync::RwLock;

use num_complex::Complex64;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EncryptionParameters, HeScheme};
use crate::encoding::{SlotEncoder, SlotInput};
use crate::errors::{HeError, HeResult, PrecisionError};
use crate::math::gaussian_noise;

/// Relative slack tolerated when comparing two scales for equality.
const SCALE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimCiphertext {
    slots: Vec<Complex64>,
    scale: f64,
    chain_index: usize,
    key_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum KeyKind {
    Public,
    Relinearization,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimKey {
    kind: KeyKind,
    key_id: u64,
}

#[derive(Debug, Default)]
struct KeyState {
    secret: Option<u64>,
    public: Option<u64>,
    eval: Option<u64>,
}

#[derive(Debug)]
pub struct SimulatedCkks {
    params: EncryptionParameters,
    encoder: SlotEncoder,
    keys: RwLock<KeyState>,
}

impl SimulatedCkks {
    fn read_keys(&self) -> std::sync::RwLockReadGuard<'_, KeyState> {
        self.keys.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_keys(&self) -> std::sync::RwLockWriteGuard<'_, KeyState> {
        self.keys.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Modulus bits available at `chain_index`.
    fn level_bits(&self, chain_index: usize) -> u32 {
        self.params
            .coeff_modulus_bits()
            .iter()
            .take(chain_index + 1)
            .sum()
    }

    /// Expands cleartext operands into complex slots.
    fn slot_values(
        &self,
        values: &[f64],
        complex_packing: bool,
        multiplicative: bool,
    ) -> HeResult<Vec<Complex64>> {
        let slots = self.slot_count();
        if let [v] = values {
            let z = if complex_packing && !multiplicative {
                Complex64::new(*v, *v)
            } else {
                Complex64::new(*v, 0.0)
            };
            return Ok(vec![z; slots]);
        }
        let packed: Vec<Complex64> = if complex_packing {
            if multiplicative {
                return Err(HeError::unsupported(
                    "multiply_plain",
                    "complex-packed ciphertext by non-scalar plaintext",
                ));
            }
            values
                .chunks(2)
                .map(|pair| Complex64::new(pair[0], *pair.get(1).unwrap_or(&0.0)))
                .collect()
        } else {
            values.iter().map(|&v| Complex64::new(v, 0.0)).collect()
        };
        if packed.len() > slots {
            return Err(HeError::validation(format!(
                "{} values exceed {} slots",
                values.len(),
                slots
            )));
        }
        Ok(packed)
    }

    fn check_value_size(
        &self,
        slots: &[Complex64],
        scale: f64,
        chain_index: usize,
    ) -> HeResult<()> {
        let total_bits = self.level_bits(chain_index);
        let max_abs = slots
            .iter()
            .map(|z| z.re.abs().max(z.im.abs()))
            .fold(0.0, f64::max);
        if max_abs > 0.0 && (max_abs * scale).log2() + 2.0 >= total_bits as f64 {
            return Err(PrecisionError::ValueTooLarge {
                value: max_abs,
                total_bits,
            }
            .into());
        }
        Ok(())
    }

    /// Encodes slot values at `scale`, returning the rounded scaled slots.
    fn encode_scaled(
        &self,
        slots: &[Complex64],
        scale: f64,
        chain_index: usize,
    ) -> HeResult<Vec<Complex64>> {
        self.check_value_size(slots, scale, chain_index)?;
        let coeffs = self.encoder.encode(SlotInput::Complex(slots), scale)?;
        let mut decoded = self.encoder.decode(&coeffs, 1.0);
        decoded.truncate(slots.len());
        Ok(decoded)
    }

    fn check_scale_bound(&self, scale: f64, chain_index: usize) -> HeResult<()> {
        let total_bits = self.level_bits(chain_index);
        if scale.log2() >= total_bits as f64 {
            return Err(PrecisionError::ScaleOutOfBounds {
                log_scale: scale.log2(),
                total_bits,
            }
            .into());
        }
        Ok(())
    }

    fn check_matched(&self, a: &SimCiphertext, b: &SimCiphertext) -> HeResult<()> {
        if a.chain_index != b.chain_index {
            return Err(PrecisionError::ChainMismatch {
                left: a.chain_index,
                right: b.chain_index,
            }
            .into());
        }
        if ((a.scale - b.scale) / a.scale).abs() > SCALE_EPSILON {
            return Err(PrecisionError::ScaleMismatch {
                expected: a.scale,
                actual: b.scale,
            }
            .into());
        }
        Ok(())
    }

    fn zip_slots(
        a: &SimCiphertext,
        b: &[Complex64],
        f: impl Fn(Complex64, Complex64) -> Complex64,
    ) -> Vec<Complex64> {
        let len = a.slots.len().max(b.len());
        let zero = Complex64::new(0.0, 0.0);
        (0..len)
            .map(|i| {
                f(
                    *a.slots.get(i).unwrap_or(&zero),
                    *b.get(i).unwrap_or(&zero),
                )
            })
            .collect()
    }

    fn public_key_id(&self) -> HeResult<u64> {
        let keys = self.read_keys();
        keys.public
            .or(keys.secret)
            .ok_or(HeError::MissingKey { key: "public key" })
    }

    fn encode_key(kind: KeyKind, key_id: Option<u64>, name: &'static str) -> HeResult<Vec<u8>> {
        let key_id = key_id.ok_or(HeError::MissingKey { key: name })?;
        Ok(bincode::serialize(&SimKey { kind, key_id })?)
    }

    fn decode_key(bytes: &[u8], expected: KeyKind) -> HeResult<u64> {
        let key: SimKey = bincode::deserialize(bytes)?;
        if key.kind != expected {
            return Err(HeError::invalid_parameter(format!(
                "expected {expected:?} key, got {:?}",
                key.kind
            )));
        }
        Ok(key.key_id)
    }
}

impl HeScheme for SimulatedCkks {
    type Ciphertext = SimCiphertext;

    fn from_parameters(params: EncryptionParameters) -> HeResult<Self> {
        params.validate()?;
        let encoder = SlotEncoder::new(params.poly_modulus_degree())?;
        Ok(Self {
            params,
            encoder,
            keys: RwLock::new(KeyState::default()),
        })
    }

    fn parameters(&self) -> &EncryptionParameters {
        &self.params
    }

    fn generate_keys(&self) -> HeResult<()> {
        let key_id: u64 = rand::rng().random();
        let mut keys = self.write_keys();
        keys.secret = Some(key_id);
        keys.public = Some(key_id);
        keys.eval = Some(key_id);
        debug!(key_id, "generated simulated key set");
        Ok(())
    }

    fn has_secret_key(&self) -> bool {
        self.read_keys().secret.is_some()
    }

    fn has_public_key(&self) -> bool {
        self.read_keys().public.is_some()
    }

    fn has_eval_key(&self) -> bool {
        self.read_keys().eval.is_some()
    }

    fn export_public_key(&self) -> HeResult<Vec<u8>> {
        Self::encode_key(KeyKind::Public, self.read_keys().public, "public key")
    }

    fn export_eval_key(&self) -> HeResult<Vec<u8>> {
        Self::encode_key(
            KeyKind::Relinearization,
            self.read_keys().eval,
            "relinearization key",
        )
    }

    fn import_public_key(&self, bytes: &[u8]) -> HeResult<()> {
        let key_id = Self::decode_key(bytes, KeyKind::Public)?;
        self.write_keys().public = Some(key_id);
        Ok(())
    }

    fn import_eval_key(&self, bytes: &[u8]) -> HeResult<()> {
        let key_id = Self::decode_key(bytes, KeyKind::Relinearization)?;
        self.write_keys().eval = Some(key_id);
        Ok(())
    }

    fn encrypt(
        &self,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<SimCiphertext> {
        let key_id = self.public_key_id()?;
        let scale = self.default_scale();
        let chain_index = self.params.top_chain_index();
        let slots = self.slot_values(values, complex_packing, false)?;

        // Rounded encoding plus coefficient noise, evaluated back into slots.
        self.check_value_size(&slots, scale, chain_index)?;
        let mut coeffs = self.encoder.encode(SlotInput::Complex(&slots), scale)?;
        let noise = gaussian_noise(
            self.params.noise_std_dev(),
            coeffs.len(),
            &mut rand::rng(),
        )?;
        for (c, e) in coeffs.iter_mut().zip(noise) {
            *c += e;
        }
        Ok(SimCiphertext {
            slots: self.encoder.decode(&coeffs, 1.0),
            scale,
            chain_index,
            key_id,
        })
    }

    fn decrypt(
        &self,
        ct: &SimCiphertext,
        count: usize,
        complex_packing: bool,
    ) -> HeResult<Vec<f64>> {
        let secret = self
            .read_keys()
            .secret
            .ok_or(HeError::MissingKey { key: "secret key" })?;
        if secret != ct.key_id {
            return Err(HeError::invalid_parameter(
                "ciphertext was encrypted under a different key",
            ));
        }
        let capacity = if complex_packing {
            2 * ct.slots.len()
        } else {
            ct.slots.len()
        };
        if count > capacity {
            return Err(HeError::validation(format!(
                "cannot decrypt {count} values from {capacity} slots"
            )));
        }
        let values = ct.slots.iter().map(|z| *z / ct.scale);
        let out: Vec<f64> = if complex_packing {
            values.flat_map(|z| [z.re, z.im]).take(count).collect()
        } else {
            values.map(|z| z.re).take(count).collect()
        };
        Ok(out)
    }

    fn chain_index(&self, ct: &SimCiphertext) -> usize {
        ct.chain_index
    }

    fn scale(&self, ct: &SimCiphertext) -> f64 {
        ct.scale
    }

    fn set_scale(&self, ct: &mut SimCiphertext, scale: f64) {
        ct.scale = scale;
    }

    fn rescale_to_next(&self, ct: &mut SimCiphertext) -> HeResult<()> {
        if ct.chain_index == 0 {
            return Err(PrecisionError::RescaleBelowFloor.into());
        }
        let prime = self
            .prime_at(ct.chain_index)
            .ok_or(PrecisionError::RescaleBelowFloor)? as f64;
        for z in ct.slots.iter_mut() {
            *z /= prime;
        }
        ct.scale /= prime;
        ct.chain_index -= 1;
        Ok(())
    }

    fn mod_switch_to_next(&self, ct: &mut SimCiphertext) -> HeResult<()> {
        if ct.chain_index == 0 {
            return Err(PrecisionError::RescaleBelowFloor.into());
        }
        ct.chain_index -= 1;
        Ok(())
    }

    fn add(&self, a: &SimCiphertext, b: &SimCiphertext) -> HeResult<SimCiphertext> {
        self.check_matched(a, b)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &b.slots, |x, y| x + y),
            ..a.clone()
        })
    }

    fn sub(&self, a: &SimCiphertext, b: &SimCiphertext) -> HeResult<SimCiphertext> {
        self.check_matched(a, b)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &b.slots, |x, y| x - y),
            ..a.clone()
        })
    }

    fn negate(&self, a: &SimCiphertext) -> HeResult<SimCiphertext> {
        Ok(SimCiphertext {
            slots: a.slots.iter().map(|z| -*z).collect(),
            ..a.clone()
        })
    }

    fn multiply(
        &self,
        a: &SimCiphertext,
        b: &SimCiphertext,
    ) -> HeResult<SimCiphertext> {
        if self.read_keys().eval.is_none() {
            return Err(HeError::MissingKey {
                key: "relinearization key",
            });
        }
        if a.chain_index != b.chain_index {
            return Err(PrecisionError::ChainMismatch {
                left: a.chain_index,
                right: b.chain_index,
            }
            .into());
        }
        let scale = a.scale * b.scale;
        self.check_scale_bound(scale, a.chain_index)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &b.slots, |x, y| x * y),
            scale,
            ..a.clone()
        })
    }

    fn add_plain(
        &self,
        a: &SimCiphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<SimCiphertext> {
        let slots = self.slot_values(values, complex_packing, false)?;
        let encoded = self.encode_scaled(&slots, a.scale, a.chain_index)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &encoded, |x, y| x + y),
            ..a.clone()
        })
    }

    fn sub_plain(
        &self,
        a: &SimCiphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<SimCiphertext> {
        let slots = self.slot_values(values, complex_packing, false)?;
        let encoded = self.encode_scaled(&slots, a.scale, a.chain_index)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &encoded, |x, y| x - y),
            ..a.clone()
        })
    }

    fn multiply_plain(
        &self,
        a: &SimCiphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<SimCiphertext> {
        let scale = a.scale * a.scale;
        self.check_scale_bound(scale, a.chain_index)?;
        let slots = self.slot_values(values, complex_packing, true)?;
        let encoded = self.encode_scaled(&slots, a.scale, a.chain_index)?;
        Ok(SimCiphertext {
            slots: Self::zip_slots(a, &encoded, |x, y| x * y),
            scale,
            ..a.clone()
        })
    }

    fn save_ciphertext(&self, ct: &SimCiphertext) -> HeResult<Vec<u8>> {
        Ok(bincode::serialize(ct)?)
    }

    fn load_ciphertext(&self, bytes: &[u8]) -> HeResult<SimCiphertext> {
        let ct: SimCiphertext = bincode::deserialize(bytes)?;
        if ct.slots.len() > self.slot_count()
            || ct.chain_index > self.params.top_chain_index()
        {
            return Err(HeError::validation(
                "ciphertext does not match encryption parameters",
            ));
        }
        Ok(ct)
    }
}
