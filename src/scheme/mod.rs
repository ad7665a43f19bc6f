//! Capability interface of the leveled HE library driven by the executor.

pub mod params;
pub mod sim;

use std::fmt::Debug;

pub use params::{EncryptionParameters, EncryptionParametersBuilder};
pub use sim::{SimCiphertext, SimulatedCkks};

use crate::errors::HeResult;

/// Everything the engine needs from a leveled CKKS implementation.
///
/// Plaintext operands are passed as cleartext slices and encoded by the
/// scheme at the ciphertext's level and scale. A slice of length one is a
/// scalar filling every slot. With complex packing, consecutive pairs of
/// reals share one complex slot.
pub trait HeScheme: Send + Sync + Sized + 'static {
    type Ciphertext: Clone + Debug + Send + Sync;

    fn from_parameters(params: EncryptionParameters) -> HeResult<Self>;

    fn parameters(&self) -> &EncryptionParameters;

    /// Complex slots per ciphertext.
    fn slot_count(&self) -> usize {
        self.parameters().poly_modulus_degree() / 2
    }

    fn default_scale(&self) -> f64 {
        self.parameters().scale()
    }

    /// Prime dropped when rescaling away from `chain_index`.
    fn prime_at(&self, chain_index: usize) -> Option<u64> {
        self.parameters().data_primes().get(chain_index).copied()
    }

    /// Lowest modulus of the chain.
    fn lowest_modulus(&self) -> u64 {
        self.parameters().data_primes().first().copied().unwrap_or(0)
    }

    // Keys.
    fn generate_keys(&self) -> HeResult<()>;
    fn has_secret_key(&self) -> bool;
    fn has_public_key(&self) -> bool;
    fn has_eval_key(&self) -> bool;
    fn export_public_key(&self) -> HeResult<Vec<u8>>;
    fn export_eval_key(&self) -> HeResult<Vec<u8>>;
    fn import_public_key(&self, bytes: &[u8]) -> HeResult<()>;
    fn import_eval_key(&self, bytes: &[u8]) -> HeResult<()>;

    // Encryption.
    fn encrypt(
        &self,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<Self::Ciphertext>;
    fn decrypt(
        &self,
        ct: &Self::Ciphertext,
        count: usize,
        complex_packing: bool,
    ) -> HeResult<Vec<f64>>;

    // Level and scale.
    fn chain_index(&self, ct: &Self::Ciphertext) -> usize;
    fn scale(&self, ct: &Self::Ciphertext) -> f64;
    fn set_scale(&self, ct: &mut Self::Ciphertext, scale: f64);
    fn rescale_to_next(&self, ct: &mut Self::Ciphertext) -> HeResult<()>;
    fn mod_switch_to_next(&self, ct: &mut Self::Ciphertext) -> HeResult<()>;

    // Arithmetic. Binary ciphertext ops require matched level and scale.
    fn add(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> HeResult<Self::Ciphertext>;
    fn sub(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> HeResult<Self::Ciphertext>;
    fn negate(&self, a: &Self::Ciphertext) -> HeResult<Self::Ciphertext>;
    /// Multiply followed by relinearization.
    fn multiply(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> HeResult<Self::Ciphertext>;
    fn add_plain(
        &self,
        a: &Self::Ciphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<Self::Ciphertext>;
    fn sub_plain(
        &self,
        a: &Self::Ciphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<Self::Ciphertext>;
    fn multiply_plain(
        &self,
        a: &Self::Ciphertext,
        values: &[f64],
        complex_packing: bool,
    ) -> HeResult<Self::Ciphertext>;

    // Serialization.
    fn save_ciphertext(&self, ct: &Self::Ciphertext) -> HeResult<Vec<u8>>;
    fn load_ciphertext(&self, bytes: &[u8]) -> HeResult<Self::Ciphertext>;

    /// Lowers `ct` to `chain_index` by repeated mod-switching.
    fn mod_switch_to(
        &self,
        ct: &mut Self::Ciphertext,
        chain_index: usize,
    ) -> HeResult<()> {
        while self.chain_index(ct) > chain_index {
            self.mod_switch_to_next(ct)?;
        }
        Ok(())
    }
}
