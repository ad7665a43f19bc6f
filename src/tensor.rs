//! Packed/batched tensors of HE values.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{HeError, HeResult};
use crate::scheme::HeScheme;
use crate::shape::{Shape, packed_shape, shape_size};
use crate::value::{self, HePlaintext, HeValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F64,
    I32,
    I64,
}

impl ElementType {
    /// Rounds `v` to the precision of this element type.
    pub fn cast(self, v: f64) -> f64 {
        match self {
            ElementType::F32 => v as f32 as f64,
            ElementType::F64 => v,
            ElementType::I32 => v.round() as i32 as f64,
            ElementType::I64 => v.round() as i64 as f64,
        }
    }
}

/// A tensor whose elements are HE values.
///
/// `shape` is the logical shape including the batch axis. When `packed`, the
/// batch axis is folded into the slots of each value and `data` follows the
/// packed shape (batch axis of size 1).
#[derive(Debug, Clone)]
pub struct HeTensor<C> {
    name: String,
    element_type: ElementType,
    shape: Shape,
    packed: bool,
    complex_packing: bool,
    data: Vec<HeValue<C>>,
    pending_rescale: bool,
}

impl<C> HeTensor<C> {
    /// Plaintext tensor filled with zeros.
    pub fn new_plain(
        name: impl Into<String>,
        element_type: ElementType,
        shape: Shape,
        packed: bool,
        complex_packing: bool,
    ) -> Self {
        let count = Self::element_count(&shape, packed);
        Self {
            name: name.into(),
            element_type,
            shape,
            packed,
            complex_packing,
            data: (0..count)
                .map(|_| HeValue::plain_scalar(0.0, complex_packing))
                .collect(),
            pending_rescale: false,
        }
    }

    /// Wraps existing values; `data` must follow the (packed) shape.
    pub fn from_values(
        name: impl Into<String>,
        element_type: ElementType,
        shape: Shape,
        packed: bool,
        complex_packing: bool,
        data: Vec<HeValue<C>>,
    ) -> HeResult<Self> {
        let expected = Self::element_count(&shape, packed);
        if data.len() != expected {
            return Err(HeError::validation(format!(
                "tensor of shape {shape:?} (packed {packed}) needs {expected} \
                 values, got {}",
                data.len()
            )));
        }
        let tensor = Self {
            name: name.into(),
            element_type,
            shape,
            packed,
            complex_packing,
            data,
            pending_rescale: false,
        };
        if !tensor.is_homogeneous() {
            return Err(HeError::validation(format!(
                "tensor {} mixes plaintext and ciphertext values",
                tensor.name
            )));
        }
        Ok(tensor)
    }

    fn element_count(shape: &[usize], packed: bool) -> usize {
        if packed {
            shape_size(&packed_shape(shape))
        } else {
            shape_size(shape)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape that `data` is laid out in.
    pub fn storage_shape(&self) -> Shape {
        if self.packed {
            packed_shape(&self.shape)
        } else {
            self.shape.clone()
        }
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    pub fn complex_packing(&self) -> bool {
        self.complex_packing
    }

    pub fn batch_size(&self) -> usize {
        if self.packed {
            self.shape.first().copied().unwrap_or(1)
        } else {
            1
        }
    }

    pub fn data(&self) -> &[HeValue<C>] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [HeValue<C>] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<HeValue<C>> {
        self.data
    }

    pub fn pending_rescale(&self) -> bool {
        self.pending_rescale
    }

    pub fn set_pending_rescale(&mut self, pending: bool) {
        self.pending_rescale = pending;
    }

    /// True when every element is a plaintext.
    pub fn is_plaintext(&self) -> bool {
        self.data.iter().all(HeValue::is_plaintext)
    }

    pub fn is_ciphertext(&self) -> bool {
        !self.data.is_empty() && self.data.iter().all(HeValue::is_ciphertext)
    }

    pub fn is_homogeneous(&self) -> bool {
        self.is_plaintext() || self.is_ciphertext()
    }

    /// Writes logical row-major values as plaintexts.
    pub fn write(&mut self, values: &[f64]) -> HeResult<()> {
        let total = shape_size(&self.shape);
        if values.len() != total {
            return Err(HeError::validation(format!(
                "tensor {} of shape {:?} expects {total} values, got {}",
                self.name,
                self.shape,
                values.len()
            )));
        }
        let et = self.element_type;
        let cp = self.complex_packing;
        if self.packed {
            let batch = self.batch_size();
            let inner = if batch == 0 { 0 } else { total / batch };
            for (j, slot) in self.data.iter_mut().enumerate() {
                let column: Vec<f64> =
                    (0..batch).map(|b| values[b * inner + j]).collect();
                *slot = HeValue::Plaintext(value::encode(&column, et, cp));
            }
        } else {
            for (slot, &v) in self.data.iter_mut().zip(values) {
                *slot = HeValue::Plaintext(value::encode(&[v], et, cp));
            }
        }
        Ok(())
    }

    /// Folds the batch axis into the slots. Plaintext tensors only.
    pub fn pack(&mut self) -> HeResult<()> {
        if self.packed {
            return Ok(());
        }
        if !self.is_plaintext() {
            return Err(HeError::validation(format!(
                "cannot pack encrypted tensor {}",
                self.name
            )));
        }
        let batch = self.shape.first().copied().unwrap_or(1);
        let inner = self.data.len().checked_div(batch).unwrap_or(0);
        let mut packed = Vec::with_capacity(inner);
        for j in 0..inner {
            let column: Vec<f64> = (0..batch)
                .map(|b| match &self.data[b * inner + j] {
                    HeValue::Plaintext(p) => p.get(0),
                    HeValue::Ciphertext(_) => 0.0,
                })
                .collect();
            packed.push(HeValue::plain(column, self.complex_packing));
        }
        self.data = packed;
        self.packed = true;
        Ok(())
    }
}

impl<C: Clone + Send + Sync> HeTensor<C> {
    /// Encrypts every plaintext element in place.
    pub fn encrypt_in_place<S>(
        &mut self,
        scheme: &S,
        known_zero_fast_path: bool,
    ) -> HeResult<()>
    where
        S: HeScheme<Ciphertext = C>,
    {
        let capacity = scheme.parameters().poly_modulus_degree() / 2
            * if self.complex_packing { 2 } else { 1 };
        if self.batch_size() > capacity {
            return Err(HeError::validation(format!(
                "batch size {} exceeds slot capacity {capacity}",
                self.batch_size()
            )));
        }
        self.data.par_iter_mut().try_for_each(|v| {
            if let HeValue::Plaintext(p) = v {
                *v = HeValue::Ciphertext(value::encrypt(
                    scheme,
                    p,
                    known_zero_fast_path,
                )?);
            }
            Ok(())
        })
    }

    /// Decrypts every ciphertext element in place.
    pub fn decrypt_in_place<S>(&mut self, scheme: &S) -> HeResult<()>
    where
        S: HeScheme<Ciphertext = C>,
    {
        let batch = self.batch_size();
        self.data.par_iter_mut().try_for_each(|v| {
            if let HeValue::Ciphertext(c) = v {
                *v = HeValue::Plaintext(value::decrypt(scheme, c, batch)?);
            }
            Ok(())
        })
    }

    /// Reads the logical row-major values, decrypting as needed.
    pub fn read<S>(&self, scheme: &S) -> HeResult<Vec<f64>>
    where
        S: HeScheme<Ciphertext = C>,
    {
        let batch = self.batch_size();
        let columns: Vec<HePlaintext> = self
            .data
            .par_iter()
            .map(|v| value::to_plaintext(scheme, v, batch))
            .collect::<HeResult<_>>()?;
        let et = self.element_type;
        if self.packed {
            let inner = columns.len();
            let mut out = vec![0.0; batch * inner];
            for (j, column) in columns.iter().enumerate() {
                for (b, v) in value::decode(column, et, batch).into_iter().enumerate() {
                    out[b * inner + j] = v;
                }
            }
            Ok(out)
        } else {
            Ok(columns
                .iter()
                .map(|p| value::decode(p, et, 1)[0])
                .collect())
        }
    }

    /// Reads a plaintext tensor without a scheme.
    pub fn read_plain(&self) -> HeResult<Vec<f64>> {
        if !self.is_plaintext() {
            return Err(HeError::validation(format!(
                "tensor {} is encrypted",
                self.name
            )));
        }
        let batch = self.batch_size();
        let et = self.element_type;
        let inner = self.data.len();
        let mut out = vec![0.0; batch * inner];
        for (j, v) in self.data.iter().enumerate() {
            if let HeValue::Plaintext(p) = v {
                for (b, x) in value::decode(p, et, batch).into_iter().enumerate() {
                    out[b * inner + j] = x;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{EncryptionParameters, SimulatedCkks};
    use approx::assert_abs_diff_eq;

    type Tensor = HeTensor<crate::scheme::SimCiphertext>;

    #[test]
    fn write_read_unpacked_plain_is_exact() {
        let mut t = Tensor::new_plain("t", ElementType::F32, vec![2, 2], false, false);
        t.write(&[1.5, -2.0, 3.25, 0.0]).unwrap();
        assert_eq!(t.read_plain().unwrap(), vec![1.5, -2.0, 3.25, 0.0]);
        assert!(t.write(&[1.0]).is_err());
    }

    #[test]
    fn packed_layout_groups_batch_per_element() {
        let mut t = Tensor::new_plain("t", ElementType::F64, vec![3, 2], true, false);
        assert_eq!(t.data().len(), 2);
        t.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.data()[0].as_plaintext().unwrap().values(), &[1.0, 3.0, 5.0]);
        assert_eq!(t.read_plain().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn pack_regroups_unpacked_values() {
        let mut t = Tensor::new_plain("t", ElementType::F64, vec![2, 3], false, false);
        t.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        t.pack().unwrap();
        assert!(t.is_packed());
        assert_eq!(t.batch_size(), 2);
        assert_eq!(t.read_plain().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn integer_types_round() {
        let mut t = Tensor::new_plain("t", ElementType::I64, vec![2], false, false);
        t.write(&[1.4, -2.6]).unwrap();
        assert_eq!(t.read_plain().unwrap(), vec![1.0, -3.0]);
    }

    #[test]
    fn encrypt_and_read_back() {
        let scheme =
            SimulatedCkks::from_parameters(EncryptionParameters::default()).unwrap();
        scheme.generate_keys().unwrap();
        let mut t = Tensor::new_plain("t", ElementType::F64, vec![2, 2], true, false);
        t.write(&[1.0, 0.0, -3.0, 0.0]).unwrap();
        t.encrypt_in_place(&scheme, true).unwrap();
        assert!(t.is_ciphertext());
        // Second column is all zero and stays a known value.
        assert!(t.data()[1].is_known_value());
        let out = t.read(&scheme).unwrap();
        for (x, y) in [1.0, 0.0, -3.0, 0.0].iter().zip(out) {
            assert_abs_diff_eq!(*x, y, epsilon = 1e-4);
        }
        assert!(t.pack().is_ok());
        t.decrypt_in_place(&scheme).unwrap();
        assert!(t.is_plaintext());
    }

    #[test]
    fn mixed_tensors_are_rejected() {
        let data = vec![HeValue::plain_scalar(1.0, false), HeValue::known(0.0, false)];
        let result = Tensor::from_values("m", ElementType::F64, vec![2], false, false, data);
        assert!(result.is_err());
    }
}
