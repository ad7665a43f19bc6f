//! Messages exchanged between the server executable and its client.

use serde::{Deserialize, Serialize};

use crate::errors::{HeResult, ProtocolError};
use crate::scheme::{EncryptionParameters, HeScheme};
use crate::value::{CipherInner, HeValue};

/// Function names carried in [`Function::name`].
pub mod function {
    pub const PARAMETER: &str = "Parameter";
    pub const RESULT: &str = "Result";
    pub const RELU: &str = "Relu";
    pub const BOUNDED_RELU: &str = "BoundedRelu";
    pub const MAX_POOL: &str = "MaxPool";
}

/// Names of the mask tensors riding along an activation request.
pub const INPUT_MASK_TENSOR: &str = "gc_input_mask";
pub const OUTPUT_MASK_TENSOR: &str = "gc_output_mask";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub bound: Option<f64>,
    pub enable_gc: bool,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bound: None,
            enable_gc: false,
        }
    }

    pub fn with_bound(mut self, bound: Option<f64>) -> Self {
        self.bound = bound;
        self
    }

    pub fn with_gc(mut self, enable_gc: bool) -> Self {
        self.enable_gc = enable_gc;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Plain(Vec<f64>),
    Cipher(Vec<u8>),
    Known(f64),
}

impl WireValue {
    pub fn from_value<S: HeScheme>(scheme: &S, value: &HeValue<S::Ciphertext>) -> HeResult<Self> {
        Ok(match value {
            HeValue::Plaintext(p) => WireValue::Plain(p.values().to_vec()),
            HeValue::Ciphertext(c) => match c.inner() {
                CipherInner::Known(v) => WireValue::Known(*v),
                CipherInner::Encrypted(ct) => WireValue::Cipher(scheme.save_ciphertext(ct)?),
            },
        })
    }

    pub fn into_value<S: HeScheme>(
        self,
        scheme: &S,
        complex_packing: bool,
    ) -> HeResult<HeValue<S::Ciphertext>> {
        Ok(match self {
            WireValue::Plain(values) => HeValue::plain(values, complex_packing),
            WireValue::Known(v) => HeValue::known(v, complex_packing),
            WireValue::Cipher(bytes) => {
                HeValue::encrypted(scheme.load_ciphertext(&bytes)?, complex_packing)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub name: String,
    /// Logical shape, batch axis included.
    pub shape: Vec<usize>,
    pub packed: bool,
    /// Index of the first value within the full tensor.
    pub offset: usize,
    pub values: Vec<WireValue>,
}

impl WireTensor {
    /// A tensor description without values.
    pub fn describe(name: &str, shape: Vec<usize>, packed: bool) -> Self {
        Self {
            name: name.to_string(),
            shape,
            packed,
            offset: 0,
            values: Vec::new(),
        }
    }

    pub fn with_values(mut self, offset: usize, values: Vec<WireValue>) -> Self {
        self.offset = offset;
        self.values = values;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub encryption_parameters: Option<EncryptionParameters>,
    pub public_key: Option<Vec<u8>>,
    pub eval_key: Option<Vec<u8>>,
    pub function: Option<Function>,
    pub request_id: u64,
    pub tensors: Vec<WireTensor>,
}

impl Message {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            encryption_parameters: None,
            public_key: None,
            eval_key: None,
            function: None,
            request_id: 0,
            tensors: Vec::new(),
        }
    }

    /// Server to client on connect.
    pub fn parameters(params: EncryptionParameters) -> Self {
        Self {
            encryption_parameters: Some(params),
            ..Self::empty(MessageKind::Response)
        }
    }

    /// Client to server after key generation.
    pub fn keys(public_key: Vec<u8>, eval_key: Vec<u8>) -> Self {
        Self {
            public_key: Some(public_key),
            eval_key: Some(eval_key),
            ..Self::empty(MessageKind::Request)
        }
    }

    pub fn request(function: Function, request_id: u64, tensors: Vec<WireTensor>) -> Self {
        Self {
            function: Some(function),
            request_id,
            tensors,
            ..Self::empty(MessageKind::Request)
        }
    }

    pub fn response(function: Function, request_id: u64, tensors: Vec<WireTensor>) -> Self {
        Self {
            function: Some(function),
            request_id,
            tensors,
            ..Self::empty(MessageKind::Response)
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function.as_ref().map(|f| f.name.as_str())
    }

    pub fn is_keys(&self) -> bool {
        self.kind == MessageKind::Request && self.public_key.is_some()
    }

    /// One-line description for logs and errors.
    pub fn summary(&self) -> String {
        format!(
            "{:?} {} #{} ({} tensors)",
            self.kind,
            self.function_name().unwrap_or(if self.is_keys() {
                "keys"
            } else if self.encryption_parameters.is_some() {
                "parameters"
            } else {
                "-"
            }),
            self.request_id,
            self.tensors.len()
        )
    }

    /// The tensor named `name`, or a malformed-message error.
    pub fn tensor(&self, name: &str) -> Result<&WireTensor, ProtocolError> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ProtocolError::malformed(format!("missing tensor {name}")))
    }
}
