use thiserror::Error;

use crate::encoding::EncodingError;

#[derive(Error, Debug)]
pub enum HeError {
    #[error("Unsupported operand combination {combination} for op {op}")]
    UnsupportedCombination { op: String, combination: String },

    #[error("Unsupported op {op}")]
    UnsupportedOp { op: String },

    #[error("Precision error: {source}")]
    Precision {
        #[from]
        source: PrecisionError,
    },

    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Encoding failed: {source}")]
    Encoding {
        #[from]
        source: EncodingError,
    },

    #[error("Missing key: {key}")]
    MissingKey { key: &'static str },

    #[error("Tensor {id} is not in the store")]
    MissingTensor { id: usize },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    #[error("Config parse error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl HeError {
    pub fn unsupported(op: impl Into<String>, combination: impl Into<String>) -> Self {
        HeError::UnsupportedCombination {
            op: op.into(),
            combination: combination.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HeError::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        HeError::InvalidParameter {
            message: message.into(),
        }
    }
}

/// Failures of the level/scale bookkeeping of the leveled scheme.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrecisionError {
    #[error("Cannot rescale below the last modulus (chain index 0)")]
    RescaleBelowFloor,

    #[error("Chain index mismatch: {left} vs {right}")]
    ChainMismatch { left: usize, right: usize },

    #[error("Scale mismatch: expected {expected:.2}, got {actual:.2}")]
    ScaleMismatch { expected: f64, actual: f64 },

    #[error("Scale 2^{log_scale:.2} out of bounds for {total_bits} modulus bits")]
    ScaleOutOfBounds { log_scale: f64, total_bits: u32 },

    #[error("Encoded value {value} too large for {total_bits} modulus bits")]
    ValueTooLarge { value: f64, total_bits: u32 },
}

/// Failures of the client/server session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    #[error("Unexpected message in phase {phase}: {message}")]
    UnexpectedMessage { phase: String, message: String },

    #[error("Keys not received from the client")]
    MissingKeys,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Timed out after {millis} ms waiting for {waiting_for}")]
    Timeout { millis: u128, waiting_for: String },

    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: u64, limit: u64 },
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            message: message.into(),
        }
    }
}

pub type HeResult<T> = Result<T, HeError>;
