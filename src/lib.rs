pub mod activation;
pub mod client;
pub mod config;
pub mod encoding;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod kernel;
pub mod liveness;
pub mod logging;
pub mod math;
pub mod precision;
pub mod protocol;
pub mod scheme;
pub mod shape;
pub mod store;
pub mod tensor;
pub mod value;

pub use activation::{GcMasks, InProcessGarbler, Plain, SecureComputation, SessionPhase};
pub use client::HeClient;
pub use config::{ExecutorConfig, ExecutorConfigBuilder};
pub use errors::{HeError, HeResult, PrecisionError, ProtocolError};
pub use executor::{Executable, ExecutableState, HeBackend};
pub use graph::{Graph, GraphBuilder, OpKind, TensorId};
pub use kernel::activation::Activation;
pub use kernel::convolution::ConvolutionParams;
pub use kernel::pool::PoolParams;
pub use scheme::{EncryptionParameters, HeScheme, SimCiphertext, SimulatedCkks};
pub use tensor::{ElementType, HeTensor};
pub use value::{HeCiphertext, HePlaintext, HeValue};
