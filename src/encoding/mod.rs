pub mod slots;

pub use slots::{SlotEncoder, SlotInput};
use thiserror::Error;

pub type EncodingResult<T> = Result<T, EncodingError>;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Ring degree {degree} not supported")]
    InvalidRingDegree { degree: usize },

    #[error("Input too long: got {got}, max {max}")]
    InputTooLong { got: usize, max: usize },
}
