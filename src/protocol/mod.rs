pub mod message;
pub mod transport;

pub use message::{Function, Message, MessageKind, WireTensor, WireValue};
pub use transport::{DEFAULT_MAX_MESSAGE_SIZE, read_message, write_message};
