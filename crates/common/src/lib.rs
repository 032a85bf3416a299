pub mod callback;
pub mod error;
pub mod fmt;

pub use callback::CallbackData;
pub use error::{ErrorKind, OrcError};
