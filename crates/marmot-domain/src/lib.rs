pub mod error;
pub mod run;
pub mod types;

pub use error::{ErrorKind, InvalidTransitionError, MarmotError};
pub use types::*;
