pub mod error;
pub mod types;

pub use error::{FailoverError, Result};
pub use types::*;
