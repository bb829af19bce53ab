pub mod constants;
pub mod error;
pub mod token;
pub mod types;

pub use constants::*;
pub use error::{ErrorCode, PaktError};
pub use token::*;
pub use types::*;
