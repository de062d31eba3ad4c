//! SQL extraction and validation
//!
//! Model output goes through [`extract`] and then [`SqlValidator::validate`];
//! only a [`ValidatedStatement`] reaches the executor.

pub mod extractor;
pub mod tokens;
pub mod validator;

pub use extractor::{extract, Extracted};
pub use validator::{SqlValidator, ValidatedStatement};
