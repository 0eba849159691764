pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod models;
pub mod services;

pub use error::{OrchestratorError, Result};
