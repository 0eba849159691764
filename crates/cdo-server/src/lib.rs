pub mod build_log;
pub mod routes;
pub mod webhook;

pub use routes::{router, AppState};
