//! Application layer: errors, shared state and message dispatch

pub mod errors;
pub mod messaging;
pub mod state;
