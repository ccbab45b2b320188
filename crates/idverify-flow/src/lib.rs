//! idverify-flow — Identity verification flow.
//!
//! Sequences document capture, recognition and face comparison as one state
//! machine running on its own task. Presentation code drives it through a
//! [`FlowHandle`] and renders the [`FlowSnapshot`]s it publishes.

pub mod config;
pub mod flow;
pub mod params;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError};
pub use flow::{FlowHandle, ImageSource};
pub use params::{FlowBuilder, FlowParams};
pub use state::{FlowError, FlowSnapshot, FlowState, VerificationResult};
