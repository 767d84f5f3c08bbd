//! Shared utilities: time stamps, identifiers and tracing setup.

pub mod clock;
pub mod ids;
pub mod telemetry;

pub use clock::*;
pub use ids::*;
pub use telemetry::*;
