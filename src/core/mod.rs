pub mod config;
pub mod error;
pub mod types;

pub use config::{GateConfig, StageConfig};
pub use error::{GateError, ProbeError, SinkError};
