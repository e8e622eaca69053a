pub mod browser;
pub mod core;
pub mod features;
pub mod workflow;

// --- Primary core exports ---
pub use self::core::types;
pub use self::core::types::*;
pub use self::core::{GateConfig, GateError, StageConfig};

pub use features::gate::{ChallengeGate, GateDecision};
pub use features::recorder::{EventRecorder, EventSink, JsonlFileSink, MemorySink, TracingSink};
pub use workflow::{run_stage, RunReport, Stage, StageDriver, WorkflowRun};
