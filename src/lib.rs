// Library interface for Strata
// The binary and integration tests build on these modules

pub mod cli_utils;
pub mod config;
pub mod config_discovery;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod xdg;

// Re-export commonly used types
pub use config::StrataConfig;
pub use error::{StrataError, EXIT_CANCELLED, EXIT_DEFINITION, EXIT_STEP_FAILED, EXIT_SUCCESS};
pub use pipeline::{load_pipeline, Orchestrator, Pipeline, PipelineResult, StageExecutor};
