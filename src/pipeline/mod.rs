//! Layered build-stage pipeline
//!
//! Step descriptors are registered once, resolved against parameters into
//! steps, grouped into stages and run in order with a persistent cache.

pub mod cache;
pub mod cache_key;
pub mod cancel;
pub mod definition;
pub mod descriptor;
pub mod executor;
pub mod orchestrator;
pub mod outputs;
pub mod stage;

pub use cache::{CacheEntry, CacheMetadata, CacheStats, StepCache};
pub use cancel::CancellationToken;
pub use definition::{load_pipeline, LoadedPipeline, PipelineDefinition};
pub use descriptor::{DescriptorStore, Params, ResolvedStep, ResultMarker, StepDescriptor};
pub use executor::{ExecutionResult, ShellExecutor, StepOutcome};
pub use orchestrator::{Orchestrator, Pipeline, PipelineResult};
pub use stage::{Stage, StageExecutor, WorkingRoot};
