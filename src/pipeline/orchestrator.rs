/// Pipeline orchestrator
///
/// Runs stages strictly in declared order, handing each stage's working root
/// to the next. A failure halts the pipeline; nothing is rolled back.
use std::collections::HashSet;
use tracing::info;

use super::executor::ExecutionResult;
use super::stage::{Stage, StageExecutor, WorkingRoot};
use crate::error::{
    Result, StrataError, EXIT_CANCELLED, EXIT_STEP_FAILED, EXIT_SUCCESS,
};

/// Linear chain of stages
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate the stage chain: unique names, each stage extends the one before it
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut seen = HashSet::new();

        for (index, stage) in stages.iter().enumerate() {
            if !seen.insert(stage.name.as_str()) {
                return Err(StrataError::StageOrdering(format!(
                    "stage '{}' is defined more than once",
                    stage.name
                )));
            }

            let previous = index.checked_sub(1).map(|i| stages[i].name.as_str());
            match (previous, stage.extends.as_deref()) {
                (None, None) => {}
                (None, Some(parent)) => {
                    return Err(StrataError::StageOrdering(format!(
                        "first stage '{}' cannot extend '{}'",
                        stage.name, parent
                    )))
                }
                (Some(prev), Some(parent)) if prev == parent => {}
                (Some(prev), Some(parent)) => {
                    return Err(StrataError::StageOrdering(format!(
                        "stage '{}' extends '{}' but follows '{}'",
                        stage.name, parent, prev
                    )))
                }
                // An omitted `extends` means "the previous stage"
                (Some(_), None) => {}
            }
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }
}

/// Results of one stage that ran to completion
#[derive(Debug)]
pub struct StageReport {
    pub name: String,
    pub results: Vec<ExecutionResult>,
}

/// The stage that stopped the pipeline
#[derive(Debug)]
pub struct FailedStage {
    pub name: String,
    /// Results gathered before (and including) the failing step
    pub results: Vec<ExecutionResult>,
    pub error: StrataError,
}

/// Outcome of a pipeline run
#[derive(Debug)]
pub struct PipelineResult {
    pub completed: Vec<StageReport>,
    pub failed: Option<FailedStage>,
    /// Stages never started because an earlier one stopped the pipeline
    pub skipped_stages: Vec<String>,
    pub root: WorkingRoot,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        match &self.failed {
            None => EXIT_SUCCESS,
            Some(failed) => match failed.error {
                StrataError::Cancelled(_) => EXIT_CANCELLED,
                _ => EXIT_STEP_FAILED,
            },
        }
    }

    /// Every step result in execution order, including the failing stage's
    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.completed
            .iter()
            .flat_map(|s| s.results.iter())
            .chain(self.failed.iter().flat_map(|f| f.results.iter()))
    }

    /// Steps whose command actually ran this time
    pub fn executed_count(&self) -> usize {
        self.results().filter(|r| !r.cache_hit).count()
    }

    pub fn cache_hit_count(&self) -> usize {
        self.results().filter(|r| r.cache_hit).count()
    }
}

/// Runs a pipeline through a stage executor
pub struct Orchestrator {
    executor: StageExecutor,
}

impl Orchestrator {
    pub fn new(executor: StageExecutor) -> Self {
        Self { executor }
    }

    pub fn run(&self, pipeline: &Pipeline, root: WorkingRoot) -> PipelineResult {
        let mut completed = Vec::new();
        let mut root = root;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            info!(
                operation = "stage.run",
                stage = %stage.name,
                steps = stage.steps.len(),
                "running stage"
            );

            match self.executor.run(stage, root.clone()) {
                Ok((next_root, results)) => {
                    root = next_root;
                    completed.push(StageReport {
                        name: stage.name.clone(),
                        results,
                    });
                }
                Err(stage_error) => {
                    let later = &pipeline.stages[index + 1..];
                    let mut error = stage_error.error;

                    // Widen the stage-local view to the whole pipeline
                    if let StrataError::Cancelled(cancelled) = &mut error {
                        let mut done: Vec<String> = completed
                            .iter()
                            .flat_map(|s: &StageReport| s.results.iter().map(|r| r.step_id.clone()))
                            .collect();
                        done.append(&mut cancelled.completed);
                        cancelled.completed = done;
                        cancelled
                            .not_started
                            .extend(later.iter().flat_map(Stage::step_ids));
                    }

                    return PipelineResult {
                        completed,
                        failed: Some(FailedStage {
                            name: stage.name.clone(),
                            results: stage_error.results,
                            error,
                        }),
                        skipped_stages: later.iter().map(|s| s.name.clone()).collect(),
                        root,
                    };
                }
            }
        }

        PipelineResult {
            completed,
            failed: None,
            skipped_stages: Vec::new(),
            root,
        }
    }
}
