/// Stage executor
///
/// Runs the steps of one stage in declared order against a working root,
/// consulting the cache first and stopping at the first failure.
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use super::cache::{OutputSnapshot, StepCache};
use super::cancel::CancellationToken;
use super::descriptor::ResolvedStep;
use super::executor::{ExecutionResult, ShellExecutor, StepContext, StepOutcome};
use super::outputs::{archive_outputs, extract_outputs};
use crate::error::{CancelledError, StageFailedError, StrataError};
use crate::logging::{operations, status};

/// Filesystem state threaded from stage to stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingRoot {
    path: PathBuf,
}

impl WorkingRoot {
    /// Open (creating if needed) a working root directory
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create working root: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Named, ordered group of resolved steps
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    /// The stage this one builds on; `None` only for the first stage
    pub extends: Option<String>,
    pub steps: Vec<ResolvedStep>,
}

impl Stage {
    pub fn new(name: impl Into<String>, extends: Option<String>, steps: Vec<ResolvedStep>) -> Self {
        Self {
            name: name.into(),
            extends,
            steps,
        }
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id().to_string()).collect()
    }
}

/// A stage that stopped early, with the results gathered up to that point
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StageError {
    /// Completed steps followed by the failing or interrupted one (if any)
    pub results: Vec<ExecutionResult>,
    pub error: StrataError,
}

/// Runs stages step by step
#[derive(Debug, Clone)]
pub struct StageExecutor {
    executor: ShellExecutor,
    cache: Option<StepCache>,
    cancel: CancellationToken,
}

impl StageExecutor {
    /// `cache: None` disables both lookups and writes
    pub fn new(executor: ShellExecutor, cache: Option<StepCache>, cancel: CancellationToken) -> Self {
        Self {
            executor,
            cache,
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run every step of `stage` against `root`, returning the root for the next stage
    pub fn run(
        &self,
        stage: &Stage,
        root: WorkingRoot,
    ) -> std::result::Result<(WorkingRoot, Vec<ExecutionResult>), StageError> {
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(stage.steps.len());

        for (index, step) in stage.steps.iter().enumerate() {
            let later = || -> Vec<String> {
                stage.steps[index + 1..]
                    .iter()
                    .map(|s| s.id().to_string())
                    .collect()
            };

            if self.cancel.is_cancelled() {
                let error = CancelledError {
                    completed: ids(&results),
                    interrupted: None,
                    not_started: stage.steps[index..]
                        .iter()
                        .map(|s| s.id().to_string())
                        .collect(),
                };
                return Err(StageError {
                    results,
                    error: error.into(),
                });
            }

            if let Some(hit) = self.restore_from_cache(stage, step, &root) {
                results.push(hit);
                continue;
            }

            let result = self.run_step(stage, step, &root);

            match result.outcome {
                StepOutcome::Succeeded => {
                    log_step(stage, &result, status::MISS);
                    results.push(result);
                }
                StepOutcome::Interrupted => {
                    log_step(stage, &result, status::CANCELLED);
                    let error = CancelledError {
                        completed: ids(&results),
                        interrupted: Some(step.id().to_string()),
                        not_started: later(),
                    };
                    results.push(result);
                    return Err(StageError {
                        results,
                        error: error.into(),
                    });
                }
                StepOutcome::Failed => {
                    log_step(stage, &result, status::FAILED);
                    let error = StageFailedError {
                        stage: stage.name.clone(),
                        step_id: step.id().to_string(),
                        exit_code: result.exit_code,
                        stdout: result.stdout.clone(),
                        stderr: result.stderr.clone(),
                        remaining: later(),
                    };
                    results.push(result);
                    return Err(StageError {
                        results,
                        error: error.into(),
                    });
                }
            }
        }

        Ok((root, results))
    }

    /// Cache hit: replay the stored result and restore its output layer
    fn restore_from_cache(
        &self,
        stage: &Stage,
        step: &ResolvedStep,
        root: &WorkingRoot,
    ) -> Option<ExecutionResult> {
        let cache = self.cache.as_ref()?;
        let start = Instant::now();
        let entry = cache.lookup(step)?;

        if let Some(archive) = &entry.archive_path {
            if let Err(e) = extract_outputs(archive, root.path()) {
                warn!(
                    operation = operations::RESTORE,
                    status = status::ERROR,
                    step_id = step.id(),
                    error = %e,
                    "failed to restore cached outputs, re-running step"
                );
                return None;
            }
        }

        let mut result = entry.metadata.result;
        result.cache_hit = true;
        result.duration = start.elapsed();
        log_step(stage, &result, status::HIT);
        Some(result)
    }

    /// Execute a step, verify its result marker, snapshot outputs and cache it
    fn run_step(&self, stage: &Stage, step: &ResolvedStep, root: &WorkingRoot) -> ExecutionResult {
        let ctx = StepContext {
            root: root.path(),
            stage: &stage.name,
        };

        let mut result = match self.executor.execute(step, ctx, &self.cancel) {
            Ok(result) => result,
            Err(e) => ExecutionResult {
                step_id: step.id().to_string(),
                cache_key: step.cache_key(),
                outcome: StepOutcome::Failed,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("{:#}\n", e),
                duration: Default::default(),
                cache_hit: false,
            },
        };

        if !result.succeeded() {
            return result;
        }

        if let Some(marker) = step.descriptor().expect() {
            match fs::read(root.path().join(&marker.path)) {
                Ok(content) if marker.matches(&content) => {}
                Ok(_) => {
                    result.fail_with(&format!("result marker mismatch for {}", marker.path));
                    return result;
                }
                Err(e) => {
                    result.fail_with(&format!("result marker {} unreadable: {}", marker.path, e));
                    return result;
                }
            }
        }

        let outputs = step.descriptor().outputs();

        // Snapshot outputs even without a cache; a missing output is a step failure
        let archive = if outputs.is_empty() {
            None
        } else {
            let snapshot = tempfile::NamedTempFile::new()
                .map_err(anyhow::Error::from)
                .and_then(|tmp| {
                    let archived = archive_outputs(outputs, root.path(), tmp.path())?;
                    Ok((tmp, archived))
                });
            match snapshot {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    result.fail_with(&format!("{:#}", e));
                    return result;
                }
            }
        };

        if let Some(cache) = &self.cache {
            let snapshot = archive.as_ref().map(|(tmp, archived)| OutputSnapshot {
                archive_path: tmp.path(),
                outputs: archived.clone(),
            });
            if let Err(e) = cache.store(step, &result, snapshot) {
                warn!(
                    operation = operations::STORE,
                    status = status::ERROR,
                    step_id = step.id(),
                    error = %e,
                    "failed to cache step result"
                );
            }
        }

        result
    }
}

fn ids(results: &[ExecutionResult]) -> Vec<String> {
    results.iter().map(|r| r.step_id.clone()).collect()
}

fn log_step(stage: &Stage, result: &ExecutionResult, status: &str) {
    info!(
        operation = operations::STEP,
        status,
        stage = %stage.name,
        step_id = %result.step_id,
        cache_key = %result.cache_key,
        duration_ms = result.duration.as_millis() as u64,
        "step {}",
        status
    );
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::{DescriptorStore, Params, StepDescriptor};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: DescriptorStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                store: DescriptorStore::new(),
            }
        }

        /// Register a step that appends its id to a run log outside the root
        fn step(&mut self, id: &str, body: &str) {
            let log = self.temp.path().join("runs.log");
            let command = format!("echo {} >> '{}' && {}", id, log.display(), body);
            self.store
                .register(StepDescriptor::new(id, command))
                .unwrap();
        }

        fn resolve(&self, id: &str) -> ResolvedStep {
            self.store.resolve(id, &Params::new()).unwrap()
        }

        fn runs(&self) -> Vec<String> {
            fs::read_to_string(self.temp.path().join("runs.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn root(&self) -> WorkingRoot {
            WorkingRoot::open(self.temp.path().join("root")).unwrap()
        }

        fn executor(&self) -> StageExecutor {
            let cache = StepCache::new(self.temp.path().join("cache")).unwrap();
            StageExecutor::new(
                ShellExecutor::new("sh", None),
                Some(cache),
                CancellationToken::new(),
            )
        }
    }

    #[test]
    fn test_failure_stops_stage_and_reports_remaining() {
        let mut fx = Fixture::new();
        fx.step("a", "true");
        fx.step("b", "echo broken >&2; exit 4");
        fx.step("c", "true");
        fx.step("d", "true");

        let stage = Stage::new(
            "dev-deps",
            None,
            vec![fx.resolve("a"), fx.resolve("b"), fx.resolve("c"), fx.resolve("d")],
        );

        let err = fx.executor().run(&stage, fx.root()).unwrap_err();
        match err.error {
            StrataError::StageFailed(failed) => {
                assert_eq!(failed.step_id, "b");
                assert_eq!(failed.exit_code, 4);
                assert!(failed.stderr.contains("broken"));
                assert_eq!(failed.remaining, vec!["c".to_string(), "d".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.results.len(), 2);
        assert_eq!(fx.runs(), vec!["a", "b"]);
    }

    #[test]
    fn test_second_run_hits_cache() {
        let mut fx = Fixture::new();
        fx.step("a", "touch a.txt");
        fx.step("b", "touch b.txt");
        let stage = Stage::new("override", None, vec![fx.resolve("a"), fx.resolve("b")]);
        let executor = fx.executor();

        let (_, first) = executor.run(&stage, fx.root()).unwrap();
        assert!(first.iter().all(|r| !r.cache_hit));

        let (_, second) = executor.run(&stage, fx.root()).unwrap();
        assert!(second.iter().all(|r| r.cache_hit));
        assert_eq!(fx.runs(), vec!["a", "b"]);
    }

    #[test]
    fn test_no_cache_always_executes() {
        let mut fx = Fixture::new();
        fx.step("a", "true");
        let stage = Stage::new("override", None, vec![fx.resolve("a")]);
        let executor = StageExecutor::new(
            ShellExecutor::new("sh", None),
            None,
            CancellationToken::new(),
        );

        executor.run(&stage, fx.root()).unwrap();
        executor.run(&stage, fx.root()).unwrap();
        assert_eq!(fx.runs(), vec!["a", "a"]);
    }

    #[test]
    fn test_cached_outputs_restored_into_fresh_root() {
        let mut fx = Fixture::new();
        let log = fx.temp.path().join("runs.log");
        fx.store
            .register(
                StepDescriptor::new(
                    "install-neovim",
                    format!(
                        "echo install-neovim >> '{}' && mkdir -p opt/nvim && echo nvim > opt/nvim/nvim",
                        log.display()
                    ),
                )
                .with_outputs(vec!["opt/nvim".to_string()]),
            )
            .unwrap();
        let stage = Stage::new("dev-deps", None, vec![fx.resolve("install-neovim")]);
        let executor = fx.executor();

        executor.run(&stage, fx.root()).unwrap();

        let fresh = WorkingRoot::open(fx.temp.path().join("fresh")).unwrap();
        let (root, results) = executor.run(&stage, fresh).unwrap();
        assert!(results[0].cache_hit);
        assert_eq!(
            fs::read_to_string(root.path().join("opt/nvim/nvim")).unwrap().trim(),
            "nvim"
        );
        assert_eq!(fx.runs(), vec!["install-neovim"]);
    }

    #[test]
    fn test_result_marker_mismatch_fails_step() {
        let mut fx = Fixture::new();
        let marker = format!("sha256:{}:marker", "0".repeat(64));
        fx.store
            .register(
                StepDescriptor::new("checked", "echo hi > marker")
                    .with_expect(crate::pipeline::descriptor::ResultMarker::parse(&marker)),
            )
            .unwrap();
        let stage = Stage::new("final", None, vec![fx.resolve("checked")]);

        let err = fx.executor().run(&stage, fx.root()).unwrap_err();
        match err.error {
            StrataError::StageFailed(failed) => {
                assert_eq!(failed.exit_code, 0);
                assert!(failed.stderr.contains("result marker mismatch"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_result_marker_fails_step() {
        let mut fx = Fixture::new();
        let marker = format!("sha256:{}:opt/nvim/bin/nvim", "0".repeat(64));
        fx.store
            .register(
                StepDescriptor::new("install-neovim", "true")
                    .with_expect(crate::pipeline::descriptor::ResultMarker::parse(&marker)),
            )
            .unwrap();
        let stage = Stage::new("dev-deps", None, vec![fx.resolve("install-neovim")]);

        let err = fx.executor().run(&stage, fx.root()).unwrap_err();
        match err.error {
            StrataError::StageFailed(failed) => {
                assert_eq!(failed.step_id, "install-neovim");
                assert_eq!(failed.exit_code, 0);
                assert!(failed.stderr.contains("opt/nvim/bin/nvim unreadable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_matching_result_marker_passes_and_caches() {
        use sha2::{Digest, Sha256};

        let mut fx = Fixture::new();
        let digest = hex::encode(Sha256::digest(b"hi\n"));
        let marker = format!("sha256:{}:marker", digest);
        fx.store
            .register(
                StepDescriptor::new("checked", "echo hi > marker")
                    .with_expect(crate::pipeline::descriptor::ResultMarker::parse(&marker)),
            )
            .unwrap();
        let stage = Stage::new("final", None, vec![fx.resolve("checked")]);
        let executor = fx.executor();

        let (_, first) = executor.run(&stage, fx.root()).unwrap();
        assert_eq!(first[0].outcome, StepOutcome::Succeeded);
        assert!(!first[0].cache_hit);

        let (_, second) = executor.run(&stage, fx.root()).unwrap();
        assert!(second[0].cache_hit);
    }

    #[test]
    fn test_cancel_before_stage_starts_nothing() {
        let mut fx = Fixture::new();
        fx.step("a", "true");
        fx.step("b", "true");
        let stage = Stage::new("override", None, vec![fx.resolve("a"), fx.resolve("b")]);
        let executor = fx.executor();
        executor.cancellation().cancel();

        let err = executor.run(&stage, fx.root()).unwrap_err();
        match err.error {
            StrataError::Cancelled(cancelled) => {
                assert!(cancelled.completed.is_empty());
                assert!(cancelled.interrupted.is_none());
                assert_eq!(cancelled.not_started, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.runs().is_empty());
    }

    #[test]
    fn test_cancel_during_step_never_starts_next() {
        let mut fx = Fixture::new();
        fx.step("a", "true");
        fx.step("b", "sleep 10");
        fx.step("c", "true");
        let stage = Stage::new(
            "dev-deps",
            None,
            vec![fx.resolve("a"), fx.resolve("b"), fx.resolve("c")],
        );
        let executor = fx.executor();

        let trigger = executor.cancellation().clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            trigger.cancel();
        });

        let err = executor.run(&stage, fx.root()).unwrap_err();
        canceller.join().unwrap();

        match err.error {
            StrataError::Cancelled(cancelled) => {
                assert_eq!(cancelled.completed, vec!["a".to_string()]);
                assert_eq!(cancelled.interrupted.as_deref(), Some("b"));
                assert_eq!(cancelled.not_started, vec!["c".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.runs(), vec!["a", "b"]);
    }
}
