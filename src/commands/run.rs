/// `strata run` command implementation
///
/// Loads a pipeline definition, resolves it against the merged parameters and
/// runs it stage by stage, reusing cached step results.
use anyhow::{Context, Result};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::merger::{env_params, MergedRunConfig};
use strata::cli_utils::{format_duration, strata_prefix};
use strata::config_discovery::load_config_with_discovery;
use strata::error::{CancelledError, StageFailedError, StrataError, EXIT_SUCCESS};
use strata::logging::status;
use strata::pipeline::{
    load_pipeline, CancellationToken, ExecutionResult, LoadedPipeline, Orchestrator,
    PipelineResult, ShellExecutor, StageExecutor, StepCache, StepOutcome, WorkingRoot,
};
use strata::xdg::XDG_VARS;

pub async fn run(args: RunArgs) -> Result<i32> {
    let file_config = load_config_with_discovery(args.config.as_deref())?;
    let merged = MergedRunConfig::merge(&args, file_config, env_params(std::env::vars()))?;

    debug!(
        params = ?merged.params,
        cache_dir = %merged.cache_dir.display(),
        cache_enabled = merged.cache_enabled,
        shell = %merged.shell,
        "merged run configuration"
    );
    for var in XDG_VARS {
        if let Ok(value) = std::env::var(var) {
            debug!(variable = var, value = %value, "passed through to steps");
        }
    }

    let loaded = load_pipeline(&args.pipeline, &merged.params)?;
    info!(
        pipeline = %loaded.path.display(),
        stages = loaded.pipeline.stages().len(),
        steps = loaded.pipeline.step_count(),
        descriptors = loaded.store.len(),
        "pipeline loaded"
    );

    let cache = if merged.cache_enabled {
        Some(StepCache::new(merged.cache_dir.clone()).context("Failed to initialize step cache")?)
    } else {
        eprintln!("{} Caching disabled - every step executes", strata_prefix());
        None
    };

    if args.dry_run {
        print_plan(&loaded, cache.as_ref(), args.verbose);
        return Ok(EXIT_SUCCESS);
    }

    let root = WorkingRoot::open(merged.root.clone())?;
    let shell = ShellExecutor::new(&merged.shell, merged.step_timeout);
    if args.verbose {
        eprintln!("{} Working root: {}", strata_prefix(), root.path().display());
        eprintln!("{} Shell: {}", strata_prefix(), shell.shell().display());
    }

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(cancel_on_signal(cancel.clone()));

    let executor = StageExecutor::new(shell, cache, cancel);
    let orchestrator = Orchestrator::new(executor);

    let start = Instant::now();
    let result = tokio::task::spawn_blocking(move || orchestrator.run(&loaded.pipeline, root))
        .await
        .context("Pipeline task failed")?;
    listener.abort();

    report(&result, args.verbose, start.elapsed())?;

    Ok(result.exit_code())
}

/// Set the token on Ctrl+C or SIGTERM; the running step is terminated by the executor
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "failed to listen for Ctrl+C");
                            sigterm.recv().await;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                if signal::ctrl_c().await.is_err() {
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_err() {
            return;
        }
    }

    warn!(
        operation = "run",
        status = status::CANCELLED,
        "cancellation requested"
    );
    eprintln!(
        "{} Cancelling - stopping the running step, no further steps will start",
        strata_prefix()
    );
    cancel.cancel();
}

/// Dry run: cache key and cache status for every step, nothing executes
fn print_plan(loaded: &LoadedPipeline, cache: Option<&StepCache>, verbose: bool) {
    println!("Pipeline: {}", loaded.path.display());

    for stage in loaded.pipeline.stages() {
        println!();
        match &stage.extends {
            Some(parent) => println!("Stage: {} (extends {})", stage.name, parent),
            None => println!("Stage: {}", stage.name),
        }

        for step in &stage.steps {
            let state = match cache {
                Some(cache) if cache.lookup(step).is_some() => "HIT ✓",
                Some(_) => "MISS ✗",
                None => "NO CACHE",
            };
            println!("  {:<28} {} | {}", step.id(), step.cache_key(), state);

            if verbose {
                for (name, value) in step.params() {
                    println!("      {} = {}", name, value);
                }
                println!("      $ {}", step.command());
            }
        }
    }
}

fn report(result: &PipelineResult, verbose: bool, elapsed: Duration) -> Result<()> {
    for stage in &result.completed {
        for step in &stage.results {
            print_step(&stage.name, step);
            if verbose && !step.cache_hit {
                write_step_output(step)?;
            }
        }
    }

    if let Some(failed) = &result.failed {
        for step in &failed.results {
            print_step(&failed.name, step);
        }

        match &failed.error {
            StrataError::StageFailed(e) => print_failure(e),
            StrataError::Cancelled(e) => print_cancelled(e),
            other => eprintln!("{} Error: {}", strata_prefix(), other),
        }

        if !result.skipped_stages.is_empty() {
            eprintln!(
                "{} Stages not started: {}",
                strata_prefix(),
                result.skipped_stages.join(", ")
            );
        }
    }

    eprintln!(
        "{} {} | {} executed, {} cached | {}",
        strata_prefix(),
        if result.is_success() { "Done" } else { "Stopped" },
        result.executed_count(),
        result.cache_hit_count(),
        format_duration(elapsed)
    );

    Ok(())
}

/// Compact single-line step summary
fn print_step(stage: &str, step: &ExecutionResult) {
    let state = match (step.cache_hit, step.outcome) {
        (true, _) => "HIT ✓",
        (false, StepOutcome::Succeeded) => "MISS ✗",
        (false, StepOutcome::Failed) => "FAIL ✗",
        (false, StepOutcome::Interrupted) => "CANCELLED",
    };

    eprintln!(
        "{} {}/{} | {} | {}",
        strata_prefix(),
        stage,
        step.step_id,
        state,
        format_duration(step.duration)
    );
}

fn write_step_output(step: &ExecutionResult) -> Result<()> {
    std::io::stdout()
        .write_all(step.stdout.as_bytes())
        .context("Failed to write stdout")?;
    std::io::stderr()
        .write_all(step.stderr.as_bytes())
        .context("Failed to write stderr")?;
    Ok(())
}

fn print_failure(e: &StageFailedError) {
    eprintln!(
        "{} Step '{}' failed in stage '{}' (exit code {})",
        strata_prefix(),
        e.step_id,
        e.stage,
        e.exit_code
    );

    for (label, output) in [("stdout", &e.stdout), ("stderr", &e.stderr)] {
        if output.is_empty() {
            continue;
        }
        eprintln!("--- {} ---", label);
        eprint!("{}", output);
        if !output.ends_with('\n') {
            eprintln!();
        }
    }

    if !e.remaining.is_empty() {
        eprintln!(
            "{} Not executed in stage '{}': {}",
            strata_prefix(),
            e.stage,
            e.remaining.join(", ")
        );
    }
}

fn print_cancelled(e: &CancelledError) {
    eprintln!("{} Cancelled", strata_prefix());
    eprintln!("{}   completed:   {}", strata_prefix(), id_list(&e.completed));
    eprintln!(
        "{}   interrupted: {}",
        strata_prefix(),
        e.interrupted.as_deref().unwrap_or("-")
    );
    eprintln!("{}   not started: {}", strata_prefix(), id_list(&e.not_started));
}

fn id_list(ids: &[String]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}
