/// `strata cache` command implementation
///
/// Manages step cache entries (list, stats, clean).
use anyhow::{Context, Result};

use crate::cli::{CacheArgs, CacheCommands};
use crate::merger::merged_cache_dir;
use strata::cli_utils::{format_duration, format_size, strata_prefix};
use strata::config_discovery::load_config_with_discovery;
use strata::pipeline::StepCache;

pub fn cache(args: &CacheArgs) -> Result<()> {
    let file = load_config_with_discovery(args.config.as_deref())?.unwrap_or_default();
    let cache_dir = merged_cache_dir(args.cache_dir.as_ref(), &file);
    let cache = StepCache::new(cache_dir).context("Failed to initialize step cache")?;

    match &args.command {
        CacheCommands::List => list(&cache, args.verbose),
        CacheCommands::Stats => stats(&cache),
        CacheCommands::Clean { step, all } => clean(&cache, step.as_deref(), *all),
    }
}

/// List cached step results
fn list(cache: &StepCache, verbose: bool) -> Result<()> {
    let entries = cache.list().context("Failed to list cache entries")?;

    if entries.is_empty() {
        println!("No cached steps.");
        return Ok(());
    }

    println!("Cached steps ({} entries):", entries.len());
    println!();

    for metadata in entries {
        println!("  {}", metadata.cache_key);
        println!("    Step: {}", metadata.step_id);
        if !metadata.params.is_empty() {
            let params: Vec<String> = metadata
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            println!("    Params: {}", params.join(" "));
        }
        println!(
            "    Created: {}",
            metadata.created_at.format("%Y-%m-%d %H:%M:%S")
        );

        if verbose {
            println!("    Fingerprint: {}", metadata.fingerprint);
            println!("    Exit code: {}", metadata.result.exit_code);
            println!("    Duration: {}", format_duration(metadata.result.duration));
            for output in &metadata.outputs {
                println!(
                    "    Output: {} ({}, {} files)",
                    output.path,
                    format_size(output.size_bytes),
                    output.file_count
                );
            }
        }

        println!();
    }

    Ok(())
}

/// Show cache statistics
fn stats(cache: &StepCache) -> Result<()> {
    let stats = cache.stats().context("Failed to get cache statistics")?;

    println!("Step Cache Statistics");
    println!();
    println!("Location: {}", cache.dir().display());
    println!("Total entries: {}", stats.total_entries);
    println!("Total size: {}", format_size(stats.total_size_bytes));

    if stats.total_entries > 0 {
        println!(
            "Average size per entry: {}",
            format_size(stats.total_size_bytes / stats.total_entries as u64)
        );
    }

    Ok(())
}

/// Clean entries for one step id or the whole cache
fn clean(cache: &StepCache, step: Option<&str>, all: bool) -> Result<()> {
    if all {
        cache.clean_all().context("Failed to clean step cache")?;
        println!("{} All cached steps removed.", strata_prefix());
        return Ok(());
    }

    let Some(step_id) = step else {
        anyhow::bail!("Specify --all to clean the whole cache, or --step <id>");
    };

    let removed = cache
        .remove_step(step_id)
        .with_context(|| format!("Failed to clean cache for step {}", step_id))?;
    println!(
        "{} Removed {} cached result(s) for step '{}'.",
        strata_prefix(),
        removed,
        step_id
    );

    Ok(())
}
