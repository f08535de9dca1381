use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Strata - layered build-stage executor
///
/// Runs declarative build stages step by step, skipping every step whose
/// descriptor and parameters are unchanged since its last successful run.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Layered build-stage executor with a persistent step cache", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter when RUST_LOG is unset
    pub fn log_level(&self) -> &'static str {
        match &self.command {
            Commands::Run(args) if args.verbose => "debug",
            Commands::Cache(args) if args.verbose => "debug",
            _ => "info",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline definition
    Run(RunArgs),

    /// Inspect or clean the step cache
    Cache(CacheArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline definition file (TOML)
    pub pipeline: PathBuf,

    /// Target architecture (binds the `arch` parameter)
    #[arg(long, env = "STRATA_ARCH")]
    pub arch: Option<String>,

    /// Version to install (binds the `version` parameter)
    #[arg(long = "version", id = "pin_version", env = "STRATA_VERSION")]
    pub version: Option<String>,

    /// Extra parameter binding, repeatable (e.g. --param node=20)
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Step cache directory
    #[arg(long, env = "STRATA_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Neither read nor write the step cache
    #[arg(long)]
    pub no_cache: bool,

    /// Working root the steps run in
    #[arg(long, default_value = ".strata-root")]
    pub root: PathBuf,

    /// Resolve the pipeline and show cache status without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file path
    #[arg(short = 'c', long, env = "STRATA_CONFIG")]
    pub config: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Step cache directory
    #[arg(long, env = "STRATA_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Config file path
    #[arg(short = 'c', long, env = "STRATA_CONFIG", global = true)]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommands {
    /// List cached step results
    List,

    /// Show cache statistics
    Stats,

    /// Remove cached step results
    Clean {
        /// Only remove entries for this step id
        #[arg(long, conflicts_with = "all")]
        step: Option<String>,

        /// Remove every entry
        #[arg(long)]
        all: bool,
    },
}

/// Parse `KEY=VALUE`
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }

    Ok((key.to_string(), value.to_string()))
}
