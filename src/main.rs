mod cli;
mod commands;
mod merger;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use strata::cli_utils::strata_prefix;
use strata::{logging, StrataError, EXIT_STEP_FAILED, EXIT_SUCCESS};

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize structured logging
    logging::init(cli.log_level());

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} Error: {:#}", strata_prefix(), e);
            exit_code_for(&e)
        }
    };

    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Cache(args) => commands::cache::cache(&args).map(|()| EXIT_SUCCESS),
    }
}

/// Exit code of the first `StrataError` in the chain, 1 otherwise
fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<StrataError>())
        .map(StrataError::exit_code)
        .unwrap_or(EXIT_STEP_FAILED)
}
