//! authproxy - authenticating multi-protocol proxy

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::env::CompleteEnv;

use authproxy::cli::{Cli, Commands, commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle dynamic shell completion if COMPLETE env var is set
    CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();

    authproxy::logging::init(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, cli.config).await?,
        Commands::Config(args) => commands::config::execute(args, cli.config).await?,
        Commands::Keygen(args) => commands::keygen::execute(args).await?,
        Commands::Version => commands::version::execute(cli.verbose).await?,
        Commands::Completion(args) => commands::completion::execute(args).await?,
    }

    Ok(())
}
