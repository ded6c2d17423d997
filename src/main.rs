mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use visualgrid::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    visualgrid::observability::init_tracing();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Resolve(args) => commands::resolve(&config, args).await?,
        Commands::RenderInfo(args) => commands::render_info(&config, args).await?,
    }

    Ok(())
}
