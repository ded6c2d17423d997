use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "visualgrid")]
#[command(about = "Visual Grid rendering and matching CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to config/visualgrid.toml or $VISUALGRID_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve page resources and their dependencies, printing them as JSON
    Resolve(ResolveArgs),
    /// Fetch render service location and credentials from the server
    RenderInfo(RenderInfoArgs),
}

#[derive(clap::Args, Debug)]
pub struct ResolveArgs {
    /// Absolute resource URLs
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// User-Agent sent with every fetch
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Referer sent with every fetch
    #[arg(long)]
    pub referer: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct RenderInfoArgs {
    /// Print the access token instead of masking it
    #[arg(long)]
    pub show_token: bool,
}
