pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to the data-directory log file
    #[arg(long, global = true)]
    pub log_to_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a crawl task and run it to completion
    Crawl {
        /// Seed URLs to start crawling from
        #[arg(required = true)]
        urls: Vec<String>,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum crawling depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum number of pages for this task
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Show the persisted snapshot of a crawl task
    Status {
        /// Task ID to check
        #[arg(required = true)]
        task_id: String,
    },

    /// List persisted crawl tasks
    Tasks {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Query the index collaborators
    Search {
        /// Search query
        #[arg(required = true)]
        query: String,

        /// Search mode (lexical, semantic)
        #[arg(short, long, default_value = "lexical")]
        mode: String,

        /// Maximum number of hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to show or create
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { urls, profile, depth, limit } => {
            info!("Submitting crawl over {} seed(s)", urls.len());
            commands::crawl(urls, profile, depth, limit).await
        }
        Commands::Status { task_id } => commands::status(task_id).await,
        Commands::Tasks { status, limit } => commands::tasks(status, limit).await,
        Commands::Search { query, mode, limit } => commands::search(query, mode, limit).await,
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
