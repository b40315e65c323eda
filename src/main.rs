use anyhow::Result;
use tracing::{error, info};

mod cli;
mod crawler;
mod index;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let log_file = args.log_to_file.then(utils::logging::default_log_file);
    utils::logging::init_logging(args.verbose, log_file)?;

    info!("Starting agentic crawler v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Command failed: {e:#}");
            Err(e)
        }
    }
}
