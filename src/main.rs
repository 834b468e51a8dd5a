use clap::Parser;
use tracing::{error, info};

use mcp_remote::{
    args::Cli,
    driver::{self, Session},
    filter::ToolFilter,
    logging, proxy,
    transport::{StdioTransport, Transport},
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("mcp-remote: {e}");
            1
        }
    });
}

async fn run(cli: Cli) -> mcp_remote::Result<()> {
    let config = cli.into_config()?;
    logging::init(config.debug, driver::debug_log_path(&config)?)?;

    let Session {
        remote,
        coordination,
    } = driver::establish(&config).await?;

    let local = Box::new(StdioTransport::new()).framed()?;
    let filter = ToolFilter::new(&config.ignore_tools);

    // End-of-stdin closes the proxy loop; SIGINT lands here so the lockfile
    // and callback server are torn down before a clean exit.
    let result = tokio::select! {
        result = proxy::run(local, remote, filter) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
            Ok(())
        }
    };

    coordination.cleanup();
    result
}
