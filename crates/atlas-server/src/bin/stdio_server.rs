//! CodeAtlas stdio tool server.
//!
//! Reads newline-delimited request frames from stdin and writes
//! response frames to stdout. Exit codes: 0 success, 1 usage error,
//! 2 config error, 3 runtime failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use atlas_server::{build_server, init_tracing, load_config_or_exit, ServerState};

/// CodeAtlas stdio tool server
#[derive(Parser, Debug)]
#[command(name = "codeatlas-server", version, about)]
struct Args {
    /// Path to the config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Index directory.
    #[arg(long)]
    index_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, default_value = "text", value_parser = ["json", "text"])]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config_or_exit(args.index_dir.as_deref(), args.config.as_deref());
    init_tracing(&config.logging.level, args.log_format == "json");

    tracing::info!(index_dir = %config.index_dir.display(), "stdio tool server starting");

    let state = match ServerState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to build server state");
            std::process::exit(3);
        }
    };

    let server = Arc::new(build_server(&state));
    if let Err(e) = atlas_server::stdio::serve(server).await {
        tracing::error!(error = %e, "stdio transport failed");
        std::process::exit(3);
    }
}
