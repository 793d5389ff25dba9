//! CodeAtlas HTTP tool server.
//!
//! Serves the same request/response frames as the stdio server over
//! HTTP POST `/rpc`. Exit codes: 0 success, 1 usage error, 2 config
//! error, 3 runtime failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use atlas_server::{build_server, init_tracing, load_config_or_exit, ServerState};

/// CodeAtlas HTTP tool server
#[derive(Parser, Debug)]
#[command(name = "codeatlas-server-http", version, about)]
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

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1:3344")]
    addr: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config_or_exit(args.index_dir.as_deref(), args.config.as_deref());
    init_tracing(&config.logging.level, args.log_format == "json");

    tracing::info!(
        index_dir = %config.index_dir.display(),
        addr = %args.addr,
        "http tool server starting"
    );

    let state = match ServerState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to build server state");
            std::process::exit(3);
        }
    };

    let server = Arc::new(build_server(&state));
    if let Err(e) = atlas_server::http::serve(server, &args.addr).await {
        tracing::error!(error = %e, "http transport failed");
        std::process::exit(3);
    }
}
