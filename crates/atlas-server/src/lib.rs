//! # atlas-server
//!
//! Tool server for CodeAtlas. A generic registry-dispatched server
//! (`server`) frames requests and responses (`protocol`), carried over
//! a line-delimited stdio transport (`stdio`) or HTTP POST (`http`).
//! The read-side, pipeline, and feedback tool set registers against a
//! shared engine state (`tools`).

pub mod http;
pub mod protocol;
pub mod server;
pub mod stdio;
pub mod tools;

pub use protocol::{ToolRequest, ToolResponse};
pub use server::{Handler, ParamKind, ParamSpec, ToolServer, ToolSpec};
pub use tools::{build_server, ServerState};

use std::path::Path;

/// Initialize tracing for a server binary.
///
/// `log_format` is `json` or `text`; anything else is a usage error
/// handled by the caller.
pub fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Load configuration for a server binary, mapping failures to the
/// documented exit code (2 = config error).
pub fn load_config_or_exit(
    index_dir: Option<&Path>,
    config_path: Option<&Path>,
) -> atlas_core::Config {
    match atlas_core::Config::load(index_dir, config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    }
}
