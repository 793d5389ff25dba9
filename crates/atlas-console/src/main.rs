//! CodeAtlas stdio console server.
//!
//! Serves the tiered live-data tools over newline-delimited stdio.
//! Exit codes: 0 success, 1 usage error, 2 config error, 3 runtime
//! failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;

use atlas_console::{
    build_console_server, AuditLogger, BridgeAdapter, Confirmation, ConfirmationMode,
    ConsoleState, Dialect, EmbeddedAdapter, LiveAdapter, ModelRegistry, SafeContext, SqlValidator,
};
use atlas_core::store::files::FileUnitStore;
use atlas_core::store::memory::{InMemoryGraphStore, InMemoryMetadataStore};
use atlas_server::{init_tracing, load_config_or_exit};

/// CodeAtlas console server
#[derive(Parser, Debug)]
#[command(name = "codeatlas-console", version, about)]
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

    /// Application database to query (embedded mode).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Bridge command to spawn instead of the embedded adapter.
    #[arg(long)]
    bridge: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config_or_exit(args.index_dir.as_deref(), args.config.as_deref());
    init_tracing(&config.logging.level, args.log_format == "json");

    tracing::info!(index_dir = %config.index_dir.display(), "console server starting");

    // The registry comes from the extracted metadata on disk.
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let files = FileUnitStore::new(&config.index_dir);
    if let Err(e) = files.seed(metadata.as_ref(), graph.as_ref()) {
        tracing::error!(error = %e, "failed to seed stores from unit files");
        std::process::exit(3);
    }
    let registry = match ModelRegistry::from_metadata(metadata.as_ref()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "failed to build model registry");
            std::process::exit(3);
        }
    };

    let adapter: Arc<dyn LiveAdapter> = if let Some(bridge) = args.bridge.as_deref() {
        match BridgeAdapter::spawn(bridge, &[]) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn bridge adapter");
                std::process::exit(3);
            }
        }
    } else {
        let db_path = args
            .database
            .clone()
            .or_else(|| config.console.database_path.clone());
        let conn = match db_path {
            Some(path) => rusqlite::Connection::open(&path),
            None => rusqlite::Connection::open_in_memory(),
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "failed to open application database");
                std::process::exit(3);
            }
        };
        let safe = SafeContext::new(
            Arc::new(Mutex::new(conn)),
            Dialect::Sqlite,
            config.console.statement_timeout_ms,
        );
        Arc::new(EmbeddedAdapter::new(safe, registry.clone()))
    };

    let Some(mode) = ConfirmationMode::parse(&config.console.confirmation) else {
        eprintln!(
            "configuration error: unknown confirmation mode: {}",
            config.console.confirmation
        );
        std::process::exit(2);
    };

    let state = Arc::new(ConsoleState {
        adapter,
        registry,
        confirmation: Arc::new(Confirmation::new(mode)),
        audit: Arc::new(AuditLogger::new(config.audit_log_path())),
        sql_validator: Arc::new(SqlValidator::new()),
        redacted_columns: config.console.redacted_columns.clone(),
    });

    let server = Arc::new(build_console_server(&state));
    if let Err(e) = atlas_server::stdio::serve(server).await {
        tracing::error!(error = %e, "stdio transport failed");
        std::process::exit(3);
    }
}
