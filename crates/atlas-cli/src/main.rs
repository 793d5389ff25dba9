//! CodeAtlas CLI.
//!
//! Offline pipeline commands: refresh manifests from extracted unit
//! files, run schema migrations, force a full re-embed, and print a
//! pipeline diagnosis.
//!
//! Exit codes: 0 success, 1 usage error, 2 config error, 3 runtime
//! failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use atlas_core::indexer::IncrementalIndexer;
use atlas_core::manifest::{ChangeManifest, IndexManifest, Invalidator};
use atlas_core::store::sqlite::SqliteStore;
use atlas_core::Config;
use atlas_server::{init_tracing, ServerState};

/// CodeAtlas -- code-intelligence retrieval for server-side applications
#[derive(Parser, Debug)]
#[command(name = "codeatlas", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Index directory.
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, default_value = "text", value_parser = ["json", "text"])]
    log_format: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the index and change manifests from the unit files.
    Extract {
        /// Git commit the snapshot was taken at.
        #[arg(long, default_value = "unknown")]
        git_sha: String,

        /// Git branch the snapshot was taken on.
        #[arg(long, default_value = "unknown")]
        git_branch: String,
    },

    /// Apply pending schema migrations to the embedded database.
    Migrate,

    /// Force a full re-embed of every stored unit.
    Reindex,

    /// Print a pipeline health diagnosis.
    Diagnose,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are success; anything else is a
            // usage error.
            if e.use_stderr() {
                let _ = e.print();
                std::process::exit(1);
            }
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let config = match Config::load(cli.index_dir.as_deref(), cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&config.logging.level, cli.log_format == "json");

    let outcome = match cli.command {
        Commands::Extract { git_sha, git_branch } => run_extract(&config, &git_sha, &git_branch),
        Commands::Migrate => run_migrate(&config),
        Commands::Reindex => run_reindex(&config),
        Commands::Diagnose => run_diagnose(&config),
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(3);
    }
}

fn run_extract(config: &Config, git_sha: &str, git_branch: &str) -> anyhow::Result<()> {
    let files = atlas_core::store::files::FileUnitStore::new(&config.index_dir);
    let units = files.load_units()?;

    let previous = ChangeManifest::load(&config.index_dir)?;
    let change = Invalidator::diff(&units, previous.as_ref(), git_sha);
    change.write(&config.index_dir)?;

    let manifest = IndexManifest::from_units(&units, git_sha, git_branch, "ruby", None);
    manifest.write(&config.index_dir)?;

    let mut dep_graph = atlas_core::graph::DependencyGraph::new();
    for unit in &units {
        dep_graph.register(unit);
    }
    atlas_core::manifest::write_json_atomic(
        &config.index_dir.join(atlas_core::manifest::GRAPH_FILE),
        &dep_graph.to_value(),
    )?;

    println!(
        "extracted {} units: {} added, {} modified, {} deleted, {} unchanged",
        change.summary.total,
        change.summary.added,
        change.summary.modified,
        change.summary.deleted,
        change.summary.unchanged,
    );
    Ok(())
}

fn run_migrate(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.db_path())?;
    let version = store.schema_version()?;
    println!("database at {} is at schema version {version}", config.db_path().display());
    Ok(())
}

fn run_reindex(config: &Config) -> anyhow::Result<()> {
    let state = ServerState::from_config(config)?;
    let indexer = IncrementalIndexer::new(
        state.vector.clone(),
        state.metadata.clone(),
        state.graph.clone(),
        state.embedder.clone(),
    );

    // No manifest: the indexer re-embeds everything.
    let outcome = indexer.run(None)?;
    println!(
        "reindexed: {} embedded, {} deleted, {} skipped",
        outcome.embedded, outcome.deleted, outcome.skipped
    );
    if !outcome.retry.is_empty() {
        println!("retry queue: {}", outcome.retry.join(", "));
    }
    Ok(())
}

fn run_diagnose(config: &Config) -> anyhow::Result<()> {
    let state = ServerState::from_config(config)?;
    let status = state.status.report();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
