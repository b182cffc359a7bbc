//! Dieah Recall Resync
//!
//! Rebuilds the vector index from the relational store.

use std::process::ExitCode;

use clap::Parser;

use dieah_recall::{config::ResyncScope, logging, Config, MemoryStore, ResyncPipeline};

#[derive(Parser)]
#[command(name = "dieah-recall-resync")]
#[command(version)]
#[command(about = "Rebuild the vector index from the relational store")]
struct Cli {
    /// Report what would be synced without embedding or writing anything
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Sync only these users (repeatable); overrides DIEAH_RESYNC_USERS
    #[arg(short, long = "user")]
    users: Vec<String>,

    /// Print statistics as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::from_env();
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logging::init(level, config.log_json);

    let store = MemoryStore::open(config)?;
    let mut pipeline = ResyncPipeline::from_store(&store);
    if !cli.users.is_empty() {
        pipeline = pipeline.with_scope(ResyncScope::from_list(&cli.users.join(",")));
    }

    let stats = pipeline.run(cli.dry_run).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        let prefix = if stats.dry_run { "[DRY RUN] " } else { "" };
        println!("{}Total memories:    {}", prefix, stats.total);
        println!("{}Candidates:        {}", prefix, stats.candidates);
        println!("{}Memories synced:   {}", prefix, stats.synced);
        println!("{}Users cleared:     {}", prefix, stats.users_cleared);
        println!("{}Errors:            {}", prefix, stats.errors);
        println!("{}Purge failures:    {}", prefix, stats.purge_errors);
        for (user, count) in &stats.user_errors {
            println!("  {}: {} failed", user, count);
        }
    }

    Ok(if stats.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
