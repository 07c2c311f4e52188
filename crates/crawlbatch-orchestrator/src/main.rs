use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crawlbatch_core::{LockManager, RunKey};
use crawlbatch_orchestrator::{
    config::Settings,
    dispatch::Dispatcher,
    finalize::StatsFinalizer,
    parse_url_list,
    store::{CrawlStore, SqliteStore},
    tasks::WptTaskOperations,
    tick::{Orchestrator, TickOutcome},
    wpt::WptClient,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "crawlbatch", about = "Advances a multi-pass WebPagetest crawl one tick at a time")]
struct Cli {
    #[arg(long, default_value = "./crawlbatch.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one tick; the default when no command is given.
    Tick,
    /// Create a crawl and enqueue every URL in the list file.
    Start {
        #[arg(long)]
        label: String,
        #[arg(long)]
        urls: PathBuf,
    },
    /// Print item counts per status for the active crawl.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    let store = SqliteStore::open(&settings.paths.db_path)?;

    match cli.command.unwrap_or(Command::Tick) {
        Command::Tick => tick(&settings, store).await,
        Command::Start { label, urls } => start(&settings, &store, label, &urls).await,
        Command::Report => report(&settings, &store).await,
    }
}

async fn tick(settings: &Settings, store: SqliteStore) -> Result<()> {
    let client = WptClient::new(&settings.wpt, &settings.crawl.location)?;
    let ops = WptTaskOperations::new(store.clone(), Arc::new(client), settings.wpt.batch_size);
    let dispatcher = Dispatcher::new(
        LockManager::new(&settings.paths.lock_dir),
        Arc::new(ops),
        settings.crawl.parse_shards,
    );
    let finalizer = StatsFinalizer::new(store.clone(), &settings.paths.dump_dir);
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        dispatcher,
        Arc::new(finalizer),
        settings.crawl.clone(),
        settings.tick.poll_interval(),
    );

    match orchestrator.tick().await? {
        TickOutcome::Finalized { passes, aggregate } => {
            info!(passes, pages = aggregate.num_pages, "crawl finalized");
        }
        TickOutcome::Dispatched { failed, .. } if !failed.is_empty() => {
            let failed: Vec<String> = failed.iter().map(ToString::to_string).collect();
            info!(failed = %failed.join(","), "tick finished with failed tasks");
        }
        _ => {}
    }
    Ok(())
}

async fn start(
    settings: &Settings,
    store: &SqliteStore,
    label: String,
    list: &Path,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(list)
        .await
        .with_context(|| format!("failed to read url list {}", list.display()))?;
    let urls = parse_url_list(&raw);
    if urls.is_empty() {
        bail!("url list {} has no urls", list.display());
    }

    let run = RunKey::new(label, &settings.crawl.archive, &settings.crawl.location);
    store.create_run(&run).await.with_context(|| format!("failed to create crawl {run}"))?;
    let queued = store.enqueue_urls(&run, &urls).await?;
    println!("{run}: queued {queued} urls");
    Ok(())
}

async fn report(settings: &Settings, store: &SqliteStore) -> Result<()> {
    let crawl = &settings.crawl;
    let Some(label) = store.active_run_label(&crawl.archive, &crawl.location).await? else {
        println!("no active crawl for {}/{}", crawl.archive, crawl.location);
        return Ok(());
    };
    let run = RunKey::new(label, &crawl.archive, &crawl.location);
    let passes = store.current_pass(&run).await?;
    let summary = store.status_summary(&run).await?;
    println!("{run} pass {passes}/{}: {summary}", crawl.max_passes);
    Ok(())
}
