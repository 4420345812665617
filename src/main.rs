use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use argh::FromArgs;

use orphan_scan::client::ClientAdapter;
use orphan_scan::config::Defaults;
use orphan_scan::model::{RunStatus, Trigger};
use orphan_scan::notifier::LoggingNotifier;
use orphan_scan::orchestrator::Orchestrator;
use orphan_scan::store::{SqliteStore, Store};

/// Drive a single orphan-scan run for one torrent-client instance to a
/// terminal state, independent of any HTTP/scheduling layer. Intended for
/// cron or manual operational use.
#[derive(FromArgs, Debug)]
struct Args {
    /// path to the SQLite database (created if missing)
    #[argh(option, short = 'd')]
    db_path: PathBuf,

    /// instance identifier to scan
    #[argh(option, short = 'i')]
    instance: String,

    /// confirm deletion of a previously previewed run instead of scanning
    #[argh(option, short = 'c')]
    confirm_run: Option<String>,

    /// run against the in-memory demo fixture instead of a real client
    /// (requires the `test-fixtures` feature)
    #[argh(switch)]
    demo: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&args.db_path)?);
    let notifier = Arc::new(LoggingNotifier);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), notifier));
    orchestrator
        .recover_from_restart()
        .context("failed to reconcile run state on startup")?;

    ensure!(
        args.demo,
        "only demo mode is wired into this binary; a real client adapter is an external integration"
    );

    let client = demo_client()?;
    let defaults = Defaults::from_env();
    let settings = match store.get_settings(&args.instance) {
        Ok(s) => s,
        Err(_) => defaults.seed_settings(),
    };

    if let Some(run_id) = args.confirm_run {
        let run = orchestrator
            .confirm_delete(&run_id, &args.instance, client, Vec::new(), &settings)
            .await?;
        log::info!("run {} finished with status {}", run.id, run.status);
        return Ok(());
    }

    let run = orchestrator
        .run_scan(&args.instance, client, Vec::new(), Trigger::Manual, &settings)
        .await?;

    match run.status {
        RunStatus::Completed => log::info!("scan complete, no action needed"),
        RunStatus::PreviewReady => log::info!(
            "run {} ready for review: {} candidate(s) found; re-run with --confirm-run {} to delete",
            run.id,
            run.files_found,
            run.id,
        ),
        RunStatus::Failed => log::error!(
            "run {} failed: {}",
            run.id,
            run.error_message.as_deref().unwrap_or("unknown error")
        ),
        other => log::warn!("run {} ended in unexpected status {other}", run.id),
    }

    Ok(())
}

#[cfg(feature = "test-fixtures")]
fn demo_client() -> Result<Arc<dyn ClientAdapter>> {
    Ok(Arc::new(orphan_scan::client::fixture::FixtureClient::new()))
}

#[cfg(not(feature = "test-fixtures"))]
fn demo_client() -> Result<Arc<dyn ClientAdapter>> {
    anyhow::bail!("demo mode requires building with `--features test-fixtures`")
}
