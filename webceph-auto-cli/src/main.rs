use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};
use webceph_auto::config::default_config_path;
use webceph_auto::sync::backup_file_path;
use webceph_auto::{
    create_window_system, AirtableStore, AppConfig, AutomationError, Locator, OfflineQueue,
    PipelineEvent, RunControl, StageSnapshot, SyncService, SystemClock, WebDriverSurface,
    WindowAcquirer, WorkflowDriver, WorkflowState,
};

mod utils;

#[derive(Parser)]
#[command(name = "webceph-auto")]
#[command(about = "Move a patient from the DentWeb chart into WebCeph and fetch the report")]
struct Cli {
    /// Configuration file (defaults to <config_dir>/WebCephAuto/config.json)
    #[clap(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Patient record as JSON (name, birth_date, chart_no, optional gender/phone/email)
    patient: PathBuf,

    /// Lateral cephalometric x-ray image
    #[clap(long)]
    xray: Vec<PathBuf>,

    /// Face photo
    #[clap(long)]
    face: Vec<PathBuf>,

    /// WebDriver endpoint driving the browser
    #[clap(long, env = "WEBDRIVER_URL", default_value = "http://localhost:9515")]
    webdriver: String,

    /// Run just this stage, regardless of the stages before it
    #[clap(long, conflicts_with = "from")]
    only: Option<String>,

    /// Start at this stage and continue to the end
    #[clap(long)]
    from: Option<String>,

    /// Bring the DentWeb chart window forward before starting
    #[clap(long)]
    activate_source: bool,

    /// Leave the browser session open when the run ends
    #[clap(long)]
    keep_browser: bool,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show operations waiting for the data store
    Status,
    /// Send every pending operation once
    Replay,
    /// Discard every pending operation
    Clear,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow for one patient
    Run(RunArgs),
    /// Find and activate the DentWeb chart window, print its capture region
    LocateWindow,
    /// Offline queue commands
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Check the data store credentials
    TestConnection,
    /// List rows in the data store
    Records {
        /// Airtable formula, e.g. "{status} = 'FAILED'"
        #[clap(long)]
        filter: Option<String>,
        #[clap(long, default_value_t = 100)]
        max: usize,
    },
    /// Session counts for one day
    Stats {
        /// Day to report (YYYY-MM-DD), today when omitted
        #[clap(long)]
        date: Option<NaiveDate>,
    },
    /// Save every data store row to a JSON file
    Backup {
        /// Output file (defaults to a timestamped file in the backup folder)
        #[clap(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = utils::init_logging()?;

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = AppConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Run(args) => run_workflow(config, args).await,
        Commands::LocateWindow => blocking(move || locate_window(&config)).await,
        Commands::Queue(QueueCommands::Status) => queue_status(&config),
        Commands::Queue(QueueCommands::Replay) => blocking(move || replay_queue(&config)).await,
        Commands::Queue(QueueCommands::Clear) => {
            let removed = OfflineQueue::new(config.queue_path()).clear()?;
            println!("Removed {removed} pending operation(s)");
            Ok(())
        }
        Commands::TestConnection => blocking(move || test_connection(&config)).await,
        Commands::Records { filter, max } => {
            blocking(move || list_records(&config, filter.as_deref(), max)).await
        }
        Commands::Stats { date } => blocking(move || show_statistics(&config, date)).await,
        Commands::Backup { output } => blocking(move || backup(&config, output)).await,
    }
}

/// The engine's HTTP clients are blocking; keep them off the async workers.
async fn blocking<F>(job: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .context("worker thread panicked")?
}

fn data_store(config: &AppConfig) -> Result<AirtableStore> {
    Ok(
        AirtableStore::new(config.data_store.clone(), config.request_timeout())?
            .with_retry(config.http_retry()),
    )
}

fn sync_service(config: &AppConfig) -> Result<Option<SyncService>> {
    if !config.data_store.is_configured() {
        warn!("Data store not configured, results stay local");
        return Ok(None);
    }
    let store = data_store(config)?;
    let queue = OfflineQueue::new(config.queue_path());
    Ok(Some(SyncService::new(Arc::new(store), Arc::new(queue))))
}

struct RunOutcome {
    stages: Vec<StageSnapshot>,
    state: WorkflowState,
    result: Result<(), AutomationError>,
}

async fn run_workflow(config: AppConfig, args: RunArgs) -> Result<()> {
    let patient = utils::load_patient(&args.patient)?;
    let images = utils::collect_images(&args.xray, &args.face)?;
    info!(
        "Starting run for {} ({}) with {} image(s)",
        patient.name,
        patient.chart_no,
        images.len()
    );

    let control = RunControl::new();
    let on_interrupt = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next checkpoint");
            on_interrupt.cancel();
        }
    });

    let (ready_tx, ready_rx) = oneshot::channel();
    let worker = tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
        std::fs::create_dir_all(&config.paths.report_folder)?;
        let surface = Arc::new(WebDriverSurface::connect(
            &args.webdriver,
            WebDriverSurface::chrome_capabilities(&config.paths.report_folder),
            config.request_timeout(),
        )?);
        let sync = sync_service(&config)?;
        let driver = WorkflowDriver::new(config, surface.clone(), sync).with_control(control);

        if args.activate_source {
            match create_window_system().and_then(|system| driver.acquire_source_window(system)) {
                Ok(source) => info!(
                    "Source window '{}' active, capture region {}",
                    source.window.title, source.capture_region
                ),
                Err(e) => warn!("Source window not activated: {}", e),
            }
        }

        let mut pipeline = driver.build_pipeline(WorkflowState::new(patient, images))?;
        let _ = ready_tx.send(pipeline.subscribe());

        let result = match (&args.only, &args.from) {
            (Some(stage), _) => pipeline.rerun_stage(stage).map(|_| ()),
            (None, Some(stage)) => pipeline.run_from(stage),
            (None, None) => pipeline.run_all(),
        };
        let stages = pipeline.snapshot();
        let state = pipeline.into_state();

        if !args.keep_browser {
            if let Err(e) = surface.close() {
                warn!("Failed to close browser session: {}", e);
            }
        }
        Ok(RunOutcome {
            stages,
            state,
            result,
        })
    });

    let printer = match ready_rx.await {
        Ok(events) => Some(tokio::spawn(drain_events(events))),
        Err(_) => None,
    };
    let outcome = worker.await.context("pipeline worker panicked")??;
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    utils::print_summary(&outcome.stages);
    if let Some(report) = &outcome.state.report_path {
        println!("\nReport: {}", report.display());
    }
    for sync_error in &outcome.state.sync_errors {
        println!("Not synced: {sync_error}");
    }

    match outcome.result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Run stopped: {}", e);
            Err(e.into())
        }
    }
}

async fn drain_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => utils::print_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display fell behind, {} event(s) skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn locate_window(config: &AppConfig) -> Result<()> {
    let system = create_window_system()?;
    let locator = Locator::new(Arc::new(SystemClock), RunControl::new())
        .set_default_timeout(config.automation.strategy_timeout());
    let acquirer =
        WindowAcquirer::new(system, locator).with_policy(config.source_window.activation);

    let window = acquirer.find_and_activate(&config.source_window.patterns)?;
    println!("Window:   {} ({})", window.title, window.handle);
    println!("Tier:     {}", window.tier);
    println!("Geometry: {}", window.geometry);
    println!("Capture:  {}", window.capture_region(acquirer.screen_size()));
    if window.degraded {
        println!("⚠ Window did not reach a usable size; capture may be incomplete");
    }
    Ok(())
}

fn queue_status(config: &AppConfig) -> Result<()> {
    let queue = OfflineQueue::new(config.queue_path());
    let items = queue.items()?;
    println!("{} pending operation(s) in {}", items.len(), queue.path().display());
    for item in items {
        println!(
            "  {}  {:<14} retries {}/{}  queued {}",
            item.id,
            item.action_type,
            item.retry_count,
            item.max_retries,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
        if let Some(last_error) = &item.last_error {
            println!("      last error: {last_error}");
        }
    }
    Ok(())
}

fn replay_queue(config: &AppConfig) -> Result<()> {
    let Some(sync) = sync_service(config)? else {
        anyhow::bail!("data store is not configured");
    };
    let summary = sync.replay_pending()?;
    println!(
        "Sent {}, dropped {}, {} still pending",
        summary.processed, summary.failed, summary.remaining
    );
    for dropped in summary.errors() {
        println!("  ✖ {dropped}");
    }
    Ok(())
}

fn test_connection(config: &AppConfig) -> Result<()> {
    let store = data_store(config)?;
    store.test_connection()?;
    println!("✅ Data store reachable ({})", config.data_store.table_name);
    match config.credentials() {
        Ok(credentials) => println!("✅ WebCeph account configured ({})", credentials.username),
        Err(e) => println!("⚠ {e}"),
    }
    Ok(())
}

fn list_records(config: &AppConfig, filter: Option<&str>, max: usize) -> Result<()> {
    let records = data_store(config)?.patient_records(filter, max)?;
    println!("{} record(s)", records.len());
    for record in &records {
        let fields = &record["fields"];
        println!(
            "  {}  {:<10} {:<12} {:<12} {}",
            record["id"].as_str().unwrap_or("-"),
            fields["name"].as_str().unwrap_or("-"),
            fields["registration_number"].as_str().unwrap_or("-"),
            fields["session_date"].as_str().unwrap_or("-"),
            fields["status"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

fn show_statistics(config: &AppConfig, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let stats = data_store(config)?.daily_statistics(date)?;
    println!("Sessions on {}", stats.date);
    println!("  total:       {}", stats.total_patients);
    println!("  completed:   {}", stats.completed);
    println!("  in progress: {}", stats.in_progress);
    println!("  failed:      {}", stats.failed);
    println!("  success:     {:.1}%", stats.success_rate());
    Ok(())
}

fn backup(config: &AppConfig, output: Option<PathBuf>) -> Result<()> {
    let path = output
        .unwrap_or_else(|| backup_file_path(&config.paths.backup_folder, Local::now()));
    let summary = data_store(config)?.backup(&path)?;
    println!(
        "✅ {} record(s) saved to {}",
        summary.total_records,
        summary.path.display()
    );
    Ok(())
}
