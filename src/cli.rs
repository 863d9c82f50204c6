use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ai::ModelClient;
use crate::capture::{CaptureCoordinator, XcapGrabber};
use crate::config::{default_data_dir, AppConfig};
use crate::events::{EventSink, LogSink, PipelineEvent};
use crate::history::{HistoryEntry, HistoryStore};
use crate::pipeline::Pipeline;
use crate::state::{CaptureRegion, PipelineState};

#[derive(Debug, Parser)]
#[command(name = "screenwatch", version, about = "Watch a screen region with a local vision model")]
pub struct Cli {
    /// Where config.json, history.db and screenshots live.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture and analyze periodically until Ctrl-C.
    Watch(WatchArgs),
    /// Capture and analyze once.
    Analyze(CaptureArgs),
    /// Browse or export stored analyses.
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    /// x,y,width,height in screen coordinates. Full screen when omitted.
    #[arg(long, value_parser = CaptureRegion::parse)]
    pub region: Option<CaptureRegion>,

    /// Instruction sent with every image.
    #[arg(long)]
    pub prompt: Option<String>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub capture: CaptureArgs,

    /// Condition that raises an alert when the model says it is met.
    #[arg(long)]
    pub alert: Option<String>,

    /// Do not hide the overlay while capturing.
    #[arg(long)]
    pub no_hide: bool,

    /// Write this run's results as text on exit.
    #[arg(long)]
    pub save_results: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    Search {
        query: String,
    },
    /// Show one entry by id or exact timestamp.
    Show {
        key: String,
    },
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

pub fn execute(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let config = AppConfig::load(&data_dir);
    let db_path = data_dir.join("history.db");
    let history = HistoryStore::new(&db_path)
        .with_context(|| format!("Failed to open history database {}", db_path.display()))?;

    match cli.command {
        Command::Watch(args) => watch(&data_dir, config, history, args),
        Command::Analyze(args) => analyze_once(&data_dir, config, history, args),
        Command::History { action } => history_command(&history, action),
    }
}

fn watch(data_dir: &Path, config: AppConfig, history: HistoryStore, args: WatchArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("screenwatch-worker")
        .build()
        .context("Failed to build tokio runtime")?;

    let state = Arc::new(PipelineState::new(
        args.capture.prompt.unwrap_or(config.system_prompt),
    ));
    state.set_region(args.capture.region);
    state.set_hide_during_capture(config.capture.hide_overlay_during_capture && !args.no_hide);
    if let Some(alert) = &args.alert {
        state.set_alert(alert.as_str());
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events: Arc<dyn EventSink> = Arc::new(event_tx);

    let coordinator = CaptureCoordinator::new(
        Arc::clone(&state),
        Box::new(XcapGrabber),
        Arc::clone(&events),
        config.capture.screenshot_path(data_dir),
        config.capture.max_pixels,
    );
    let client = Arc::new(
        ModelClient::new(config.inference.clone()).context("Failed to set up inference client")?,
    );

    let (mut pipeline, host) = runtime.block_on(async {
        Pipeline::start(
            state,
            client,
            Arc::new(history),
            events,
            coordinator,
            config.scheduler.clone(),
        )
    });

    runtime.spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let save_path = args.save_results;
    runtime.spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
        log::info!("Shutting down");
        shutdown(&mut pipeline, save_path.as_deref()).await;
        let _ = done_tx.send(());
    });

    log::info!(
        "Watching. Sending captures to {}. Press Ctrl-C to stop.",
        config.inference.url
    );
    // This thread owns the display: captures run here.
    host.run_blocking();

    runtime.block_on(async {
        let _ = done_rx.await;
    });
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    Ok(())
}

/// Joins the scheduler before saving, so the saved file holds every cycle
/// that reached history.
async fn shutdown(pipeline: &mut Pipeline, save_path: Option<&Path>) {
    if let Err(e) = pipeline.stop().await {
        log::error!("{:#}", e);
    }
    if let Some(path) = save_path {
        pipeline.save_results(path);
    }
}

fn analyze_once(
    data_dir: &Path,
    config: AppConfig,
    history: HistoryStore,
    args: CaptureArgs,
) -> Result<()> {
    let prompt = args.prompt.unwrap_or(config.system_prompt);
    let state = Arc::new(PipelineState::new(prompt.clone()));
    state.set_region(args.region);
    state.set_hide_during_capture(false);

    let coordinator = CaptureCoordinator::new(
        state,
        Box::new(XcapGrabber),
        Arc::new(LogSink),
        config.capture.screenshot_path(data_dir),
        config.capture.max_pixels,
    );
    let Some(captured) = coordinator.capture().into_valid() else {
        bail!("No valid screenshot was captured");
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let client = ModelClient::new(config.inference).context("Failed to set up inference client")?;
    let text = runtime.block_on(client.analyze(Some(&captured.image), &prompt));

    println!("{}", text);
    history
        .add(&text, &prompt)
        .context("Failed to save analysis")?;
    Ok(())
}

fn history_command(history: &HistoryStore, action: HistoryCommand) -> Result<()> {
    match action {
        HistoryCommand::List { limit } => {
            for entry in history.list(limit)? {
                print_entry_line(&entry);
            }
        }
        HistoryCommand::Search { query } => {
            for entry in history.search(&query)? {
                print_entry_line(&entry);
            }
        }
        HistoryCommand::Show { key } => {
            let entry = match key.parse::<i64>() {
                Ok(id) => history.get(id)?,
                Err(_) => history.get_by_timestamp(&key)?,
            };
            let Some(entry) = entry else {
                bail!("No history entry for '{}'", key);
            };
            println!("Id:        {}", entry.id);
            println!("Timestamp: {}", entry.timestamp);
            println!("Prompt:    {}", entry.prompt);
            println!();
            println!("{}", entry.analysis_text);
        }
        HistoryCommand::Export { format, path } => {
            let n = match format {
                ExportFormat::Json => history.export_json(&path)?,
                ExportFormat::Csv => history.export_csv(&path)?,
            };
            println!("Exported {} entries to {}", n, path.display());
        }
    }
    Ok(())
}

fn print_entry_line(entry: &HistoryEntry) {
    let first_line = entry.analysis_text.lines().next().unwrap_or("");
    let preview: String = first_line.chars().take(80).collect();
    println!("{:>6}  {}  {}", entry.id, entry.timestamp, preview);
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::AnalysisComplete { text } => println!("{}", text),
        PipelineEvent::AlertTriggered {
            condition,
            analysis,
        } => {
            println!("*** Alert Condition Met! ***");
            println!("The condition '{}' was detected.", condition);
            println!("{}", analysis);
        }
        PipelineEvent::Error { message } => eprintln!("An error occurred: {}", message),
        PipelineEvent::Status { message } => println!("{}", message),
        PipelineEvent::CaptureCompleted { valid } => {
            log::debug!("Capture completed (valid: {})", valid)
        }
    }
}
