//! Command-line interface for sbomer.
//!
//! Provides commands for submitting generation requests, inspecting their
//! status and events, retrying failed requests, and running the controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::adapters::{HttpJobRunner, JobRunner, MemoryJobRunner, ProcessJobRunner, WebhookChannel};
use crate::config::{self, ResolvedConfig, RunnerKind};
use crate::core::{
    Controller, FileStore, PipelineOrchestrator, ReconcileOutcome, Reconciler, RequestStore,
};
use crate::notify::{
    EventPublisher, FanoutChannel, IndexWorker, LocalChannel, NotificationChannel,
    PublisherHandle, WorkerDispatcher, DEFAULT_CAPACITY,
};

/// sbomer - SBOM generation request reconciler
#[derive(Parser, Debug)]
#[command(name = "sbomer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a generation request for a build
    Submit {
        /// External build identifier
        build_id: String,

        /// Metadata entries (key=value), e.g. --meta worker=index
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Show the status of a request
    Status {
        /// Request ID (UUID)
        request_id: String,
    },

    /// List requests
    List {
        /// Maximum number of requests to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the events of a request
    Events {
        /// Request ID (UUID)
        request_id: String,
    },

    /// Retry a failed request
    Retry {
        /// Request ID (UUID)
        request_id: String,
    },

    /// Run a single reconciliation pass for a request
    Reconcile {
        /// Request ID (UUID)
        request_id: String,
    },

    /// Run the controller until interrupted
    Run,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { build_id, meta } => submit(&build_id, meta).await,
            Commands::Status { request_id } => show_status(&request_id).await,
            Commands::List { limit } => list_requests(limit).await,
            Commands::Events { request_id } => show_events(&request_id).await,
            Commands::Retry { request_id } => retry(&request_id).await,
            Commands::Reconcile { request_id } => reconcile_once(&request_id).await,
            Commands::Run => run_controller().await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn parse_request_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid request ID: {}", s))
}

/// Job runner selected by configuration
fn build_runner(cfg: &ResolvedConfig) -> Result<Arc<dyn JobRunner>> {
    let runner: Arc<dyn JobRunner> = match cfg.runner.kind {
        RunnerKind::Memory => Arc::new(MemoryJobRunner::new()),
        RunnerKind::Process => {
            if cfg.runner.init_command.is_empty() || cfg.runner.generate_command.is_empty() {
                bail!("Process runner needs runner.init_command and runner.generate_command");
            }
            Arc::new(ProcessJobRunner::new(
                cfg.runner.init_command.clone(),
                cfg.runner.generate_command.clone(),
            ))
        }
        RunnerKind::Http => {
            let base_url = cfg
                .runner
                .base_url
                .as_deref()
                .context("HTTP runner needs runner.base_url or SBOMER_RUNNER_URL")?;
            Arc::new(
                HttpJobRunner::new(base_url, cfg.runner.request_timeout())
                    .context("Failed to build HTTP runner client")?,
            )
        }
    };
    Ok(runner)
}

/// Store, reconciler and the publishing side, wired from configuration
struct Runtime {
    store: Arc<dyn RequestStore>,
    reconciler: Arc<Reconciler>,
    publisher: PublisherHandle,
    publisher_stop: watch::Sender<bool>,
    publisher_task: JoinHandle<()>,
    dispatcher_stop: watch::Sender<bool>,
    dispatcher_task: JoinHandle<()>,
}

impl Runtime {
    async fn start(cfg: &ResolvedConfig) -> Result<Self> {
        let store: Arc<dyn RequestStore> = Arc::new(
            FileStore::open(cfg.store_dir())
                .await
                .context("Failed to open request store")?,
        );

        let (local, events) = LocalChannel::new(DEFAULT_CAPACITY);
        let mut fanout = FanoutChannel::new().with(Arc::new(local));
        if let Some(url) = &cfg.notification.webhook_url {
            let webhook = WebhookChannel::new(url.clone(), cfg.runner.request_timeout())
                .context("Failed to build webhook client")?;
            fanout = fanout.with(Arc::new(webhook));
        }
        let channel: Arc<dyn NotificationChannel> = Arc::new(fanout);

        let (dispatcher_stop, dispatcher_rx) = watch::channel(false);
        let dispatcher_task = WorkerDispatcher::new()
            .with_worker(Arc::new(IndexWorker::in_home(&cfg.home)))
            .spawn(events, dispatcher_rx);

        let (publisher_stop, publisher_rx) = watch::channel(false);
        let (publisher, publisher_task) = EventPublisher::new(store.clone(), channel)
            .with_retry_policy(cfg.notification.retry.clone())
            .with_redelivery_interval(cfg.notification.redelivery_interval())
            .spawn(publisher_rx);

        let orchestrator =
            PipelineOrchestrator::new(build_runner(cfg)?, store.clone(), cfg.runner.orchestrator());
        let reconciler =
            Arc::new(Reconciler::new(store.clone(), orchestrator).with_publisher(publisher.clone()));

        Ok(Self {
            store,
            reconciler,
            publisher,
            publisher_stop,
            publisher_task,
            dispatcher_stop,
            dispatcher_task,
        })
    }

    /// Drain the publisher, then the dispatcher
    async fn stop(self) -> Result<()> {
        self.publisher.flush().await;
        let _ = self.publisher_stop.send(true);
        self.publisher_task.await.context("Publisher task panicked")?;

        let _ = self.dispatcher_stop.send(true);
        self.dispatcher_task.await.context("Dispatcher task panicked")?;
        Ok(())
    }
}

async fn open_store() -> Result<Arc<dyn RequestStore>> {
    Ok(Arc::new(FileStore::open_default().await?))
}

/// Submit a request
async fn submit(build_id: &str, meta: Vec<(String, String)>) -> Result<()> {
    let cfg = config::config()?;
    let runtime = Runtime::start(cfg).await?;

    let metadata: BTreeMap<String, String> = meta.into_iter().collect();
    let request = runtime.reconciler.submit(build_id, metadata).await?;
    runtime.stop().await?;

    println!("Request ID: {}", request.id);
    println!("Build:      {}", request.build_id);
    println!("Status:     {}", request.status);
    Ok(())
}

/// Show the status of a request
async fn show_status(request_id: &str) -> Result<()> {
    let id = parse_request_id(request_id)?;
    let store = open_store().await?;

    let request = store
        .get(id)
        .await?
        .with_context(|| format!("Request not found: {}", id))?;

    println!("Request ID: {}", request.id);
    println!("Build:      {}", request.build_id);
    println!("Status:     {}", request.status);
    if let Some(reason) = &request.reason {
        println!("Reason:     {}", reason);
    }
    println!("Attempt:    {}", request.attempt);
    println!("Created:    {}", request.created_at);
    println!("Updated:    {}", request.updated_at);

    if !request.metadata.is_empty() {
        println!("\nMetadata:");
        for (key, value) in &request.metadata {
            println!("  {}: {}", key, value);
        }
    }

    let generations = store.generations(id).await?;
    if !generations.is_empty() {
        println!("\nGenerations:");
        for generation in generations {
            println!(
                "  {} [{}] {:?}{}",
                generation.job_id,
                generation.phase,
                generation.status,
                generation
                    .reason
                    .map(|r| format!(" - {}", r))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

/// List requests, newest first
async fn list_requests(limit: usize) -> Result<()> {
    let store = open_store().await?;
    let requests = store.list().await?;

    if requests.is_empty() {
        println!("No requests found");
        return Ok(());
    }

    println!("{:<38} {:<30} {:<14}", "REQUEST ID", "BUILD", "STATUS");
    println!("{}", "-".repeat(82));

    for request in requests.iter().rev().take(limit) {
        println!(
            "{:<38} {:<30} {:<14}",
            request.id, request.build_id, request.status
        );
    }

    Ok(())
}

/// Show the event chain of a request
async fn show_events(request_id: &str) -> Result<()> {
    let id = parse_request_id(request_id)?;
    let store = open_store().await?;
    let events = store.events(id).await?;

    if events.is_empty() {
        println!("No events found");
        return Ok(());
    }

    for event in events {
        println!(
            "{} {:<14} {} (parent: {})",
            event.created.format("%Y-%m-%d %H:%M:%S"),
            event.status.to_string(),
            event.reason,
            event
                .parent
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    Ok(())
}

/// Retry a failed request
async fn retry(request_id: &str) -> Result<()> {
    let id = parse_request_id(request_id)?;
    let cfg = config::config()?;
    let runtime = Runtime::start(cfg).await?;

    let result = runtime.reconciler.retry(id).await;
    runtime.stop().await?;
    let request = result?;

    println!("Request {} reset to {} (attempt {})", request.id, request.status, request.attempt);
    Ok(())
}

/// Run one reconciliation pass, then drain the publisher
async fn reconcile_once(request_id: &str) -> Result<()> {
    let id = parse_request_id(request_id)?;
    let cfg = config::config()?;
    let runtime = Runtime::start(cfg).await?;

    let result = runtime.reconciler.reconcile(id).await;
    runtime.stop().await?;

    match result? {
        ReconcileOutcome::Missing => bail!("Request not found: {}", id),
        ReconcileOutcome::Skipped { condition } => {
            println!("Skipped: condition '{}' not met", condition)
        }
        ReconcileOutcome::Unchanged { status } => println!("No change ({})", status),
        ReconcileOutcome::Transitioned { from, to, event_id } => {
            println!("{} -> {} (event {})", from, to, event_id)
        }
        ReconcileOutcome::Abandoned => println!("Request changed concurrently, pass abandoned"),
    }

    Ok(())
}

/// Run controller, publisher and dispatcher until Ctrl-C
async fn run_controller() -> Result<()> {
    let cfg = config::config()?;
    let runtime = Runtime::start(cfg).await?;

    let controller = Arc::new(Controller::new(runtime.reconciler.clone(), cfg.controller()));
    let (controller_stop, controller_rx) = watch::channel(false);
    let controller_task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run(controller_rx).await })
    };

    info!(
        store = %cfg.store_dir().display(),
        runner = ?cfg.runner.kind,
        "sbomer running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    let _ = controller_stop.send(true);
    controller_task.await.context("Controller task panicked")?;
    drop(controller);

    let pending = runtime.store.undelivered_events().await?.len();
    runtime.stop().await?;
    if pending > 0 {
        info!(pending, "Undelivered events will be retried on next start");
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("sbomer configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Store: {}", cfg.store_dir().display());
    println!("  Index: {}", cfg.home.join("index.jsonl").display());
    println!();
    println!("Runner:");
    println!("  Kind:             {:?}", cfg.runner.kind);
    if let Some(url) = &cfg.runner.base_url {
        println!("  Base URL:         {}", url);
    }
    if !cfg.runner.init_command.is_empty() {
        println!("  Init command:     {}", cfg.runner.init_command.join(" "));
    }
    if !cfg.runner.generate_command.is_empty() {
        println!("  Generate command: {}", cfg.runner.generate_command.join(" "));
    }
    println!("  Request timeout:  {}s", cfg.runner.request_timeout_seconds);
    println!("  Visibility grace: {}s", cfg.runner.visibility_grace_seconds);
    println!();
    println!("Notification:");
    println!(
        "  Webhook:      {}",
        cfg.notification.webhook_url.as_deref().unwrap_or("(none)")
    );
    println!("  Max attempts: {}", cfg.notification.retry.max_attempts);
    println!("  Redelivery:   {}s", cfg.notification.redelivery_interval_seconds);
    println!();
    println!("Controller:");
    println!("  Workers: {}", cfg.workers);
    println!("  Resync:  {}s", cfg.resync_interval_seconds);

    Ok(())
}
