// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Command-line interface of the exporter.
//!
//! `run` starts the reconciliation daemon and the scrape endpoint, `check`
//! validates a configuration document and `snapshot` computes the metrics of
//! a single repository once.

use std::{
    env, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use git_stats_exporter::{
    ApiFactory, Credential, Error, GitHubApiFactory, MetricsClient, Reconciler, Scheduler,
    aggregate::{FirstSyncPolicy, SyncWindow, aggregate},
    client::FetchOptions,
    config::{Settings, WatchEntry},
    controller::DEFAULT_ANONYMOUS_TIMEOUT,
    exporter::serve,
    load_config,
    publisher::RepoMetrics,
};
use indicatif::{ProgressBar, ProgressStyle};
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface of the repository statistics exporter.
#[derive(Debug, Parser,)]
#[command(name = "git-stats-exporter", version, about = "Export repository statistics as Prometheus metrics")]
struct Cli
{
    /// Tracing filter used when `RUST_LOG` is not set.
    #[arg(long = "log-filter", value_name = "FILTER", default_value = "info", global = true)]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand,)]
enum Command
{
    /// Reconcile the configured repositories and serve their metrics.
    Run(RunArgs,),
    /// Validate a configuration document and print the watch list.
    Check(CheckArgs,),
    /// Fetch one repository once and print its metrics snapshot.
    Snapshot(SnapshotArgs,),
}

#[derive(Debug, Args,)]
struct RunArgs
{
    /// Path to the YAML configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config: PathBuf,

    /// Overrides `settings.listen` of the configuration.
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Option<SocketAddr,>,
}

#[derive(Debug, Args,)]
struct CheckArgs
{
    /// Path to the YAML configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config: PathBuf,

    /// Output formatted JSON for easier inspection.
    #[arg(long = "pretty", action = ArgAction::SetTrue)]
    pretty: bool,
}

#[derive(Debug, Args,)]
struct SnapshotArgs
{
    #[arg(long = "owner", value_name = "OWNER")]
    owner: String,

    #[arg(long = "repo", value_name = "REPO")]
    repo: String,

    /// Environment variable holding an API token; anonymous access otherwise.
    #[arg(long = "token-env", value_name = "VAR")]
    token_env: Option<String,>,

    /// Only report issues closed after this instant (RFC 3339).
    #[arg(long = "since", value_name = "TIMESTAMP")]
    since: Option<DateTime<Utc,>,>,

    /// Base URI of a GitHub Enterprise instance.
    #[arg(long = "api-base", value_name = "URI")]
    api_base: Option<String,>,

    /// Output formatted JSON for easier inspection.
    #[arg(long = "pretty", action = ArgAction::SetTrue)]
    pretty: bool,
}

/// Output of the `check` subcommand.
#[derive(Debug, Serialize,)]
struct CheckReport<'config,>
{
    settings:     &'config Settings,
    repositories: Vec<WatchEntry,>,
}

/// Entry point that reports errors and sets the appropriate exit status.
fn main()
{
    if let Err(error,) = run() {
        eprintln!("{}", error.to_display_string());
        process::exit(1,);
    }
}

fn run() -> Result<(), Error,>
{
    let cli = Cli::parse();
    init_tracing(&cli.log_filter,)?;

    match cli.command {
        Command::Run(args,) => runtime()?.block_on(run_exporter(args,),),
        Command::Check(args,) => run_check(&args.config, args.pretty,),
        Command::Snapshot(args,) => runtime()?.block_on(run_snapshot(args,),),
    }
}

fn init_tracing(default_filter: &str,) -> Result<(), Error,>
{
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter,) => filter,
        Err(_,) => EnvFilter::try_new(default_filter,)
            .map_err(|error| Error::validation(format!("invalid log filter: {error}"),),)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter,)
        .with_writer(io::stderr,)
        .try_init()
        .map_err(|error| Error::service(format!("failed to install log subscriber: {error}"),),)
}

fn runtime() -> Result<tokio::runtime::Runtime, Error,>
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| Error::service(format!("failed to start async runtime: {error}"),),)
}

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancellationToken,)
{
    tokio::spawn(async move {
        if let Err(error,) = tokio::signal::ctrl_c().await {
            warn!(%error, "unable to listen for interrupt signal");
            return;
        }
        info!("interrupt received, shutting down");
        cancel.cancel();
    },);
}

async fn run_exporter(args: RunArgs,) -> Result<(), Error,>
{
    let config = load_config(&args.config,)?;
    let store = Arc::new(config.resource_store()?,);
    let secrets = Arc::new(config.secret_store()?,);

    let mut registry = Registry::default();
    let metrics = Arc::new(RepoMetrics::new(&mut registry,),);
    let registry = Arc::new(registry,);

    let reconciler = Reconciler::new(
        store.clone(),
        secrets,
        Arc::new(config.api_factory(),),
        metrics,
        config.reconcile_settings(),
    );
    let scheduler =
        Scheduler::new(Arc::new(reconciler,), store, config.settings.workers, config.settings.retry.clone(),);

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone(),);
    let listen = args.listen.unwrap_or(config.settings.listen,);

    let server = async {
        let result = serve(listen, registry, cancel.clone(),).await;
        cancel.cancel();
        result
    };
    let reconciliation = async {
        let result = scheduler.run(cancel.clone(),).await;
        cancel.cancel();
        result
    };
    let (served, reconciled,) = tokio::join!(server, reconciliation);
    served.and(reconciled,)
}

fn run_check(path: &Path, pretty: bool,) -> Result<(), Error,>
{
    let config = load_config(path,)?;
    let report = CheckReport {
        settings: &config.settings, repositories: config.watches()?,
    };

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write_json(&mut handle, &report, pretty,)
}

async fn run_snapshot(args: SnapshotArgs,) -> Result<(), Error,>
{
    let credential = match &args.token_env {
        Some(variable,) => {
            let token = env::var(variable,).map_err(|_| {
                Error::credential(format!("environment variable {variable} is not set"),)
            },)?;
            Credential::Token(token.into_bytes(),)
        }
        None => Credential::Anonymous,
    };
    let options = FetchOptions {
        call_timeout: credential.is_anonymous().then_some(DEFAULT_ANONYMOUS_TIMEOUT,),
        ..FetchOptions::default()
    };
    let api = GitHubApiFactory::new(args.api_base.clone(),).connect(&credential,)?;
    let client = MetricsClient::new(api, options,);

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone(),);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.yellow} [{elapsed_precise}] {msg}",)
            .expect("valid template",),
    );
    pb.enable_steady_tick(Duration::from_millis(100,),);
    pb.set_message(format!("Fetching {}/{}...", args.owner, args.repo),);

    let started_at = Utc::now();
    let fetched = client.fetch(&args.owner, &args.repo, &cancel,).await;
    pb.finish_and_clear();
    let data = fetched?;

    let window = SyncWindow {
        since: args.since, until: started_at, policy: FirstSyncPolicy::Backfill,
    };
    let snapshot = aggregate(&data.summary, &data.issues, &data.pull_requests, &window,);
    info!(owner = %args.owner, repo = %args.repo, issues = data.issues.len(), "snapshot computed");

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write_json(&mut handle, &snapshot, args.pretty,)
}

fn write_json<W: io::Write, T: Serialize,>(writer: &mut W, document: &T, pretty: bool,) -> Result<(), Error,>
{
    if pretty {
        serde_json::to_writer_pretty(&mut *writer, document,)?;
    } else {
        serde_json::to_writer(&mut *writer, document,)?;
    }
    writeln!(writer).map_err(|error| Error::service(format!("failed to write output: {error}"),),)
}
