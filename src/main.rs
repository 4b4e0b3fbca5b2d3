//! CLI entry point for the ICSD downloader.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use icsd_core::config::credential_from_env;
use icsd_core::{AggregateReport, ContentType, Retriever, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "loaded config file");
    }
    let mut settings = loaded.settings;
    args.apply_to(&mut settings);
    settings.validate().context("invalid settings")?;

    let credential = credential_from_env(args.login_id.as_deref())?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight batches finish");
            interrupt.cancel();
        }
    });

    let retriever = Retriever::from_settings(&settings, credential)?.with_cancellation(cancel);

    let content_type = ContentType::from(args.content_type);
    let kind = args.command.search_kind();

    retriever.connect().await?;
    let found = retriever
        .search_with(kind, content_type, args.command.query())
        .await;
    retriever.close().await;
    let ids = found?;

    let report = match &args.command {
        Command::Search { .. } => {
            for id in &ids {
                println!("{id}");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Records { fields, name, .. } => {
            retriever.records_to_csv(&ids, fields, name).await?
        }
        Command::Structures { text: true, name, .. } => {
            retriever.structures_to_cif(&ids, name).await?
        }
        Command::Structures { name, .. } => retriever.structures_to_zip(&ids, name).await?,
    };

    Ok(summarize(&report))
}

fn summarize(report: &AggregateReport) -> ExitCode {
    info!(
        output = %report.output.display(),
        merged = report.merged.len(),
        failed = report.failed.len(),
        "retrieval complete"
    );

    match &report.failure_file {
        Some(path) => {
            warn!(
                failed = report.failed.len(),
                path = %path.display(),
                "some ids could not be fetched"
            );
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}
