//! Apitape CLI

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use apitape::capture::CdpCaptureSource;
use apitape::config::Config;
use apitape::output::{default_output_path, write_record};
use apitape::recording::SessionController;

/// Record a page's API traffic into a replayable JSON scenario
#[derive(Debug, Parser)]
#[command(name = "apitape", version, about)]
struct Cli {
    /// Page to open
    #[arg(short, long)]
    url: String,

    /// Scenario name (default: scenario_YYYYMMDD_HHMMSS)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Output file (default: <timestamp>_<scenario>.json)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Recording time in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Include patterns, comma separated (default: /api/)
    #[arg(short, long, value_delimiter = ',')]
    include: Option<Vec<String>>,

    /// Exclude patterns, comma separated
    #[arg(short, long, value_delimiter = ',')]
    exclude: Option<Vec<String>>,

    /// Run the browser without a window
    #[arg(long)]
    headless: bool,

    /// Body size limit in characters
    #[arg(long)]
    body_limit: Option<usize>,

    /// Chromium executable
    #[arg(long, env = "CHROME_PATH")]
    browser: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags override the config file
    fn apply(&self, config: &mut Config) {
        if let Some(scenario) = &self.scenario {
            config.session.scenario = Some(scenario.clone());
        }
        if let Some(output) = &self.output {
            config.session.output = Some(output.clone());
        }
        if let Some(duration) = self.duration {
            config.session.duration_secs = duration;
        }
        if let Some(include) = &self.include {
            config.filter.include_patterns = trimmed(include);
        }
        if let Some(exclude) = &self.exclude {
            config.filter.exclude_patterns = trimmed(exclude);
        }
        if let Some(limit) = self.body_limit {
            config.filter.body_size_limit = limit;
        }
        if let Some(browser) = &self.browser {
            config.browser.executable = Some(browser.clone());
        }
        if self.headless {
            config.browser.headless = true;
        }
    }
}

fn trimmed(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.trim().to_string()).collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let source = CdpCaptureSource::new(config.browser.clone());
    let mut session = SessionController::from_config(source, &config)?;
    let output = config
        .session
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(session.scenario(), Utc::now()));

    info!("URL: {}", cli.url);
    info!("Scenario: {}", session.scenario());
    info!("Duration: {}s", config.session.duration_secs);
    info!("Include: {}", config.filter.include_patterns.join(", "));
    info!("Headless: {}", config.browser.headless);

    session
        .start(&cli.url)
        .await
        .context("failed to start recording")?;

    info!(
        "Recording for {}s (Ctrl+C to stop early)",
        config.session.duration_secs
    );
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(config.session.duration_secs)) => {
            info!("Recording time elapsed");
        }
        () = shutdown_signal() => {
            info!("Stop requested");
        }
    }

    let report = session.stop().await?;
    if let Some(e) = &report.release_error {
        warn!("{}", e);
    }

    write_record(&report.record, &output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("Recorded {} entries", report.record.entries.len());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
