use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use volley::{
    config::{DEFAULT_BASE_URL, DEFAULT_TARGET_HOST},
    EndpointScenario, JsonReporter, Profile, Reporter, ReqwestClient, ScenarioFile, StdoutReporter,
    TestRun,
};

/// Exit status when the run completed but a threshold failed.
const THRESHOLDS_FAILED: u8 = 99;

#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(about = "Staged virtual-user HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    /// Base URL every relative request path is resolved against
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Value of the Host header sent with each request
    #[arg(long, env = "TARGET_HOST")]
    target_host: Option<String>,

    /// Built-in load profile, ignored when --config is given
    #[arg(long, value_enum, default_value = "basic")]
    profile: Profile,

    /// Scenario file (JSON) to run instead of a built-in profile
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the full result as JSON to this file
    #[arg(long)]
    out: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let env_filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt().with_env_filter(env_filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(THRESHOLDS_FAILED),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every threshold passed.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let file = match &cli.config {
        Some(path) => ScenarioFile::load(path)
            .await
            .with_context(|| format!("loading scenario file {}", path.display()))?
            .retarget(cli.base_url, cli.target_host),
        None => cli.profile.scenario(
            cli.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            cli.target_host.as_deref().unwrap_or(DEFAULT_TARGET_HOST),
        ),
    };

    tracing::info!(
        "Target: {} (host {})",
        file.scenario.target.base_url,
        file.scenario.target.host.as_deref().unwrap_or("-")
    );

    let scenario = EndpointScenario::new(file.plan)?;
    let run = TestRun::new(file.scenario, scenario, ReqwestClient::new())?;

    let cancel = run.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = run.run().await?;

    StdoutReporter.report(&result).await?;
    if let Some(out) = cli.out {
        JsonReporter::new(out).report(&result).await?;
    }

    Ok(result.passed)
}
