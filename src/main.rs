//! purgeman - Main entry point.

use anyhow::Context;
use purgeman::cli::{is_child_process, Cli};
use purgeman::config::{ObservabilityConfig, ServiceConfig};
use purgeman::daemon::{self, Sentinel, StartupNotifier};
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if is_child_process(std::env::args()) {
        if run_child().await.is_err() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let cli = Cli::parse_args();
    let config = cli.load_config().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    if config.foreground {
        let _guard = purgeman::observability::init(&config.observability)?;
        purgeman::run(config, None).await?;
        return Ok(());
    }

    // The parent only reports on the hand-off, the child owns file logs and metrics.
    let _guard = purgeman::observability::init(&ObservabilityConfig {
        log_path: None,
        metrics_addr: None,
        ..config.observability.clone()
    })?;

    let program = std::env::current_exe().context("cannot locate the purgeman executable")?;
    let pid = tokio::task::spawn_blocking(move || daemon::spawn_background(&program, &config))
        .await
        .context("background start-up task failed")??;

    info!(pid, "purgeman is running in the background");
    Ok(())
}

/// Background child: configuration comes from stdin, the outcome goes to stdout.
///
/// Failures are reported before the error sentinel so the parent relays them.
async fn run_child() -> anyhow::Result<()> {
    let notifier = Arc::new(StartupNotifier::stdout());

    let config = match child_config() {
        Ok(config) => config,
        Err(e) => {
            report(&e);
            notifier.notify(Sentinel::Error);
            return Err(e);
        }
    };

    let _guard = match purgeman::observability::init(&config.observability) {
        Ok(guard) => guard,
        Err(e) => {
            let e = anyhow::Error::from(e);
            report(&e);
            notifier.notify(Sentinel::Error);
            return Err(e);
        }
    };

    if let Err(e) = purgeman::run(config, Some(Arc::clone(&notifier))).await {
        error!(error = %e, "purgeman stopped");
        notifier.notify(Sentinel::Error);
        return Err(e.into());
    }

    Ok(())
}

fn child_config() -> anyhow::Result<ServiceConfig> {
    let config = daemon::read_config(std::io::stdin().lock())
        .context("failed to read configuration from parent")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Write `error` to stderr, which may already be closed in the child.
fn report(error: &anyhow::Error) {
    if !purgeman::observability::is_console_silenced() {
        let _ = writeln!(std::io::stderr(), "purgeman: {:#}", error);
    }
}
