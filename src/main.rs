use clap::Parser;
use gmaps_screenshot_engine::{setup_logging, Cli, CliRunner};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose);

    info!("starting gmaps-screenshot-engine v{}", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _signal_task = spawn_signal_handler(shutdown_tx);

    let runner = CliRunner::new(&args).await?;
    if let Some(report) = runner.run(args.command, shutdown_rx).await? {
        info!(
            "job {}: {}/{} targets succeeded ({})",
            report.job_id, report.succeeded, report.total, report.finish_reason
        );
    }

    Ok(())
}

/// First SIGINT or SIGTERM flips the shutdown flag; in-flight captures are
/// cancelled and the run finishes with a stats row.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(true);
    })
}
