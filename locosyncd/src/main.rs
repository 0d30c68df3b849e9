use std::path::PathBuf;

use locosyncd::daemon::{DaemonConfig, DaemonRuntime, RetryScope, format_error_log};
use locosyncd::sync::RestoreStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Restore(PathBuf),
    Errors,
    Retry(RetryScope),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--restore" => {
                let Some(dir) = args.next() else {
                    anyhow::bail!("--restore needs a directory");
                };
                mode = CliMode::Restore(PathBuf::from(dir));
            }
            "--errors" => mode = CliMode::Errors,
            "--retry" => mode = CliMode::Retry(RetryScope::Errored),
            "--retry-ignore-missing" => mode = CliMode::Retry(RetryScope::IgnoringMissing),
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("locosyncd=info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!(
            "Usage: locosyncd [--once | --restore <dir> | --errors | --retry | --retry-ignore-missing]"
        );
        println!("  --once            Run one full sync pass and exit");
        println!("  --restore <dir>   Import a backup folder from another location");
        println!("  --errors          Run an import pass and print the error log");
        println!("  --retry           Import errored files again");
        println!("  --retry-ignore-missing");
        println!("                    Import files with missing parents, dropping those links");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Once => {
            let outcome = daemon.run_once().await?;
            println!("sync run {}", outcome.as_str());
            Ok(())
        }
        CliMode::Restore(dir) => {
            match daemon.restore(&dir).await? {
                RestoreStatus::Downloading { pending } => {
                    println!("waiting for {pending} files to download, run again later");
                }
                RestoreStatus::Queued { files } => println!("restored {files} files"),
            }
            Ok(())
        }
        CliMode::Errors => {
            let entries = daemon.error_report().await?;
            if entries.is_empty() {
                println!("no import errors");
            } else {
                print!("{}", format_error_log(&entries));
            }
            Ok(())
        }
        CliMode::Retry(scope) => {
            let report = daemon.retry(scope).await?;
            println!("retried {} files", report.retried);
            if !report.remaining.is_empty() {
                print!("{}", format_error_log(&report.remaining));
            }
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}
