use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use streamwrap::AppError;
use streamwrap::cli::{Args, LogLevel};
use streamwrap_engine::{HttpSession, Relay, install_rustls_provider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => return report_cli_error(AppError::from(e)),
    };

    if let Err(e) = init_logging(args.loglevel) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    streamwrap::exit_code(run(args).await)
}

fn report_cli_error(error: AppError) -> ExitCode {
    match error {
        // --help and --version also arrive here and go to stdout.
        AppError::Cli(e) if !e.use_stderr() => {
            let _ = e.print();
            ExitCode::SUCCESS
        }
        AppError::Cli(e) => {
            let _ = e.print();
            ExitCode::FAILURE
        }
        other => {
            eprintln!("Error: {other}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    install_rustls_provider();

    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    let config = args.into_config().await?;
    let transport = HttpSession::new(
        Arc::new(config.request_context()),
        config.proxy.as_ref(),
        config.http.clone(),
    )?;
    let relay = Relay::new(config, Arc::new(transport));

    let prepared = tokio::select! {
        prepared = relay.prepare() => prepared?,
        _ = token.cancelled() => {
            info!("Cancelled before the stream started");
            return Ok(());
        }
    };

    let report = relay.run(prepared, tokio::io::stdout(), &token).await?;
    info!(outcome = ?report.outcome, bytes = report.bytes, "Relay finished");
    Ok(())
}

/// Logs go to stderr, stdout carries the stream. `RUST_LOG` takes
/// precedence over `--loglevel`.
fn init_logging(level: LogLevel) -> Result<(), AppError> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_tracing().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            interrupted().await;
            return;
        }
    };

    tokio::select! {
        _ = interrupted() => {}
        _ = terminate.recv() => info!("Received terminate signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    interrupted().await;
}

async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt signal"),
        Err(e) => {
            debug!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
