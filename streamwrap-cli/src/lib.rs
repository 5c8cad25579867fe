//! Library target for the `streamwrap` package.
//!
//! The deliverable is the `streamwrap` binary (`src/main.rs`). The argument
//! model and error type live here so they can be tested without spawning it.

pub mod cli;

use std::process::ExitCode;

#[doc(hidden)]
pub use streamwrap_engine;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Relay(#[from] streamwrap_engine::Error),

    #[error("{0}")]
    Cli(#[from] clap::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl AppError {
    /// The consumer closed stdout. Not a failure of the relay.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            Self::Relay(e) => !e.is_fatal(),
            Self::Io(e) => e.kind() == std::io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}

/// Map the outcome of a run to the process exit code. Failures are logged once.
pub fn exit_code(result: Result<(), AppError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_broken_pipe() => {
            info!("Consumer closed the output");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use streamwrap_engine::Error as RelayError;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_logged(result: Result<(), AppError>) -> (ExitCode, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let code = tracing::subscriber::with_default(subscriber, || exit_code(result));
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        (code, output)
    }

    #[test]
    fn setup_failure_is_reported_once() {
        let (code, output) = run_logged(Err(RelayError::setup("muxer has no inputs").into()));
        assert_eq!(code, ExitCode::FAILURE);
        assert_eq!(output.matches("muxer has no inputs").count(), 1);
    }

    #[test]
    fn closed_consumer_is_a_clean_exit() {
        let broken = io::Error::from(io::ErrorKind::BrokenPipe);
        let (code, output) = run_logged(Err(AppError::Io(broken)));
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(output.contains("Consumer closed the output"));

        assert_eq!(run_logged(Ok(())).0, ExitCode::SUCCESS);
    }
}
