//! Muxer command construction and process handling.
//!
//! The command is built in two passes. [`MuxPlan::template`] produces the
//! base argument list, then [`splice`] walks it once and inserts the
//! per-input decryption, pacing and timestamp options.

mod args;
mod plan;

pub use args::{MuxArg, render};
pub use plan::{GENERATED_INPUT, InputSource, MuxInput, MuxPlan, MuxSettings, OUTPUT_SINK, TrackRole};

use std::process::{ExitStatus, Stdio};

use process_utils::{ScopedChild, tokio_command};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::RequestContext;
use crate::keys::KeySet;
use crate::proxy::ProxyConfig;

/// Initial burst, in seconds, read ahead of real time for paced inputs.
pub const READRATE_INITIAL_BURST: &str = "10";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceFlags {
    pub copy_timestamps: bool,
    pub copy_subtitles: bool,
}

/// Insert per-input options into a command template.
///
/// Every remote input receives the next key from [`KeySet::slots`] together
/// with real-time pacing. Generated inputs are never keyed.
pub fn splice(template: Vec<MuxArg>, keys: &KeySet, flags: SpliceFlags) -> Vec<MuxArg> {
    let mut slots = keys.slots();
    let mut out = Vec::with_capacity(template.len() + 8);

    for arg in template {
        match &arg {
            MuxArg::Input { generated, .. } => {
                if !generated && let Some(key) = slots.next() {
                    out.push(MuxArg::flag("-re"));
                    out.push(MuxArg::option("-readrate_initial_burst", READRATE_INITIAL_BURST));
                    out.push(MuxArg::option("-decryption_key", key));
                }
                if flags.copy_timestamps {
                    out.push(MuxArg::flag("-copyts"));
                }
                out.push(arg);
            }
            _ if flags.copy_subtitles && arg.is_option("-c:a") => {
                out.push(arg);
                out.push(MuxArg::option("-c:s", "copy"));
            }
            _ => out.push(arg),
        }
    }

    if flags.copy_timestamps && matches!(out.last(), Some(MuxArg::Output(_))) {
        let at = out.len() - 1;
        out.insert(at, MuxArg::option("-mpegts_copyts", "1"));
    }

    out
}

/// Full muxer argument list for a plan.
pub fn build_command(
    plan: &MuxPlan,
    request: &RequestContext,
    proxy: Option<&ProxyConfig>,
    keys: &KeySet,
    settings: &MuxSettings,
) -> Vec<String> {
    let template = plan.template(request, proxy, settings);
    let flags = SpliceFlags {
        copy_timestamps: settings.copy_timestamps,
        copy_subtitles: plan.has_subtitles(),
    };
    render(&splice(template, keys, flags))
}

/// Redacts key material before an argument list is logged.
pub fn redacted(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("<redacted>");
            hide_next = false;
            continue;
        }
        hide_next = arg == "-decryption_key";
        out.push(arg.as_str());
    }
    out.join(" ")
}

/// A running muxer process writing the combined stream to its stdout.
#[derive(Debug)]
pub struct Muxer {
    process: ScopedChild,
    feeder: Option<JoinHandle<()>>,
}

impl Muxer {
    /// Start the muxer. `generated` feeds its stdin when the plan has a
    /// generated input.
    pub fn spawn(program: &str, args: &[String], generated: Option<ChildStdout>) -> Result<Self> {
        info!(program, "Starting muxer");
        debug!(args = %redacted(args), "Muxer arguments");

        let child = tokio_command(program)
            .args(args)
            .stdin(if generated.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(format!("failed to start muxer {program}: {e}")))?;

        let mut process = ScopedChild::new("muxer", child);
        if let Some(stderr) = process.take_stderr() {
            process_utils::forward_stderr("muxer", stderr);
        }

        let feeder = match (generated, process.take_stdin()) {
            (Some(source), Some(sink)) => Some(spawn_feeder(source, sink)),
            _ => None,
        };

        Ok(Self { process, feeder })
    }

    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.process.take_stdout()
    }

    /// Stop the muxer and its stdin feeder. Returns the exit status when
    /// one could be collected.
    pub async fn shutdown(mut self) -> Option<ExitStatus> {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        let status = self.process.terminate().await;
        if let Some(status) = status {
            debug!(%status, "Muxer exited");
        }
        status
    }
}

fn spawn_feeder(mut source: ChildStdout, mut sink: ChildStdin) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::io::copy(&mut source, &mut sink).await {
            Ok(bytes) => debug!(bytes, "Generated track ended"),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("Muxer stopped reading the generated track")
            }
            Err(e) => warn!(error = %e, "Feeding generated track failed"),
        }
    })
}
