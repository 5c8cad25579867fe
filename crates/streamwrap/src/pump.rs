//! Copies a byte source to the output sink until one side ends.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 64 MPEG-TS packets.
pub const PUMP_CHUNK_SIZE: usize = 188 * 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source reported end of stream.
    EndOfStream,
    /// The consumer closed its end of the sink.
    ConsumerClosed,
    /// Shutdown was requested.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub outcome: PumpOutcome,
    pub bytes: u64,
}

/// Read in [`PUMP_CHUNK_SIZE`] chunks and write each one through, flushing
/// after every write.
///
/// A broken pipe on the sink is the normal way for a consumer to go away and
/// is reported as [`PumpOutcome::ConsumerClosed`], not as an error.
pub async fn pump<R, W>(mut source: R, mut sink: W, token: &CancellationToken) -> io::Result<PumpReport>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(bytes, "Stream pump cancelled");
                return Ok(PumpReport { outcome: PumpOutcome::Cancelled, bytes });
            }
            read = source.read(&mut buf) => read?,
        };

        if n == 0 {
            info!(bytes, "Source reached end of stream");
            return Ok(PumpReport { outcome: PumpOutcome::EndOfStream, bytes });
        }

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(bytes, "Stream pump cancelled");
                return Ok(PumpReport { outcome: PumpOutcome::Cancelled, bytes });
            }
            written = write_chunk(&mut sink, &buf[..n]) => written,
        };

        match written {
            Ok(()) => bytes += n as u64,
            Err(e) if is_consumer_gone(&e) => {
                info!(bytes, "Consumer closed the output");
                return Ok(PumpReport { outcome: PumpOutcome::ConsumerClosed, bytes });
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(sink: &mut W, chunk: &[u8]) -> io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}

fn is_consumer_gone(e: &io::Error) -> bool {
    let gone = matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    );
    if gone {
        debug!(error = %e, "Sink write failed");
    }
    gone
}
