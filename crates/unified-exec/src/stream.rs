//! Stdio plumbing between a child process and the caller

use crate::request::StdinSource;
use async_channel::{Receiver, Sender};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_lite::{StreamExt, future};
use smol::Timer;
use std::io;
use std::time::Duration;

/// Bytes to write ahead of the caller's stdin, optionally gated on a prompt
pub(crate) struct StdinPrefix {
    /// The bytes
    pub bytes: Vec<u8>,
    /// Signalled when the prompt shows up on stderr
    pub gate: Option<Receiver<()>>,
    /// Bound on the wait for `gate`
    pub gate_timeout: Duration,
}

/// Write the prefix then the caller's input to `pipe`, then close it
///
/// A child that exits without reading its input is not an error.
pub(crate) async fn feed_stdin<W>(
    pipe: Option<W>,
    prefix: Option<StdinPrefix>,
    source: StdinSource,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    match write_all_input(&mut pipe, prefix, source).await {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

async fn write_all_input<W>(
    pipe: &mut W,
    prefix: Option<StdinPrefix>,
    source: StdinSource,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(prefix) = prefix {
        if let Some(gate) = prefix.gate {
            future::or(
                async {
                    let _ = gate.recv().await;
                },
                async {
                    Timer::after(prefix.gate_timeout).await;
                },
            )
            .await;
        }
        pipe.write_all(&prefix.bytes).await?;
    }
    match source {
        StdinSource::None => {}
        StdinSource::Text(text) => pipe.write_all(text.as_bytes()).await?,
        StdinSource::Bytes(bytes) => pipe.write_all(&bytes).await?,
        StdinSource::Reader(reader) => {
            futures::io::copy(reader, pipe).await?;
        }
    }
    pipe.flush().await?;
    pipe.close().await
}

/// Watches a stream for a prompt and signals once when it appears
pub(crate) struct PromptWatch {
    prompt: String,
    signal: Option<Sender<()>>,
}

impl PromptWatch {
    /// Watch for `prompt`; the receiver fires once
    pub fn new(prompt: impl Into<String>) -> (Self, Receiver<()>) {
        let (tx, rx) = async_channel::bounded(1);
        (
            Self {
                prompt: prompt.into(),
                signal: Some(tx),
            },
            rx,
        )
    }

    fn observe(&mut self, captured: &[u8]) {
        if self.signal.is_some() && String::from_utf8_lossy(captured).contains(&self.prompt) {
            if let Some(tx) = self.signal.take() {
                let _ = tx.try_send(());
            }
        }
    }
}

/// Read `pipe` to EOF into `buf`
///
/// Data read so far stays in `buf` if the future is dropped early.
pub(crate) async fn capture<R>(
    pipe: Option<R>,
    buf: &mut Vec<u8>,
    mut watch: Option<PromptWatch>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(watch) = watch.as_mut() {
            watch.observe(buf);
        }
    }
}

/// Deliver each line of `reader` to `on_line` until EOF or until it returns `false`
pub(crate) async fn pump_lines<R, F>(reader: R, mut on_line: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> bool,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next().await {
        let line = line?;
        let line = line.strip_suffix('\r').map(str::to_string).unwrap_or(line);
        if !on_line(line) {
            break;
        }
    }
    Ok(())
}
