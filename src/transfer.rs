// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use indicatif::ProgressStyle;
use std::{
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::io::AsyncWrite;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt as _;

use crate::args::Settings;
use crate::channel::{ControlPort, SyncGate, acquire};
use crate::download::{ReadOutcome, TransferSession};
use crate::error::TransferError;
use crate::writer::{StorageHandle, StorageTarget, Volume};

/// Destination value that streams the body without persisting it.
pub const DISCARD_SENTINEL: &str = "null";
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Raw command parameters, as received.
#[derive(Clone, Debug)]
pub struct Command {
    pub destination: String,
    pub url_length: i64,
    pub network_buffer_size: i64,
    pub storage_buffer_size: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Discard,
    File(PathBuf),
}

/// Validated parameters of one transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub destination: Destination,
    pub url_length: usize,
    pub network_buffer_size: usize,
    pub storage_buffer_size: usize,
}

impl TransferRequest {
    pub fn validate(command: &Command, max_url_length: usize) -> Result<Self, TransferError> {
        let destination = parse_destination(&command.destination)?;
        let url_length = parse_size("url length", command.url_length, max_url_length)?;
        let network_buffer_size = parse_size(
            "network buffer size",
            command.network_buffer_size,
            MAX_BUFFER_SIZE,
        )?;
        let storage_buffer_size = parse_size(
            "storage buffer size",
            command.storage_buffer_size,
            MAX_BUFFER_SIZE,
        )?;

        Ok(Self {
            destination,
            url_length,
            network_buffer_size,
            storage_buffer_size,
        })
    }
}

fn parse_destination(value: &str) -> Result<Destination, TransferError> {
    if value.is_empty() {
        return Err(TransferError::InvalidParameter(
            "destination must not be empty".to_string(),
        ));
    }
    if value == DISCARD_SENTINEL {
        return Ok(Destination::Discard);
    }

    let path = Path::new(value);
    let relative = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !relative || path.file_name().is_none() {
        return Err(TransferError::InvalidParameter(format!(
            "destination `{value}` must be a file path inside the volume"
        )));
    }
    Ok(Destination::File(path.to_path_buf()))
}

fn parse_size(name: &str, value: i64, max: usize) -> Result<usize, TransferError> {
    match usize::try_from(value) {
        Ok(size) if size > 0 && size <= max => Ok(size),
        _ => Err(TransferError::InvalidParameter(format!(
            "{name} must be between 1 and {max}, got {value}"
        ))),
    }
}

/// Timing of the read/write loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferStats {
    pub reads: u64,
    pub elapsed: Duration,
    pub write_time: Duration,
}

#[derive(Debug)]
pub struct TransferReport {
    /// Bytes persisted, or received when the body was discarded.
    pub bytes: u64,
    pub received_bytes: u64,
    pub content_length: Option<u64>,
    pub leftover_parameter_bytes: usize,
    pub stats: TransferStats,
}

impl TransferReport {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.stats.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.received_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Proof that a transfer is in flight. Released on drop.
#[derive(Debug)]
pub struct SessionHandle {
    active: Arc<AtomicBool>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Resources held by one transfer, released in declaration order.
#[derive(Default)]
struct ActiveTransfer<'v> {
    network: Option<TransferSession>,
    url: Option<String>,
    gate: Option<Arc<SyncGate>>,
    storage: Option<StorageTarget<'v>>,
}

impl ActiveTransfer<'_> {
    fn release(&mut self) {
        if let Some(mut network) = self.network.take() {
            network.close();
        }
        self.url = None;
        self.gate = None;
        if let Some(mut storage) = self.storage.take() {
            storage.close_and_unmount();
        }
    }
}

pub struct Orchestrator {
    client: reqwest::Client,
    acquire_timeout: Duration,
    max_url_length: usize,
    show_progress: bool,
    active: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            acquire_timeout: settings.acquire_timeout,
            max_url_length: settings.max_url_length,
            show_progress: !settings.quiet,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claims the single transfer slot.
    pub fn begin(&self) -> Result<SessionHandle, TransferError> {
        self.active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| TransferError::Busy)?;
        Ok(SessionHandle {
            active: self.active.clone(),
        })
    }

    /// Runs `command` and writes its terminal line to `port`.
    pub async fn handle_command<W>(
        &self,
        command: &Command,
        volume: &mut dyn Volume,
        port: &mut ControlPort<W>,
    ) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let result = self.execute(command, volume, port).await;
        match &result {
            Ok(report) => tracing::info!(
                "transferred {} bytes in {} ms ({:.2} bytes/second)",
                report.bytes,
                report.stats.elapsed.as_millis(),
                report.bytes_per_second()
            ),
            Err(err) => tracing::error!("{err}"),
        }
        if let Err(err) = port.respond(&result).await {
            tracing::error!("failed to write command response: {err}");
        }
        result
    }

    pub async fn execute<W>(
        &self,
        command: &Command,
        volume: &mut dyn Volume,
        port: &mut ControlPort<W>,
    ) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let request = TransferRequest::validate(command, self.max_url_length)?;
        let _session = self.begin()?;

        let mut active = ActiveTransfer::default();
        let result = self.drive(&request, volume, port, &mut active).await;
        active.release();
        result
    }

    async fn drive<'v, W>(
        &self,
        request: &TransferRequest,
        volume: &'v mut dyn Volume,
        port: &mut ControlPort<W>,
        active: &mut ActiveTransfer<'v>,
    ) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let gate = active.gate.insert(Arc::new(SyncGate::default())).clone();
        let mut buffer = allocate(request.storage_buffer_size)?;

        if let Destination::File(relative) = &request.destination {
            active.storage = Some(StorageTarget::open(volume, relative).await?);
        }

        let acquired = acquire(port, &gate, request.url_length, self.acquire_timeout).await?;
        let url = String::from_utf8(acquired.data)
            .map_err(|_| TransferError::InvalidParameter("url is not valid UTF-8".to_string()))?;
        let url = active.url.insert(url);

        match &active.storage {
            Some(storage) => tracing::info!(
                "ready to download {url} to {} ({} of {} bytes available)",
                storage.path().display(),
                storage.available_bytes(),
                storage.total_capacity_bytes()
            ),
            None => tracing::info!("ready to download {url} (discarding body)"),
        }

        let session = active.network.insert(
            TransferSession::open(&self.client, url, request.network_buffer_size).await?,
        );
        session.status_check()?;
        if session.is_chunked() {
            tracing::debug!("no content length, reading until the connection closes");
        }

        if let Some(storage) = active.storage.as_mut() {
            session.check_capacity(storage.available_bytes())?;
            if let Some(total) = session.content_length() {
                storage.preallocate(total).await?;
            }
        }

        let progress = self.progress_span(session.content_length());
        let stats = pump(session, active.storage.as_mut(), &mut buffer, &progress).await;
        drop(progress);
        let stats = stats?;

        let written = active.storage.as_ref().map(StorageTarget::written_bytes);
        let bytes = reconcile(session.content_length(), session.received_bytes(), written)?;

        if let Some(storage) = active.storage.as_mut() {
            storage.sync().await?;
            storage.commit();
        }

        Ok(TransferReport {
            bytes,
            received_bytes: session.received_bytes(),
            content_length: session.content_length(),
            leftover_parameter_bytes: acquired.leftover,
            stats,
        })
    }

    /// Span carrying the progress bar. Closing it clears the bar.
    fn progress_span(&self, length: Option<u64>) -> Span {
        let span = tracing::info_span!("transfer");
        let template = match length {
            Some(_) => {
                "[{elapsed_precise}] [{wide_bar}] {bytes:>9}/{total_bytes:9} ({percent:>3}%) ETA: {eta}"
            }
            None => "[{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})",
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            span.pb_set_style(&style.progress_chars("#>-"));
        }
        if let Some(length) = length {
            span.pb_set_length(length);
        }
        if self.show_progress {
            span.pb_start();
        }
        span
    }
}

fn allocate(size: usize) -> Result<Vec<u8>, TransferError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| TransferError::OutOfMemory {
            purpose: "transfer buffer",
            size,
        })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Alternates network reads and storage writes until the body ends or
/// aborts. Only an aborted chunked body is an error here.
async fn pump<H: StorageHandle>(
    session: &mut TransferSession,
    mut storage: Option<&mut StorageTarget<'_, H>>,
    buffer: &mut [u8],
    progress: &Span,
) -> Result<TransferStats, TransferError> {
    let started = Instant::now();
    let mut stats = TransferStats::default();

    loop {
        match session.read_next(buffer).await {
            ReadOutcome::Data(n) => {
                stats.reads += 1;
                if let Some(target) = storage.as_deref_mut() {
                    let write_started = Instant::now();
                    target.write(&buffer[..n]).await?;
                    let took = write_started.elapsed();
                    stats.write_time += took;
                    tracing::trace!("wrote {n} bytes in {} ms", took.as_millis());
                }
                progress.pb_inc(n as u64);
            }
            ReadOutcome::Closed => {
                tracing::debug!("connection closed");
                break;
            }
            ReadOutcome::Aborted(err) if session.is_chunked() => {
                return Err(TransferError::Transport {
                    url: session.url().to_string(),
                    error: err.to_string(),
                });
            }
            // A known length is settled by reconcile.
            ReadOutcome::Aborted(err) => {
                tracing::warn!("body from {} ended early: {err}", session.url());
                break;
            }
        }
    }

    stats.elapsed = started.elapsed();
    Ok(stats)
}

/// Decides the final byte count for a finished body.
fn reconcile(
    content_length: Option<u64>,
    received: u64,
    written: Option<u64>,
) -> Result<u64, TransferError> {
    let persisted = written.unwrap_or(received);
    match content_length {
        Some(expected) if expected != persisted => {
            tracing::warn!("expected {expected} bytes, but {persisted} bytes were persisted");
            Err(TransferError::SizeMismatch {
                expected,
                written: persisted,
            })
        }
        Some(_) => Ok(persisted),
        None => {
            debug_assert_eq!(persisted, received, "every received byte must be written");
            tracing::info!("total received {received} bytes, total written {persisted} bytes");
            Ok(persisted)
        }
    }
}

#[cfg(test)]
pub fn create_test_orchestrator() -> Orchestrator {
    let settings = crate::args::create_test_settings(PathBuf::from("."));
    Orchestrator::new(reqwest::Client::new(), &settings)
}
