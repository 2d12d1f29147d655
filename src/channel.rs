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

use std::{
    io::Read,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    sync::Notify,
    time::{Instant, timeout_at},
};
use tokio_util::bytes::BytesMut;

use crate::error::TransferError;
use crate::transfer::TransferReport;

const INPUT_PROMPT: &[u8] = b"OK\r\n\r\n>";
const READER_CHUNK_SIZE: usize = 1024;

/// Invoked whenever new bytes land in the control port. Must only signal.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;

/// Binary wakeup between the control port and the acquisition loop.
///
/// Signals do not accumulate: any number of `signal` calls before the next
/// `wait` release it exactly once.
#[derive(Debug, Default)]
pub struct SyncGate {
    notify: Notify,
}

impl SyncGate {
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[derive(Default)]
struct PortState {
    pending: BytesMut,
    on_data: Option<DataCallback>,
    closed: bool,
}

fn lock(state: &Mutex<PortState>) -> MutexGuard<'_, PortState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer side of a [`ControlPort`]. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct PortFeeder {
    state: Arc<Mutex<PortState>>,
}

impl PortFeeder {
    pub fn deliver(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let callback = {
            let mut state = lock(&self.state);
            state.pending.extend_from_slice(data);
            state.on_data.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Marks end of input. A waiting reader is woken so it can observe it.
    pub fn close(&self) {
        let callback = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.on_data.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.state).on_data.is_some()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

/// Half-duplex command port: raw input arrives through a [`PortFeeder`],
/// responses go out through `W`.
pub struct ControlPort<W> {
    state: Arc<Mutex<PortState>>,
    writer: W,
}

impl<W> ControlPort<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> (Self, PortFeeder) {
        let state = Arc::new(Mutex::new(PortState::default()));
        let feeder = PortFeeder {
            state: state.clone(),
        };
        (Self { state, writer }, feeder)
    }

    pub fn enter_specific(&mut self, on_data: DataCallback) {
        let fire = {
            let mut state = lock(&self.state);
            state.on_data = Some(on_data.clone());
            !state.pending.is_empty() || state.closed
        };
        // Bytes that arrived before registration still need a wakeup.
        if fire {
            on_data();
        }
    }

    pub fn exit_specific(&mut self) {
        lock(&self.state).on_data = None;
    }

    /// Drains up to `buf.len()` buffered bytes without blocking.
    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let mut state = lock(&self.state);
        let n = buf.len().min(state.pending.len());
        buf[..n].copy_from_slice(&state.pending.split_to(n));
        n
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Announces bytes left over for whichever stage reads the port next.
    pub fn notify_remaining(&mut self, len: usize) {
        tracing::debug!("{len} bytes remain buffered on the control port");
    }

    pub async fn prompt(&mut self) -> std::io::Result<()> {
        self.writer.write_all(INPUT_PROMPT).await?;
        self.writer.flush().await
    }

    /// Writes the single terminal line for a command.
    pub async fn respond(
        &mut self,
        result: &Result<TransferReport, TransferError>,
    ) -> std::io::Result<()> {
        let line = match result {
            Ok(report) => format!("OK {}\r\n", report.bytes),
            Err(_) => "ERROR\r\n".to_string(),
        };
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    #[cfg(test)]
    pub fn writer(&self) -> &W {
        &self.writer
    }
}

/// Pumps `reader` into the port from a dedicated thread until end of input.
pub fn spawn_reader<R>(mut reader: R, feeder: PortFeeder) -> std::io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("control-port".to_string())
        .spawn(move || {
            let mut buf = [0u8; READER_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => feeder.deliver(&buf[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!("control port read failed: {err}");
                        break;
                    }
                }
            }
            feeder.close();
        })
}

/// Outcome of a parameter acquisition.
#[derive(Debug)]
pub struct Acquired {
    pub data: Vec<u8>,
    pub wakeups: usize,
    /// Bytes already buffered past the parameter, left for the next stage.
    pub leftover: usize,
}

/// Blocks until exactly `expected` bytes have been delivered on `port`, or
/// `timeout` elapses.
pub async fn acquire<W>(
    port: &mut ControlPort<W>,
    gate: &Arc<SyncGate>,
    expected: usize,
    timeout: Duration,
) -> Result<Acquired, TransferError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut data = Vec::new();
    data.try_reserve_exact(expected)
        .map_err(|_| TransferError::OutOfMemory {
            purpose: "parameter buffer",
            size: expected,
        })?;
    data.resize(expected, 0);

    let signal = gate.clone();
    port.enter_specific(Arc::new(move || signal.signal()));
    let result = fill(port, gate, &mut data, timeout).await;
    port.exit_specific();
    let wakeups = result?;

    tracing::debug!("received {expected} parameter bytes after {wakeups} wakeups");

    let leftover = port.pending_len();
    if leftover > 0 {
        port.notify_remaining(leftover);
    }

    Ok(Acquired {
        data,
        wakeups,
        leftover,
    })
}

async fn fill<W>(
    port: &mut ControlPort<W>,
    gate: &SyncGate,
    data: &mut [u8],
    timeout: Duration,
) -> Result<usize, TransferError>
where
    W: AsyncWrite + Unpin + Send,
{
    let deadline = Instant::now() + timeout;
    let expected = data.len();
    let mut received = 0;
    let mut wakeups = 0;

    port.prompt().await.map_err(TransferError::Control)?;

    while received < expected {
        if timeout_at(deadline, gate.wait()).await.is_err() {
            return Err(TransferError::Timeout {
                expected,
                received,
                waited: timeout,
            });
        }
        wakeups += 1;
        received += port.read_data(&mut data[received..]);

        if received < expected && port.is_closed() && port.pending_len() == 0 {
            return Err(TransferError::ControlClosed { expected, received });
        }
    }

    Ok(wakeups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_acquire(
        mut port: ControlPort<Vec<u8>>,
        expected: usize,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<(Result<Acquired, TransferError>, ControlPort<Vec<u8>>)> {
        tokio::spawn(async move {
            let gate = Arc::new(SyncGate::default());
            let result = acquire(&mut port, &gate, expected, timeout).await;
            (result, port)
        })
    }

    #[tokio::test]
    async fn acquire_across_three_deliveries() {
        let (port, feeder) = ControlPort::new(Vec::new());
        let task = spawn_acquire(port, 10, Duration::from_secs(5));

        for chunk in [&b"htt"[..], b"p://", b"a.b"] {
            wait_until(|| feeder.is_listening()).await;
            feeder.deliver(chunk);
            wait_until(|| feeder.pending_len() == 0).await;
        }

        let (result, port) = task.await.unwrap();
        let acquired = result.unwrap();
        assert_eq!(acquired.data, b"http://a.b");
        assert_eq!(acquired.wakeups, 3);
        assert_eq!(acquired.leftover, 0);
        assert_eq!(port.writer().as_slice(), INPUT_PROMPT);
        assert!(!feeder.is_listening());
    }

    #[tokio::test]
    async fn acquire_reports_leftover_bytes() {
        let (port, feeder) = ControlPort::new(Vec::new());
        let task = spawn_acquire(port, 10, Duration::from_secs(5));

        wait_until(|| feeder.is_listening()).await;
        feeder.deliver(b"http://a.bEXTRA");

        let (result, port) = task.await.unwrap();
        let acquired = result.unwrap();
        assert_eq!(acquired.data, b"http://a.b");
        assert_eq!(acquired.leftover, 5);
        assert_eq!(port.pending_len(), 5);
    }

    #[tokio::test]
    async fn acquire_picks_up_data_delivered_before_registration() {
        let (mut port, feeder) = ControlPort::new(Vec::new());
        feeder.deliver(b"0123456789");

        let gate = Arc::new(SyncGate::default());
        let acquired = acquire(&mut port, &gate, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(acquired.data, b"0123456789");
        assert_eq!(acquired.wakeups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_remote_is_silent() {
        let (port, feeder) = ControlPort::new(Vec::new());
        let task = spawn_acquire(port, 10, Duration::from_secs(30));

        wait_until(|| feeder.is_listening()).await;
        feeder.deliver(b"abc");

        let (result, _port) = task.await.unwrap();
        match result {
            Err(TransferError::Timeout {
                expected,
                received,
                waited,
            }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
                assert_eq!(waited, Duration::from_secs(30));
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(!feeder.is_listening());
    }

    #[tokio::test]
    async fn acquire_fails_when_input_ends_early() {
        let (port, feeder) = ControlPort::new(Vec::new());
        let task = spawn_acquire(port, 10, Duration::from_secs(5));

        wait_until(|| feeder.is_listening()).await;
        feeder.deliver(b"abcd");
        feeder.close();

        let (result, _port) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(TransferError::ControlClosed {
                expected: 10,
                received: 4
            })
        ));
    }

    #[tokio::test]
    async fn sync_gate_does_not_count_signals() {
        let gate = SyncGate::default();
        gate.signal();
        gate.signal();
        gate.wait().await;
        let second = tokio::time::timeout(Duration::from_millis(10), gate.wait()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn reader_thread_feeds_port_and_closes() {
        let (mut port, feeder) = ControlPort::new(Vec::new());
        let handle = spawn_reader(Cursor::new(b"http://example.com".to_vec()), feeder).unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 64];
        let n = port.read_data(&mut buf);
        assert_eq!(&buf[..n], b"http://example.com");
        assert!(port.is_closed());
    }

    #[tokio::test]
    async fn respond_writes_one_terminal_line() {
        let (mut port, _feeder) = ControlPort::new(Vec::new());
        port.respond(&Err(TransferError::Busy)).await.unwrap();
        assert_eq!(port.writer().as_slice(), b"ERROR\r\n");
    }
}
