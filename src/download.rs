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

use futures::{Stream, TryStreamExt as _};
use reqwest::{
    StatusCode, Url,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use std::{error::Error as _, pin::Pin};
use tokio::io::{AsyncRead, AsyncReadExt as _, BufReader};
use tokio_util::{bytes::Bytes, io::StreamReader};

use crate::error::TransferError;

type Body = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    HeadersReceived,
    StatusOk,
    Streaming,
    Finished,
    Aborted,
}

/// Events raised while a session talks to the remote end.
#[derive(Debug)]
pub enum HttpEvent<'a> {
    Connected { status_code: StatusCode },
    Header { name: &'a HeaderName, value: &'a HeaderValue },
    Data(usize),
    Finished,
    Error(&'a str),
}

/// Outcome of a single body read.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    Closed,
    Aborted(std::io::Error),
}

pub struct TransferSession {
    url: String,
    state: SessionState,
    status_code: Option<StatusCode>,
    content_length: Option<u64>,
    received_bytes: u64,
    body: Option<Body>,
}

impl TransferSession {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: SessionState::Closed,
            status_code: None,
            content_length: None,
            received_bytes: 0,
            body: None,
        }
    }

    /// Issues a GET for `url` and waits for the response headers.
    pub async fn open(
        client: &reqwest::Client,
        url: &str,
        buffer_size: usize,
    ) -> Result<Self, TransferError> {
        let parsed = Url::parse(url)
            .map_err(|err| TransferError::InvalidParameter(format!("invalid url {url}: {err}")))?;

        let mut session = Self::new(url);
        session.state = SessionState::Connecting;

        match client.get(parsed).send().await {
            Ok(response) => {
                let status_code = response.status();
                let headers = response.headers().clone();
                let body = response.bytes_stream().map_err(std::io::Error::other);
                session.accept(status_code, &headers, body, buffer_size);
                Ok(session)
            }
            Err(err) => {
                let error = err
                    .source()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| err.to_string());
                session.dispatch(HttpEvent::Error(&error));
                Err(TransferError::Transport {
                    url: url.to_string(),
                    error,
                })
            }
        }
    }

    /// Builds a session from an already received response.
    pub fn from_response<S>(
        url: &str,
        status_code: StatusCode,
        headers: &HeaderMap,
        body: S,
        buffer_size: usize,
    ) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        let mut session = Self::new(url);
        session.state = SessionState::Connecting;
        session.accept(status_code, headers, body, buffer_size);
        session
    }

    fn accept<S>(
        &mut self,
        status_code: StatusCode,
        headers: &HeaderMap,
        body: S,
        buffer_size: usize,
    ) where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        self.dispatch(HttpEvent::Connected { status_code });
        for (name, value) in headers {
            self.dispatch(HttpEvent::Header { name, value });
        }
        let reader = BufReader::with_capacity(buffer_size, StreamReader::new(body));
        self.body = Some(Box::pin(reader));
    }

    /// Single decision point for everything the remote end reports.
    fn dispatch(&mut self, event: HttpEvent<'_>) {
        match event {
            HttpEvent::Connected { status_code } => {
                tracing::debug!("connected to {}, status {status_code}", self.url);
                self.status_code = Some(status_code);
                self.state = SessionState::HeadersReceived;
            }
            HttpEvent::Header { name, value } => {
                tracing::trace!("header {name}: {value:?}");
                if name == header::CONTENT_LENGTH {
                    self.content_length = value
                        .to_str()
                        .ok()
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    if let Some(total) = self.content_length {
                        tracing::debug!("content length {total}");
                    }
                }
            }
            HttpEvent::Data(len) => {
                self.received_bytes += len as u64;
                match self.content_length {
                    Some(total) if total > 0 => tracing::trace!(
                        "received {}/{total} bytes ({:.1}%)",
                        self.received_bytes,
                        self.received_bytes as f64 * 100.0 / total as f64
                    ),
                    _ => tracing::trace!("received {} bytes", self.received_bytes),
                }
            }
            HttpEvent::Finished => {
                tracing::debug!("transfer from {} finished", self.url);
                self.state = SessionState::Finished;
            }
            HttpEvent::Error(error) => {
                tracing::warn!("transfer from {} aborted: {error}", self.url);
                self.state = SessionState::Aborted;
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.content_length.is_none()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn status_check(&mut self) -> Result<(), TransferError> {
        match self.status_code {
            Some(status_code) if status_code.as_u16() < 400 => {
                self.state = SessionState::StatusOk;
                Ok(())
            }
            Some(status_code) => {
                self.dispatch(HttpEvent::Error(status_code.as_str()));
                Err(TransferError::RemoteStatus {
                    url: self.url.clone(),
                    status_code,
                })
            }
            None => Err(TransferError::Transport {
                url: self.url.clone(),
                error: "no response received".to_string(),
            }),
        }
    }

    /// Fails when the declared length cannot fit in `available_bytes`.
    /// Chunked transfers cannot be checked up front.
    pub fn check_capacity(&self, available_bytes: u64) -> Result<(), TransferError> {
        match self.content_length {
            Some(required) if required > available_bytes => {
                Err(TransferError::InsufficientStorage {
                    required,
                    available: available_bytes,
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn read_next(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.state {
            SessionState::StatusOk | SessionState::Streaming => {}
            SessionState::Finished => return ReadOutcome::Closed,
            state => {
                return ReadOutcome::Aborted(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("session is not readable in state {state:?}"),
                ));
            }
        }
        let Some(body) = self.body.as_mut() else {
            return ReadOutcome::Aborted(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session is closed",
            ));
        };

        self.state = SessionState::Streaming;
        match body.read(buf).await {
            Ok(0) => {
                self.dispatch(HttpEvent::Finished);
                ReadOutcome::Closed
            }
            Ok(n) => {
                self.dispatch(HttpEvent::Data(n));
                ReadOutcome::Data(n)
            }
            Err(err) => {
                self.dispatch(HttpEvent::Error(&err.to_string()));
                ReadOutcome::Aborted(err)
            }
        }
    }

    pub fn close(&mut self) {
        if self.body.take().is_some() {
            tracing::debug!("closed connection to {}", self.url);
        }
    }
}
