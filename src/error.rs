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

use reqwest::StatusCode;
use std::{path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Another transfer is already in progress")]
    Busy,
    #[error("Failed to allocate {size} bytes for the {purpose}")]
    OutOfMemory { purpose: &'static str, size: usize },
    #[error("{operation} operation on {path} failed: {source}")]
    StorageUnavailable {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Insufficient storage: {required} bytes required, {available} bytes available")]
    InsufficientStorage { required: u64, available: u64 },
    #[error("Remote error {status_code} for {url}")]
    RemoteStatus { url: String, status_code: StatusCode },
    #[error("Network error {error} for {url}")]
    Transport { url: String, error: String },
    #[error("write on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Short write on {path}: {written} of {requested} bytes persisted")]
    ShortWrite {
        path: String,
        requested: usize,
        written: usize,
    },
    #[error("Size mismatch: expected {expected} bytes, wrote {written} bytes")]
    SizeMismatch { expected: u64, written: u64 },
    #[error("Timed out after {waited:?} waiting for parameter data ({received} of {expected} bytes)")]
    Timeout {
        expected: usize,
        received: usize,
        waited: Duration,
    },
    #[error("Control channel closed after {received} of {expected} parameter bytes")]
    ControlClosed { expected: usize, received: usize },
    #[error("Control channel write failed: {0}")]
    Control(#[source] std::io::Error),
}

impl TransferError {
    pub fn storage(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        TransferError::StorageUnavailable {
            operation,
            path: path.display().to_string(),
            source,
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
