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

use async_trait::async_trait;
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    io::{AsyncSeek, AsyncSeekExt as _, AsyncWrite, AsyncWriteExt as _},
};
use walkdir::WalkDir;

use crate::error::TransferError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// A mountable storage area with a fixed capacity.
pub trait Volume: Send {
    fn mount_point(&self) -> &Path;
    fn mount(&mut self) -> std::io::Result<()>;
    fn unmount(&mut self);
    fn info(&self) -> std::io::Result<VolumeInfo>;
}

/// A directory treated as a volume of `capacity` bytes.
#[derive(Debug)]
pub struct DirectoryVolume {
    root: PathBuf,
    capacity: u64,
    mounted: bool,
}

impl DirectoryVolume {
    pub fn new(root: PathBuf, capacity: u64) -> Self {
        Self {
            root,
            capacity,
            mounted: false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn used_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }
}

impl Volume for DirectoryVolume {
    fn mount_point(&self) -> &Path {
        &self.root
    }

    fn mount(&mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        self.mounted = true;
        tracing::debug!("mounted {}", self.root.display());
        Ok(())
    }

    fn unmount(&mut self) {
        if self.mounted {
            self.mounted = false;
            tracing::debug!("unmounted {}", self.root.display());
        }
    }

    fn info(&self) -> std::io::Result<VolumeInfo> {
        if !self.mounted {
            return Err(std::io::Error::new(
                ErrorKind::NotConnected,
                "volume is not mounted",
            ));
        }
        Ok(VolumeInfo {
            total_bytes: self.capacity,
            available_bytes: self.capacity.saturating_sub(self.used_bytes()),
        })
    }
}

#[async_trait]
pub trait StorageHandle: AsyncWrite + AsyncSeek + Unpin + Send {
    async fn set_len(&mut self, len: u64) -> std::io::Result<()>;

    async fn sync(&mut self) -> std::io::Result<()> {
        self.flush().await
    }
}

#[async_trait]
impl StorageHandle for fs::File {
    async fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        fs::File::set_len(self, len).await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.flush().await?;
        self.sync_all().await
    }
}

/// Destination file on a mounted volume.
///
/// `written_bytes` only counts bytes that were fully written at the current
/// offset. Unless [`commit`](Self::commit) is called, the file is removed when
/// the target is closed or dropped.
pub struct StorageTarget<'v, H: StorageHandle = fs::File> {
    volume: Option<&'v mut dyn Volume>,
    path: PathBuf,
    handle: Option<H>,
    info: VolumeInfo,
    written_bytes: u64,
    committed: bool,
}

impl<'v> StorageTarget<'v, fs::File> {
    pub async fn open(
        volume: &'v mut dyn Volume,
        relative: &Path,
    ) -> Result<Self, TransferError> {
        let mount_point = volume.mount_point().to_path_buf();
        volume
            .mount()
            .map_err(|source| TransferError::storage("mount", &mount_point, source))?;

        let prepared = prepare(&*volume, &mount_point.join(relative)).await;
        match prepared {
            Ok((path, info, file)) => {
                tracing::info!(
                    "volume available size: {}, total size: {}",
                    info.available_bytes,
                    info.total_bytes
                );
                Ok(Self::with_handle(volume, path, info, file))
            }
            Err(err) => {
                volume.unmount();
                Err(err)
            }
        }
    }
}

async fn prepare(
    volume: &dyn Volume,
    path: &Path,
) -> Result<(PathBuf, VolumeInfo, fs::File), TransferError> {
    let info = volume
        .info()
        .map_err(|source| TransferError::storage("info", volume.mount_point(), source))?;

    match fs::remove_file(path).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(source) => return Err(TransferError::storage("remove", path, source)),
    }

    let file = fs::File::create(path)
        .await
        .map_err(|source| TransferError::storage("create", path, source))?;

    Ok((path.to_path_buf(), info, file))
}

impl<'v, H: StorageHandle> StorageTarget<'v, H> {
    /// Wraps an already opened handle on a mounted volume.
    pub fn with_handle(
        volume: &'v mut dyn Volume,
        path: PathBuf,
        info: VolumeInfo,
        handle: H,
    ) -> Self {
        Self {
            volume: Some(volume),
            path,
            handle: Some(handle),
            info,
            written_bytes: 0,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_capacity_bytes(&self) -> u64 {
        self.info.total_bytes
    }

    pub fn available_bytes(&self) -> u64 {
        self.info.available_bytes
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    fn handle_mut(&mut self) -> Result<&mut H, TransferError> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(TransferError::io(
                &self.path,
                std::io::Error::new(ErrorKind::NotConnected, "storage target is closed"),
            )),
        }
    }

    /// Sizes the file to `expected_size` up front and rewinds to offset 0.
    pub async fn preallocate(&mut self, expected_size: u64) -> Result<(), TransferError> {
        let path = self.path.clone();
        let handle = self.handle_mut()?;
        handle
            .seek(SeekFrom::Start(expected_size))
            .await
            .map_err(|source| TransferError::storage("preallocate", &path, source))?;
        handle
            .set_len(expected_size)
            .await
            .map_err(|source| TransferError::storage("preallocate", &path, source))?;
        handle
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|source| TransferError::storage("preallocate", &path, source))?;
        Ok(())
    }

    /// Appends `buf` at `written_bytes`.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        let path = self.path.clone();
        let offset = self.written_bytes;
        let handle = self.handle_mut()?;

        // Always position explicitly; the cursor is not trusted across calls.
        handle
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| TransferError::io(&path, source))?;

        let mut written = 0;
        while written < buf.len() {
            match handle.write(&buf[written..]).await {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(TransferError::io(&path, source)),
            }
        }
        if written != buf.len() {
            return Err(TransferError::ShortWrite {
                path: path.display().to_string(),
                requested: buf.len(),
                written,
            });
        }
        // Device errors on buffered handles only surface here.
        handle
            .flush()
            .await
            .map_err(|source| TransferError::io(&path, source))?;

        self.written_bytes += buf.len() as u64;
        Ok(())
    }

    /// Flushes buffered data to the device.
    pub async fn sync(&mut self) -> Result<(), TransferError> {
        let path = self.path.clone();
        self.handle_mut()?
            .sync()
            .await
            .map_err(|source| TransferError::io(&path, source))
    }

    /// Keeps the file in place when the target is closed.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn close_and_unmount(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(handle);
            if !self.committed {
                match std::fs::remove_file(&self.path) {
                    Ok(_) => tracing::debug!("removed partial file {}", self.path.display()),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!("failed to remove {}: {err}", self.path.display())
                    }
                }
            }
        }
        if let Some(volume) = self.volume.take() {
            volume.unmount();
        }
    }

    #[cfg(test)]
    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }
}

impl<H: StorageHandle> Drop for StorageTarget<'_, H> {
    fn drop(&mut self) {
        self.close_and_unmount();
    }
}
