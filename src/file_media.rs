//! Loading compressed payloads out of files.
//!
//! A PPMd text block usually sits at a known offset inside a larger file
//! (an archive comment, a packed header). These helpers read just that byte
//! range and hand it to [`decode_text_block`].

use crate::block::decode_text_block;
use crate::error::Result;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Inclusive byte range of a payload inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadInterval {
    pub start: u64,
    pub end: u64,
}

impl ReadInterval {
    /// Number of bytes covered.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// A payload file on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileMedia {
    path: PathBuf,
    size: u64,
}

impl LocalFileMedia {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, size })
    }

    /// File size in bytes at open time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the bytes of `interval`; a range past the end of the file is an
    /// I/O error.
    pub fn read_range_sync(&self, interval: ReadInterval) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; interval.len()];
        if payload.is_empty() {
            return Ok(payload);
        }
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(interval.start))?;
        file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

/// Load a text block from `media` and decode at most `limit` bytes of it.
pub fn decode_media_range(media: &LocalFileMedia, interval: ReadInterval, limit: usize) -> Result<Vec<u8>> {
    let payload = media.read_range_sync(interval)?;
    decode_text_block(&payload, limit)
}

#[cfg(feature = "async")]
use std::future::Future;
#[cfg(feature = "async")]
use std::pin::Pin;

/// Asynchronous source of payload byte ranges, e.g. HTTP range requests.
#[cfg(feature = "async")]
#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
pub trait FileMedia: Send + Sync {
    fn read_range(
        &self,
        interval: ReadInterval,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + '_>>;
}

#[cfg(feature = "async")]
impl FileMedia for LocalFileMedia {
    fn read_range(
        &self,
        interval: ReadInterval,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + '_>> {
        Box::pin(async move {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut payload = vec![0u8; interval.len()];
            if payload.is_empty() {
                return Ok(payload);
            }
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(interval.start)).await?;
            file.read_exact(&mut payload).await?;
            Ok(payload)
        })
    }
}

/// Async variant of [`decode_media_range`].
///
/// Only the read is asynchronous; decoding runs to completion on the
/// calling task.
#[cfg(feature = "async")]
#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
pub async fn decode_media_range_async(
    media: &dyn FileMedia,
    interval: ReadInterval,
    limit: usize,
) -> Result<Vec<u8>> {
    let payload = media.read_range(interval).await?;
    decode_text_block(&payload, limit)
}
