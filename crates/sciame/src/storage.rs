//! Where the data of a torrent is read from and written to.
//!
//! The [`crate::piece::PieceManager`] is the only caller, it writes blocks
//! once their piece is verified and reads blocks to check local data and to
//! upload them.
use std::{
    fmt::Debug,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use hashbrown::HashMap;
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::RwLock,
};
use tracing::debug;

use crate::{
    descriptor::{FileEntry, TorrentDescriptor},
    error::Error,
};

pub trait Storage: Debug + Send + Sync + 'static {
    /// Read `len` bytes at `begin` of the piece `index`.
    ///
    /// Returns [`Error::BlockUnavailable`] if the data was never written.
    fn read_block(
        &self,
        index: usize,
        begin: u32,
        len: u32,
    ) -> BoxFuture<'_, Result<Vec<u8>, Error>>;

    fn write_block(
        &self,
        index: usize,
        begin: u32,
        data: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), Error>>;
}

/// Keeps the torrent in memory, mostly useful for tests and for small
/// torrents that are consumed by the same process.
#[derive(Debug)]
pub struct MemoryStorage {
    piece_length: u64,
    total_length: u64,
    data: RwLock<Vec<u8>>,
    /// byte ranges that were written, key: start, value: end.
    written: RwLock<HashMap<u64, u64>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        Self {
            piece_length: descriptor.piece_length as u64,
            total_length: descriptor.total_length,
            data: RwLock::new(vec![0; descriptor.total_length as usize]),
            written: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Storage that already has all the data of the torrent.
    pub fn with_data(descriptor: &TorrentDescriptor, mut data: Vec<u8>) -> Self {
        let mut written = HashMap::new();
        written.insert(0, data.len() as u64);
        data.resize(descriptor.total_length as usize, 0);

        Self {
            piece_length: descriptor.piece_length as u64,
            total_length: descriptor.total_length,
            data: RwLock::new(data),
            written: RwLock::new(written),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail, as a full disk would.
    pub fn fail_writes(&self, v: bool) {
        self.fail_writes.store(v, Ordering::Relaxed);
    }

    /// A copy of the whole torrent data.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.data.read().await.clone()
    }

    fn offset(&self, index: usize, begin: u32, len: u64) -> Result<u64, Error> {
        let start = index as u64 * self.piece_length + begin as u64;
        if start + len > self.total_length {
            return Err(Error::Storage(format!(
                "block at piece {index} offset {begin} is out of bounds"
            )));
        }
        Ok(start)
    }
}

/// If `[start, end)` is covered by the union of `ranges`.
fn covered(ranges: &HashMap<u64, u64>, start: u64, end: u64) -> bool {
    let mut sorted: Vec<(u64, u64)> =
        ranges.iter().map(|(s, e)| (*s, *e)).collect();
    sorted.sort_unstable();

    let mut cursor = start;
    for (s, e) in sorted {
        if s > cursor {
            break;
        }
        cursor = cursor.max(e);
        if cursor >= end {
            return true;
        }
    }
    cursor >= end
}

impl Storage for MemoryStorage {
    fn read_block(
        &self,
        index: usize,
        begin: u32,
        len: u32,
    ) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(async move {
            let start = self.offset(index, begin, len as u64)?;
            let end = start + len as u64;

            if !covered(&*self.written.read().await, start, end) {
                return Err(Error::BlockUnavailable { index, begin });
            }

            let data = self.data.read().await;
            Ok(data[start as usize..end as usize].to_vec())
        })
    }

    fn write_block(
        &self,
        index: usize,
        begin: u32,
        block: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(Error::Storage("no space left on device".into()));
            }

            let start = self.offset(index, begin, block.len() as u64)?;
            let end = start + block.len() as u64;

            let mut data = self.data.write().await;
            data[start as usize..end as usize].copy_from_slice(&block);
            drop(data);

            self.written.write().await.insert(start, end);
            Ok(())
        })
    }
}

/// Maps the pieces of a torrent to the files of its descriptor, under a
/// download directory.
///
/// A block may span more than one file.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    piece_length: u64,
    files: Vec<FileEntry>,
}

impl FileStorage {
    /// Single file torrents without a file list are written to `root/name`.
    pub fn new(root: impl Into<PathBuf>, descriptor: &TorrentDescriptor) -> Self {
        let files = if descriptor.files.is_empty() {
            vec![FileEntry {
                path: vec![descriptor.name.clone()],
                length: descriptor.total_length,
            }]
        } else {
            descriptor.files.clone()
        };

        Self {
            root: root.into(),
            piece_length: descriptor.piece_length as u64,
            files,
        }
    }

    fn file_path(&self, file: &FileEntry) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(file.path.iter());
        path
    }

    /// The slices of files that hold `len` bytes starting at the absolute
    /// torrent offset `start`, as (file, offset in file, len).
    fn segments(&self, start: u64, len: u64) -> Vec<(&FileEntry, u64, u64)> {
        let end = start + len;
        let mut segments = Vec::new();
        let mut file_start = 0;

        for file in &self.files {
            let file_end = file_start + file.length;
            if file_end > start && file_start < end {
                let from = start.max(file_start);
                let to = end.min(file_end);
                segments.push((file, from - file_start, to - from));
            }
            if file_end >= end {
                break;
            }
            file_start = file_end;
        }

        segments
    }
}

impl Storage for FileStorage {
    fn read_block(
        &self,
        index: usize,
        begin: u32,
        len: u32,
    ) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(async move {
            let start = index as u64 * self.piece_length + begin as u64;
            let mut buf = Vec::with_capacity(len as usize);

            for (file, offset, seg_len) in self.segments(start, len as u64) {
                let path = self.file_path(file);

                let storage_err =
                    |e: std::io::Error| Error::Storage(format!("{}: {e}", path.display()));

                let mut f = match OpenOptions::new().read(true).open(&path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::BlockUnavailable { index, begin });
                    }
                    Err(e) => return Err(storage_err(e)),
                };

                // files are created sparse, so a short file means the block
                // was never written.
                if f.metadata().await.map_err(storage_err)?.len() < offset + seg_len {
                    return Err(Error::BlockUnavailable { index, begin });
                }

                f.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(storage_err)?;
                let mut chunk = vec![0; seg_len as usize];
                f.read_exact(&mut chunk).await.map_err(storage_err)?;
                buf.extend_from_slice(&chunk);
            }

            if buf.len() != len as usize {
                return Err(Error::BlockUnavailable { index, begin });
            }

            Ok(buf)
        })
    }

    fn write_block(
        &self,
        index: usize,
        begin: u32,
        data: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let start = index as u64 * self.piece_length + begin as u64;
            let mut written = 0usize;

            for (file, offset, seg_len) in
                self.segments(start, data.len() as u64)
            {
                let path = self.file_path(file);

                if let Some(parent) = path.parent() {
                    create_dir_all(parent).await.map_err(|e| {
                        Error::Storage(format!("{}: {e}", parent.display()))
                    })?;
                }

                let mut f = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await
                    .map_err(|e| {
                        Error::Storage(format!("{}: {e}", path.display()))
                    })?;

                f.seek(std::io::SeekFrom::Start(offset)).await?;
                f.write_all(&data[written..written + seg_len as usize])
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                f.flush().await?;

                written += seg_len as usize;
            }

            if written != data.len() {
                return Err(Error::Storage(format!(
                    "block at piece {index} offset {begin} is out of bounds"
                )));
            }

            debug!("wrote {written} bytes of piece {index} at {begin}");
            Ok(())
        })
    }
}
