//! The storage interface consumed by the scheduler/session, plus a
//! minimal single-file default implementation.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::types::Sha1Hash;

/// `read_piece`/`write_piece`/`verify_piece`/`piece_length`/`num_pieces`,
/// per §6's consumed "Storage interface". Blocking file IO runs on
/// `spawn_blocking`, the teacher's idiom for keeping disk work off the
/// async runtime's worker threads.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_piece(&self, index: usize) -> std::io::Result<Vec<u8>>;
    async fn write_piece(&self, index: usize, data: Vec<u8>) -> std::io::Result<()>;
    async fn verify_piece(&self, index: usize, expected: &Sha1Hash) -> std::io::Result<bool>;
    fn piece_length(&self, index: usize) -> usize;
    fn num_pieces(&self) -> usize;
}

/// Backs a single-file dataset with one pre-allocated file on disk.
/// Multi-file torrents are out of scope for the core library.
pub struct FileStorage {
    file: Arc<Mutex<std::fs::File>>,
    piece_length: u64,
    total_length: u64,
    num_pieces: usize,
}

impl FileStorage {
    /// Pre-allocates `path` to `total_length` bytes.
    pub async fn create(
        path: PathBuf,
        total_length: u64,
        piece_length: u64,
        num_pieces: usize,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(total_length)?;
            Ok(file)
        })
        .await
        .expect("pre-allocation task panicked")?;

        Ok(FileStorage {
            file: Arc::new(Mutex::new(file)),
            piece_length,
            total_length,
            num_pieces,
        })
    }

    fn length_of(&self, index: usize) -> usize {
        let is_last = index + 1 == self.num_pieces;
        if is_last {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 { self.piece_length as usize } else { remainder as usize }
        } else {
            self.piece_length as usize
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_piece(&self, index: usize) -> std::io::Result<Vec<u8>> {
        let offset = index as u64 * self.piece_length;
        let len = self.length_of(index);
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = file.blocking_lock();
            guard.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len];
            guard.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .expect("read task panicked")
    }

    async fn write_piece(&self, index: usize, data: Vec<u8>) -> std::io::Result<()> {
        let offset = index as u64 * self.piece_length;
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = file.blocking_lock();
            guard.seek(SeekFrom::Start(offset))?;
            guard.write_all(&data)
        })
        .await
        .expect("write task panicked")
    }

    async fn verify_piece(&self, index: usize, expected: &Sha1Hash) -> std::io::Result<bool> {
        let data = self.read_piece(index).await?;
        let digest = Sha1::digest(&data);
        Ok(digest.as_slice() == expected.as_bytes())
    }

    fn piece_length(&self, index: usize) -> usize {
        self.length_of(index)
    }

    fn num_pieces(&self) -> usize {
        self.num_pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back_a_piece() {
        let dir = std::env::temp_dir().join(format!("peerwire-core-test-{:p}", &dir_marker()));
        let path = dir.join("dataset.bin");
        let storage = FileStorage::create(path.clone(), 32, 16, 2).await.unwrap();

        let piece = vec![7u8; 16];
        storage.write_piece(0, piece.clone()).await.unwrap();
        let read_back = storage.read_piece(0).await.unwrap();
        assert_eq!(read_back, piece);

        let hash_bytes = Sha1::digest(&piece);
        let hash = Sha1Hash::try_from(hash_bytes.as_slice()).unwrap();
        assert!(storage.verify_piece(0, &hash).await.unwrap());

        let _ = std::fs::remove_file(&path);
    }

    fn dir_marker() -> u8 {
        0
    }
}
