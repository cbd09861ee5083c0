use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::error::{Result, SwarmError};

/// Writes downloaded chunks at their offsets in the output file. The file is
/// only created once the first chunk arrives.
pub struct ChunkWriter {
    path: PathBuf,
    chunk_size: u64,
    file: Option<File>,
    bytes: u64,
}

impl ChunkWriter {
    pub fn new(path: &Path, chunk_size: u64) -> ChunkWriter {
        ChunkWriter {
            path: path.to_path_buf(),
            chunk_size,
            file: None,
            bytes: 0,
        }
    }

    async fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(SwarmError::Storage)?;
                }
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)
                    .await
                    .map_err(SwarmError::Storage)?
            }
        };
        Ok(self.file.insert(file))
    }

    pub async fn write_chunk(&mut self, chunk_id: u64, block: &[u8]) -> Result<()> {
        let offset = chunk_id * self.chunk_size;
        let file = self.file().await?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(SwarmError::Storage)?;
        file.write_all(block).await.map_err(SwarmError::Storage)?;
        self.bytes += block.len() as u64;
        debug!("Wrote chunk {} ({} bytes) to {}", chunk_id, block.len(), self.path.display());
        Ok(())
    }

    /// Flushes to disk and returns the number of bytes written.
    pub async fn finish(mut self) -> Result<u64> {
        let bytes = self.bytes;
        let file = self.file().await?;
        file.flush().await.map_err(SwarmError::Storage)?;
        file.sync_all().await.map_err(SwarmError::Storage)?;
        Ok(bytes)
    }
}
