//! Bounded reads over locally stored unsealed sector files.
//!
//! Unsealed files are written sparsely up to the padded sector size; a byte
//! range counts as allocated when the file extends past its end.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncSeekExt};

use crate::error::{QuarryError, QuarryResult};
use crate::types::PaddedPieceSize;

pub struct PartialFile {
    file: tokio::fs::File,
    len: u64,
    max_piece_size: u64,
}

impl PartialFile {
    pub async fn open(max_piece_size: PaddedPieceSize, path: &Path) -> QuarryResult<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| QuarryError::storage(format!("open partial file {}", path.display()), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| QuarryError::storage("stat partial file", e))?
            .len();

        Ok(Self {
            file,
            len,
            max_piece_size: max_piece_size.0,
        })
    }

    pub fn has_allocated(&self, offset: PaddedPieceSize, size: PaddedPieceSize) -> bool {
        let end = offset.0.saturating_add(size.0);
        end <= self.max_piece_size && end <= self.len
    }

    /// Reader over `[offset, offset + size)`. The range must be allocated.
    pub async fn reader(
        mut self,
        offset: PaddedPieceSize,
        size: PaddedPieceSize,
    ) -> QuarryResult<Box<dyn AsyncRead + Send + Unpin>> {
        if !self.has_allocated(offset, size) {
            return Err(QuarryError::Storage {
                operation: "read partial file".to_string(),
                source: format!(
                    "range {}+{} not allocated (file length {})",
                    offset.0, size.0, self.len
                )
                .into(),
            });
        }

        self.file
            .seek(SeekFrom::Start(offset.0))
            .await
            .map_err(|e| QuarryError::storage("seek partial file", e))?;
        Ok(Box::new(tokio::io::AsyncReadExt::take(self.file, size.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn allocation_follows_file_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("unsealed");
        std::fs::write(&path, vec![7u8; 256]).unwrap();

        let pf = PartialFile::open(PaddedPieceSize(2048), &path).await.unwrap();
        assert!(pf.has_allocated(PaddedPieceSize(0), PaddedPieceSize(256)));
        assert!(pf.has_allocated(PaddedPieceSize(128), PaddedPieceSize(128)));
        assert!(!pf.has_allocated(PaddedPieceSize(128), PaddedPieceSize(256)));
        assert!(!pf.has_allocated(PaddedPieceSize(2048), PaddedPieceSize(128)));
    }

    #[tokio::test]
    async fn reader_is_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("unsealed");
        let mut data = vec![0u8; 64];
        data.extend_from_slice(&[1u8; 64]);
        data.extend_from_slice(&[2u8; 64]);
        std::fs::write(&path, &data).unwrap();

        let pf = PartialFile::open(PaddedPieceSize(192), &path).await.unwrap();
        let mut reader = pf
            .reader(PaddedPieceSize(64), PaddedPieceSize(64))
            .await
            .unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![1u8; 64]);
    }
}
