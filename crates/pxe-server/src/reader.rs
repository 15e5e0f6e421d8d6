//! Readers handed to the TFTP and HTTP front ends

use bytes::Bytes;
use std::fmt;
use std::io;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// The content of one served file, read block by block.
pub enum BootReader {
    /// Generated or downloaded content held in memory.
    Memory(Bytes),
    /// A file under the TFTP root.
    File { file: File, size: u64 },
}

impl BootReader {
    /// A zero-length file.
    pub fn empty() -> Self {
        BootReader::Memory(Bytes::new())
    }

    /// Wraps an open file, reading its size up front.
    pub async fn open(file: File) -> io::Result<Self> {
        let size = file.metadata().await?.len();
        Ok(BootReader::File { file, size })
    }

    /// Bytes left to read.
    pub fn size(&self) -> u64 {
        match self {
            BootReader::Memory(bytes) => bytes.len() as u64,
            BootReader::File { size, .. } => *size,
        }
    }

    /// Fills `buf` as far as the content allows. A short count means the end was reached.
    pub async fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BootReader::Memory(bytes) => {
                let n = buf.len().min(bytes.len());
                buf[..n].copy_from_slice(&bytes.split_to(n));
                Ok(n)
            }
            BootReader::File { file, size } => {
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                *size = size.saturating_sub(filled as u64);
                Ok(filled)
            }
        }
    }

    /// Reads everything that is left.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            BootReader::Memory(bytes) => Ok(bytes),
            BootReader::File { mut file, size } => {
                let mut content = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
                file.read_to_end(&mut content).await?;
                Ok(Bytes::from(content))
            }
        }
    }
}

impl From<Bytes> for BootReader {
    fn from(bytes: Bytes) -> Self {
        BootReader::Memory(bytes)
    }
}

impl From<String> for BootReader {
    fn from(text: String) -> Self {
        BootReader::Memory(Bytes::from(text))
    }
}

impl fmt::Debug for BootReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootReader::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            BootReader::File { size, .. } => f.debug_struct("File").field("size", size).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_blocks() {
        let mut reader = BootReader::from("abcdefghij".to_string());
        assert_eq!(reader.size(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 4);
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ij");
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_reader() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 1500]).unwrap();
        let file = File::open(tmp.path()).await.unwrap();
        let mut reader = BootReader::open(file).await.unwrap();
        assert_eq!(reader.size(), 1500);
        let mut buf = vec![0u8; 512];
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 512);
        assert_eq!(reader.size(), 988);
        let rest = reader.into_bytes().await.unwrap();
        assert_eq!(rest.len(), 988);
    }
}
