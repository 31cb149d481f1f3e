//! Block device I/O for ChronoFS

mod blockdev_trait;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device backed by a regular file or a raw block device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<File>,
    path: PathBuf,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new file-backed block device of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            block_count: size / BLOCK_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing file-backed block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::device_size(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    /// Size in bytes of a file or raw block device node
    fn device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            use std::os::unix::io::AsRawFd;

            let metadata = std::fs::metadata(path)?;
            if !metadata.file_type().is_block_device() {
                return Ok(metadata.len());
            }

            // BLKGETSIZE64 on Linux
            const BLKGETSIZE64: libc::c_ulong = 0x80081272;

            let file = std::fs::File::open(path)?;
            let mut size: u64 = 0;
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
            if rc == -1 {
                return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
            }
            Ok(size)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))
            .await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))
            .await?;
        file.write_all(data).await?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        self.file.lock().await.sync_all().await?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// In-memory sparse block device, used by tests and the bench harness.
/// Unwritten blocks read back as zeros.
#[derive(Debug, Default)]
pub struct MemBlockDevice {
    blocks: SyncMutex<HashMap<u64, Box<[u8; BLOCK_SIZE]>>>,
    block_count: u64,
}

impl MemBlockDevice {
    /// Create a sparse in-memory device with `block_count` blocks
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: SyncMutex::new(HashMap::new()),
            block_count,
        }
    }

    /// Number of blocks actually materialized
    pub fn resident_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        match self.blocks.lock().get(&block_num) {
            Some(data) => buf.copy_from_slice(&data[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        let mut block = Box::new([0u8; BLOCK_SIZE]);
        block.copy_from_slice(data);
        self.blocks.lock().insert(block_num, block);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_device_read_write() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8)
            .await
            .unwrap();

        let test_data = [0xAAu8; BLOCK_SIZE];
        device.write_block(0, &test_data).await.unwrap();

        let mut read_buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        for i in 1..8 {
            let data = [i as u8; BLOCK_SIZE];
            device.write_block(i, &data).await.unwrap();

            let mut read_data = [0u8; BLOCK_SIZE];
            device.read_block(i, &mut read_data).await.unwrap();
            assert_eq!(data, read_data);
        }
    }

    #[tokio::test]
    async fn test_read_only_device() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 2)
            .await
            .unwrap();
        let test_data = [0x55u8; BLOCK_SIZE];
        device.write_block(0, &test_data).await.unwrap();
        device.sync().await.unwrap();
        drop(device);

        let read_only = FileBackedBlockDevice::open(&file_path, true).await.unwrap();

        let mut read_buf = [0u8; BLOCK_SIZE];
        read_only.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        let write_result = read_only.write_block(0, &[0u8; BLOCK_SIZE]).await;
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_mem_device_sparse_reads() {
        let device = MemBlockDevice::new(64);

        let mut buf = [0xFFu8; BLOCK_SIZE];
        device.read_block(10, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(device.resident_blocks(), 0);

        device.write_block(10, &[7u8; BLOCK_SIZE]).await.unwrap();
        device.read_block(10, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 7));

        let out_of_range = device.read_block(64, &mut buf).await;
        assert!(matches!(
            out_of_range,
            Err(BlockDeviceError::InvalidBlockNumber(64))
        ));
    }
}
