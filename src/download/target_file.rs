//!
//! # 目标文件
//! 预先按远端大小创建的本地文件，供各分片在自己的区间内随机写入
//!

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub struct TargetFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl TargetFile {
    /// 创建固定大小的文件，稀疏文件即可，不需要预写零
    pub async fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = File::create(path).await?;
        file.set_len(size).await?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// 打开已存在的文件用于续传，长度不足时扩展到 least_size
    pub async fn open_existing(path: &Path, least_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        if file.metadata().await?.len() < least_size {
            file.set_len(least_size).await?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(())
    }

    pub async fn truncate_to(&self, size: u64) -> io::Result<()> {
        let file = self.file.lock().await;
        file.set_len(size).await
    }

    pub async fn sync(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_all().await
    }

    pub async fn len(&self) -> io::Result<u64> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
