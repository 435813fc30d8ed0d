//!
//! # 索引文件
//! 持久化分片布局与各分片进度的 sidecar 文件，用于断点恢复；
//! 写入采用临时文件 + fsync + rename，保证重写是原子的
//!

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};

use crate::download::hash::HashType;

const INDEX_MAGIC: &str = "SLDIDX";
const INDEX_VERSION: u32 = 1;
pub const INDEX_FILE_SUFFIX: &str = ".index";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceRecord {
    pub index: u32,
    pub begin: u64,
    /// 闭区间终点，None 表示直到 EOF（远端大小未知）
    pub end: Option<u64>,
    pub completed: u64,
    pub failed_times: u32,
}

impl SliceRecord {
    pub fn capacity(&self) -> Option<u64> {
        self.end.map(|end| end - self.begin + 1)
    }

    pub fn is_completed(&self) -> bool {
        self.capacity().map(|n| self.completed == n).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceLayout {
    pub magic: String,
    pub version: u32,
    pub url: String,
    pub origin_file_size: Option<u64>,
    pub content_md5: String,
    pub hash_type: Option<HashType>,
    pub expected_hash: Option<String>,
    pub slices: Vec<SliceRecord>,
}

impl SliceLayout {
    pub fn new(url: String, origin_file_size: Option<u64>, content_md5: String) -> Self {
        Self {
            magic: INDEX_MAGIC.to_string(),
            version: INDEX_VERSION,
            url,
            origin_file_size,
            content_md5,
            hash_type: None,
            expected_hash: None,
            slices: Vec::new(),
        }
    }

    fn is_well_formed(&self) -> bool {
        if self.magic != INDEX_MAGIC || self.version != INDEX_VERSION {
            return false;
        }
        if self.slices.is_empty() {
            return false;
        }

        // 分片必须正好连续覆盖 [0, origin_file_size)
        let mut expected_begin = 0u64;
        for (i, record) in self.slices.iter().enumerate() {
            if record.begin != expected_begin {
                return false;
            }
            match record.end {
                Some(end) => {
                    if end < record.begin || record.completed > end - record.begin + 1 {
                        return false;
                    }
                    expected_begin = end + 1;
                }
                // 开放分片只允许在末尾且大小未知时出现
                None => {
                    if self.origin_file_size.is_some() || i != self.slices.len() - 1 {
                        return false;
                    }
                }
            }
        }

        if let Some(size) = self.origin_file_size {
            if expected_begin != size {
                return false;
            }
        }

        true
    }
}

#[derive(Error, Debug)]
pub enum IndexLoadError {
    #[error("Index file not found")]
    NotFound,

    #[error("Index file corrupt")]
    Corrupt,
}

pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    /// 索引文件始终跟随最终目标路径，和临时扩展名无关
    pub fn for_target(target_path: &Path) -> Self {
        let mut os: OsString = target_path.as_os_str().to_os_string();
        os.push(INDEX_FILE_SUFFIX);

        Self { path: PathBuf::from(os) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn load(&self) -> Result<SliceLayout, IndexLoadError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(IndexLoadError::NotFound);
            }
            Err(_) => return Err(IndexLoadError::Corrupt),
        };

        let layout: SliceLayout = serde_json::from_str(&data).map_err(|_| IndexLoadError::Corrupt)?;
        if !layout.is_well_formed() {
            return Err(IndexLoadError::Corrupt);
        }

        Ok(layout)
    }

    pub async fn store(&self, layout: &SliceLayout) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(layout)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let mut tmp_os: OsString = self.path.as_os_str().to_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        let mut file = File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await
    }

    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
