//!
//! # 分片
//! 目标文件的一个连续字节区间，对应一条 Range 请求；
//! 收到的数据先进入内存缓存，写满或收尾时落盘到区间内的正确偏移
//!

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io;
use tokio::sync::Mutex;

use crate::download::error::DownloadError;
use crate::download::index_file::SliceRecord;
use crate::download::target_file::TargetFile;

/// 即使缓存一直不满，超过这个时间也要落一次盘，崩溃丢失的数据有上界。
/// 刷新只由分片自己的传输循环触发，驱动循环不碰在途分片的缓存
const CACHE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// 本轮还未调度过
    Unfetch,
    /// 已被选中，即将发起传输
    Fetched,
    /// 传输进行中
    Downloading,
    Completed,
    Failed,
    /// 传输正常结束，但分片是开放区间，是否完整还需要对账
    OkUnconfirmed,
}

pub struct Slice {
    index: u32,
    begin: u64,
    /// 闭区间终点，None 表示下到 EOF
    end: Option<u64>,
    /// 已接收字节数（含缓存中未落盘部分），单调不减
    completed: AtomicU64,
    /// 已落盘字节数，落盘偏移 = begin + flushed
    flushed: AtomicU64,
    failed_times: AtomicU32,
    status: parking_lot::Mutex<SliceStatus>,
    cache: Mutex<Vec<u8>>,
    target: Arc<TargetFile>,
}

impl Slice {
    pub fn new(index: u32, begin: u64, end: Option<u64>, target: Arc<TargetFile>) -> Self {
        Self {
            index,
            begin,
            end,
            completed: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            failed_times: AtomicU32::new(0),
            status: parking_lot::Mutex::new(SliceStatus::Unfetch),
            cache: Mutex::new(Vec::new()),
            target,
        }
    }

    /// 从索引记录恢复，缓存为空所以 flushed == completed
    pub fn from_record(record: &SliceRecord, target: Arc<TargetFile>) -> Self {
        let slice = Self::new(record.index, record.begin, record.end, target);
        slice.completed.store(record.completed, Ordering::Release);
        slice.flushed.store(record.completed, Ordering::Release);
        slice.failed_times.store(record.failed_times, Ordering::Release);
        if slice.is_data_completed_clearly() {
            *slice.status.lock() = SliceStatus::Completed;
        }

        slice
    }

    /// 持久化快照只记录已落盘的字节数，缓存里的数据崩溃后并不存在
    pub fn to_record(&self) -> SliceRecord {
        SliceRecord {
            index: self.index,
            begin: self.begin,
            end: self.end,
            completed: self.flushed.load(Ordering::Acquire),
            failed_times: self.failed_times.load(Ordering::Acquire),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn capacity(&self) -> Option<u64> {
        self.end.map(|end| end - self.begin + 1)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SliceStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SliceStatus) {
        *self.status.lock() = status;
    }

    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::Acquire)
    }

    pub fn increase_failed_times(&self) {
        self.failed_times.fetch_add(1, Ordering::AcqRel);
    }

    /// 区间有界并且收满时才算确定完成
    pub fn is_data_completed_clearly(&self) -> bool {
        match self.capacity() {
            Some(capacity) => self.completed.load(Ordering::Acquire) == capacity,
            None => false,
        }
    }

    /// 服务器不支持 Range 时无法从中间续传，只能从头再来
    pub async fn reset_progress(&self) {
        let mut cache = self.cache.lock().await;
        cache.clear();
        self.completed.store(0, Ordering::Release);
        self.flushed.store(0, Ordering::Release);
    }

    /// 执行本分片的一次传输。
    /// 从 begin + completed 续传；分片有界时发送闭区间 Range，
    /// 开放分片发送 `bytes=from-`；use_range 为 false 时不带 Range 头。
    pub async fn transfer(
        &self,
        client: &Client,
        url: &str,
        headers: HeaderMap,
        cache_capacity: usize,
        max_speed: Option<u64>,
        use_range: bool,
    ) -> Result<(), DownloadError> {
        self.set_status(SliceStatus::Downloading);

        if !use_range && self.completed.load(Ordering::Acquire) > 0 {
            self.reset_progress().await;
        }

        let from = self.begin + self.completed.load(Ordering::Acquire);
        if let Some(end) = self.end {
            if from > end {
                self.flush_cache().await?;
                return Ok(());
            }
        }

        let mut request = client.get(url).headers(headers);
        if use_range {
            let range = match self.end {
                Some(end) => format!("bytes={}-{}", from, end),
                None => format!("bytes={}-", from),
            };
            request = request.header(RANGE, range);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::UnexpectedStatus(status));
        }
        // 已有进度时必须拿到 206，否则数据会错位
        if use_range && from > self.begin && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::RangeNotSupported(status));
        }

        let mut limiter = SpeedLimiter::new(max_speed);
        let mut last_flush = Instant::now();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes: Bytes = chunk?;
            self.write_chunk(&bytes, cache_capacity).await?;
            if last_flush.elapsed() >= CACHE_FLUSH_INTERVAL {
                self.flush_cache().await?;
                last_flush = Instant::now();
            }
            limiter.throttle(bytes.len() as u64).await;
        }

        self.flush_cache().await?;

        Ok(())
    }

    /// 追加一段数据：超出分片终点的部分直接丢弃，
    /// 缓存装不下时先落盘，单块超过缓存容量时绕过缓存直写
    async fn write_chunk(&self, data: &[u8], cache_capacity: usize) -> io::Result<()> {
        let take = match self.capacity() {
            Some(capacity) => {
                let completed = self.completed.load(Ordering::Acquire);
                if completed >= capacity {
                    return Ok(());
                }
                data.len().min((capacity - completed) as usize)
            }
            None => data.len(),
        };
        if take == 0 {
            return Ok(());
        }
        let data = &data[..take];
        let capacity = cache_capacity.max(1);

        let mut cache = self.cache.lock().await;
        if cache.len() + data.len() > capacity {
            self.flush_locked(&mut cache).await?;
        }

        if data.len() >= capacity {
            let offset = self.begin + self.flushed.load(Ordering::Acquire);
            self.target.write_at(offset, data).await?;
            self.flushed.fetch_add(data.len() as u64, Ordering::AcqRel);
        } else {
            cache.extend_from_slice(data);
        }

        self.completed.fetch_add(take as u64, Ordering::AcqRel);

        Ok(())
    }

    /// 把缓存内容落盘，传输循环的定期刷新和收尾流程都会调用
    pub async fn flush_cache(&self) -> io::Result<()> {
        let mut cache = self.cache.lock().await;
        self.flush_locked(&mut cache).await
    }

    async fn flush_locked(&self, cache: &mut Vec<u8>) -> io::Result<()> {
        if cache.is_empty() {
            return Ok(());
        }

        let offset = self.begin + self.flushed.load(Ordering::Acquire);
        self.target.write_at(offset, cache).await?;
        self.flushed.fetch_add(cache.len() as u64, Ordering::AcqRel);
        cache.clear();

        Ok(())
    }

    #[cfg(test)]
    pub async fn write_bytes_for_test(&self, data: &[u8]) {
        self.write_chunk(data, 64 * 1024).await.unwrap();
        self.flush_cache().await.unwrap();
    }
}

/// 按一秒为窗口的简单限速器，None 表示不限速
struct SpeedLimiter {
    limit: Option<u64>,
    window_start: Instant,
    window_bytes: u64,
}

impl SpeedLimiter {
    fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    async fn throttle(&mut self, len: u64) {
        let Some(limit) = self.limit else {
            return;
        };

        self.window_bytes += len;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
            return;
        }

        if self.window_bytes >= limit {
            tokio::time::sleep(Duration::from_secs(1) - elapsed).await;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use super::*;

    async fn create_slice(dir: &TempDir, begin: u64, end: Option<u64>, file_size: u64) -> Slice {
        let path = dir.path().join("target.bin");
        let target = Arc::new(TargetFile::create(&path, file_size).await.unwrap());

        Slice::new(0, begin, end, target)
    }

    #[tokio::test]
    async fn write_chunk_should_fill_cache_then_flush() {
        let dir = TempDir::new().unwrap();
        let slice = create_slice(&dir, 0, Some(15), 16).await;

        // 缓存容量 8：前 6 字节留在缓存
        slice.write_chunk(b"abcdef", 8).await.unwrap();
        assert_eq!(slice.completed(), 6);
        assert_eq!(slice.flushed.load(Ordering::Acquire), 0);

        // 再来 6 字节装不下，先把缓存落盘
        slice.write_chunk(b"ghijkl", 8).await.unwrap();
        assert_eq!(slice.completed(), 12);
        assert_eq!(slice.flushed.load(Ordering::Acquire), 6);

        slice.flush_cache().await.unwrap();
        assert_eq!(slice.flushed.load(Ordering::Acquire), 12);

        let content = std::fs::read(dir.path().join("target.bin")).unwrap();
        assert_eq!(&content[..12], b"abcdefghijkl");
    }

    #[tokio::test]
    async fn write_chunk_should_discard_excess() {
        let dir = TempDir::new().unwrap();
        let slice = create_slice(&dir, 0, Some(3), 4).await;

        // 分片只有 4 字节，多余部分必须被丢掉
        slice.write_chunk(b"abcdefgh", 64).await.unwrap();
        assert_eq!(slice.completed(), 4);
        assert!(slice.is_data_completed_clearly());

        slice.write_chunk(b"zz", 64).await.unwrap();
        assert_eq!(slice.completed(), 4);

        slice.flush_cache().await.unwrap();
        let content = std::fs::read(dir.path().join("target.bin")).unwrap();
        assert_eq!(&content, b"abcd");
    }

    #[tokio::test]
    async fn big_chunk_should_bypass_cache() {
        let dir = TempDir::new().unwrap();
        let slice = create_slice(&dir, 0, Some(31), 32).await;

        slice.write_chunk(&[7u8; 32], 4).await.unwrap();
        assert_eq!(slice.flushed.load(Ordering::Acquire), 32);
        assert!(slice.is_data_completed_clearly());
    }

    #[tokio::test]
    async fn offset_slice_should_write_in_own_region() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.bin");
        let target = Arc::new(TargetFile::create(&path, 20).await.unwrap());
        let slice = Slice::new(1, 10, Some(19), target);

        slice.write_chunk(b"0123456789", 4).await.unwrap();
        slice.flush_cache().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[10..], b"0123456789");
        assert_eq!(&content[..10], &[0u8; 10]);
    }

    #[tokio::test]
    async fn record_round_trip_should_keep_progress() {
        let dir = TempDir::new().unwrap();
        let slice = create_slice(&dir, 0, Some(99), 100).await;
        slice.write_chunk(&[1u8; 40], 16).await.unwrap();
        slice.flush_cache().await.unwrap();
        slice.increase_failed_times();

        let record = slice.to_record();
        assert_eq!(record.completed, 40);
        assert_eq!(record.failed_times, 1);

        let path = dir.path().join("target.bin");
        let target = Arc::new(TargetFile::open_existing(&path, 100).await.unwrap());
        let restored = Slice::from_record(&record, target);
        assert_eq!(restored.completed(), 40);
        assert_eq!(restored.status(), SliceStatus::Unfetch);
    }

    #[tokio::test]
    async fn open_ended_slice_should_never_be_clearly_completed() {
        let dir = TempDir::new().unwrap();
        let slice = create_slice(&dir, 0, None, 0).await;

        slice.write_chunk(&[1u8; 128], 64).await.unwrap();
        assert!(!slice.is_data_completed_clearly());
        assert_eq!(slice.completed(), 128);
    }
}
