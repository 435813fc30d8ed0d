//!
//! # 分片管理
//! 持有全部分片与目标文件、索引文件的句柄：
//! 负责切分任务、校验并复用历史进度、判断整体完成、收尾与善后
//!

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io;

use crate::download::error::DownloadResult;
use crate::download::hash::{verify_file_hash, HashType};
use crate::download::index_file::{IndexFile, IndexLoadError, SliceLayout};
use crate::download::options::{DownloadOptions, HashVerifyPolicy, UncompletedSliceSavePolicy};
use crate::download::slice::{Slice, SliceStatus};
use crate::download::target_file::TargetFile;

pub struct SliceManager {
    options: Arc<DownloadOptions>,
    url: String,
    final_path: PathBuf,
    /// 实际写入路径，设置了临时扩展名时与 final_path 不同
    write_path: PathBuf,
    index_file: IndexFile,
    origin_file_size: Option<u64>,
    content_md5: String,
    target: Option<Arc<TargetFile>>,
    slices: Vec<Arc<Slice>>,
}

impl SliceManager {
    pub fn new(options: Arc<DownloadOptions>, url: String, target_path: &Path) -> Self {
        let final_path = target_path.to_path_buf();
        let write_path = match &options.tmp_file_extension {
            Some(ext) => {
                let mut os = final_path.as_os_str().to_os_string();
                os.push(ext);
                PathBuf::from(os)
            }
            None => final_path.clone(),
        };

        Self {
            index_file: IndexFile::for_target(&final_path),
            final_path,
            write_path,
            options,
            url,
            origin_file_size: None,
            content_md5: String::new(),
            target: None,
            slices: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn origin_file_size(&self) -> Option<u64> {
        self.origin_file_size
    }

    pub fn set_origin_file_size(&mut self, size: Option<u64>) {
        self.origin_file_size = size;
    }

    pub fn set_content_md5(&mut self, content_md5: String) {
        self.content_md5 = content_md5;
    }

    pub fn slices(&self) -> &[Arc<Slice>] {
        &self.slices
    }

    pub fn slice_by_index(&self, index: u32) -> Option<Arc<Slice>> {
        self.slices.get(index as usize).cloned()
    }

    /// 按分片序号线性扫描，取第一个命中，保证失败重试的顺序可复现
    pub fn slice_with_status(&self, status: SliceStatus) -> Option<Arc<Slice>> {
        self.slices.iter().find(|s| s.status() == status).cloned()
    }

    pub fn unfetched_slice_count(&self) -> u32 {
        self.slices
            .iter()
            .filter(|s| s.status() == SliceStatus::Unfetch)
            .count() as u32
    }

    pub fn total_downloaded(&self) -> u64 {
        self.slices.iter().map(|s| s.completed()).sum()
    }

    /// 所有分片都有界且收满才算按大小完成
    pub fn check_all_slices_completed(&self) -> bool {
        !self.slices.is_empty() && self.slices.iter().all(|s| s.is_data_completed_clearly())
    }

    fn all_slices_done(&self) -> bool {
        !self.slices.is_empty()
            && self
                .slices
                .iter()
                .all(|s| s.is_data_completed_clearly() || s.status() == SliceStatus::Completed)
    }

    /// 尝试加载并校验历史索引，任何一项不满足都会丢弃索引并返回 false
    pub async fn load_exist_slices(&mut self, expected_size: Option<u64>, expected_md5: &str) -> bool {
        let layout = match self.index_file.load().await {
            Ok(layout) => layout,
            Err(IndexLoadError::NotFound) => return false,
            Err(IndexLoadError::Corrupt) => {
                warn!("Index file corrupt, discarded: {:?}", self.index_file.path());
                self.discard_stale_state().await;
                return false;
            }
        };

        if layout.origin_file_size != expected_size {
            info!(
                "Index size mismatch (index: {:?}, remote: {:?}), discarded",
                layout.origin_file_size, expected_size
            );
            self.discard_stale_state().await;
            return false;
        }

        if !layout.content_md5.is_empty()
            && !expected_md5.is_empty()
            && layout.content_md5 != expected_md5
        {
            info!("Index content-md5 mismatch, discarded");
            self.discard_stale_state().await;
            return false;
        }

        let least_size = layout
            .slices
            .iter()
            .map(|r| r.begin + r.completed)
            .max()
            .unwrap_or(0);
        let target =
            match TargetFile::open_existing(&self.write_path, expected_size.unwrap_or(least_size)).await {
                Ok(target) => target,
                Err(err) => {
                    info!("Target file unusable ({}), index discarded", err);
                    self.discard_stale_state().await;
                    return false;
                }
            };

        let file_len = match target.len().await {
            Ok(len) => len,
            Err(_) => {
                self.discard_stale_state().await;
                return false;
            }
        };
        if layout
            .slices
            .iter()
            .any(|r| r.completed > 0 && r.begin + r.completed > file_len)
        {
            info!("Target file shorter than recorded progress, index discarded");
            self.discard_stale_state().await;
            return false;
        }

        let target = Arc::new(target);
        self.slices = layout
            .slices
            .iter()
            .map(|record| Arc::new(Slice::from_record(record, target.clone())))
            .collect();
        self.origin_file_size = layout.origin_file_size;
        self.content_md5 = if layout.content_md5.is_empty() {
            expected_md5.to_string()
        } else {
            layout.content_md5
        };
        self.target = Some(target);

        info!(
            "Resume from index: {} slices, {} bytes already done",
            self.slices.len(),
            self.total_downloaded()
        );

        true
    }

    async fn discard_stale_state(&self) {
        let _ = self.index_file.remove().await;

        // 布局作废后旧数据无法复用，丢弃策略下直接清空目标文件
        if self.options.uncompleted_slice_save_policy == UncompletedSliceSavePolicy::AlwaysDiscard {
            if let Ok(file) = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.write_path)
                .await
            {
                let _ = file.set_len(0).await;
            }
        }
    }

    /// 重新切分并创建目标文件
    pub async fn make_slices(&mut self, accept_ranges: bool) -> Result<(), DownloadResult> {
        let spans = partition(
            self.origin_file_size,
            accept_ranges,
            self.options.thread_num,
            self.options.max_slice_count,
            self.options.min_slice_size,
        );

        let target = TargetFile::create(&self.write_path, self.origin_file_size.unwrap_or(0))
            .await
            .map_err(|err| {
                error!("Create target file failed: {}", err);
                DownloadResult::CreateTargetFileFailed
            })?;
        let target = Arc::new(target);

        self.slices = spans
            .iter()
            .enumerate()
            .map(|(i, (begin, end))| Arc::new(Slice::new(i as u32, *begin, *end, target.clone())))
            .collect();
        self.target = Some(target);

        info!("Made {} slices for {:?} bytes", self.slices.len(), self.origin_file_size);

        Ok(())
    }

    pub async fn flush_all_slices(&self) -> io::Result<()> {
        for slice in &self.slices {
            slice.flush_cache().await?;
        }

        Ok(())
    }

    fn snapshot_layout(&self) -> SliceLayout {
        let mut layout = SliceLayout::new(
            self.url.clone(),
            self.origin_file_size,
            self.content_md5.clone(),
        );
        if self.options.expected_hash.is_some() {
            layout.hash_type = Some(self.options.hash_type);
            layout.expected_hash = self.options.expected_hash.clone();
        }
        layout.slices = self.slices.iter().map(|s| s.to_record()).collect();

        layout
    }

    pub async fn store_index(&self) -> io::Result<()> {
        self.index_file.store(&self.snapshot_layout()).await
    }

    /// 校验策略要求比对时给出 (摘要类型, 期望值)
    fn hash_to_verify(&self) -> Option<(HashType, String)> {
        match self.options.hash_verify_policy {
            HashVerifyPolicy::Never => None,
            HashVerifyPolicy::AlwaysVerify | HashVerifyPolicy::OnlyIfAvailable => {
                if let Some(expected) = &self.options.expected_hash {
                    return Some((self.options.hash_type, expected.clone()));
                }
                if !self.content_md5.is_empty() {
                    return Some((HashType::Md5, self.content_md5.clone()));
                }
                if self.options.hash_verify_policy == HashVerifyPolicy::AlwaysVerify {
                    warn!("AlwaysVerify is set but no expected hash available, skip verify");
                }
                None
            }
        }
    }

    /// 收尾：刷盘、修正大小、摘要校验、索引删除或保存。
    /// was_downloading 为 false 表示本轮根本没有发起过传输
    pub async fn finish(
        &mut self,
        was_downloading: bool,
        stop_was_set: bool,
        first_fatal: Option<DownloadResult>,
    ) -> DownloadResult {
        if let Err(err) = self.flush_all_slices().await {
            error!("Flush slices failed: {}", err);
        }
        if let Some(target) = &self.target {
            let _ = target.sync().await;
        }

        // 大小未知的下载按实际收到的字节数定型
        if self.origin_file_size.is_none() {
            let total = self.total_downloaded();
            if let Some(target) = &self.target {
                let _ = target.truncate_to(total).await;
            }
            self.origin_file_size = Some(total);
        }

        if self.all_slices_done() {
            if let Some((hash_type, expected)) = self.hash_to_verify() {
                match verify_file_hash(&self.write_path, hash_type, &expected) {
                    Ok(true) => info!("Hash verify passed"),
                    Ok(false) => {
                        warn!("Hash verify failed, expected: {}", expected);
                        let _ = tokio::fs::remove_file(&self.write_path).await;
                        let _ = self.index_file.remove().await;
                        return DownloadResult::HashVerifyFailed;
                    }
                    Err(err) => {
                        error!("Hash compute failed: {}", err);
                        return DownloadResult::OpenTargetFileFailed;
                    }
                }
            }

            if let Err(err) = self.index_file.remove().await {
                warn!("Remove index file failed: {}", err);
            }
            if self.write_path != self.final_path {
                if let Err(err) = tokio::fs::rename(&self.write_path, &self.final_path).await {
                    error!("Rename to final path failed: {}", err);
                    return DownloadResult::CreateTargetFileFailed;
                }
            }

            return DownloadResult::Success;
        }

        let mut store_failed = false;
        match self.options.uncompleted_slice_save_policy {
            UncompletedSliceSavePolicy::AlwaysDiscard => {
                let _ = tokio::fs::remove_file(&self.write_path).await;
                let _ = self.index_file.remove().await;
            }
            UncompletedSliceSavePolicy::SaveExceptFailed => {
                // 即使从未发起传输也要保存，布局本身就是进度的一部分
                let _ = was_downloading;
                if let Err(err) = self.store_index().await {
                    error!("Store index failed: {}", err);
                    store_failed = true;
                }
            }
        }

        if stop_was_set {
            return DownloadResult::Canceled;
        }
        if store_failed {
            return DownloadResult::WriteIndexFileFailed;
        }

        first_fatal.unwrap_or(DownloadResult::UnknownError)
    }
}

/// 切分算法：
/// 大小未知时只有一个开放分片；不支持 Range 时只有一个覆盖全文件的分片；
/// 其余情况按线程数等分（受 max_slice_count 与 min_slice_size 约束），余数归最后一片
fn partition(
    size: Option<u64>,
    accept_ranges: bool,
    thread_num: u32,
    max_slice_count: u32,
    min_slice_size: u64,
) -> Vec<(u64, Option<u64>)> {
    let Some(size) = size else {
        return vec![(0, None)];
    };
    debug_assert!(size > 0);
    if !accept_ranges {
        return vec![(0, Some(size - 1))];
    }

    let mut n = thread_num.clamp(1, max_slice_count.max(1)) as u64;
    while n > 1 && size.div_ceil(n) < min_slice_size.max(1) {
        n -= 1;
    }

    let per = size / n;
    (0..n)
        .map(|i| {
            let begin = i * per;
            let end = if i == n - 1 { size - 1 } else { begin + per - 1 };
            (begin, Some(end))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use super::*;

    fn options() -> Arc<DownloadOptions> {
        Arc::new(DownloadOptions::default())
    }

    fn manager_at(dir: &TempDir, options: Arc<DownloadOptions>) -> SliceManager {
        SliceManager::new(
            options,
            "http://localhost:23333/image.jpg".to_string(),
            &dir.path().join("image.jpg"),
        )
    }

    #[test]
    fn partition_should_split_evenly() {
        let spans = partition(Some(10 * 1024 * 1024), true, 4, 100, 16 * 1024);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0], (0, Some(2_621_439)));
        assert_eq!(spans[3], (3 * 2_621_440, Some(10 * 1024 * 1024 - 1)));

        // 区间必须正好连续
        for window in spans.windows(2) {
            assert_eq!(window[1].0, window[0].1.unwrap() + 1);
        }
    }

    #[test]
    fn partition_remainder_should_go_to_last() {
        let spans = partition(Some(100), true, 3, 100, 1);
        assert_eq!(spans, vec![(0, Some(32)), (33, Some(65)), (66, Some(99))]);
    }

    #[test]
    fn partition_should_respect_min_slice_size() {
        // 文件比 min_slice_size 还小，只能一片
        let spans = partition(Some(1000), true, 8, 100, 16 * 1024);
        assert_eq!(spans, vec![(0, Some(999))]);

        // 刚好容得下两片
        let spans = partition(Some(40 * 1024), true, 8, 100, 16 * 1024);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn partition_should_respect_max_slice_count() {
        let spans = partition(Some(1024 * 1024), true, 64, 4, 1);
        assert_eq!(spans.len(), 4);
    }

    #[test]
    fn partition_unknown_size_should_be_single_open_slice() {
        let spans = partition(None, true, 8, 100, 1);
        assert_eq!(spans, vec![(0, None)]);
    }

    #[test]
    fn partition_no_ranges_should_be_single_bounded_slice() {
        let spans = partition(Some(4096), false, 8, 100, 1);
        assert_eq!(spans, vec![(0, Some(4095))]);
    }

    #[tokio::test]
    async fn make_slices_should_preallocate_target() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_at(&dir, options());
        manager.set_origin_file_size(Some(1024 * 1024));

        manager.make_slices(true).await.unwrap();
        assert_eq!(manager.slices().len(), 3);
        assert_eq!(manager.unfetched_slice_count(), 3);

        let len = std::fs::metadata(dir.path().join("image.jpg")).unwrap().len();
        assert_eq!(len, 1024 * 1024);
    }

    #[tokio::test]
    async fn index_should_round_trip_through_manager() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_at(&dir, options());
        manager.set_origin_file_size(Some(200_000));
        manager.make_slices(true).await.unwrap();

        // 给第一个分片写入一段数据后保存
        let slice = manager.slice_by_index(0).unwrap();
        slice.write_bytes_for_test(&vec![9u8; 5000]).await;
        manager.flush_all_slices().await.unwrap();
        manager.store_index().await.unwrap();

        let mut restored = manager_at(&dir, options());
        assert!(restored.load_exist_slices(Some(200_000), "").await);
        assert_eq!(restored.total_downloaded(), 5000);
        assert_eq!(restored.slices().len(), manager.slices().len());
    }

    #[tokio::test]
    async fn size_mismatch_should_discard_index() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_at(&dir, options());
        manager.set_origin_file_size(Some(10_000));
        manager.make_slices(true).await.unwrap();
        manager.store_index().await.unwrap();

        let mut restored = manager_at(&dir, options());
        assert!(!restored.load_exist_slices(Some(20_000), "").await);
        // 索引必须已被删除
        assert!(!IndexFile::for_target(&dir.path().join("image.jpg")).exists());
    }

    #[tokio::test]
    async fn finish_should_verify_and_remove_index() {
        let dir = TempDir::new().unwrap();
        let content = b"hello world";

        let mut opts = DownloadOptions::default();
        opts.hash_verify_policy = HashVerifyPolicy::AlwaysVerify;
        opts.hash_type = HashType::Md5;
        opts.expected_hash = Some("5eb63bbbe01eeed093cb22bb8f5acdc3".to_string());

        let mut manager = manager_at(&dir, Arc::new(opts));
        manager.set_origin_file_size(Some(content.len() as u64));
        manager.make_slices(false).await.unwrap();
        manager.store_index().await.unwrap();

        let slice = manager.slice_by_index(0).unwrap();
        slice.write_bytes_for_test(content).await;

        let result = manager.finish(true, false, None).await;
        assert_eq!(result, DownloadResult::Success);
        assert!(!IndexFile::for_target(&dir.path().join("image.jpg")).exists());
        assert_eq!(std::fs::read(dir.path().join("image.jpg")).unwrap(), content);
    }

    #[tokio::test]
    async fn finish_should_fail_on_wrong_hash() {
        let dir = TempDir::new().unwrap();
        let content = b"hello world";

        let mut opts = DownloadOptions::default();
        opts.hash_verify_policy = HashVerifyPolicy::AlwaysVerify;
        opts.hash_type = HashType::Md5;
        opts.expected_hash = Some("00000000000000000000000000000000".to_string());

        let mut manager = manager_at(&dir, Arc::new(opts));
        manager.set_origin_file_size(Some(content.len() as u64));
        manager.make_slices(false).await.unwrap();

        let slice = manager.slice_by_index(0).unwrap();
        slice.write_bytes_for_test(content).await;

        let result = manager.finish(true, false, None).await;
        assert_eq!(result, DownloadResult::HashVerifyFailed);
        assert!(!dir.path().join("image.jpg").exists());
        assert!(!IndexFile::for_target(&dir.path().join("image.jpg")).exists());
    }

    #[tokio::test]
    async fn finish_incomplete_should_follow_save_policy() {
        // SaveExceptFailed：保留目标与索引
        let dir = TempDir::new().unwrap();
        let mut manager = manager_at(&dir, options());
        manager.set_origin_file_size(Some(100_000));
        manager.make_slices(true).await.unwrap();

        let result = manager.finish(true, true, None).await;
        assert_eq!(result, DownloadResult::Canceled);
        assert!(dir.path().join("image.jpg").exists());
        assert!(IndexFile::for_target(&dir.path().join("image.jpg")).exists());

        // AlwaysDiscard：两者都删掉
        let dir = TempDir::new().unwrap();
        let mut opts = DownloadOptions::default();
        opts.uncompleted_slice_save_policy = UncompletedSliceSavePolicy::AlwaysDiscard;
        let mut manager = manager_at(&dir, Arc::new(opts));
        manager.set_origin_file_size(Some(100_000));
        manager.make_slices(true).await.unwrap();

        let result = manager.finish(true, false, None).await;
        assert_eq!(result, DownloadResult::UnknownError);
        assert!(!dir.path().join("image.jpg").exists());
        assert!(!IndexFile::for_target(&dir.path().join("image.jpg")).exists());
    }

    #[tokio::test]
    async fn finish_unknown_size_should_truncate() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_at(&dir, options());
        manager.set_origin_file_size(None);
        manager.make_slices(true).await.unwrap();

        let slice = manager.slice_by_index(0).unwrap();
        slice.write_bytes_for_test(b"0123456789").await;
        slice.set_status(SliceStatus::Completed);

        let result = manager.finish(true, false, None).await;
        assert_eq!(result, DownloadResult::Success);
        assert_eq!(std::fs::read(dir.path().join("image.jpg")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn tmp_extension_should_rename_on_success() {
        let dir = TempDir::new().unwrap();
        let content = b"abcd";

        let mut opts = DownloadOptions::default();
        opts.tmp_file_extension = Some(".part".to_string());
        opts.hash_verify_policy = HashVerifyPolicy::Never;

        let mut manager = manager_at(&dir, Arc::new(opts));
        manager.set_origin_file_size(Some(4));
        manager.make_slices(false).await.unwrap();

        let tmp_path = dir.path().join("image.jpg.part");
        assert!(tmp_path.exists());

        let slice = manager.slice_by_index(0).unwrap();
        slice.write_bytes_for_test(content).await;

        let result = manager.finish(true, false, None).await;
        assert_eq!(result, DownloadResult::Success);
        assert!(!tmp_path.exists());
        assert_eq!(std::fs::read(dir.path().join("image.jpg")).unwrap(), content);
    }
}
