//!
//! # 下载器
//! 单个下载实例的公开接口与后台驱动循环：
//! 探测远端、装配分片、并发调度传输、定期刷盘、响应暂停与停止、收尾
//!

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::task::JoinHandle;
use url::Url;

use crate::download::error::{DownloadError, DownloadResult, DownloadStartError};
use crate::download::file_info::fetch_file_info;
use crate::download::hash::HashType;
use crate::download::options::{DownloadOptions, HashVerifyPolicy, UncompletedSliceSavePolicy};
use crate::download::progress::{ProgressReporter, SpeedMeter};
use crate::download::slice::{Slice, SliceStatus};
use crate::download::slice_manager::SliceManager;
use crate::download::stop_event::StopEvent;
use crate::download::target_file::TargetFile;

/// 传输轮询的单次等待上限，也是暂停与停止的响应粒度
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// 索引文件的定期重写间隔
const INDEX_STORE_INTERVAL: Duration = Duration::from_secs(10);
/// 暂停期间检查停止事件的步长
const PAUSE_WAIT: Duration = Duration::from_millis(50);

pub type ResultCallback = Box<dyn Fn(DownloadResult) + Send + Sync>;
pub type ProgressCallback = Box<dyn Fn(Option<u64>, u64) + Send + Sync>;
pub type SpeedCallback = Box<dyn Fn(u64) + Send + Sync>;
pub type VerboseCallback = Box<dyn Fn(&str) + Send + Sync>;

/// 回调都在驱动任务上执行，不要在里面再调用下载器本身
#[derive(Default)]
pub struct DownloadCallbacks {
    pub result: Option<ResultCallback>,
    pub progress: Option<ProgressCallback>,
    pub speed: Option<SpeedCallback>,
    pub verbose: Option<VerboseCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Stopped,
    Downloading,
    Paused,
}

const STATE_STOPPED: u8 = 0;
const STATE_DOWNLOADING: u8 = 1;
const STATE_PAUSED: u8 = 2;

/// 驱动任务与外部控制面共享的状态，全部可以跨线程读取
struct SharedState {
    state: AtomicU8,
    user_paused: AtomicBool,
    internal_stop: StopEvent,
    user_stop: Option<Arc<StopEvent>>,
    /// -1 表示未知
    origin_file_size: AtomicI64,
}

impl SharedState {
    fn new(user_stop: Option<Arc<StopEvent>>) -> Self {
        Self {
            state: AtomicU8::new(STATE_STOPPED),
            user_paused: AtomicBool::new(false),
            internal_stop: StopEvent::new(),
            user_stop,
            origin_file_size: AtomicI64::new(-1),
        }
    }

    fn state(&self) -> DownloadState {
        match self.state.load(Ordering::Acquire) {
            STATE_DOWNLOADING => DownloadState::Downloading,
            STATE_PAUSED => DownloadState::Paused,
            _ => DownloadState::Stopped,
        }
    }

    fn set_state(&self, state: DownloadState) {
        let value = match state {
            DownloadState::Stopped => STATE_STOPPED,
            DownloadState::Downloading => STATE_DOWNLOADING,
            DownloadState::Paused => STATE_PAUSED,
        };
        self.state.store(value, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.internal_stop.is_set()
            || self.user_stop.as_ref().map(|e| e.is_set()).unwrap_or(false)
    }

    fn store_origin(&self, size: Option<u64>) {
        self.origin_file_size
            .store(size.map(|n| n as i64).unwrap_or(-1), Ordering::Release);
    }
}

struct DriverCtx {
    options: Arc<DownloadOptions>,
    url: String,
    target_path: PathBuf,
    shared: Arc<SharedState>,
}

pub struct FileDownloader {
    options: DownloadOptions,
    shared: Arc<SharedState>,
}

impl FileDownloader {
    pub fn new() -> Self {
        Self {
            options: DownloadOptions::default(),
            shared: Arc::new(SharedState::new(None)),
        }
    }

    pub fn set_thread_num(&mut self, thread_num: u32) {
        self.options.thread_num = thread_num.max(1);
    }

    pub fn set_disk_cache_size(&mut self, bytes: u64) {
        self.options.disk_cache_size = bytes;
    }

    /// None 表示不限速
    pub fn set_max_speed(&mut self, bytes_per_sec: Option<u64>) {
        self.options.max_speed = bytes_per_sec;
    }

    pub fn set_http_headers(&mut self, headers: HashMap<String, String>) {
        self.options.http_headers = headers;
    }

    pub fn set_proxy(&mut self, proxy: &str) {
        self.options.proxy = Some(proxy.to_string());
    }

    pub fn set_cookie_list(&mut self, cookie_list: &str) {
        self.options.cookie_list = Some(cookie_list.to_string());
    }

    pub fn set_ca_path(&mut self, ca_path: impl Into<PathBuf>) {
        self.options.ca_path = Some(ca_path.into());
    }

    pub fn set_verify_peer_host(&mut self, verify: bool) {
        self.options.verify_peer_host = verify;
    }

    pub fn set_verify_peer_certificate(&mut self, verify: bool) {
        self.options.verify_peer_certificate = verify;
    }

    pub fn set_network_conn_timeout(&mut self, timeout: Duration) {
        self.options.network_conn_timeout = timeout;
    }

    pub fn set_fetch_file_info_retry(&mut self, retry: u32) {
        self.options.fetch_file_info_retry = retry;
    }

    pub fn set_slice_max_failed_times(&mut self, times: u32) {
        self.options.slice_max_failed_times = times;
    }

    pub fn set_min_slice_size(&mut self, size: u64) {
        self.options.min_slice_size = size;
    }

    pub fn set_max_slice_count(&mut self, count: u32) {
        self.options.max_slice_count = count;
    }

    pub fn set_hash_verify_policy(
        &mut self,
        policy: HashVerifyPolicy,
        hash_type: HashType,
        expected_hash: Option<String>,
    ) {
        self.options.hash_verify_policy = policy;
        self.options.hash_type = hash_type;
        self.options.expected_hash = expected_hash;
    }

    pub fn set_uncompleted_slice_save_policy(&mut self, policy: UncompletedSliceSavePolicy) {
        self.options.uncompleted_slice_save_policy = policy;
    }

    pub fn set_tmp_file_extension(&mut self, extension: &str) {
        self.options.tmp_file_extension = Some(extension.to_string());
    }

    pub fn set_user_stop_event(&mut self, event: Arc<StopEvent>) {
        self.options.user_stop_event = Some(event);
    }

    pub fn set_use_head_method_fetch_file_info(&mut self, use_head: bool) {
        self.options.use_head_method_fetch_file_info = use_head;
    }

    /// 启动下载，返回可等待最终结果的句柄；result 回调也会被调用恰好一次。
    /// 生命周期控制（pause / resume / stop）继续走本实例
    pub fn start(
        &mut self,
        url: &str,
        target_path: impl AsRef<Path>,
        callbacks: DownloadCallbacks,
    ) -> Result<JoinHandle<DownloadResult>, DownloadStartError> {
        if self.shared.state() != DownloadState::Stopped {
            return Err(DownloadStartError::AlreadyDownloading);
        }

        Url::parse(url)?;

        let target_path = target_path.as_ref().to_path_buf();
        if let Some(parent) = target_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(DownloadStartError::DirectoryDoesNotExist);
            }
        }

        let shared = Arc::new(SharedState::new(self.options.user_stop_event.clone()));
        shared.set_state(DownloadState::Downloading);
        self.shared = shared.clone();

        let ctx = DriverCtx {
            options: Arc::new(self.options.clone()),
            url: url.to_string(),
            target_path,
            shared,
        };

        Ok(tokio::spawn(run_download(ctx, callbacks)))
    }

    /// 协作式暂停：在途请求不中断，驱动循环停止拉取与轮询
    pub fn pause(&self) {
        if self.shared.state() == DownloadState::Downloading {
            self.shared.user_paused.store(true, Ordering::Release);
            self.shared.set_state(DownloadState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.shared.state() == DownloadState::Paused {
            self.shared.user_paused.store(false, Ordering::Release);
            self.shared.set_state(DownloadState::Downloading);
        }
    }

    pub fn stop(&self) {
        self.shared.internal_stop.set();
        self.shared.set_state(DownloadState::Stopped);
    }

    pub fn state(&self) -> DownloadState {
        self.shared.state()
    }

    pub fn origin_file_size(&self) -> Option<u64> {
        let size = self.shared.origin_file_size.load(Ordering::Acquire);
        (size >= 0).then_some(size as u64)
    }
}

impl Default for FileDownloader {
    fn default() -> Self {
        Self::new()
    }
}

fn verbose(callback: &Option<VerboseCallback>, message: &str) {
    debug!("{}", message);
    if let Some(callback) = callback {
        callback(message);
    }
}

async fn run_download(ctx: DriverCtx, mut callbacks: DownloadCallbacks) -> DownloadResult {
    let result = drive(&ctx, &mut callbacks).await;

    ctx.shared.set_state(DownloadState::Stopped);
    ctx.shared.internal_stop.set();

    verbose(&callbacks.verbose, &format!("Download end: {}", result.as_str()));
    if let Some(callback) = callbacks.result.take() {
        callback(result);
    }

    result
}

async fn drive(ctx: &DriverCtx, callbacks: &mut DownloadCallbacks) -> DownloadResult {
    let options = &ctx.options;
    let thread_num = options.thread_num.max(1);

    verbose(&callbacks.verbose, &format!("URL: {}", ctx.url));
    verbose(&callbacks.verbose, &format!("Thread number: {}", thread_num));
    verbose(
        &callbacks.verbose,
        &format!("Target file path: {:?}", ctx.target_path),
    );

    let client = match make_client(options) {
        Ok(client) => client,
        Err(err) => {
            error!("Init transport client failed: {}", err);
            return DownloadResult::InitTransportFailed;
        }
    };
    let request_headers = options.request_headers();

    // 探测远端信息，失败按配置重试，停止事件随时打断
    let mut file_info = None;
    let mut try_times = 0u32;
    loop {
        match fetch_file_info(
            &client,
            &ctx.url,
            &request_headers,
            options.use_head_method_fetch_file_info,
        )
        .await
        {
            Ok(info) => {
                file_info = Some(info);
                break;
            }
            Err(err) => warn!("Fetch file info failed: {}", err),
        }

        if ctx.shared.stopped() {
            break;
        }
        try_times += 1;
        if try_times > options.fetch_file_info_retry {
            break;
        }
        info!("Fetching file info, retry...");
    }

    if ctx.shared.stopped() {
        return DownloadResult::Canceled;
    }
    let Some(file_info) = file_info else {
        return DownloadResult::FetchFileInfoFailed;
    };
    verbose(
        &callbacks.verbose,
        &format!("File size: {:?} bytes", file_info.file_size),
    );

    // 空文件直接创建目标即可，整个下载到此为止
    if file_info.file_size == Some(0) {
        return match TargetFile::create(&ctx.target_path, 0).await {
            Ok(_) => DownloadResult::Success,
            Err(err) => {
                error!("Create empty target file failed: {}", err);
                DownloadResult::CreateTargetFileFailed
            }
        };
    }

    let effective_url = if file_info.final_url.is_empty() {
        ctx.url.clone()
    } else {
        file_info.final_url.clone()
    };
    let mut manager = SliceManager::new(options.clone(), effective_url, &ctx.target_path);

    if !manager
        .load_exist_slices(file_info.file_size, &file_info.content_md5)
        .await
    {
        manager.set_origin_file_size(file_info.file_size);
        manager.set_content_md5(file_info.content_md5.clone());
        if let Err(result) = manager.make_slices(file_info.accept_ranges).await {
            return result;
        }
    }
    ctx.shared.store_origin(manager.origin_file_size());

    if manager.origin_file_size().is_some() && manager.check_all_slices_completed() {
        info!("All slices have been downloaded");
        return manager.finish(false, ctx.shared.stopped(), None).await;
    }

    // 并发拉起首批分片
    let concurrency = manager.unfetched_slice_count().min(thread_num).max(1);
    let (cache_per_slice, speed_per_slice) = slice_budget(options, concurrency);
    debug!(
        "Disk cache per slice: {} bytes, max speed per slice: {:?}",
        cache_per_slice, speed_per_slice
    );

    let transfer_url = manager.url().to_string();
    let use_range = file_info.accept_ranges;
    let mut in_flight: FuturesUnordered<BoxFuture<'static, (u32, Result<(), DownloadError>)>> =
        FuturesUnordered::new();

    while (in_flight.len() as u32) < thread_num {
        let Some(slice) = manager.slice_with_status(SliceStatus::Unfetch) else {
            break;
        };
        slice.set_status(SliceStatus::Fetched);
        info!("Slice<{}> start downloading", slice.index());
        in_flight.push(spawn_transfer(
            slice,
            client.clone(),
            transfer_url.clone(),
            request_headers.clone(),
            cache_per_slice,
            speed_per_slice,
            use_range,
        ));
    }

    if in_flight.is_empty() {
        warn!("No available slice");
        return DownloadResult::UnknownError;
    }

    let mut progress = callbacks
        .progress
        .take()
        .map(|cb| ProgressReporter::new(manager.origin_file_size(), cb));
    let mut speed = callbacks
        .speed
        .take()
        .map(|cb| SpeedMeter::new(manager.total_downloaded(), cb));

    let mut last_flush = Instant::now();
    let mut first_fatal: Option<DownloadResult> = None;

    loop {
        // 暂停时只维持停止检测与索引重写，不轮询传输，计数随之冻结
        if ctx.shared.user_paused.load(Ordering::Acquire) {
            if ctx.shared.internal_stop.wait(PAUSE_WAIT).await || ctx.shared.stopped() {
                break;
            }
            if ctx.shared.user_paused.load(Ordering::Acquire) {
                store_index_if_due(&manager, &mut last_flush, &mut first_fatal).await;
                continue;
            }
        }

        if ctx.shared.stopped() {
            break;
        }

        store_index_if_due(&manager, &mut last_flush, &mut first_fatal).await;

        if !in_flight.is_empty() {
            match tokio::time::timeout(POLL_TIMEOUT, in_flight.next()).await {
                Ok(Some((index, result))) => {
                    update_slice_status(&manager, index, result, &mut first_fatal)
                }
                Ok(None) | Err(_) => {}
            }
        }

        if let Some(reporter) = progress.as_mut() {
            reporter.tick(manager.total_downloaded());
        }
        if let Some(meter) = speed.as_mut() {
            meter.tick(manager.total_downloaded());
        }

        // 并发低于上限时补充新的分片，优先级：未下载 > 可重试的失败 > 开放分片对账
        while (in_flight.len() as u32) < thread_num {
            let Some(slice) = next_slice(&manager, options) else {
                break;
            };
            slice.set_status(SliceStatus::Fetched);
            let (cache_per_slice, speed_per_slice) =
                slice_budget(options, (in_flight.len() as u32) + 1);
            info!("Slice<{}> start downloading", slice.index());
            in_flight.push(spawn_transfer(
                slice,
                client.clone(),
                transfer_url.clone(),
                request_headers.clone(),
                cache_per_slice,
                speed_per_slice,
                use_range,
            ));
        }

        if in_flight.is_empty() {
            break;
        }
    }

    // 先丢弃在途传输，释放它们可能持有的文件与缓存锁，收尾才能安全刷盘
    drop(in_flight);

    if let Some(reporter) = progress.as_mut() {
        reporter.finish(manager.total_downloaded());
    }

    manager.finish(true, ctx.shared.stopped(), first_fatal).await
}

fn make_client(options: &DownloadOptions) -> Result<Client, DownloadError> {
    if options.needs_dedicated_client() {
        return options.build_client();
    }

    match crate::shared_client() {
        Some(client) => Ok(client),
        None => options.build_client(),
    }
}

fn slice_budget(options: &DownloadOptions, concurrency: u32) -> (usize, Option<u64>) {
    let n = concurrency.max(1) as u64;

    (
        (options.disk_cache_size / n) as usize,
        options.max_speed.map(|speed| (speed / n).max(1)),
    )
}

fn spawn_transfer(
    slice: Arc<Slice>,
    client: Client,
    url: String,
    headers: HeaderMap,
    cache_capacity: usize,
    max_speed: Option<u64>,
    use_range: bool,
) -> BoxFuture<'static, (u32, Result<(), DownloadError>)> {
    Box::pin(async move {
        let index = slice.index();
        let result = slice
            .transfer(&client, &url, headers, cache_capacity, max_speed, use_range)
            .await;
        (index, result)
    })
}

/// 处理一条传输完成消息
fn update_slice_status(
    manager: &SliceManager,
    index: u32,
    result: Result<(), DownloadError>,
    first_fatal: &mut Option<DownloadResult>,
) {
    let Some(slice) = manager.slice_by_index(index) else {
        return;
    };

    match result {
        Ok(()) => {
            if slice.is_data_completed_clearly() {
                debug!("Slice<{}> download completed", index);
                slice.set_status(SliceStatus::Completed);
            } else if slice.end().is_none() {
                // 开放分片正常收尾，是否真的下完交给对账
                slice.set_status(SliceStatus::OkUnconfirmed);
            } else {
                warn!("Slice<{}> ended before completion", index);
                slice.set_status(SliceStatus::Failed);
                slice.increase_failed_times();
            }
        }
        Err(err) => {
            warn!("Slice<{}> download failed: {}", index, err);
            if matches!(err, DownloadError::IOError(_)) {
                // 本地写失败重试也救不回来，记为致命错误
                first_fatal.get_or_insert(DownloadResult::OpenTargetFileFailed);
            }
            slice.set_status(SliceStatus::Failed);
            slice.increase_failed_times();
        }
    }
}

fn next_slice(manager: &SliceManager, options: &DownloadOptions) -> Option<Arc<Slice>> {
    if let Some(slice) = manager.slice_with_status(SliceStatus::Unfetch) {
        return Some(slice);
    }

    if let Some(slice) = manager.slice_with_status(SliceStatus::Failed) {
        if slice.failed_times() < options.slice_max_failed_times {
            info!("Re-download slice<{}>", slice.index());
            return Some(slice);
        }
        // 第一个失败分片重试耗尽后放弃调度，顺序保持确定
        return None;
    }

    if manager.slice_with_status(SliceStatus::Downloading).is_none()
        && manager.slice_with_status(SliceStatus::Fetched).is_none()
    {
        if let Some(slice) = manager.slice_with_status(SliceStatus::OkUnconfirmed) {
            // 开放分片只在大小未知时存在；此刻已无其它在途分片，视为下载完成
            if manager.origin_file_size().is_none() || manager.check_all_slices_completed() {
                slice.set_status(SliceStatus::Completed);
                return None;
            }
            info!("Re-download slice<{}>", slice.index());
            slice.set_status(SliceStatus::Failed);
            return Some(slice);
        }
    }

    None
}

/// 定期把当前进度快照重写进索引文件。
/// 快照只读原子计数并写独立的索引文件，不会与在途分片争锁
async fn store_index_if_due(
    manager: &SliceManager,
    last_store: &mut Instant,
    first_fatal: &mut Option<DownloadResult>,
) {
    if last_store.elapsed() < INDEX_STORE_INTERVAL {
        return;
    }

    if let Err(err) = manager.store_index().await {
        error!("Store index failed: {}", err);
        first_fatal.get_or_insert(DownloadResult::WriteIndexFileFailed);
    }
    *last_store = Instant::now();
}
