//!
//! # slice-downloader
//! 可断点续传的多分片 HTTP 下载库。
//! 一个 [`FileDownloader`] 对应一次下载：按字节区间并发拉取，
//! 进度持久化在目标文件旁的索引文件里，进程重启后可以继续
//!

pub mod download;

use parking_lot::Mutex;
use reqwest::Client;

pub use download::{
    DownloadCallbacks, DownloadError, DownloadOptions, DownloadResult, DownloadStartError,
    DownloadState, FileDownloader, HashType, HashVerifyPolicy, StopEvent,
    UncompletedSliceSavePolicy,
};

struct GlobalTransport {
    client: Client,
    refs: usize,
}

static GLOBAL_TRANSPORT: Mutex<Option<GlobalTransport>> = Mutex::new(None);

/// 进程级初始化：建立被所有默认配置的下载共享的传输客户端。
/// 可以重复调用，与 [`uninit`] 成对使用，按引用计数释放
pub fn init() {
    let mut global = GLOBAL_TRANSPORT.lock();
    match global.as_mut() {
        Some(transport) => transport.refs += 1,
        None => match Client::builder().build() {
            Ok(client) => *global = Some(GlobalTransport { client, refs: 1 }),
            Err(err) => log::error!("Init shared transport client failed: {}", err),
        },
    }
}

pub fn uninit() {
    let mut global = GLOBAL_TRANSPORT.lock();
    if let Some(transport) = global.as_mut() {
        transport.refs = transport.refs.saturating_sub(1);
        if transport.refs == 0 {
            *global = None;
        }
    }
}

/// 未调用 init 时返回 None，下载实例会退回到自建客户端
pub(crate) fn shared_client() -> Option<Client> {
    GLOBAL_TRANSPORT.lock().as_ref().map(|t| t.client.clone())
}
