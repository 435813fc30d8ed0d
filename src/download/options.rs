//!
//! # 配置模块
//! 单个下载实例的全部可调参数，以及据此构建 reqwest 客户端
//!

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::Client;

use crate::download::hash::HashType;
use crate::download::stop_event::StopEvent;

/// 摘要校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVerifyPolicy {
    /// 从不校验
    Never,
    /// 总是校验，期望值来自调用方
    AlwaysVerify,
    /// 服务器给出 Content-MD5 或调用方给出期望值时才校验
    OnlyIfAvailable,
}

/// 未完成分片的保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncompletedSliceSavePolicy {
    /// 停止或失败时丢弃目标文件与索引
    AlwaysDiscard,
    /// 保留进度，下次对同一 URL + 路径可断点续传
    SaveExceptFailed,
}

pub const DEFAULT_THREAD_NUM: u32 = 3;
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MIN_SLICE_SIZE: u64 = 16 * 1024;
pub const DEFAULT_MAX_SLICE_COUNT: u32 = 100;
pub const DEFAULT_SLICE_MAX_FAILED_TIMES: u32 = 3;
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct DownloadOptions {
    pub thread_num: u32,
    pub disk_cache_size: u64,
    /// 整体限速，None 表示不限速
    pub max_speed: Option<u64>,
    pub http_headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub cookie_list: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub verify_peer_host: bool,
    pub verify_peer_certificate: bool,
    pub network_conn_timeout: Duration,
    pub fetch_file_info_retry: u32,
    pub slice_max_failed_times: u32,
    pub min_slice_size: u64,
    pub max_slice_count: u32,
    pub hash_verify_policy: HashVerifyPolicy,
    pub hash_type: HashType,
    pub expected_hash: Option<String>,
    pub uncompleted_slice_save_policy: UncompletedSliceSavePolicy,
    /// 设置后数据先写入 `<target><ext>`，成功时再改名
    pub tmp_file_extension: Option<String>,
    pub user_stop_event: Option<Arc<StopEvent>>,
    pub use_head_method_fetch_file_info: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            thread_num: DEFAULT_THREAD_NUM,
            disk_cache_size: DEFAULT_DISK_CACHE_SIZE,
            max_speed: None,
            http_headers: HashMap::new(),
            proxy: None,
            cookie_list: None,
            ca_path: None,
            verify_peer_host: true,
            verify_peer_certificate: true,
            network_conn_timeout: DEFAULT_CONN_TIMEOUT,
            fetch_file_info_retry: 1,
            slice_max_failed_times: DEFAULT_SLICE_MAX_FAILED_TIMES,
            min_slice_size: DEFAULT_MIN_SLICE_SIZE,
            max_slice_count: DEFAULT_MAX_SLICE_COUNT,
            hash_verify_policy: HashVerifyPolicy::OnlyIfAvailable,
            hash_type: HashType::Md5,
            expected_hash: None,
            uncompleted_slice_save_policy: UncompletedSliceSavePolicy::SaveExceptFailed,
            tmp_file_extension: None,
            user_stop_event: None,
            use_head_method_fetch_file_info: true,
        }
    }
}

impl DownloadOptions {
    /// 默认传输参数下可以直接复用全局共享的 Client
    pub fn needs_dedicated_client(&self) -> bool {
        self.proxy.is_some()
            || self.ca_path.is_some()
            || !self.verify_peer_host
            || !self.verify_peer_certificate
            || self.network_conn_timeout != DEFAULT_CONN_TIMEOUT
    }

    pub fn build_client(&self) -> Result<Client, crate::download::error::DownloadError> {
        let mut builder = Client::builder()
            .connect_timeout(self.network_conn_timeout)
            .danger_accept_invalid_certs(!self.verify_peer_certificate)
            .danger_accept_invalid_hostnames(!self.verify_peer_host);

        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        if let Some(ca_path) = &self.ca_path {
            let pem = std::fs::read(ca_path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(builder.build()?)
    }

    /// 每个请求都会携带的头，包含调用方自定义头与 cookie
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.http_headers {
            let name = match HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    warn!("Invalid http header name: {}", key);
                    continue;
                }
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => warn!("Invalid http header value for: {}", key),
            }
        }

        if let Some(cookie_list) = &self.cookie_list {
            if let Ok(value) = HeaderValue::from_str(cookie_list) {
                headers.insert(COOKIE, value);
            } else {
                warn!("Invalid cookie list, ignored");
            }
        }

        headers
    }
}
