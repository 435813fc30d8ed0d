//!
//! # 远端探测
//! 下载前先探测远端资源：大小、Content-MD5、是否支持 Range、重定向后的最终地址
//!

use headers::{ContentLength, HeaderMapExt};
use log::debug;
use reqwest::header::{HeaderMap, ACCEPT_RANGES};
use reqwest::Client;

use crate::download::error::DownloadError;

#[derive(Debug, Clone)]
pub struct FileInfo {
    /// None 表示远端没有报告大小
    pub file_size: Option<u64>,
    /// 服务器给出的 Content-MD5，没有则为空串
    pub content_md5: String,
    pub accept_ranges: bool,
    /// 跟随重定向之后的最终地址，分片传输用它而不是原始 URL
    pub final_url: String,
}

/// 用 HEAD（或不读 body 的 GET）拿响应头。
/// 只接受 200 与 350；350 是 FTP 的过渡应答码，保留兼容，不扩展到其它 3xx
pub async fn fetch_file_info(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    use_head_method: bool,
) -> Result<FileInfo, DownloadError> {
    let request = if use_head_method {
        client.head(url)
    } else {
        client.get(url)
    };

    let response = request.headers(headers.clone()).send().await?;

    let status = response.status();
    if status.as_u16() != 200 && status.as_u16() != 350 {
        return Err(DownloadError::UnexpectedStatus(status));
    }

    let file_size = response
        .headers()
        .typed_get::<ContentLength>()
        .map(|length| length.0);

    let content_md5 = response
        .headers()
        .get("content-md5")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    // 只有显式的 "none" 才认为不支持，缺失或其它值都按支持处理
    let accept_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .map(|value| !value.eq_ignore_ascii_case("none"))
        .unwrap_or(true);

    let final_url = response.url().to_string();
    debug!(
        "File info: size={:?} md5={} accept_ranges={} url={}",
        file_size, content_md5, accept_ranges, final_url
    );

    Ok(FileInfo {
        file_size,
        content_md5,
        accept_ranges,
        final_url,
    })
}
