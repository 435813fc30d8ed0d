use reqwest::StatusCode;
use thiserror::Error;
use tokio::io;

/// 一次下载最终的结束状态，通过 result 回调与 start 返回的句柄给出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadResult {
    Success,
    Canceled,
    FetchFileInfoFailed,
    CreateTargetFileFailed,
    InitTransportFailed,
    HashVerifyFailed,
    OpenIndexFileFailed,
    WriteIndexFileFailed,
    OpenTargetFileFailed,
    UnknownError,
}

impl DownloadResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadResult::Success => "Success",
            DownloadResult::Canceled => "Canceled",
            DownloadResult::FetchFileInfoFailed => "FetchFileInfoFailed",
            DownloadResult::CreateTargetFileFailed => "CreateTargetFileFailed",
            DownloadResult::InitTransportFailed => "InitTransportFailed",
            DownloadResult::HashVerifyFailed => "HashVerifyFailed",
            DownloadResult::OpenIndexFileFailed => "OpenIndexFileFailed",
            DownloadResult::WriteIndexFileFailed => "WriteIndexFileFailed",
            DownloadResult::OpenTargetFileFailed => "OpenTargetFileFailed",
            DownloadResult::UnknownError => "UnknownError",
        }
    }
}

/// 下载中发生的错误
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Http request failed: {:?}", .0)]
    HttpRequestFailed(#[from] reqwest::Error),

    #[error("IOError: {:?}", .0)]
    IOError(#[from] io::Error),

    #[error("Unexpected http status: {0}")]
    UnexpectedStatus(StatusCode),

    // 发出了 Range 请求但服务器按完整文件应答，续传位置无法对齐
    #[error("Server ignored range request, status: {0}")]
    RangeNotSupported(StatusCode),
}

#[derive(Error, Debug)]
pub enum DownloadStartError {
    #[error("Invalid url: {:?}", .0)]
    InvalidUrl(#[from] url::ParseError),

    #[error("Already downloading")]
    AlreadyDownloading,

    #[error("Directory does not exist")]
    DirectoryDoesNotExist,
}
