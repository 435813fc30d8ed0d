//!
//! 测试用的进程内文件服务器：
//! 支持 Range / Accept-Ranges / Content-MD5，也能模拟大小未知的分块响应
//!

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

pub struct FileFixture {
    pub body: Vec<u8>,
    pub accept_ranges: bool,
    pub content_md5: Option<String>,
    /// false 时以分块方式应答，不带 Content-Length，模拟大小未知的资源
    pub known_length: bool,
}

impl FileFixture {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            accept_ranges: true,
            content_md5: None,
            known_length: true,
        }
    }
}

/// 绑定随机端口启动服务，返回资源地址
pub async fn spawn_file_server(fixture: FileFixture) -> String {
    let state = Arc::new(fixture);
    let app = Router::new().route("/file", get(serve_file)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/file", addr)
}

/// 生成内容可复现的测试数据
pub fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

async fn serve_file(
    State(fixture): State<Arc<FileFixture>>,
    request_headers: HeaderMap,
) -> Response {
    let total = fixture.body.len() as u64;

    let mut headers = HeaderMap::new();
    let ranges_value = if fixture.accept_ranges { "bytes" } else { "none" };
    headers.insert(header::ACCEPT_RANGES, ranges_value.parse().unwrap());
    if let Some(md5) = &fixture.content_md5 {
        headers.insert(HeaderName::from_static("content-md5"), md5.parse().unwrap());
    }

    if fixture.accept_ranges {
        if let Some(range) = request_headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
        {
            return match parse_range(range, total) {
                Some((start, end)) => {
                    headers.insert(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, total).parse().unwrap(),
                    );
                    let body = fixture.body[start as usize..=end as usize].to_vec();
                    (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
                }
                None => (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response(),
            };
        }
    }

    if !fixture.known_length {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = fixture
            .body
            .chunks(16 * 1024)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        let stream = futures_util::stream::iter(chunks);
        return (StatusCode::OK, headers, Body::from_stream(stream)).into_response();
    }

    (StatusCode::OK, headers, fixture.body.clone()).into_response()
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };

    if start > end || end >= total {
        return None;
    }

    Some((start, end))
}
