use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Response;
use tracing::debug;

use crate::common::client::client::BiliClient;
use crate::downloader::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// 已下载的字节数，大于 0 时请求 `Range: bytes=<offset>-`
    pub offset: u64,
    pub referer: Option<String>,
}

pub struct FetchResponse {
    pub status: u16,
    /// 本次响应体的长度
    pub content_length: Option<u64>,
    /// 十六进制的 MD5
    pub content_md5: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

/// 一次下载请求，重试由调用方负责
#[async_trait]
pub trait FetchGateway: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

pub struct HttpGateway {
    client: BiliClient,
}

impl HttpGateway {
    pub fn new(client: BiliClient) -> Self {
        Self { client }
    }

    fn content_md5(resp: &Response) -> Option<String> {
        resp.headers()
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_md5)
    }
}

#[async_trait]
impl FetchGateway for HttpGateway {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        debug!("请求 {} (offset={})", request.url, request.offset);
        let resp = self
            .client
            .get_raw_response(&request.url, request.offset, request.referer.as_deref())
            .await?;

        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let content_md5 = Self::content_md5(&resp);
        let body = resp.bytes_stream().map_err(FetchError::from).boxed();

        Ok(FetchResponse {
            status,
            content_length,
            content_md5,
            body,
        })
    }
}

/// Content-MD5 可能是 base64 也可能是十六进制，统一转成小写十六进制
pub fn normalize_md5(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(raw.to_ascii_lowercase());
    }
    let decoded = STANDARD.decode(raw).ok()?;
    if decoded.len() != 16 {
        return None;
    }
    Some(decoded.iter().map(|b| format!("{:02x}", b)).collect())
}
