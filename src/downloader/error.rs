use std::path::PathBuf;

use thiserror::Error;

use crate::downloader::models::DuplicateTask;
use crate::parser::errors::ResolutionError;
use crate::post_process::merger::MergeError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("任务未找到: {0}")]
    TaskNotFound(u64),

    #[error("任务已存在: {0}")]
    TaskAlreadyExists(u64),

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("发现 {} 个重复任务", .0.len())]
    Duplicate(Vec<DuplicateTask>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("合并错误: {0}")]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// 任务文件写入错误，读取错误一律视为没有数据
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("写入任务文件失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("序列化任务信息失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 单次请求的错误
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("网络错误: {0}")]
    Transient(String),

    #[error("服务器返回错误状态码 {status}: {url}")]
    Status { status: u16, url: String },

    #[error("请求被限流 (429): {0}")]
    RateLimited(String),

    #[error("MD5 校验失败: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 原地重试（换下一个地址）
    Transient,
    /// 整个任务回到等待队列
    Requeue,
    /// 直接失败
    Permanent,
}

impl FetchError {
    pub fn from_status(status: u16, url: &str) -> Self {
        if status == 429 {
            FetchError::RateLimited(url.to_string())
        } else {
            FetchError::Status {
                status,
                url: url.to_string(),
            }
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Transient(_) | FetchError::ChecksumMismatch { .. } => FailureClass::Transient,
            FetchError::Status { status, .. } => {
                if *status >= 500 || *status == 408 {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            FetchError::RateLimited(_) => FailureClass::Requeue,
            FetchError::InvalidRequest(_) => FailureClass::Permanent,
            FetchError::Io(e) => match e.kind() {
                // 连接类错误可以重试，磁盘类错误重试也没用
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::Interrupted => FailureClass::Transient,
                _ => FailureClass::Permanent,
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            let url = e.url().map(|u| u.to_string()).unwrap_or_default();
            return FetchError::from_status(status.as_u16(), &url);
        }
        if e.is_builder() {
            return FetchError::InvalidRequest(e.to_string());
        }
        FetchError::Transient(e.to_string())
    }
}

impl From<crate::common::client::error::ApiError> for FetchError {
    fn from(e: crate::common::client::error::ApiError) -> Self {
        use crate::common::client::error::ApiError;
        match e {
            ApiError::Reqwest(inner) => inner.into(),
            other => FetchError::Transient(other.to_string()),
        }
    }
}
