use thiserror::Error;

use crate::common::client::error::ApiError;
use crate::common::models::DownloadType;
use crate::downloader::models::StreamKey;

/// 解析播放地址清单时的错误，解析失败的任务不会进入下载队列
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("播放地址数据格式错误: {0}")]
    Malformed(String),

    #[error("播放地址数据缺少 {0}")]
    MissingSection(&'static str),

    #[error("任务缺少 {0}，无法请求播放地址")]
    MissingIdentifier(&'static str),

    #[error("没有不高于 {requested} 的清晰度，可用: {available:?}")]
    QualityUnavailable { requested: i32, available: Vec<i32> },

    #[error("清单形态 {found} 与任务记录的 {expected} 不一致")]
    ShapeMismatch { expected: String, found: String },

    #[error("没有可以下载的流")]
    NoStreams,

    #[error("新的清单中没有 {0}")]
    MissingStream(StreamKey),

    #[error("不支持的任务类型: {0}")]
    UnsupportedSource(DownloadType),

    #[error("API错误: {0}")]
    Api(String),
}

impl From<ApiError> for ResolutionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::ApiError(code, message) => handle_api_error(code, &message, "视频"),
            other => ResolutionError::Api(other.to_string()),
        }
    }
}

/// 把 B站 的错误码翻译成可读的提示
pub fn handle_api_error(code: i64, message: &str, context: &str) -> ResolutionError {
    let hint = match code {
        -101 => format!("{}需要登录（-101）: {}。请设置 SESSDATA", context, message),
        -403 => format!(
            "{}访问被拒绝（-403）: {}。可能原因：权限不足、需要登录或Cookie已过期",
            context, message
        ),
        -404 => format!("{}不存在（-404）: {}。内容可能已被删除或ID错误", context, message),
        -10403 => format!(
            "{}需要大会员权限（-10403）: {}。请登录大会员账号或选择较低清晰度",
            context, message
        ),
        6001 => format!("{}地区限制（6001）: {}。此内容在当前地区不可观看", context, message),
        62002 => format!("{}不可见（62002）: {}。内容可能是私密视频", context, message),
        62012 => format!("{}审核中（62012）: {}。暂时无法访问", context, message),
        _ => format!("{}请求失败（{}）: {}", context, code, message),
    };
    ResolutionError::Api(hint)
}
