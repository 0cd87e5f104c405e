use async_trait::async_trait;
use tracing::debug;

use crate::common::client::client::BiliClient;
use crate::common::models::DownloadType;
use crate::downloader::models::{StreamDescriptor, TaskRecord};
use crate::parser::errors::ResolutionError;
use crate::parser::playurl::PlayUrlApi;
use crate::parser::resolver::refresh_urls;
use crate::parser::stream_utils::StreamOptions;

/// 播放地址带有效期，恢复或重试的任务开始下载前重新获取
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn refresh(&self, record: &TaskRecord) -> Result<Vec<StreamDescriptor>, ResolutionError>;
}

pub struct PlayUrlSource {
    client: BiliClient,
    options: StreamOptions,
}

impl PlayUrlSource {
    pub fn new(client: BiliClient, options: StreamOptions) -> Self {
        Self { client, options }
    }
}

#[async_trait]
impl ManifestSource for PlayUrlSource {
    async fn refresh(&self, record: &TaskRecord) -> Result<Vec<StreamDescriptor>, ResolutionError> {
        // 弹幕和封面地址不会过期
        if record.download_type == DownloadType::Extra {
            return Ok(record.descriptors.clone());
        }

        debug!("重新获取任务 {} 的播放地址", record.id);
        let manifest = PlayUrlApi::new(&self.client).fetch_manifest(record).await?;
        refresh_urls(record, &manifest, &self.options)
    }
}
