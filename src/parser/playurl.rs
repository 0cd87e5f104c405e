use serde_derive::Deserialize;
use tracing::{debug, info};

use crate::common::client::client::BiliClient;
use crate::common::models::DownloadType;
use crate::common::wbi_utils::WbiUtils;
use crate::downloader::models::TaskRecord;
use crate::parser::errors::ResolutionError;
use crate::parser::manifest::Manifest;

const VIDEO_PLAYURL: &str = "https://api.bilibili.com/x/player/wbi/playurl";
const BANGUMI_PLAYURL: &str = "https://api.bilibili.com/pgc/player/web/playurl";
const CHEESE_PLAYURL: &str = "https://api.bilibili.com/pugv/player/web/playurl";
const VIDEO_VIEW: &str = "https://api.bilibili.com/x/web-interface/view";

/// 视频基本信息，用于补全 cid 和标题
#[derive(Debug, Clone, Deserialize)]
pub struct VideoView {
    pub bvid: String,
    pub aid: i64,
    pub cid: i64,
    pub title: String,
    #[serde(default)]
    pub pic: Option<String>,
    #[serde(default)]
    pub pages: Vec<VideoPage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoPage {
    pub cid: i64,
    pub page: u32,
    #[serde(default)]
    pub part: String,
}

pub struct PlayUrlApi<'a> {
    client: &'a BiliClient,
}

impl<'a> PlayUrlApi<'a> {
    pub fn new(client: &'a BiliClient) -> Self {
        Self { client }
    }

    /// 按任务类型请求播放地址并解析清单
    pub async fn fetch_manifest(&self, record: &TaskRecord) -> Result<Manifest, ResolutionError> {
        let data = match record.download_type {
            DownloadType::Video => self.video_playurl(record).await?,
            DownloadType::Bangumi => self.bangumi_playurl(record).await?,
            DownloadType::Cheese => self.cheese_playurl(record).await?,
            DownloadType::Extra => {
                return Err(ResolutionError::UnsupportedSource(DownloadType::Extra));
            }
        };
        Manifest::from_value(data)
    }

    pub async fn video_view(&self, bvid: &str) -> Result<VideoView, ResolutionError> {
        let query = serde_urlencoded::to_string([("bvid", bvid)])
            .map_err(|e| ResolutionError::Malformed(e.to_string()))?;
        let data = self.client.get_json(VIDEO_VIEW, &query).await?;
        let view: VideoView = serde_json::from_value(data)
            .map_err(|e| ResolutionError::Malformed(format!("视频信息: {}", e)))?;
        info!("获取视频信息: {} ({} 个分P)", view.title, view.pages.len());
        Ok(view)
    }

    async fn video_playurl(&self, record: &TaskRecord) -> Result<serde_json::Value, ResolutionError> {
        let bvid = record
            .bvid
            .clone()
            .ok_or(ResolutionError::MissingIdentifier("bvid"))?;
        let cid = record.cid.ok_or(ResolutionError::MissingIdentifier("cid"))?;

        let params = [
            ("bvid", bvid),
            ("cid", cid.to_string()),
            ("fnver", "0".to_string()),
            ("fnval", "4048".to_string()),
            ("fourk", "1".to_string()),
        ];
        let (img_key, sub_key) = self.client.wbi_keys().await?;
        let query = WbiUtils::enc_wbi(&params, &img_key, &sub_key);
        debug!("请求普通视频播放地址: {}", query);

        Ok(self.client.get_json(VIDEO_PLAYURL, &query).await?)
    }

    async fn bangumi_playurl(
        &self,
        record: &TaskRecord,
    ) -> Result<serde_json::Value, ResolutionError> {
        let cid = record.cid.ok_or(ResolutionError::MissingIdentifier("cid"))?;
        let mut params = vec![("cid", cid.to_string())];
        match (&record.bvid, record.ep_id) {
            (Some(bvid), _) => params.push(("bvid", bvid.clone())),
            (None, Some(ep_id)) => params.push(("ep_id", ep_id.to_string())),
            (None, None) => return Err(ResolutionError::MissingIdentifier("bvid 或 ep_id")),
        }
        params.extend([
            ("qn", record.video_quality_id.to_string()),
            ("fnver", "0".to_string()),
            ("fnval", "12240".to_string()),
            ("fourk", "1".to_string()),
        ]);

        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ResolutionError::Malformed(e.to_string()))?;
        debug!("请求番剧播放地址: {}", query);
        Ok(self.client.get_json(BANGUMI_PLAYURL, &query).await?)
    }

    async fn cheese_playurl(
        &self,
        record: &TaskRecord,
    ) -> Result<serde_json::Value, ResolutionError> {
        let aid = record.aid.ok_or(ResolutionError::MissingIdentifier("aid"))?;
        let ep_id = record.ep_id.ok_or(ResolutionError::MissingIdentifier("ep_id"))?;
        let cid = record.cid.ok_or(ResolutionError::MissingIdentifier("cid"))?;

        let params = [
            ("avid", aid.to_string()),
            ("ep_id", ep_id.to_string()),
            ("cid", cid.to_string()),
            ("fnver", "0".to_string()),
            ("fnval", "4048".to_string()),
            ("fourk", "1".to_string()),
        ];
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| ResolutionError::Malformed(e.to_string()))?;
        debug!("请求课程播放地址: {}", query);
        Ok(self.client.get_json(CHEESE_PLAYURL, &query).await?)
    }
}
