use serde_derive::Deserialize;
use serde_json::Value;

use crate::parser::errors::ResolutionError;
use crate::parser::models::StreamType;

/// 播放地址接口返回的清单，DASH 或 FLV 二选一
#[derive(Debug, Clone)]
pub enum Manifest {
    Dash(DashManifest),
    Flv(FlvManifest),
}

impl Manifest {
    /// 从接口的 data/result 负载解析
    pub fn from_value(data: Value) -> Result<Self, ResolutionError> {
        let Value::Object(map) = data else {
            return Err(ResolutionError::Malformed("负载不是 JSON 对象".to_string()));
        };

        if let Some(dash) = map.get("dash").filter(|v| !v.is_null()) {
            let dash = serde_json::from_value(dash.clone())
                .map_err(|e| ResolutionError::Malformed(format!("dash: {}", e)))?;
            return Ok(Manifest::Dash(dash));
        }

        if map.get("durl").is_some_and(|v| !v.is_null()) {
            let flv = serde_json::from_value(Value::Object(map))
                .map_err(|e| ResolutionError::Malformed(format!("durl: {}", e)))?;
            return Ok(Manifest::Flv(flv));
        }

        Err(ResolutionError::MissingSection("dash 或 durl"))
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            Manifest::Dash(_) => StreamType::Dash,
            Manifest::Flv(_) => StreamType::Flv,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashManifest {
    #[serde(default)]
    pub duration: i64,
    pub video: Vec<DashItem>,
    #[serde(default)]
    pub audio: Option<Vec<DashItem>>,
    #[serde(default)]
    pub dolby: Option<DolbyInfo>,
    #[serde(default)]
    pub flac: Option<FlacInfo>,
}

impl DashManifest {
    pub fn normal_audio(&self) -> &[DashItem] {
        self.audio.as_deref().unwrap_or_default()
    }

    pub fn dolby_audio(&self) -> Option<&DashItem> {
        self.dolby
            .as_ref()
            .and_then(|d| d.audio.as_deref())
            .and_then(|a| a.first())
    }

    pub fn hi_res_audio(&self) -> Option<&DashItem> {
        self.flac.as_ref().and_then(|f| f.audio.as_ref())
    }

    pub fn has_audio(&self) -> bool {
        !self.normal_audio().is_empty()
            || self.dolby_audio().is_some()
            || self.hi_res_audio().is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DolbyInfo {
    #[serde(default)]
    pub audio: Option<Vec<DashItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlacInfo {
    #[serde(default)]
    pub audio: Option<DashItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashItem {
    pub id: i32,

    #[serde(default, alias = "baseUrl")]
    pub base_url: String,

    #[serde(default, alias = "backupUrl")]
    pub backup_url: Option<Vec<String>>,

    #[serde(default)]
    pub bandwidth: i64,

    #[serde(rename = "codecid", default)]
    pub codec_id: i32,

    #[serde(default)]
    pub codecs: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlvManifest {
    /// 降序排列
    #[serde(default)]
    pub accept_quality: Vec<i32>,
    #[serde(default)]
    pub quality: Option<i32>,
    pub durl: Vec<FlvSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlvSegment {
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub backup_url: Option<Vec<String>>,
}
