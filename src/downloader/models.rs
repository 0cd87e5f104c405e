use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::common::models::DownloadType;
use crate::parser::models::{AudioQuality, StreamType, VideoCodec, VideoQuality};

/// 任务 ID 取值范围（8 位数字）
pub const TASK_ID_RANGE: std::ops::Range<u64> = 10_000_000..100_000_000;

pub fn random_task_id() -> u64 {
    rand::rng().random_range(TASK_ID_RANGE)
}

// --------------------------------------------------------------------
/// 任务中一个可下载的流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StreamKey {
    Video,
    Audio,
    /// FLV 分段，从 1 开始
    Flv(u32),
    Danmaku,
    Cover,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Video => f.write_str("video"),
            StreamKey::Audio => f.write_str("audio"),
            StreamKey::Flv(n) => write!(f, "flv_{}", n),
            StreamKey::Danmaku => f.write_str("danmaku"),
            StreamKey::Cover => f.write_str("cover"),
        }
    }
}

impl FromStr for StreamKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(StreamKey::Video),
            "audio" => Ok(StreamKey::Audio),
            "danmaku" => Ok(StreamKey::Danmaku),
            "cover" => Ok(StreamKey::Cover),
            other => other
                .strip_prefix("flv_")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(StreamKey::Flv)
                .ok_or_else(|| format!("未知的流标识: {}", other)),
        }
    }
}

impl TryFrom<String> for StreamKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamKey> for String {
    fn from(key: StreamKey) -> Self {
        key.to_string()
    }
}

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Waiting,
    Downloading,
    Paused,
    Merging,
    Complete,
    Error,
}

impl TaskStatus {
    /// 仍在队列中、可能还会下载的任务
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TaskStatus::Waiting | TaskStatus::Downloading | TaskStatus::Paused
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Waiting => "等待中",
            TaskStatus::Downloading => "下载中",
            TaskStatus::Paused => "已暂停",
            TaskStatus::Merging => "合并中",
            TaskStatus::Complete => "已完成",
            TaskStatus::Error => "下载失败",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOption {
    #[default]
    VideoAndAudio,
    VideoOnly,
    AudioOnly,
}

/// 编号方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberType {
    /// 每次添加都从 1 开始
    #[default]
    From1,
    /// 接着上一次添加的编号继续
    Coherent,
    /// 使用剧集列表中的序号
    EpisodeList,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraOptions {
    pub download_danmaku: bool,
    pub download_subtitle: bool,
    pub download_cover: bool,
}

impl ExtraOptions {
    pub fn any(&self) -> bool {
        self.download_danmaku || self.download_subtitle || self.download_cover
    }
}

// --------------------------------------------------------------------
/// 一个流的下载地址和本地文件名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub key: StreamKey,
    /// 按优先级排列，失败时依次切换
    pub url_list: Vec<String>,
    pub file_name: String,
}

/// 单个流的下载进度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadInfo {
    pub downloaded: u64,
    pub total_size: Option<u64>,
    /// 服务器返回的 MD5（十六进制）
    pub checksum: Option<String>,
    pub completed: bool,
}

pub type ThreadInfoMap = BTreeMap<StreamKey, ThreadInfo>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub key: Option<StreamKey>,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(key) => write!(f, "[{}] {}", key, self.message),
            None => f.write_str(&self.message),
        }
    }
}

// --------------------------------------------------------------------
/// 一个下载任务的完整记录，写入任务文件的 task_info 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    pub id: u64,
    pub download_type: DownloadType,

    pub title: String,
    pub series_title: Option<String>,
    /// 在剧集列表中的序号
    pub list_number: u32,
    /// 添加时分配的编号，为空时文件名不带编号
    pub numbering: Option<u32>,

    pub bvid: Option<String>,
    pub aid: Option<i64>,
    pub cid: Option<i64>,
    pub ep_id: Option<i64>,
    pub referer_url: Option<String>,
    pub cover_url: Option<String>,

    pub stream_type: Option<StreamType>,
    pub video_quality_id: i32,
    pub audio_quality_id: i32,
    pub video_codec_id: i32,
    pub download_option: DownloadOption,
    pub extra_options: ExtraOptions,

    pub download_items: Vec<StreamKey>,
    pub descriptors: Vec<StreamDescriptor>,
    /// 合并后的容器格式（扩展名）
    pub output_container: Option<String>,

    pub status: TaskStatus,
    pub error: Option<TaskFailure>,
    /// 创建时间（毫秒），决定排队顺序
    pub timestamp: i64,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self {
            id: 0,
            download_type: DownloadType::Video,
            title: String::new(),
            series_title: None,
            list_number: 0,
            numbering: None,
            bvid: None,
            aid: None,
            cid: None,
            ep_id: None,
            referer_url: None,
            cover_url: None,
            stream_type: None,
            video_quality_id: VideoQuality::AUTO_ID,
            audio_quality_id: AudioQuality::AUTO_ID,
            video_codec_id: VideoCodec::AVC_ID,
            download_option: DownloadOption::VideoAndAudio,
            extra_options: ExtraOptions::default(),
            download_items: Vec::new(),
            descriptors: Vec::new(),
            output_container: None,
            status: TaskStatus::Waiting,
            error: None,
            timestamp: 0,
        }
    }
}

impl TaskRecord {
    pub fn new(id: u64, download_type: DownloadType, title: impl Into<String>) -> Self {
        Self {
            id,
            download_type,
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn descriptor(&self, key: StreamKey) -> Option<&StreamDescriptor> {
        self.descriptors.iter().find(|d| d.key == key)
    }
}

// --------------------------------------------------------------------
/// 添加任务时发现的重复项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateTask {
    pub id: u64,
    pub title: String,
    pub list_number: u32,
    pub download_type: DownloadType,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// 有重复时整批拒绝
    Reject,
    /// 忽略重复继续添加
    Proceed,
}

/// 对外暴露的任务快照
#[derive(Debug, Clone)]
pub struct TaskView {
    pub record: TaskRecord,
    pub thread_info: ThreadInfoMap,
    /// 是否还有下载协程在运行（包括暂停后尚未退出的）
    pub active: bool,
}

impl TaskView {
    pub fn downloaded(&self) -> u64 {
        self.thread_info.values().map(|t| t.downloaded).sum()
    }

    /// 所有流的总大小，有未知大小的流时返回 None
    pub fn total_size(&self) -> Option<u64> {
        self.record
            .download_items
            .iter()
            .map(|key| self.thread_info.get(key).and_then(|t| t.total_size))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    StatusChanged {
        id: u64,
        status: TaskStatus,
    },
    Progress {
        id: u64,
        key: StreamKey,
        downloaded: u64,
        total: Option<u64>,
    },
    Removed {
        id: u64,
    },
}
