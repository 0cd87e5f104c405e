use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::downloader::models::{DownloadOption, NumberType};

/// 任务文件版本号，低于此版本的任务文件在加载时被丢弃
pub const TASK_FILE_MIN_VERSION: u32 = 1630;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

/// 引擎配置，可以从 JSON 文件加载，缺失的字段使用默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub download: DownloadConfig,
    pub advanced: AdvancedConfig,
    pub merge: MergeConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
}

impl EngineConfig {
    /// 读取配置文件，文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            debug!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            warn!("配置文件解析失败: {}", e);
            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// 下载保存目录
    pub path: PathBuf,
    /// 任务文件目录
    pub state_dir: PathBuf,
    pub max_download_count: usize,
    pub max_thread_count: usize,

    pub video_quality_id: i32,
    pub audio_quality_id: i32,
    pub video_codec_id: i32,
    pub stream_download_option: DownloadOption,

    pub auto_add_number: bool,
    pub number_type: NumberType,

    pub enable_speed_limit: bool,
    /// 单位 MB/s
    pub speed_mbps: u64,

    /// 取消任务时保留已下载的部分文件
    pub keep_partial_on_cancel: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./downloads"),
            state_dir: PathBuf::from(".bilidl").join("tasks"),
            max_download_count: 1,
            max_thread_count: 2,
            video_quality_id: 200,
            audio_quality_id: 30300,
            video_codec_id: 7,
            stream_download_option: DownloadOption::VideoAndAudio,
            auto_add_number: true,
            number_type: NumberType::From1,
            enable_speed_limit: false,
            speed_mbps: 10,
            keep_partial_on_cancel: false,
        }
    }
}

impl DownloadConfig {
    /// 限速值（字节/秒），未开启时为 None
    pub fn speed_limit_bps(&self) -> Option<u64> {
        self.enable_speed_limit
            .then(|| self.speed_mbps.saturating_mul(1024 * 1024))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub enable_switch_cdn: bool,
    pub cdn_list: Vec<String>,

    pub retry_when_download_error: bool,
    pub download_error_retry_count: u32,
    /// 重试间隔，单位秒
    pub download_suspend_retry_interval: u64,
    /// 429 限流时任务重新排队的次数上限
    pub max_requeue_count: u32,

    pub always_use_https_protocol: bool,
    pub check_md5: bool,
    pub user_agent: String,

    pub task_file_min_version: u32,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            enable_switch_cdn: true,
            cdn_list: [
                "upos-sz-estgoss.bilivideo.com",
                "upos-sz-mirror08c.bilivideo.com",
                "upos-sz-mirrorcoso1.bilivideo.com",
                "upos-sz-mirrorali02.bilivideo.com",
                "upos-sz-mirrorhw.bilivideo.com",
                "upos-sz-mirror08h.bilivideo.com",
                "upos-sz-mirrorcos.bilivideo.com",
                "upos-sz-mirrorcosb.bilivideo.com",
                "upos-sz-mirrorali.bilivideo.com",
                "upos-sz-mirroralib.bilivideo.com",
                "upos-sz-mirroraliov.bilivideo.com",
                "upos-sz-mirrorcosov.bilivideo.com",
                "upos-hz-mirrorakam.akamaized.net",
                "upos-sz-mirrorcf1ov.bilivideo.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            retry_when_download_error: true,
            download_error_retry_count: 3,
            download_suspend_retry_interval: 3,
            max_requeue_count: 3,
            always_use_https_protocol: true,
            check_md5: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            task_file_min_version: TASK_FILE_MIN_VERSION,
        }
    }
}

impl AdvancedConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.download_suspend_retry_interval)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// ffmpeg 路径，为空时依次尝试环境变量 FFMPEG_PATH 和 PATH 中的 ffmpeg
    pub ffmpeg_path: Option<PathBuf>,
    pub keep_original_files: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// 不使用代理
    Disable,
    /// 跟随系统代理
    #[default]
    Follow,
    /// 自定义代理
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy_mode: ProxyMode,
    pub proxy_ip: String,
    pub proxy_port: Option<u16>,
    pub enable_auth: bool,
    pub auth_username: String,
    pub auth_password: String,
}

/// 登录 Cookie，只保存请求需要的几项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub sessdata: Option<String>,
    pub bili_jct: Option<String>,
    pub dede_user_id: Option<String>,
    pub buvid3: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"download": {"max_download_count": 3}, "advanced": {"check_md5": false}}"#,
        )
        .unwrap();

        assert_eq!(config.download.max_download_count, 3);
        assert_eq!(config.download.max_thread_count, 2);
        assert!(!config.advanced.check_md5);
        assert_eq!(config.advanced.download_error_retry_count, 3);
        assert_eq!(config.advanced.task_file_min_version, TASK_FILE_MIN_VERSION);
        assert_eq!(config.proxy.proxy_mode, ProxyMode::Follow);
    }

    #[test]
    fn speed_limit_only_when_enabled() {
        let mut download = DownloadConfig::default();
        assert_eq!(download.speed_limit_bps(), None);

        download.enable_speed_limit = true;
        download.speed_mbps = 2;
        assert_eq!(download.speed_limit_bps(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn missing_file_gives_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.download.max_download_count, 1);
    }
}
