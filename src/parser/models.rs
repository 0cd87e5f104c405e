use serde::{Deserialize, Serialize};
use std::fmt;

/// 清晰度 ID，和播放地址接口中的 `id` / `accept_quality` 对应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoQuality {
    Q240P = 6,      // 极速 240P
    Q360P = 16,     // 流畅 360P
    Q480P = 32,     // 清晰 480P
    Q720P = 64,     // 高清 720P
    Q720P60 = 74,   // 高清 720P60
    Q1080P = 80,    // 高清 1080P
    Q1080PP = 112,  // 高清 1080P+
    Q1080P60 = 116, // 高清 1080P60
    Q4K = 120,      // 超清 4K
    QHdr = 125,     // HDR 真彩色
    QDolby = 126,   // 杜比视界
    Q8K = 127,      // 超高清 8K
    Auto = 200,     // 自动，选择最高可用
}

impl VideoQuality {
    pub const AUTO_ID: i32 = VideoQuality::Auto as i32;

    pub fn from_id(id: i32) -> Option<Self> {
        use VideoQuality::*;
        [
            Q240P, Q360P, Q480P, Q720P, Q720P60, Q1080P, Q1080PP, Q1080P60, Q4K, QHdr, QDolby,
            Q8K, Auto,
        ]
        .into_iter()
        .find(|q| *q as i32 == id)
    }

    pub fn description(id: i32) -> String {
        let name = match Self::from_id(id) {
            Some(VideoQuality::Q240P) => "240P 极速",
            Some(VideoQuality::Q360P) => "360P 流畅",
            Some(VideoQuality::Q480P) => "480P 清晰",
            Some(VideoQuality::Q720P) => "720P 高清",
            Some(VideoQuality::Q720P60) => "720P60 高帧率",
            Some(VideoQuality::Q1080P) => "1080P 高清",
            Some(VideoQuality::Q1080PP) => "1080P+ 高码率",
            Some(VideoQuality::Q1080P60) => "1080P60 高帧率",
            Some(VideoQuality::Q4K) => "4K 超清",
            Some(VideoQuality::QHdr) => "HDR 真彩色",
            Some(VideoQuality::QDolby) => "杜比视界",
            Some(VideoQuality::Q8K) => "8K 超高清",
            Some(VideoQuality::Auto) => "自动",
            None => return format!("未知清晰度({})", id),
        };
        name.to_string()
    }
}

pub enum AudioQuality {
    None = 0,
    Quality64k = 30216,
    Quality132k = 30232,
    QualityDolby = 30250,
    QualityHiRes = 30251,
    Quality192k = 30280,
    Auto = 30300,
}

impl AudioQuality {
    pub const NONE_ID: i32 = AudioQuality::None as i32;
    pub const DOLBY_ID: i32 = AudioQuality::QualityDolby as i32;
    pub const HI_RES_ID: i32 = AudioQuality::QualityHiRes as i32;
    pub const AUTO_ID: i32 = AudioQuality::Auto as i32;

    pub fn description(id: i32) -> String {
        match id {
            0 => "无音频".to_string(),
            30216 => "64K".to_string(),
            30232 => "132K".to_string(),
            30280 => "192K".to_string(),
            30250 => "杜比全景声".to_string(),
            30251 => "Hi-Res 无损".to_string(),
            30300 => "自动".to_string(),
            other => format!("未知音质({})", other),
        }
    }
}

pub enum VideoCodec {
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub const AVC_ID: i32 = VideoCodec::Avc as i32;

    pub fn description(id: i32) -> &'static str {
        match id {
            7 => "H.264/AVC",
            12 => "H.265/HEVC",
            13 => "AV1",
            _ => "未知编码",
        }
    }
}

/// 清单的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Dash, // 音视频分离
    Flv,  // 分段的 FLV
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Dash => f.write_str("DASH"),
            StreamType::Flv => f.write_str("FLV"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_ids_round_trip_through_lookup() {
        assert_eq!(VideoQuality::from_id(80), Some(VideoQuality::Q1080P));
        assert_eq!(VideoQuality::from_id(200), Some(VideoQuality::Auto));
        assert_eq!(VideoQuality::from_id(81), None);
        assert_eq!(VideoQuality::description(81), "未知清晰度(81)");
        assert_eq!(AudioQuality::HI_RES_ID, 30251);
        assert_eq!(VideoCodec::AVC_ID, 7);
    }
}
