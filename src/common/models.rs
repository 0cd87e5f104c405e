use std::fmt;

use serde::{Deserialize, Serialize};

/// 任务来源
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    #[default]
    Video, // 普通视频
    Bangumi, // 番剧
    Cheese,  // 课程
    Extra,   // 弹幕、封面等附件
}

impl fmt::Display for DownloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadType::Video => "普通视频",
            DownloadType::Bangumi => "番剧",
            DownloadType::Cheese => "课程",
            DownloadType::Extra => "附件",
        };
        f.write_str(name)
    }
}
