use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::common::config::MergeConfig;
use crate::common::models::DownloadType;
use crate::common::utils::legal_file_name;
use crate::downloader::models::{StreamKey, TaskRecord};
use crate::parser::models::StreamType;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("文件不存在: {0:?}")]
    FileNotFound(PathBuf),

    #[error("未检测到 ffmpeg，请安装或设置 FFMPEG_PATH")]
    FfmpegNotFound,

    #[error("ffmpeg 执行失败: {0}")]
    FfmpegError(String),

    #[error("没有需要合并的文件")]
    NothingToMerge,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 合并需要的全部信息，由任务记录生成
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub task_id: u64,
    pub title: String,
    pub numbering: Option<u32>,
    pub download_type: DownloadType,
    pub stream_type: Option<StreamType>,
    pub output_container: Option<String>,
    /// 按 download_items 的顺序
    pub inputs: Vec<(StreamKey, PathBuf)>,
    pub output_dir: PathBuf,
}

impl MergeJob {
    pub fn from_record(record: &TaskRecord, download_dir: &Path) -> Self {
        let inputs = record
            .download_items
            .iter()
            .filter_map(|key| record.descriptor(*key))
            .map(|d| (d.key, download_dir.join(&d.file_name)))
            .collect();

        Self {
            task_id: record.id,
            title: record.title.clone(),
            numbering: record.numbering,
            download_type: record.download_type,
            stream_type: record.stream_type,
            output_container: record.output_container.clone(),
            inputs,
            output_dir: download_dir.to_path_buf(),
        }
    }

    /// 输出文件名（不含扩展名），带编号时形如 `01 - 标题`
    pub fn output_stem(&self) -> String {
        let title = legal_file_name(&self.title);
        match self.numbering {
            Some(n) => format!("{:02} - {}", n, title),
            None => title,
        }
    }

    fn input(&self, key: StreamKey) -> Option<&PathBuf> {
        self.inputs.iter().find(|(k, _)| *k == key).map(|(_, p)| p)
    }
}

/// 所有流下载完成后调用
#[async_trait]
pub trait MergeCollaborator: Send + Sync {
    async fn merge(&self, job: &MergeJob) -> Result<PathBuf, MergeError>;
}

// --------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStep {
    WriteConcatList { path: PathBuf, content: String },
    Ffmpeg { args: Vec<OsString> },
    Move { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub steps: Vec<MergeStep>,
    pub output: PathBuf,
    /// 合并成功后可以删除的中间文件
    pub intermediates: Vec<PathBuf>,
}

impl MergePlan {
    pub fn build(job: &MergeJob) -> Result<Self, MergeError> {
        if job.inputs.is_empty() {
            return Err(MergeError::NothingToMerge);
        }
        let stem = job.output_stem();

        if job.download_type == DownloadType::Extra {
            let steps: Vec<MergeStep> = job
                .inputs
                .iter()
                .map(|(_, from)| MergeStep::Move {
                    from: from.clone(),
                    to: job.output_dir.join(format!("{}.{}", stem, extension_of(from))),
                })
                .collect();
            let output = match &steps[0] {
                MergeStep::Move { to, .. } => to.clone(),
                _ => job.output_dir.clone(),
            };
            return Ok(Self {
                steps,
                output,
                intermediates: Vec::new(),
            });
        }

        let container = job.output_container.clone().unwrap_or_else(|| "mp4".to_string());
        let output = job.output_dir.join(format!("{}.{}", stem, container));

        match job.stream_type {
            Some(StreamType::Flv) => Ok(Self::flv(job, output)),
            _ => Ok(Self::dash(job, output)),
        }
    }

    fn dash(job: &MergeJob, output: PathBuf) -> Self {
        let video = job.input(StreamKey::Video).cloned();
        let audio = job.input(StreamKey::Audio).cloned();

        match (video, audio) {
            (Some(video), Some(audio)) => {
                let args = vec![
                    "-i".into(),
                    video.clone().into(),
                    "-i".into(),
                    audio.clone().into(),
                    "-c".into(),
                    "copy".into(),
                    "-y".into(),
                    output.clone().into(),
                ];
                Self {
                    steps: vec![MergeStep::Ffmpeg { args }],
                    output,
                    intermediates: vec![video, audio],
                }
            }
            // m4s 需要重新封装成 mp4
            (Some(video), None) => {
                let args = vec![
                    "-i".into(),
                    video.clone().into(),
                    "-c".into(),
                    "copy".into(),
                    "-y".into(),
                    output.clone().into(),
                ];
                Self {
                    steps: vec![MergeStep::Ffmpeg { args }],
                    output,
                    intermediates: vec![video],
                }
            }
            (None, Some(audio)) => Self {
                steps: vec![MergeStep::Move {
                    from: audio,
                    to: output.clone(),
                }],
                output,
                intermediates: Vec::new(),
            },
            (None, None) => Self {
                steps: Vec::new(),
                output,
                intermediates: Vec::new(),
            },
        }
    }

    fn flv(job: &MergeJob, output: PathBuf) -> Self {
        let parts: Vec<PathBuf> = job.inputs.iter().map(|(_, p)| p.clone()).collect();
        if parts.len() == 1 {
            return Self {
                steps: vec![MergeStep::Move {
                    from: parts[0].clone(),
                    to: output.clone(),
                }],
                output,
                intermediates: Vec::new(),
            };
        }

        let list_path = job.output_dir.join(format!("flv_{}_concat.txt", job.task_id));
        let content: String = parts
            .iter()
            .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
            .collect();
        let args = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.clone().into(),
            "-c".into(),
            "copy".into(),
            "-y".into(),
            output.clone().into(),
        ];

        let mut intermediates = parts;
        intermediates.push(list_path.clone());
        Self {
            steps: vec![
                MergeStep::WriteConcatList {
                    path: list_path,
                    content,
                },
                MergeStep::Ffmpeg { args },
            ],
            output,
            intermediates,
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_string()
}

// --------------------------------------------------------------------
pub struct FfmpegMerger {
    ffmpeg: PathBuf,
    keep_original_files: bool,
}

impl FfmpegMerger {
    pub fn new(config: &MergeConfig) -> Self {
        // 获取 ffmpeg 路径（配置优先，其次环境变量）
        let ffmpeg = config
            .ffmpeg_path
            .clone()
            .or_else(|| std::env::var_os("FFMPEG_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));

        Self {
            ffmpeg,
            keep_original_files: config.keep_original_files,
        }
    }

    pub async fn check_ffmpeg(&self) -> Result<(), MergeError> {
        debug!("检查系统中是否安装了 ffmpeg...");
        let status = Command::new(&self.ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => {
                error!("❌ 未检测到 ffmpeg，请确保系统中已安装并配置了 ffmpeg 可执行路径。");
                error!("或者设置环境变量 FFMPEG_PATH 指向 ffmpeg 可执行文件路径");
                Err(MergeError::FfmpegNotFound)
            }
        }
    }

    async fn run_ffmpeg(&self, args: &[OsString]) -> Result<(), MergeError> {
        self.check_ffmpeg().await?;

        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            error!("❌ ffmpeg 合并失败，错误日志如下：\n{}", err_msg);
            return Err(MergeError::FfmpegError(err_msg.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MergeCollaborator for FfmpegMerger {
    async fn merge(&self, job: &MergeJob) -> Result<PathBuf, MergeError> {
        for (key, path) in &job.inputs {
            if !path.exists() {
                error!("{} 的文件不存在: {:?}", key, path);
                return Err(MergeError::FileNotFound(path.clone()));
            }
        }

        let plan = MergePlan::build(job)?;
        tokio::fs::create_dir_all(&job.output_dir).await?;

        for step in &plan.steps {
            match step {
                MergeStep::WriteConcatList { path, content } => {
                    tokio::fs::write(path, content).await?;
                }
                MergeStep::Ffmpeg { args } => self.run_ffmpeg(args).await?,
                MergeStep::Move { from, to } => {
                    debug!("移动文件 {:?} -> {:?}", from, to);
                    tokio::fs::rename(from, to).await?;
                }
            }
        }

        if !self.keep_original_files {
            for path in &plan.intermediates {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("删除中间文件失败 {:?}: {}", path, e);
                }
            }
        }

        info!("✅ 任务 {} 处理完成，输出文件: {:?}", job.task_id, plan.output);
        Ok(plan.output)
    }
}
