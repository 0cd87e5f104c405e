//! 单个任务的下载执行
//!
//! 一个任务的所有流在同一个运行中并行下载（受 `max_thread_count` 限制），
//! 任意一个流失败会取消其它流。断点的保存交给调度器。

use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chardetng::EncodingDetector;
use flate2::read::{DeflateDecoder, GzDecoder};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::downloader::error::{FetchError, StoreError};
use crate::downloader::gateway::{FetchGateway, FetchRequest};
use crate::downloader::models::{StreamDescriptor, StreamKey, ThreadInfo, ThreadInfoMap};
use crate::downloader::retry::{RetryDecision, RetryPolicy};
use crate::downloader::speed_limiter::SpeedLimiter;

/// 两次保存断点的最小间隔
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// 运行过程中的进度回报
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// 保存断点，`info.downloaded` 与磁盘上的字节数一致
    async fn checkpoint(&self, key: StreamKey, info: &ThreadInfo) -> Result<(), StoreError>;

    fn progress(&self, key: StreamKey, downloaded: u64, total: Option<u64>);
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Requeue { key: StreamKey, error: FetchError },
    Failed { key: StreamKey, error: FetchError },
    Store(StoreError),
}

impl RunOutcome {
    fn severity(&self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Stopped => 1,
            RunOutcome::Requeue { .. } => 2,
            RunOutcome::Failed { .. } => 3,
            RunOutcome::Store(_) => 4,
        }
    }
}

enum Attempt {
    Complete,
    Stopped,
}

enum AttemptError {
    Fetch(FetchError),
    Store(StoreError),
}

impl From<FetchError> for AttemptError {
    fn from(e: FetchError) -> Self {
        AttemptError::Fetch(e)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Fetch(FetchError::Io(e))
    }
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        AttemptError::Store(e)
    }
}

pub struct TaskRunner {
    pub task_id: u64,
    pub referer: Option<String>,
    /// 只包含需要下载的流
    pub descriptors: Vec<StreamDescriptor>,
    pub threads: ThreadInfoMap,
    pub download_dir: PathBuf,
    pub gateway: Arc<dyn FetchGateway>,
    pub limiter: SpeedLimiter,
    pub policy: RetryPolicy,
    pub check_md5: bool,
    pub max_threads: usize,
    pub token: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
}

impl TaskRunner {
    pub async fn run(self) -> RunOutcome {
        let pending: Vec<StreamDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| !self.threads.get(&d.key).is_some_and(|t| t.completed))
            .cloned()
            .collect();
        if pending.is_empty() {
            return RunOutcome::Completed;
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            return RunOutcome::Failed {
                key: pending[0].key,
                error: e.into(),
            };
        }

        debug!("任务 {} 开始下载 {} 个流", self.task_id, pending.len());
        let this = &self;
        let streams = self.token.child_token();
        let streams_ref = &streams;

        let mut results = stream::iter(pending)
            .map(|desc| {
                let info = this.threads.get(&desc.key).cloned().unwrap_or_default();
                async move { this.fetch_stream(&desc, info, streams_ref).await }
            })
            .buffer_unordered(self.max_threads.max(1));

        let mut outcome = RunOutcome::Completed;
        while let Some(result) = results.next().await {
            if matches!(result, RunOutcome::Completed) {
                continue;
            }
            // 一个流出错，其余的流没有继续的必要
            streams.cancel();
            if result.severity() > outcome.severity() {
                outcome = result;
            }
        }
        outcome
    }

    async fn fetch_stream(
        &self,
        desc: &StreamDescriptor,
        mut info: ThreadInfo,
        token: &CancellationToken,
    ) -> RunOutcome {
        if desc.url_list.is_empty() {
            return RunOutcome::Failed {
                key: desc.key,
                error: FetchError::InvalidRequest("没有可用的下载地址".to_string()),
            };
        }

        let path = self.download_dir.join(&desc.file_name);
        let mut attempt = 0u32;

        loop {
            // 每次重试切换到下一个地址
            let url = &desc.url_list[attempt as usize % desc.url_list.len()];

            let result = match self.fetch_once(desc, url, &path, &mut info, token).await {
                Ok(Attempt::Stopped) => {
                    return match self.sink.checkpoint(desc.key, &info).await {
                        Ok(()) => RunOutcome::Stopped,
                        Err(e) => RunOutcome::Store(e),
                    };
                }
                Ok(Attempt::Complete) => self.finalize(desc, &path, &mut info).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(()) => {
                    info.completed = true;
                    debug!("任务 {} 的 {} 下载完成", self.task_id, desc.key);
                    return match self.sink.checkpoint(desc.key, &info).await {
                        Ok(()) => RunOutcome::Completed,
                        Err(e) => RunOutcome::Store(e),
                    };
                }
                Err(AttemptError::Store(e)) => return RunOutcome::Store(e),
                Err(AttemptError::Fetch(e)) => e,
            };

            if let Err(e) = self.sink.checkpoint(desc.key, &info).await {
                return RunOutcome::Store(e);
            }

            match self.policy.decide(&error, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    attempt += 1;
                    warn!(
                        "任务 {} 的 {} 下载出错，{:.1} 秒后重试 ({}/{}): {}",
                        self.task_id,
                        desc.key,
                        delay.as_secs_f64(),
                        attempt,
                        self.policy.max_retries,
                        error
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return RunOutcome::Stopped,
                    }
                }
                RetryDecision::Requeue => {
                    warn!("⚠️ 任务 {} 请求过于频繁，重新排队", self.task_id);
                    return RunOutcome::Requeue {
                        key: desc.key,
                        error,
                    };
                }
                RetryDecision::Fail => {
                    warn!("❌ 任务 {} 的 {} 下载失败: {}", self.task_id, desc.key, error);
                    return RunOutcome::Failed {
                        key: desc.key,
                        error,
                    };
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        desc: &StreamDescriptor,
        url: &str,
        path: &Path,
        info: &mut ThreadInfo,
        token: &CancellationToken,
    ) -> Result<Attempt, AttemptError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        // 上次写入的数据可能超过断点，截断到断点处再续传
        file.set_len(info.downloaded).await?;
        file.seek(SeekFrom::Start(info.downloaded)).await?;

        let request = FetchRequest {
            url: url.to_string(),
            offset: info.downloaded,
            referer: self.referer.clone(),
        };
        let response = tokio::select! {
            response = self.gateway.fetch(request) => response?,
            _ = token.cancelled() => return Ok(Attempt::Stopped),
        };

        match response.status {
            206 => {}
            200..=299 => {
                if info.downloaded > 0 {
                    debug!("服务器不支持断点续传，{} 从头开始下载", desc.key);
                    info.downloaded = 0;
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                }
            }
            416 if info.downloaded > 0 && info.total_size == Some(info.downloaded) => {
                return Ok(Attempt::Complete);
            }
            status => return Err(FetchError::from_status(status, url).into()),
        }

        if let Some(len) = response.content_length {
            info.total_size = Some(info.downloaded + len);
        }
        if info.downloaded == 0 {
            info.checksum = response.content_md5.clone();
        }
        self.sink.progress(desc.key, info.downloaded, info.total_size);

        let mut body = response.body;
        let mut last_checkpoint = Instant::now();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Ok(Attempt::Stopped);
                }
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush().await?;
                    return Err(e.into());
                }
                None => break,
            };

            self.limiter.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await?;
            info.downloaded += chunk.len() as u64;
            self.sink.progress(desc.key, info.downloaded, info.total_size);

            if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                file.flush().await?;
                self.sink.checkpoint(desc.key, info).await?;
                last_checkpoint = Instant::now();
            }

            // 只在数据块写完之后检查暂停
            if token.is_cancelled() {
                file.flush().await?;
                return Ok(Attempt::Stopped);
            }
        }
        file.flush().await?;

        match info.total_size {
            Some(total) if info.downloaded < total => Err(FetchError::Transient(format!(
                "数据不完整: {}/{}",
                info.downloaded, total
            ))
            .into()),
            Some(_) => Ok(Attempt::Complete),
            None => {
                info.total_size = Some(info.downloaded);
                Ok(Attempt::Complete)
            }
        }
    }

    async fn finalize(
        &self,
        desc: &StreamDescriptor,
        path: &Path,
        info: &mut ThreadInfo,
    ) -> Result<(), AttemptError> {
        if self.check_md5 {
            if let Some(expected) = info.checksum.clone() {
                let actual = file_md5(path).await?;
                if actual != expected {
                    warn!("任务 {} 的 {} MD5 校验失败，重新下载", self.task_id, desc.key);
                    *info = ThreadInfo::default();
                    self.sink.progress(desc.key, 0, None);
                    return Err(FetchError::ChecksumMismatch { expected, actual }.into());
                }
            }
        }

        if desc.key == StreamKey::Danmaku {
            let raw = tokio::fs::read(path).await?;
            tokio::fs::write(path, decode_text(&raw).as_bytes()).await?;
        }
        Ok(())
    }
}

async fn file_md5(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// 弹幕文件可能是 deflate/gzip 压缩的，编码也不固定，统一转成 UTF-8
pub(crate) fn decode_text(raw: &[u8]) -> String {
    let bytes = match raw {
        [0x1f, 0x8b, ..] => inflate(GzDecoder::new(raw)).unwrap_or_else(|| raw.to_vec()),
        [b'<', ..] | [0xef, 0xbb, 0xbf, ..] => raw.to_vec(),
        _ => inflate(DeflateDecoder::new(raw)).unwrap_or_else(|| raw.to_vec()),
    };

    let mut detector = EncodingDetector::new();
    detector.feed(&bytes, true);
    let encoding = detector.guess(None, true);
    let (decoded, _, had_errors) = encoding.decode(&bytes);
    if had_errors {
        warn!("文本解码过程中发现错误，可能存在字符丢失");
    }
    decoded.into_owned()
}

fn inflate(mut decoder: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use flate2::Compression;
    use flate2::write::DeflateEncoder;

    use super::*;
    use crate::downloader::test_support::{FakeGateway, Scripted};

    #[derive(Default)]
    struct RecordingSink {
        checkpoints: Mutex<Vec<(StreamKey, ThreadInfo)>>,
    }

    impl RecordingSink {
        fn last(&self, key: StreamKey) -> Option<ThreadInfo> {
            self.checkpoints
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(k, _)| *k == key)
                .map(|(_, info)| info.clone())
        }
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn checkpoint(&self, key: StreamKey, info: &ThreadInfo) -> Result<(), StoreError> {
            self.checkpoints.lock().unwrap().push((key, info.clone()));
            Ok(())
        }

        fn progress(&self, _key: StreamKey, _downloaded: u64, _total: Option<u64>) {}
    }

    fn runner(
        dir: &Path,
        gateway: Arc<FakeGateway>,
        sink: Arc<RecordingSink>,
        descriptors: Vec<StreamDescriptor>,
        threads: ThreadInfoMap,
    ) -> TaskRunner {
        TaskRunner {
            task_id: 12345678,
            referer: Some("https://www.bilibili.com".to_string()),
            descriptors,
            threads,
            download_dir: dir.to_path_buf(),
            gateway,
            limiter: SpeedLimiter::new(None),
            policy: RetryPolicy {
                max_retries: 2,
                interval: Duration::ZERO,
                jitter: false,
            },
            check_md5: true,
            max_threads: 2,
            token: CancellationToken::new(),
            sink,
        }
    }

    fn descriptor(key: StreamKey, urls: &[&str], file_name: &str) -> StreamDescriptor {
        StreamDescriptor {
            key,
            url_list: urls.iter().map(|u| u.to_string()).collect(),
            file_name: file_name.to_string(),
        }
    }

    #[tokio::test]
    async fn resumes_from_recorded_offset_and_drops_unsaved_tail() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::new(4));
        gateway.add_file("mem://video", b"0123456789abcdef".to_vec());

        // 磁盘上有 10 字节，其中只有 6 字节保存过断点
        std::fs::write(dir.path().join("video.m4s"), b"012345XXXX").unwrap();
        let mut threads = ThreadInfoMap::new();
        threads.insert(
            StreamKey::Video,
            ThreadInfo {
                downloaded: 6,
                total_size: Some(16),
                checksum: None,
                completed: false,
            },
        );

        let sink = Arc::new(RecordingSink::default());
        let outcome = runner(
            dir.path(),
            gateway.clone(),
            sink.clone(),
            vec![descriptor(StreamKey::Video, &["mem://video"], "video.m4s")],
            threads,
        )
        .run()
        .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(gateway.requests()[0].offset, 6);
        assert_eq!(
            std::fs::read(dir.path().join("video.m4s")).unwrap(),
            b"0123456789abcdef"
        );
        let info = sink.last(StreamKey::Video).unwrap();
        assert!(info.completed);
        assert_eq!(info.downloaded, 16);
    }

    #[tokio::test]
    async fn corrupted_body_is_refetched_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::new(3));
        gateway.add_file("mem://audio", b"audio-payload".to_vec());
        gateway.script("mem://audio", Scripted::Corrupt);

        let sink = Arc::new(RecordingSink::default());
        let outcome = runner(
            dir.path(),
            gateway.clone(),
            sink,
            vec![descriptor(StreamKey::Audio, &["mem://audio"], "audio.m4a")],
            ThreadInfoMap::new(),
        )
        .run()
        .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        let offsets: Vec<u64> = gateway.requests().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 0]);
        assert_eq!(
            std::fs::read(dir.path().join("audio.m4a")).unwrap(),
            b"audio-payload"
        );
    }

    #[tokio::test]
    async fn retries_switch_to_backup_url() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::new(8));
        gateway.script("mem://primary", Scripted::Status(503));
        gateway.add_file("mem://backup", b"backup".to_vec());

        let sink = Arc::new(RecordingSink::default());
        let outcome = runner(
            dir.path(),
            gateway.clone(),
            sink,
            vec![descriptor(
                StreamKey::Video,
                &["mem://primary", "mem://backup"],
                "video.m4s",
            )],
            ThreadInfoMap::new(),
        )
        .run()
        .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        let urls: Vec<String> = gateway.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["mem://primary", "mem://backup"]);
    }

    #[tokio::test]
    async fn permanent_failure_reports_stream_and_cancels_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::new(2));
        gateway.add_file("mem://video", b"0123456789".to_vec());
        gateway.gate("mem://video");
        // 音频地址不存在
        let sink = Arc::new(RecordingSink::default());

        let outcome = runner(
            dir.path(),
            gateway.clone(),
            sink.clone(),
            vec![
                descriptor(StreamKey::Video, &["mem://video"], "video.m4s"),
                descriptor(StreamKey::Audio, &["mem://missing"], "audio.m4a"),
            ],
            ThreadInfoMap::new(),
        )
        .run()
        .await;

        match outcome {
            RunOutcome::Failed { key, error } => {
                assert_eq!(key, StreamKey::Audio);
                assert!(matches!(error, FetchError::Status { status: 404, .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // 视频流被取消时保存了已写入的部分
        let video = sink.last(StreamKey::Video).unwrap();
        assert!(!video.completed);
        assert_eq!(
            std::fs::metadata(dir.path().join("video.m4s")).unwrap().len(),
            video.downloaded
        );
    }

    #[tokio::test]
    async fn rate_limit_requests_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::new(8));
        gateway.script("mem://video", Scripted::Status(429));

        let outcome = runner(
            dir.path(),
            gateway,
            Arc::new(RecordingSink::default()),
            vec![descriptor(StreamKey::Video, &["mem://video"], "video.m4s")],
            ThreadInfoMap::new(),
        )
        .run()
        .await;
        assert!(matches!(outcome, RunOutcome::Requeue { key: StreamKey::Video, .. }));
    }

    #[test]
    fn danmaku_text_is_inflated_and_decoded() {
        let xml = "<?xml version=\"1.0\"?><i><d p=\"0\">弹幕</d></i>";
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decode_text(&compressed), xml);
        assert_eq!(decode_text(xml.as_bytes()), xml);
    }
}
