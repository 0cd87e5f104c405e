//! 测试用的内存网关、地址源和合并器

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use tokio::sync::watch;

use crate::downloader::error::FetchError;
use crate::downloader::gateway::{FetchGateway, FetchRequest, FetchResponse};
use crate::downloader::models::{StreamDescriptor, TaskRecord};
use crate::parser::errors::ResolutionError;
use crate::parser::source::ManifestSource;
use crate::post_process::merger::{MergeCollaborator, MergeError, MergeJob};

pub(crate) enum Scripted {
    /// 直接返回这个状态码
    Status(u16),
    /// 返回损坏的数据，但 MD5 是正确数据的
    Corrupt,
}

pub(crate) struct FakeGateway {
    chunk_size: usize,
    files: Mutex<HashMap<String, Vec<u8>>>,
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    gates: Mutex<HashMap<String, watch::Sender<bool>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeGateway {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            files: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_file(&self, url: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), data);
    }

    pub(crate) fn script(&self, url: &str, response: Scripted) {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// 关闭闸门后，响应只会发出第一个数据块
    pub(crate) fn gate(&self, url: &str) {
        let (tx, _) = watch::channel(false);
        self.gates.lock().unwrap().insert(url.to_string(), tx);
    }

    pub(crate) fn open(&self, url: &str) {
        if let Some(tx) = self.gates.lock().unwrap().get(url) {
            tx.send_replace(true);
        }
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_for(&self, url: &str) -> Vec<FetchRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url)
            .collect()
    }

    fn respond(
        status: u16,
        data: Vec<u8>,
        md5: Option<String>,
        chunk_size: usize,
        gate: Option<watch::Receiver<bool>>,
    ) -> FetchResponse {
        let content_length = Some(data.len() as u64);
        let chunks: Vec<Bytes> = data
            .chunks(chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let body = stream::iter(chunks.into_iter().enumerate())
            .then(move |(i, chunk)| {
                let gate = gate.clone();
                async move {
                    if i > 0 {
                        if let Some(mut gate) = gate {
                            let _ = gate.wait_for(|open| *open).await;
                        }
                    }
                    Ok::<Bytes, FetchError>(chunk)
                }
            })
            .boxed();

        FetchResponse {
            status,
            content_length,
            content_md5: md5,
            body,
        }
    }
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl FetchGateway for FakeGateway {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);
        let data = self.files.lock().unwrap().get(&request.url).cloned();
        let gate = self
            .gates
            .lock()
            .unwrap()
            .get(&request.url)
            .map(|tx| tx.subscribe());

        match scripted {
            Some(Scripted::Status(status)) => {
                return Ok(Self::respond(status, Vec::new(), None, self.chunk_size, None));
            }
            Some(Scripted::Corrupt) => {
                let data = data.unwrap_or_default();
                let md5 = md5_hex(&data);
                let corrupted = data.iter().map(|b| b ^ 0xff).collect();
                return Ok(Self::respond(200, corrupted, Some(md5), self.chunk_size, None));
            }
            None => {}
        }

        let Some(data) = data else {
            return Ok(Self::respond(404, Vec::new(), None, self.chunk_size, None));
        };
        let offset = (request.offset as usize).min(data.len());
        if offset > 0 && offset == data.len() {
            return Ok(Self::respond(416, Vec::new(), None, self.chunk_size, None));
        }

        let (status, md5) = if offset > 0 {
            (206, None)
        } else {
            (200, Some(md5_hex(&data)))
        };
        Ok(Self::respond(status, data[offset..].to_vec(), md5, self.chunk_size, gate))
    }
}

/// 把所有输入按顺序拼接成一个文件
#[derive(Default)]
pub(crate) struct FakeMerger {
    pub(crate) jobs: Mutex<Vec<MergeJob>>,
    pub(crate) fail: bool,
}

#[async_trait]
impl MergeCollaborator for FakeMerger {
    async fn merge(&self, job: &MergeJob) -> Result<PathBuf, MergeError> {
        self.jobs.lock().unwrap().push(job.clone());
        if self.fail {
            return Err(MergeError::FfmpegError("fake failure".to_string()));
        }

        let mut merged = Vec::new();
        for (_, path) in &job.inputs {
            merged.extend(tokio::fs::read(path).await?);
        }
        let output = job.output_dir.join(format!("merged_{}.bin", job.task_id));
        tokio::fs::write(&output, merged).await?;
        Ok(output)
    }
}

/// 按旧地址换新地址；没有登记的地址原样返回
#[derive(Default)]
pub(crate) struct FakeSource {
    rewrites: Mutex<HashMap<String, String>>,
    failing: Mutex<bool>,
    refreshed: Mutex<Vec<u64>>,
}

impl FakeSource {
    pub(crate) fn rewrite(&self, old: &str, new: &str) {
        self.rewrites
            .lock()
            .unwrap()
            .insert(old.to_string(), new.to_string());
    }

    pub(crate) fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub(crate) fn refreshed(&self) -> Vec<u64> {
        self.refreshed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManifestSource for FakeSource {
    async fn refresh(&self, record: &TaskRecord) -> Result<Vec<StreamDescriptor>, ResolutionError> {
        self.refreshed.lock().unwrap().push(record.id);
        if *self.failing.lock().unwrap() {
            return Err(ResolutionError::Api("播放地址接口不可用".to_string()));
        }

        let rewrites = self.rewrites.lock().unwrap();
        Ok(record
            .descriptors
            .iter()
            .map(|d| StreamDescriptor {
                url_list: d
                    .url_list
                    .iter()
                    .map(|u| rewrites.get(u).cloned().unwrap_or_else(|| u.clone()))
                    .collect(),
                ..d.clone()
            })
            .collect())
    }
}
