//! 任务调度
//!
//! 所有状态变化都在一把锁下完成。每次状态变化后按创建时间扫描等待中的任务，
//! 直到下载中的任务数达到上限。任务文件只由这里写入。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::config::EngineConfig;
use crate::downloader::core::{ProgressSink, RunOutcome, TaskRunner};
use crate::downloader::error::{DownloadError, StoreError};
use crate::downloader::gateway::FetchGateway;
use crate::downloader::models::{
    DuplicatePolicy, DuplicateTask, NumberType, StreamDescriptor, StreamKey, TaskEvent,
    TaskFailure, TaskRecord, TaskStatus, TaskView, ThreadInfo, ThreadInfoMap, random_task_id,
};
use crate::downloader::retry::RetryPolicy;
use crate::downloader::speed_limiter::SpeedLimiter;
use crate::downloader::store::{StoredTask, TaskStore};
use crate::parser::source::ManifestSource;
use crate::post_process::merger::{MergeCollaborator, MergeError, MergeJob};

const EVENT_CAPACITY: usize = 1024;

struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct TaskEntry {
    record: TaskRecord,
    threads: ThreadInfoMap,
    /// 暂停后到下载协程退出之前仍然保留
    run: Option<ActiveRun>,
    requeues: u32,
    /// 下载地址来自任务文件或者上一次运行，开始前要重新获取
    stale_urls: bool,
}

impl TaskEntry {
    fn is_current(&self, run_id: u64) -> bool {
        self.run.as_ref().is_some_and(|r| r.run_id == run_id)
    }
}

struct SchedulerState {
    tasks: HashMap<u64, TaskEntry>,
    ceiling: usize,
    run_seq: u64,
    numbering: u32,
    last_cid: Option<i64>,
    last_timestamp: i64,
}

impl SchedulerState {
    /// 单调递增的毫秒时间戳
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn duplicates_of(&self, records: &[TaskRecord]) -> Vec<DuplicateTask> {
        let mut found: Vec<DuplicateTask> = Vec::new();
        for record in records.iter().filter(|r| r.cid.is_some()) {
            for entry in self.tasks.values() {
                let existing = &entry.record;
                if existing.status.is_pending()
                    && existing.cid == record.cid
                    && existing.download_type == record.download_type
                    && !found.iter().any(|d| d.id == existing.id)
                {
                    found.push(DuplicateTask {
                        id: existing.id,
                        title: existing.title.clone(),
                        list_number: existing.list_number,
                        download_type: existing.download_type,
                        status: existing.status,
                    });
                }
            }
        }
        found
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    store: TaskStore,
    gateway: Arc<dyn FetchGateway>,
    source: Arc<dyn ManifestSource>,
    merger: Arc<dyn MergeCollaborator>,
    limiter: SpeedLimiter,
    policy: RetryPolicy,
    config: EngineConfig,
    events: broadcast::Sender<TaskEvent>,
    /// 两次断点之间的实时进度
    live: DashMap<(u64, StreamKey), (u64, Option<u64>)>,
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        config: EngineConfig,
        store: TaskStore,
        gateway: Arc<dyn FetchGateway>,
        source: Arc<dyn ManifestSource>,
        merger: Arc<dyn MergeCollaborator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SchedulerState {
            tasks: HashMap::new(),
            ceiling: config.download.max_download_count.max(1),
            run_seq: 0,
            numbering: 0,
            last_cid: None,
            last_timestamp: 0,
        };

        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(state),
                store,
                gateway,
                source,
                merger,
                limiter: SpeedLimiter::new(config.download.speed_limit_bps()),
                policy: RetryPolicy::from(&config.advanced),
                config,
                events,
                live: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// 修改全局限速，正在下载的任务立即生效
    pub fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.inner.limiter.set_limit(limit_bps);
    }

    pub fn speed_limit(&self) -> Option<u64> {
        self.inner.limiter.get_limit()
    }

    /// 分配一个内存和任务目录里都没有用到的 ID
    pub async fn allocate_id(&self) -> u64 {
        let state = self.inner.state.lock().await;
        self.inner.allocate_id(&state)
    }

    pub async fn check_duplicates(&self, records: &[TaskRecord]) -> Vec<DuplicateTask> {
        self.inner.state.lock().await.duplicates_of(records)
    }

    /// 添加一批任务，`Reject` 时只要有重复就整批不添加
    pub async fn submit(
        &self,
        records: Vec<TaskRecord>,
        policy: DuplicatePolicy,
    ) -> Result<Vec<u64>, DownloadError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if policy == DuplicatePolicy::Reject {
            let duplicates = state.duplicates_of(&records);
            if !duplicates.is_empty() {
                return Err(DownloadError::Duplicate(duplicates));
            }
        }

        // 先检查指定的 id，整批要么全部添加要么都不添加
        let mut explicit = HashSet::new();
        for record in records.iter().filter(|r| r.id != 0) {
            if !explicit.insert(record.id)
                || state.tasks.contains_key(&record.id)
                || inner.store.exists(record.id)
            {
                return Err(DownloadError::TaskAlreadyExists(record.id));
            }
        }

        let numbers = inner.assign_numbering(&mut state, &records);
        let mut ids = Vec::with_capacity(records.len());
        let mut failure = None;
        for (record, numbering) in records.into_iter().zip(numbers) {
            match inner.admit(&mut state, record, numbering) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        inner.promote(&mut state);
        match failure {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    /// 从任务目录恢复任务，中断的任务恢复为暂停
    pub async fn restore(&self) -> usize {
        let stored = self.inner.store.load_all();
        let mut state = self.inner.state.lock().await;
        let mut restored = 0;

        for StoredTask {
            mut record,
            thread_info,
        } in stored
        {
            if state.tasks.contains_key(&record.id) {
                continue;
            }
            let previous = record.status;
            if matches!(
                previous,
                TaskStatus::Waiting | TaskStatus::Downloading | TaskStatus::Merging
            ) {
                record.status = TaskStatus::Paused;
            }
            state.last_timestamp = state.last_timestamp.max(record.timestamp);

            let id = record.id;
            let mut entry = TaskEntry {
                record,
                threads: thread_info,
                run: None,
                requeues: 0,
                stale_urls: true,
            };
            if entry.record.status != previous {
                self.inner.persist(&mut entry);
            }
            state.tasks.insert(id, entry);
            restored += 1;
        }

        info!("恢复了 {} 个任务", restored);
        restored
    }

    pub async fn pause(&self, id: u64) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&id)
            .ok_or(DownloadError::TaskNotFound(id))?;
        if !self.inner.pause_entry(entry) {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 当前状态为 {}，无法暂停",
                id, entry.record.status
            )));
        }
        self.inner.promote(&mut state);
        Ok(())
    }

    pub async fn resume(&self, id: u64) -> Result<(), DownloadError> {
        self.requeue_from(id, TaskStatus::Paused).await
    }

    /// 失败的任务重新排队，已下载的部分保留
    pub async fn retry(&self, id: u64) -> Result<(), DownloadError> {
        self.requeue_from(id, TaskStatus::Error).await
    }

    async fn requeue_from(&self, id: u64, expected: TaskStatus) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&id)
            .ok_or(DownloadError::TaskNotFound(id))?;
        if entry.record.status != expected {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 当前状态为 {}",
                id, entry.record.status
            )));
        }

        entry.record.error = None;
        entry.requeues = 0;
        self.inner.set_status(entry, TaskStatus::Waiting);
        self.inner.promote(&mut state);
        Ok(())
    }

    /// 取消任务：立即删除记录，等下载协程退出后删除未完成的文件
    pub async fn cancel(&self, id: u64) -> Result<(), DownloadError> {
        let entry = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .tasks
                .remove(&id)
                .ok_or(DownloadError::TaskNotFound(id))?;
            if let Some(run) = &entry.run {
                run.token.cancel();
            }
            if let Err(e) = self.inner.store.delete(id) {
                warn!("删除任务文件失败: {}", e);
            }
            self.inner.live.retain(|(task_id, _), _| *task_id != id);
            self.inner.emit(TaskEvent::Removed { id });
            self.inner.promote(&mut state);
            entry
        };
        info!("🗑️ 已取消任务 {} ({})", id, entry.record.title);

        if let Some(run) = entry.run {
            if let Err(e) = run.handle.await {
                warn!("任务 {} 的下载协程异常退出: {}", id, e);
            }
        }

        if entry.record.status != TaskStatus::Complete
            && !self.inner.config.download.keep_partial_on_cancel
        {
            for desc in &entry.record.descriptors {
                let path = self.inner.config.download.path.join(&desc.file_name);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!("已删除未完成的文件: {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("删除文件失败 {:?}: {}", path, e),
                }
            }
        }
        Ok(())
    }

    /// 修改同时下载的任务数；`enforce_now` 时把多出来的、最晚开始的任务放回等待
    pub async fn set_ceiling(&self, ceiling: usize, enforce_now: bool) {
        let mut state = self.inner.state.lock().await;
        let ceiling = ceiling.max(1);
        state.ceiling = ceiling;

        if enforce_now {
            let mut running: Vec<(u64, u64)> = state
                .tasks
                .values()
                .filter(|e| e.record.status == TaskStatus::Downloading)
                .filter_map(|e| e.run.as_ref().map(|r| (r.run_id, e.record.id)))
                .collect();
            running.sort_unstable_by(|a, b| b.cmp(a));
            let excess = running.len().saturating_sub(ceiling);

            for (_, id) in running.into_iter().take(excess) {
                if let Some(entry) = state.tasks.get_mut(&id) {
                    if let Some(run) = &entry.run {
                        run.token.cancel();
                    }
                    info!("任务 {} 让出下载名额，回到等待队列", id);
                    self.inner.set_status(entry, TaskStatus::Waiting);
                }
            }
        }

        self.inner.promote(&mut state);
    }

    pub async fn ceiling(&self) -> usize {
        self.inner.state.lock().await.ceiling
    }

    pub async fn start_all(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut count = 0;
        for entry in state.tasks.values_mut() {
            if entry.record.status == TaskStatus::Paused {
                entry.record.error = None;
                self.inner.set_status(entry, TaskStatus::Waiting);
                count += 1;
            }
        }
        self.inner.promote(&mut state);
        count
    }

    pub async fn pause_all(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let count = state
            .tasks
            .values_mut()
            .map(|entry| self.inner.pause_entry(entry))
            .filter(|paused| *paused)
            .count();
        self.inner.promote(&mut state);
        count
    }

    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<u64> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|e| e.record.status != TaskStatus::Complete)
                .map(|e| e.record.id)
                .collect()
        };

        let mut count = 0;
        for id in ids {
            if self.cancel(id).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    /// 删除已完成任务的记录
    pub async fn clear_history(&self) -> Result<usize, DownloadError> {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<u64> = state
            .tasks
            .values()
            .filter(|e| e.record.status == TaskStatus::Complete)
            .map(|e| e.record.id)
            .collect();

        for id in &ids {
            self.inner.store.delete(*id)?;
            state.tasks.remove(id);
            self.inner.emit(TaskEvent::Removed { id: *id });
        }
        Ok(ids.len())
    }

    pub async fn snapshot(&self) -> Vec<TaskView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<TaskView> = state.tasks.values().map(|e| self.inner.view(e)).collect();
        views.sort_by_key(|v| (v.record.timestamp, v.record.id));
        views
    }

    pub async fn get(&self, id: u64) -> Option<TaskView> {
        let state = self.inner.state.lock().await;
        state.tasks.get(&id).map(|e| self.inner.view(e))
    }

    /// 没有等待、下载或合并中的任务
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        !state
            .tasks
            .values()
            .any(|e| e.run.is_some() || e.record.status == TaskStatus::Waiting)
    }

    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        while !self.is_idle().await {
            let _ = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
        }
    }
}

impl SchedulerInner {
    fn emit(&self, event: TaskEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    /// 写入任务文件，失败时任务转为出错
    fn persist(&self, entry: &mut TaskEntry) {
        if let Err(e) = self.store.write(&entry.record, &entry.threads) {
            error!("❌ 保存任务 {} 失败: {}", entry.record.id, e);
            if let Some(run) = &entry.run {
                run.token.cancel();
            }
            entry.record.status = TaskStatus::Error;
            entry.record.error = Some(TaskFailure {
                key: None,
                message: e.to_string(),
            });
        }
    }

    fn set_status(&self, entry: &mut TaskEntry, status: TaskStatus) {
        entry.record.status = status;
        self.persist(entry);
        self.emit(TaskEvent::StatusChanged {
            id: entry.record.id,
            status: entry.record.status,
        });
    }

    fn pause_entry(&self, entry: &mut TaskEntry) -> bool {
        match entry.record.status {
            TaskStatus::Downloading => {
                if let Some(run) = &entry.run {
                    run.token.cancel();
                }
            }
            TaskStatus::Waiting => {}
            _ => return false,
        }
        info!("⏸️ 暂停任务 {}", entry.record.id);
        self.set_status(entry, TaskStatus::Paused);
        true
    }

    fn allocate_id(&self, state: &SchedulerState) -> u64 {
        loop {
            let id = random_task_id();
            if !state.tasks.contains_key(&id) && !self.store.exists(id) {
                return id;
            }
        }
    }

    /// 同一个 cid 连续出现时共用一个编号
    fn assign_numbering(
        &self,
        state: &mut SchedulerState,
        records: &[TaskRecord],
    ) -> Vec<Option<u32>> {
        let download = &self.config.download;
        if !download.auto_add_number {
            return vec![None; records.len()];
        }

        let (mut counter, mut last_cid) = match download.number_type {
            NumberType::EpisodeList => {
                return records.iter().map(|r| Some(r.list_number)).collect();
            }
            NumberType::Coherent => (state.numbering, state.last_cid),
            NumberType::From1 => (0, None),
        };

        let numbers = records
            .iter()
            .map(|record| {
                if record.cid.is_none() || record.cid != last_cid {
                    counter += 1;
                }
                last_cid = record.cid;
                Some(counter)
            })
            .collect();

        state.numbering = counter;
        state.last_cid = last_cid;
        numbers
    }

    fn admit(
        &self,
        state: &mut SchedulerState,
        mut record: TaskRecord,
        numbering: Option<u32>,
    ) -> Result<u64, DownloadError> {
        if record.id == 0 {
            record.id = self.allocate_id(state);
        } else if state.tasks.contains_key(&record.id) || self.store.exists(record.id) {
            return Err(DownloadError::TaskAlreadyExists(record.id));
        }

        record.numbering = numbering;
        record.status = TaskStatus::Waiting;
        record.error = None;
        record.timestamp = state.next_timestamp();

        let threads = ThreadInfoMap::new();
        self.store.write(&record, &threads)?;

        let id = record.id;
        info!("📥 添加任务 {} ({})", id, record.title);
        state.tasks.insert(
            id,
            TaskEntry {
                record,
                threads,
                run: None,
                requeues: 0,
                stale_urls: false,
            },
        );
        self.emit(TaskEvent::StatusChanged {
            id,
            status: TaskStatus::Waiting,
        });
        Ok(id)
    }

    /// 按创建时间提升等待中的任务，直到达到上限
    fn promote(self: &Arc<Self>, state: &mut SchedulerState) {
        let mut active = state
            .tasks
            .values()
            .filter(|e| e.record.status == TaskStatus::Downloading)
            .count();
        if active >= state.ceiling {
            return;
        }

        // 上一次运行还没退出的任务要等它退出
        let mut waiting: Vec<(i64, u64)> = state
            .tasks
            .values()
            .filter(|e| e.record.status == TaskStatus::Waiting && e.run.is_none())
            .map(|e| (e.record.timestamp, e.record.id))
            .collect();
        waiting.sort_unstable();

        for (_, id) in waiting {
            if active >= state.ceiling {
                break;
            }
            if self.start_run(state, id) {
                active += 1;
            }
        }
    }

    fn start_run(self: &Arc<Self>, state: &mut SchedulerState, id: u64) -> bool {
        state.run_seq += 1;
        let run_id = state.run_seq;
        let Some(entry) = state.tasks.get_mut(&id) else {
            return false;
        };

        entry.record.error = None;
        self.set_status(entry, TaskStatus::Downloading);
        if entry.record.status != TaskStatus::Downloading {
            return false;
        }

        let token = CancellationToken::new();
        let refresh = entry.stale_urls.then(|| entry.record.clone());
        entry.stale_urls = true;

        let record = &entry.record;
        let mut runner = TaskRunner {
            task_id: id,
            referer: record.referer_url.clone(),
            descriptors: record
                .download_items
                .iter()
                .filter_map(|key| record.descriptor(*key))
                .cloned()
                .collect(),
            threads: entry.threads.clone(),
            download_dir: self.config.download.path.clone(),
            gateway: Arc::clone(&self.gateway),
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            check_md5: self.config.advanced.check_md5,
            max_threads: self.config.download.max_thread_count,
            token: token.clone(),
            sink: Arc::new(RunSink {
                inner: Arc::clone(self),
                task_id: id,
                run_id,
            }),
        };

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(record) = refresh {
                match inner.refresh_urls(id, run_id, record, &runner.token).await {
                    Some(descriptors) => runner.descriptors = descriptors,
                    None => return,
                }
            }
            let outcome = runner.run().await;
            if let Some(job) = inner.finish_fetch(id, run_id, outcome).await {
                let result = inner.merger.merge(&job).await;
                inner.finish_merge(id, run_id, result).await;
            }
        });

        info!("▶️ 开始下载任务 {} ({})", id, entry.record.title);
        entry.run = Some(ActiveRun {
            run_id,
            token,
            handle,
        });
        true
    }

    /// 重新获取下载地址并写回任务记录。返回 None 时这次运行已经结束
    async fn refresh_urls(
        self: &Arc<Self>,
        id: u64,
        run_id: u64,
        record: TaskRecord,
        token: &CancellationToken,
    ) -> Option<Vec<StreamDescriptor>> {
        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.source.refresh(&record) => Some(result),
        };

        let mut state = self.state.lock().await;
        let entry = state.tasks.get_mut(&id)?;
        if !entry.is_current(run_id) {
            return None;
        }

        if entry.record.status == TaskStatus::Downloading {
            match result {
                Some(Ok(fresh)) => {
                    for desc in entry.record.descriptors.iter_mut() {
                        if let Some(new) = fresh.iter().find(|d| d.key == desc.key) {
                            desc.url_list = new.url_list.clone();
                        }
                    }
                    self.persist(entry);
                    if entry.record.status == TaskStatus::Downloading {
                        debug!("任务 {} 已更新下载地址", id);
                        let record = &entry.record;
                        return Some(
                            record
                                .download_items
                                .iter()
                                .filter_map(|key| record.descriptor(*key))
                                .cloned()
                                .collect(),
                        );
                    }
                }
                Some(Err(e)) => {
                    let e = DownloadError::from(e);
                    error!("❌ 任务 {} 重新获取下载地址失败: {}", id, e);
                    entry.record.error = Some(TaskFailure {
                        key: None,
                        message: e.to_string(),
                    });
                    self.set_status(entry, TaskStatus::Error);
                }
                None => self.set_status(entry, TaskStatus::Paused),
            }
        }

        // 已经暂停、让出名额或者出错
        entry.run = None;
        self.promote(&mut state);
        None
    }

    /// 下载协程结束，返回需要执行的合并
    async fn finish_fetch(
        self: &Arc<Self>,
        id: u64,
        run_id: u64,
        outcome: RunOutcome,
    ) -> Option<MergeJob> {
        let mut state = self.state.lock().await;
        let requeue_timestamp =
            matches!(outcome, RunOutcome::Requeue { .. }).then(|| state.next_timestamp());
        let max_requeue = self.config.advanced.max_requeue_count;
        self.live.retain(|(task_id, _), _| *task_id != id);

        let entry = state.tasks.get_mut(&id)?;
        if !entry.is_current(run_id) {
            return None;
        }

        // 已经被暂停或者让出名额
        if entry.record.status != TaskStatus::Downloading {
            entry.run = None;
            debug!("任务 {} 的下载协程已退出", id);
            self.promote(&mut state);
            return None;
        }

        let status = match outcome {
            RunOutcome::Completed => {
                info!("任务 {} 下载完成，开始合并", id);
                TaskStatus::Merging
            }
            RunOutcome::Stopped => TaskStatus::Paused,
            RunOutcome::Requeue { key, error } => {
                entry.requeues += 1;
                if entry.requeues > max_requeue {
                    entry.record.error = Some(TaskFailure {
                        key: Some(key),
                        message: error.to_string(),
                    });
                    TaskStatus::Error
                } else {
                    // 排到队尾
                    if let Some(timestamp) = requeue_timestamp {
                        entry.record.timestamp = timestamp;
                    }
                    TaskStatus::Waiting
                }
            }
            RunOutcome::Failed { key, error } => {
                entry.record.error = Some(TaskFailure {
                    key: Some(key),
                    message: error.to_string(),
                });
                TaskStatus::Error
            }
            RunOutcome::Store(e) => {
                entry.record.error = Some(TaskFailure {
                    key: None,
                    message: e.to_string(),
                });
                TaskStatus::Error
            }
        };

        self.set_status(entry, status);
        let job = if entry.record.status == TaskStatus::Merging {
            Some(MergeJob::from_record(
                &entry.record,
                &self.config.download.path,
            ))
        } else {
            entry.run = None;
            if let Some(failure) = &entry.record.error {
                error!("❌ 任务 {} 失败: {}", id, failure);
            }
            None
        };

        self.promote(&mut state);
        job
    }

    async fn finish_merge(
        self: &Arc<Self>,
        id: u64,
        run_id: u64,
        result: Result<std::path::PathBuf, MergeError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.tasks.get_mut(&id) else {
            return;
        };
        if !entry.is_current(run_id) {
            return;
        }
        entry.run = None;

        let status = match result {
            Ok(output) => {
                info!("✅ 任务 {} 完成: {:?}", id, output);
                TaskStatus::Complete
            }
            Err(e) => {
                let e = DownloadError::from(e);
                error!("❌ 任务 {} 合并失败: {}", id, e);
                entry.record.error = Some(TaskFailure {
                    key: None,
                    message: e.to_string(),
                });
                TaskStatus::Error
            }
        };
        self.set_status(entry, status);
        self.promote(&mut state);
    }

    fn view(&self, entry: &TaskEntry) -> TaskView {
        let mut thread_info = entry.threads.clone();
        if entry.run.is_some() {
            for key in &entry.record.download_items {
                if let Some(live) = self.live.get(&(entry.record.id, *key)) {
                    let (downloaded, total) = *live;
                    let info = thread_info.entry(*key).or_default();
                    info.downloaded = downloaded;
                    if total.is_some() {
                        info.total_size = total;
                    }
                }
            }
        }

        TaskView {
            record: entry.record.clone(),
            thread_info,
            active: entry.run.is_some(),
        }
    }
}

/// 把一次运行的断点和进度交给调度器，运行过期后的回报会被忽略
struct RunSink {
    inner: Arc<SchedulerInner>,
    task_id: u64,
    run_id: u64,
}

#[async_trait]
impl ProgressSink for RunSink {
    async fn checkpoint(&self, key: StreamKey, info: &ThreadInfo) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.tasks.get_mut(&self.task_id) else {
            return Ok(());
        };
        if !entry.is_current(self.run_id) {
            return Ok(());
        }
        entry.threads.insert(key, info.clone());
        self.inner.store.write(&entry.record, &entry.threads)
    }

    fn progress(&self, key: StreamKey, downloaded: u64, total: Option<u64>) {
        self.inner
            .live
            .insert((self.task_id, key), (downloaded, total));
        self.inner.emit(TaskEvent::Progress {
            id: self.task_id,
            key,
            downloaded,
            total,
        });
    }
}
