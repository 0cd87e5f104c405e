use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::downloader::models::{StreamKey, TaskEvent, TaskStatus};
use crate::downloader::scheduler::TaskScheduler;

struct TaskBar {
    bar: ProgressBar,
    title: String,
    streams: HashMap<StreamKey, (u64, Option<u64>)>,
}

/// 终端进度条，由调度器的事件驱动
pub struct ProgressBoard {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<u64, TaskBar>,
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBoard {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");

        Self {
            multi: MultiProgress::new(),
            style,
            bars: HashMap::new(),
        }
    }

    pub fn spawn(mut self, scheduler: TaskScheduler) -> JoinHandle<()> {
        let mut events = scheduler.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.apply(&scheduler, event).await,
                    Err(RecvError::Lagged(skipped)) => debug!("进度事件丢失 {} 条", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn apply(&mut self, scheduler: &TaskScheduler, event: TaskEvent) {
        match event {
            TaskEvent::StatusChanged { id, status } => match status {
                TaskStatus::Downloading => {
                    self.ensure_bar(scheduler, id).await;
                }
                TaskStatus::Merging => {
                    if let Some(task) = self.bars.get(&id) {
                        task.bar.set_message(format!("合并中 {}", task.title));
                    }
                }
                TaskStatus::Complete => {
                    if let Some(task) = self.bars.remove(&id) {
                        task.bar.finish_with_message(format!("✅ {}", task.title));
                    }
                }
                TaskStatus::Error | TaskStatus::Paused => {
                    if let Some(task) = self.bars.remove(&id) {
                        task.bar.abandon_with_message(format!("{} {}", status, task.title));
                    }
                }
                TaskStatus::Waiting => {
                    if let Some(task) = self.bars.remove(&id) {
                        task.bar.finish_and_clear();
                    }
                }
            },
            TaskEvent::Progress {
                id,
                key,
                downloaded,
                total,
            } => {
                self.ensure_bar(scheduler, id).await;
                if let Some(task) = self.bars.get_mut(&id) {
                    task.streams.insert(key, (downloaded, total));
                    let position: u64 = task.streams.values().map(|(d, _)| d).sum();
                    let length: u64 = task.streams.values().filter_map(|(_, t)| *t).sum();
                    task.bar.set_length(length.max(position));
                    task.bar.set_position(position);
                }
            }
            TaskEvent::Removed { id } => {
                if let Some(task) = self.bars.remove(&id) {
                    task.bar.finish_and_clear();
                }
            }
        }
    }

    async fn ensure_bar(&mut self, scheduler: &TaskScheduler, id: u64) {
        if self.bars.contains_key(&id) {
            return;
        }
        // 已经结束的任务可能还有迟到的进度事件
        let Some(view) = scheduler.get(id).await.filter(|view| view.active) else {
            return;
        };
        let title = view.record.title;

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(self.style.clone());
        bar.set_message(title.clone());
        self.bars.insert(
            id,
            TaskBar {
                bar,
                title,
                streams: HashMap::new(),
            },
        );
    }
}
