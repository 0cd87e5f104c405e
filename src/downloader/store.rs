//! 任务文件读写
//!
//! 每个任务一个 `info_<id>.json`：
//! ```json
//! {
//!   "header": {"min_version": 1630},
//!   "task_info": {...},
//!   "thread_info": {"video": {...}, "audio": {...}}
//! }
//! ```
//! 所有写入都由调度器在持有状态锁时发起，同一个文件只有一个写者。

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::downloader::error::StoreError;
use crate::downloader::models::{TaskRecord, ThreadInfoMap};

const FILE_PREFIX: &str = "info_";
const FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    TaskInfo,
    ThreadInfo,
}

impl Section {
    fn as_str(&self) -> &'static str {
        match self {
            Section::Header => "header",
            Section::TaskInfo => "task_info",
            Section::ThreadInfo => "thread_info",
        }
    }
}

/// 从任务文件恢复出的任务
#[derive(Debug, Clone)]
pub struct StoredTask {
    pub record: TaskRecord,
    pub thread_info: ThreadInfoMap,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
    min_version: u32,
}

impl TaskStore {
    pub fn open(dir: impl Into<PathBuf>, min_version: u32) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, min_version })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}.{}", FILE_PREFIX, id, FILE_EXTENSION))
    }

    pub fn exists(&self, id: u64) -> bool {
        self.file_path(id).exists()
    }

    /// 文件不存在时写入空文档，已存在则不动
    pub fn create(&self, id: u64) -> Result<(), StoreError> {
        let path = self.file_path(id);
        if path.exists() {
            return Ok(());
        }
        Self::write_document(&path, &Value::Object(Map::new()))
    }

    /// 覆盖写入整个任务文件，同时刷新版本号
    pub fn write(&self, record: &TaskRecord, thread_info: &ThreadInfoMap) -> Result<(), StoreError> {
        let document = json!({
            "header": {"min_version": self.min_version},
            "task_info": serde_json::to_value(record)?,
            "thread_info": serde_json::to_value(thread_info)?,
        });
        Self::write_document(&self.file_path(record.id), &document)
    }

    /// 读取一段，缺失或无法读取时返回空对象
    pub fn read(&self, id: u64, section: Section) -> Value {
        Self::read_document(&self.file_path(id))
            .and_then(|mut doc| doc.get_mut(section.as_str()).map(Value::take))
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn read_record(&self, id: u64) -> Option<TaskRecord> {
        let value = self.read(id, Section::TaskInfo);
        if value.as_object().is_none_or(|m| m.is_empty()) {
            return None;
        }
        serde_json::from_value(value)
            .map_err(|e| warn!("任务 {} 的 task_info 无法解析: {}", id, e))
            .ok()
    }

    pub fn read_thread_info(&self, id: u64) -> ThreadInfoMap {
        serde_json::from_value(self.read(id, Section::ThreadInfo)).unwrap_or_else(|e| {
            warn!("任务 {} 的 thread_info 无法解析: {}", id, e);
            ThreadInfoMap::new()
        })
    }

    /// 版本号不低于引擎要求时才兼容，没有版本号的文件视为不兼容
    pub fn check_compatibility(&self, id: u64) -> bool {
        self.read(id, Section::Header)
            .get("min_version")
            .and_then(Value::as_u64)
            .is_some_and(|v| v >= self.min_version as u64)
    }

    pub fn delete(&self, id: u64) -> Result<(), StoreError> {
        let path = self.file_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("已删除任务文件: {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let ids = self.task_ids();
        for id in &ids {
            self.delete(*id)?;
        }
        Ok(ids.len())
    }

    /// 加载所有兼容的任务，按创建时间排序；不兼容的文件直接删除
    pub fn load_all(&self) -> Vec<StoredTask> {
        let mut tasks = Vec::new();

        for id in self.task_ids() {
            if !self.check_compatibility(id) {
                info!("删除不兼容的任务文件: {}", id);
                if let Err(e) = self.delete(id) {
                    warn!("删除任务文件失败: {}", e);
                }
                continue;
            }

            match self.read_record(id) {
                Some(record) => tasks.push(StoredTask {
                    thread_info: self.read_thread_info(id),
                    record,
                }),
                None => warn!("任务文件 {} 没有任务信息，已跳过", id),
            }
        }

        tasks.sort_by_key(|t| (t.record.timestamp, t.record.id));
        debug!("从 {:?} 加载了 {} 个任务", self.dir, tasks.len());
        tasks
    }

    fn task_ids(&self) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix(FILE_PREFIX)?
                    .strip_suffix(&format!(".{}", FILE_EXTENSION))?
                    .parse::<u64>()
                    .ok()
            })
            .collect()
    }

    fn read_document(path: &Path) -> Option<Value> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text)
            .map_err(|e| debug!("任务文件 {:?} 解析失败: {}", path, e))
            .ok()
    }

    // 先写临时文件再重命名，写入中断不会留下半个文件
    fn write_document(path: &Path, document: &Value) -> Result<(), StoreError> {
        let temp_path = path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(&temp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, document)?;
        writer.flush().map_err(io_err)?;
        drop(writer);

        fs::rename(&temp_path, path).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::TASK_FILE_MIN_VERSION;
    use crate::common::models::DownloadType;
    use crate::downloader::models::{StreamKey, TaskStatus, ThreadInfo};

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks"), TASK_FILE_MIN_VERSION).unwrap();
        (dir, store)
    }

    fn record(id: u64, timestamp: i64) -> TaskRecord {
        let mut record = TaskRecord::new(id, DownloadType::Video, format!("任务{}", id));
        record.timestamp = timestamp;
        record.cid = Some(42);
        record
    }

    #[test]
    fn write_then_read_is_stable() {
        let (_dir, store) = store();
        let rec = record(11111111, 5);
        let mut threads = ThreadInfoMap::new();
        threads.insert(
            StreamKey::Video,
            ThreadInfo {
                downloaded: 1024,
                total_size: Some(4096),
                checksum: Some("abc".to_string()),
                completed: false,
            },
        );

        store.write(&rec, &threads).unwrap();
        assert_eq!(store.read_record(rec.id), Some(rec.clone()));
        assert_eq!(store.read_thread_info(rec.id), threads);

        // 再写一次内容不变
        store.write(&rec, &threads).unwrap();
        assert_eq!(store.read_record(rec.id), Some(rec));
        assert!(store.check_compatibility(11111111));
    }

    #[test]
    fn missing_sections_read_as_empty() {
        let (_dir, store) = store();
        store.create(22222222).unwrap();

        assert_eq!(store.read(22222222, Section::ThreadInfo), json!({}));
        assert!(store.read_thread_info(22222222).is_empty());
        assert!(store.read_record(22222222).is_none());
        assert_eq!(store.read(99999999, Section::TaskInfo), json!({}));
        assert!(!store.check_compatibility(22222222));
    }

    #[test]
    fn create_does_not_clobber_existing_file() {
        let (_dir, store) = store();
        let rec = record(33333333, 1);
        store.write(&rec, &ThreadInfoMap::new()).unwrap();
        store.create(rec.id).unwrap();
        assert_eq!(store.read_record(rec.id), Some(rec));
    }

    #[test]
    fn old_version_is_deleted_on_load() {
        let (dir, store) = store();
        let old_store = TaskStore::open(dir.path().join("tasks"), 1000).unwrap();
        old_store.write(&record(44444444, 1), &ThreadInfoMap::new()).unwrap();
        store.write(&record(55555555, 3), &ThreadInfoMap::new()).unwrap();
        store.write(&record(66666666, 2), &ThreadInfoMap::new()).unwrap();

        let loaded = store.load_all();
        let ids: Vec<u64> = loaded.iter().map(|t| t.record.id).collect();
        assert_eq!(ids, vec![66666666, 55555555]);
        assert!(!store.exists(44444444));
        assert_eq!(loaded[0].record.status, TaskStatus::Waiting);
    }

    #[test]
    fn unreadable_file_reads_as_no_data() {
        let (_dir, store) = store();
        fs::write(store.file_path(77777777), "{not json").unwrap();
        assert_eq!(store.read(77777777, Section::TaskInfo), json!({}));
        assert!(store.load_all().is_empty());
        assert!(!store.exists(77777777));
    }

    #[test]
    fn write_errors_are_surfaced() {
        let (dir, store) = store();
        fs::remove_dir_all(dir.path().join("tasks")).unwrap();
        fs::write(dir.path().join("tasks"), "not a directory").unwrap();

        let err = store.write(&record(88888888, 1), &ThreadInfoMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.write(&record(12121212, 1), &ThreadInfoMap::new()).unwrap();
        store.write(&record(13131313, 2), &ThreadInfoMap::new()).unwrap();
        store.delete(12121212).unwrap();
        store.delete(12121212).unwrap();
        assert_eq!(store.delete_all().unwrap(), 1);
        assert!(store.load_all().is_empty());
    }
}
