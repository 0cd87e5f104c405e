use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use md5::{Digest, Md5};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bili_fetcher::common::client::client::BiliClient;
use bili_fetcher::common::config::{EngineConfig, ProxyMode};
use bili_fetcher::common::models::DownloadType;
use bili_fetcher::downloader::gateway::FetchRequest;
use bili_fetcher::downloader::models::{DuplicatePolicy, StreamKey, TaskRecord, TaskStatus};
use bili_fetcher::downloader::{FetchGateway, HttpGateway, TaskScheduler, TaskStore};
use bili_fetcher::parser::{Manifest, PlayUrlSource, StreamOptions, resolve};
use bili_fetcher::post_process::FfmpegMerger;

const BODY: &[u8] = b"0123456789";

fn test_config(root: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.download.path = root.join("downloads");
    config.download.state_dir = root.join("tasks");
    config.proxy.proxy_mode = ProxyMode::Disable;
    config.advanced.download_suspend_retry_interval = 0;
    config
}

fn local_options() -> StreamOptions {
    StreamOptions {
        enable_switch_cdn: false,
        cdn_list: Vec::new(),
        always_use_https: false,
    }
}

#[tokio::test]
async fn ranged_request_sends_offset_and_referer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video.flv"))
        .and(header("Range", "bytes=4-"))
        .and(header("Referer", "https://www.bilibili.com/video/BV1xx411c7mD"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[4..]))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BiliClient::new(&test_config(dir.path())).unwrap();
    let gateway = HttpGateway::new(client);

    let response = gateway
        .fetch(FetchRequest {
            url: format!("{}/video.flv", server.uri()),
            offset: 4,
            referer: Some("https://www.bilibili.com/video/BV1xx411c7mD".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(response.status, 206);
    assert_eq!(response.content_length, Some(6));
    let chunks: Vec<_> = response.body.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"456789");
}

#[tokio::test]
async fn single_part_flv_task_completes_through_http() {
    let server = MockServer::start().await;
    let md5 = format!("{:x}", Md5::digest(BODY));
    Mock::given(method("GET"))
        .and(path("/1.flv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-MD5", md5.as_str())
                .set_body_bytes(BODY),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let client = BiliClient::new(&config).unwrap();
    let store = TaskStore::open(&config.download.state_dir, config.advanced.task_file_min_version)
        .unwrap();
    let scheduler = TaskScheduler::new(
        config.clone(),
        store,
        Arc::new(HttpGateway::new(client.clone())),
        Arc::new(PlayUrlSource::new(client, local_options())),
        Arc::new(FfmpegMerger::new(&config.merge)),
    );

    let manifest = Manifest::from_value(json!({
        "accept_quality": [80, 64],
        "durl": [{"order": 1, "size": BODY.len(), "url": format!("{}/1.flv", server.uri())}]
    }))
    .unwrap();
    let mut record = TaskRecord::new(scheduler.allocate_id().await, DownloadType::Video, "测试 视频");
    record.cid = Some(1001);
    record.video_quality_id = 80;
    let record = resolve(record, &manifest, &local_options()).unwrap();
    assert_eq!(record.download_items, vec![StreamKey::Flv(1)]);

    let ids = scheduler
        .submit(vec![record], DuplicatePolicy::Reject)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait_idle())
        .await
        .unwrap();

    let view = scheduler.get(ids[0]).await.unwrap();
    assert_eq!(view.record.status, TaskStatus::Complete, "{:?}", view.record.error);
    assert_eq!(view.downloaded(), BODY.len() as u64);

    let output = config.download.path.join("01 - 测试 视频.flv");
    assert_eq!(std::fs::read(&output).unwrap(), BODY);
    assert!(!config.download.path.join(format!("flv_{}.flv", ids[0])).exists());

    // 任务文件里的状态也已经更新
    let stored = scheduler.store().read_record(ids[0]).unwrap();
    assert_eq!(stored.status, TaskStatus::Complete);
}
