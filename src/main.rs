use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};

use bili_fetcher::common::client::client::BiliClient;
use bili_fetcher::common::config::EngineConfig;
use bili_fetcher::common::logger::PrettyLogger;
use bili_fetcher::common::models::DownloadType;
use bili_fetcher::downloader::models::{DuplicatePolicy, ExtraOptions, TaskRecord, TaskStatus};
use bili_fetcher::downloader::progress::ProgressBoard;
use bili_fetcher::downloader::{DownloadError, HttpGateway, TaskScheduler, TaskStore};
use bili_fetcher::parser::models::VideoQuality;
use bili_fetcher::parser::playurl::{PlayUrlApi, VideoPage};
use bili_fetcher::parser::resolver::needs_av_merge;
use bili_fetcher::parser::{PlayUrlSource, StreamOptions, resolve, resolve_extra};
use bili_fetcher::post_process::FfmpegMerger;
use bili_fetcher::{log_complete, log_error, log_info, log_step, log_success, log_warning};

use crate::cli::{Cli, Command, DownloadArgs, SourceKind};

mod cli;

/// 一个要下载的分P或剧集
struct Target {
    cid: i64,
    title: String,
    list_number: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // 初始化日志，终端输出主要交给进度条和 PrettyLogger
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    args.apply(&mut config).map_err(anyhow::Error::msg)?;
    debug!("当前配置: {:?}", config);

    let client = BiliClient::new(&config).context("创建 HTTP 客户端失败")?;
    if !client.is_authenticated() {
        info!("未提供登录信息，可能无法下载受限内容");
    }

    let store = TaskStore::open(&config.download.state_dir, config.advanced.task_file_min_version)
        .context("打开任务目录失败")?;
    let merger = Arc::new(FfmpegMerger::new(&config.merge));
    let scheduler = TaskScheduler::new(
        config.clone(),
        store,
        Arc::new(HttpGateway::new(client.clone())),
        Arc::new(PlayUrlSource::new(
            client.clone(),
            StreamOptions::from(&config.advanced),
        )),
        merger.clone(),
    );
    scheduler.restore().await;

    match &args.command {
        Command::Download(download) => {
            let records = create_records(&scheduler, &client, &config, download).await?;
            if records.is_empty() {
                bail!("没有可以下载的内容");
            }

            if records.iter().any(needs_av_merge) && merger.check_ffmpeg().await.is_err() {
                log_warning!("未找到 ffmpeg，音视频下载完成后将无法合并");
            }

            let policy = if download.force {
                DuplicatePolicy::Proceed
            } else {
                DuplicatePolicy::Reject
            };
            match scheduler.submit(records, policy).await {
                Ok(ids) => log_success!("已添加 {} 个任务", ids.len()),
                Err(DownloadError::Duplicate(duplicates)) => {
                    log_warning!("以下任务已经存在，使用 --force 仍然添加:");
                    for dup in duplicates {
                        PrettyLogger::task_info(
                            format!("[{}] {}", dup.id, dup.title),
                            format!("{} · P{} · {}", dup.download_type, dup.list_number, dup.status),
                        );
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            run_until_idle(&scheduler).await;
        }
        Command::Resume => {
            let started = scheduler.start_all().await;
            if started == 0 && scheduler.is_idle().await {
                log_info!("没有需要继续的任务");
                return Ok(());
            }
            log_info!("继续 {} 个任务", started);
            run_until_idle(&scheduler).await;
        }
        Command::List => list_tasks(&scheduler).await,
        Command::Cancel { ids } => {
            for id in ids {
                match scheduler.cancel(*id).await {
                    Ok(()) => log_success!("已取消任务 {}", id),
                    Err(e) => log_error!("取消任务 {} 失败: {}", id, e),
                }
            }
        }
        Command::Clear { all } => {
            if *all {
                let cancelled = scheduler.cancel_all().await;
                log_info!("已取消 {} 个未完成的任务", cancelled);
            }
            let cleared = scheduler.clear_history().await?;
            log_success!("已清除 {} 条完成记录", cleared);
        }
    }

    Ok(())
}

/// 查询视频信息、请求播放地址，生成待提交的任务记录
async fn create_records(
    scheduler: &TaskScheduler,
    client: &BiliClient,
    config: &EngineConfig,
    args: &DownloadArgs,
) -> Result<Vec<TaskRecord>> {
    let api = PlayUrlApi::new(client);
    let options = StreamOptions::from(&config.advanced);
    let download_type = DownloadType::from(args.kind);

    let mut aid = args.aid;
    let mut cover_url = None;
    let mut series_title = None;

    let targets = if args.kind == SourceKind::Video
        && (args.cid.is_none() || args.title.is_none() || !args.pages.is_empty() || args.cover)
    {
        let bvid = args.bvid.as_deref().context("普通视频需要 --bvid")?;
        log_step!("获取视频信息: {}", bvid);
        let view = api.video_view(bvid).await?;
        aid = aid.or(Some(view.aid));
        cover_url = view.pic.clone();
        series_title = Some(view.title.clone());

        let multi_page = view.pages.len() > 1;
        let page_title = |page: &VideoPage| {
            if multi_page && !page.part.is_empty() {
                page.part.clone()
            } else {
                view.title.clone()
            }
        };

        let mut targets = Vec::new();
        if !args.pages.is_empty() {
            for number in &args.pages {
                let page = view
                    .pages
                    .iter()
                    .find(|p| p.page == *number)
                    .with_context(|| format!("分P {} 不存在，共 {} 个分P", number, view.pages.len()))?;
                targets.push(Target {
                    cid: page.cid,
                    title: page_title(page),
                    list_number: page.page,
                });
            }
        } else {
            let cid = args.cid.unwrap_or(view.cid);
            let target = match view.pages.iter().find(|p| p.cid == cid) {
                Some(page) => Target {
                    cid,
                    title: args.title.clone().unwrap_or_else(|| page_title(page)),
                    list_number: page.page,
                },
                None => Target {
                    cid,
                    title: args.title.clone().unwrap_or_else(|| view.title.clone()),
                    list_number: 1,
                },
            };
            targets.push(target);
        }
        log_complete!("{} ({} 个分P)", view.title, targets.len());
        targets
    } else {
        let cid = args.cid.context("需要 --cid")?;
        vec![Target {
            cid,
            title: args.title.clone().unwrap_or_else(|| cid.to_string()),
            list_number: 1,
        }]
    };

    let extra_options = ExtraOptions {
        download_danmaku: args.danmaku,
        download_subtitle: false,
        download_cover: args.cover,
    };
    let referer = referer_url(args);

    let mut records = Vec::new();
    for target in targets {
        let mut record = TaskRecord::new(scheduler.allocate_id().await, download_type, &target.title);
        record.series_title = series_title.clone();
        record.list_number = target.list_number;
        record.bvid = args.bvid.clone();
        record.aid = aid;
        record.cid = Some(target.cid);
        record.ep_id = args.ep_id;
        record.referer_url = referer.clone();
        record.cover_url = cover_url.clone();
        record.video_quality_id = args.quality.unwrap_or(config.download.video_quality_id);
        record.audio_quality_id = args
            .audio_quality
            .unwrap_or(config.download.audio_quality_id);
        record.video_codec_id = args.codec.unwrap_or(config.download.video_codec_id);
        record.download_option = args
            .streams
            .map(Into::into)
            .unwrap_or(config.download.stream_download_option);
        record.extra_options = extra_options;

        // 解析失败只跳过当前分P
        log_step!("解析播放地址: {}", target.title);
        let resolved = match api.fetch_manifest(&record).await {
            Ok(manifest) => resolve(record.clone(), &manifest, &options),
            Err(e) => Err(e),
        };
        match resolved {
            Ok(resolved) => {
                let mut detail = format!(
                    "{} · {} 个流",
                    VideoQuality::description(resolved.video_quality_id),
                    resolved.download_items.len()
                );
                if needs_av_merge(&resolved) {
                    detail.push_str("，需要合并");
                }
                PrettyLogger::task_info(&resolved.title, detail);
                records.push(resolved);
            }
            Err(e) => {
                log_error!("解析 {} 失败: {}", target.title, e);
                continue;
            }
        }

        if extra_options.any() {
            let mut extra = record;
            extra.id = scheduler.allocate_id().await;
            extra.download_type = DownloadType::Extra;
            extra.stream_type = None;
            match resolve_extra(extra, &options) {
                Ok(extra) if !extra.download_items.is_empty() => records.push(extra),
                Ok(_) => debug!("{} 没有可下载的附件", target.title),
                Err(e) => log_warning!("附件任务创建失败: {}", e),
            }
        }
    }

    Ok(records)
}

fn referer_url(args: &DownloadArgs) -> Option<String> {
    match args.kind {
        SourceKind::Video => args
            .bvid
            .as_ref()
            .map(|bvid| format!("https://www.bilibili.com/video/{}", bvid)),
        SourceKind::Bangumi => args
            .ep_id
            .map(|ep| format!("https://www.bilibili.com/bangumi/play/ep{}", ep)),
        SourceKind::Cheese => args
            .ep_id
            .map(|ep| format!("https://www.bilibili.com/cheese/play/ep{}", ep)),
    }
}

/// 显示进度直到所有任务结束，Ctrl-C 时暂停全部任务
async fn run_until_idle(scheduler: &TaskScheduler) {
    let board = ProgressBoard::new().spawn(scheduler.clone());

    tokio::select! {
        _ = scheduler.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            PrettyLogger::waiting("收到中断信号，正在暂停所有任务...");
            let paused = scheduler.pause_all().await;
            scheduler.wait_idle().await;
            log_info!("已暂停 {} 个任务，使用 resume 继续", paused);
        }
    }
    board.abort();

    let views = scheduler.snapshot().await;
    let count = |status: TaskStatus| views.iter().filter(|v| v.record.status == status).count();
    let mut items = vec![
        format!("完成: {}", count(TaskStatus::Complete)),
        format!("暂停: {}", count(TaskStatus::Paused)),
        format!("出错: {}", count(TaskStatus::Error)),
    ];
    for view in views.iter().filter(|v| v.record.status == TaskStatus::Error) {
        if let Some(failure) = &view.record.error {
            items.push(format!("[{}] {}: {}", view.record.id, view.record.title, failure));
        }
    }
    PrettyLogger::completion_summary("下载结束", items);
}

async fn list_tasks(scheduler: &TaskScheduler) {
    let views = scheduler.snapshot().await;
    if views.is_empty() {
        log_info!("没有任务");
        return;
    }

    PrettyLogger::title(format!("共 {} 个任务", views.len()));
    for view in &views {
        PrettyLogger::task_row(view);
    }
    PrettyLogger::separator();
}
