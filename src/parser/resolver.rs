use tracing::{debug, info, warn};

use crate::common::models::DownloadType;
use crate::downloader::models::{DownloadOption, StreamDescriptor, StreamKey, TaskRecord};
use crate::parser::errors::ResolutionError;
use crate::parser::manifest::{DashItem, DashManifest, FlvManifest, Manifest};
use crate::parser::models::{AudioQuality, StreamType, VideoCodec, VideoQuality};
use crate::parser::stream_utils::{StreamOptions, build_url_list};

const DANMAKU_URL: &str = "https://comment.bilibili.com";

/// 根据清单和任务的偏好补全任务记录：流描述、清晰度、编码、输出格式
pub fn resolve(
    mut record: TaskRecord,
    manifest: &Manifest,
    options: &StreamOptions,
) -> Result<TaskRecord, ResolutionError> {
    let found = manifest.stream_type();
    if let Some(expected) = record.stream_type {
        if expected != found {
            return Err(ResolutionError::ShapeMismatch {
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }
    record.stream_type = Some(found);

    let descriptors = match manifest {
        Manifest::Dash(dash) => resolve_dash(&mut record, dash, options)?,
        Manifest::Flv(flv) => resolve_flv(&mut record, flv, options)?,
    };

    finish(record, descriptors)
}

/// 已有任务的下载地址过期后重新解析：流、清晰度和文件名都不变，只换下载地址
pub fn refresh_urls(
    record: &TaskRecord,
    manifest: &Manifest,
    options: &StreamOptions,
) -> Result<Vec<StreamDescriptor>, ResolutionError> {
    let fresh = resolve(record.clone(), manifest, options)?;

    record
        .download_items
        .iter()
        .map(|key| {
            let old = record
                .descriptor(*key)
                .ok_or(ResolutionError::MissingStream(*key))?;
            let new = fresh
                .descriptor(*key)
                .ok_or(ResolutionError::MissingStream(*key))?;
            Ok(StreamDescriptor {
                key: *key,
                url_list: new.url_list.clone(),
                file_name: old.file_name.clone(),
            })
        })
        .collect()
}

/// 附件任务不需要清单，直接由 cid 和封面地址生成
pub fn resolve_extra(
    mut record: TaskRecord,
    options: &StreamOptions,
) -> Result<TaskRecord, ResolutionError> {
    if record.download_type != DownloadType::Extra {
        return Err(ResolutionError::UnsupportedSource(record.download_type));
    }

    let extra = record.extra_options;
    let mut descriptors = Vec::new();

    if extra.download_danmaku {
        let cid = record.cid.ok_or(ResolutionError::MissingIdentifier("cid"))?;
        descriptors.push(StreamDescriptor {
            key: StreamKey::Danmaku,
            url_list: vec![format!("{}/{}.xml", DANMAKU_URL, cid)],
            file_name: format!("danmaku_{}.xml", record.id),
        });
    }

    if extra.download_cover {
        match record.cover_url.as_deref().filter(|u| !u.is_empty()) {
            Some(cover_url) => {
                let sidecar_options = StreamOptions {
                    enable_switch_cdn: false,
                    ..options.clone()
                };
                descriptors.push(StreamDescriptor {
                    key: StreamKey::Cover,
                    url_list: build_url_list(cover_url, None, &sidecar_options),
                    file_name: format!("cover_{}.{}", record.id, image_extension(cover_url)),
                });
            }
            None => warn!("任务 {} 没有封面地址，跳过封面", record.id),
        }
    }

    if extra.download_subtitle {
        warn!("字幕下载暂不支持，已忽略");
    }

    record.output_container = None;
    finish(record, descriptors)
}

fn finish(
    mut record: TaskRecord,
    descriptors: Vec<StreamDescriptor>,
) -> Result<TaskRecord, ResolutionError> {
    let (kept, dropped): (Vec<_>, Vec<_>) = descriptors
        .into_iter()
        .partition(|d| !d.url_list.is_empty());
    for d in &dropped {
        warn!("{} 没有可用的下载地址，已跳过", d.key);
    }

    if kept.is_empty() {
        return Err(ResolutionError::NoStreams);
    }

    record.download_items = kept.iter().map(|d| d.key).collect();
    // 视频地址全部为空时只剩音频，输出格式跟随音频
    if record.stream_type == Some(StreamType::Dash)
        && !record.download_items.contains(&StreamKey::Video)
    {
        record.output_container = kept
            .iter()
            .find(|d| d.key == StreamKey::Audio)
            .and_then(|d| d.file_name.rsplit('.').next())
            .map(str::to_string);
    }
    record.descriptors = kept;
    info!(
        "任务 {} 解析完成: {:?}，清晰度 {}，音质 {}",
        record.id,
        record.download_items,
        VideoQuality::description(record.video_quality_id),
        AudioQuality::description(record.audio_quality_id)
    );
    Ok(record)
}

// -----------------------------------------------------------------------------------------------

fn resolve_dash(
    record: &mut TaskRecord,
    dash: &DashManifest,
    options: &StreamOptions,
) -> Result<Vec<StreamDescriptor>, ResolutionError> {
    if record.download_items.is_empty() {
        record.download_items = match record.download_option {
            DownloadOption::VideoOnly => vec![StreamKey::Video],
            DownloadOption::AudioOnly => vec![StreamKey::Audio],
            DownloadOption::VideoAndAudio if dash.has_audio() => {
                vec![StreamKey::Video, StreamKey::Audio]
            }
            DownloadOption::VideoAndAudio => {
                warn!("清单中没有音频流，改为仅下载视频");
                record.download_option = DownloadOption::VideoOnly;
                vec![StreamKey::Video]
            }
        };
    }

    let mut descriptors = Vec::new();

    if record.download_items.contains(&StreamKey::Video) {
        descriptors.push(select_video(record, &dash.video, options)?);
    }

    let mut audio_ext = None;
    if record.download_items.contains(&StreamKey::Audio) {
        match select_audio(record, dash) {
            Some((item, ext)) => {
                descriptors.push(StreamDescriptor {
                    key: StreamKey::Audio,
                    url_list: build_url_list(&item.base_url, item.backup_url.as_deref(), options),
                    file_name: format!("audio_{}.{}", record.id, ext),
                });
                audio_ext = Some(ext);
            }
            None => {
                warn!(
                    "没有匹配的音频流 ({})，改为仅下载视频",
                    AudioQuality::description(record.audio_quality_id)
                );
                record.audio_quality_id = AudioQuality::NONE_ID;
                record.download_items.retain(|k| *k != StreamKey::Audio);
                if record.download_items.contains(&StreamKey::Video) {
                    record.download_option = DownloadOption::VideoOnly;
                }
            }
        }
    }

    record.output_container = if record.download_items.contains(&StreamKey::Video) {
        Some("mp4".to_string())
    } else {
        audio_ext.map(str::to_string)
    };

    Ok(descriptors)
}

fn select_video(
    record: &mut TaskRecord,
    videos: &[DashItem],
    options: &StreamOptions,
) -> Result<StreamDescriptor, ResolutionError> {
    if videos.is_empty() {
        return Err(ResolutionError::MissingSection("dash.video"));
    }

    let requested = record.video_quality_id;
    let quality = select_quality(requested, videos.iter().map(|v| v.id)).ok_or_else(|| {
        ResolutionError::QualityUnavailable {
            requested,
            available: videos.iter().map(|v| v.id).collect(),
        }
    })?;

    // 优先使用请求的编码，否则取该清晰度下清单中的第一个
    let at_quality = videos.iter().filter(|v| v.id == quality);
    let item = at_quality
        .clone()
        .find(|v| v.codec_id == record.video_codec_id)
        .or_else(|| at_quality.clone().next())
        .ok_or(ResolutionError::MissingSection("dash.video"))?;

    if item.codec_id != record.video_codec_id {
        debug!(
            "清晰度 {} 没有 {} 编码，使用 {}",
            quality,
            VideoCodec::description(record.video_codec_id),
            VideoCodec::description(item.codec_id)
        );
    }

    record.video_quality_id = quality;
    record.video_codec_id = item.codec_id;

    Ok(StreamDescriptor {
        key: StreamKey::Video,
        url_list: build_url_list(&item.base_url, item.backup_url.as_deref(), options),
        file_name: format!("video_{}.m4s", record.id),
    })
}

/// 选中的音频和它的文件扩展名，没有音频时返回 None
fn select_audio<'a>(
    record: &mut TaskRecord,
    dash: &'a DashManifest,
) -> Option<(&'a DashItem, &'static str)> {
    let requested = if record.audio_quality_id == AudioQuality::AUTO_ID {
        best_audio_id(dash)
    } else {
        record.audio_quality_id
    };

    let selected = match requested {
        AudioQuality::NONE_ID => None,
        AudioQuality::HI_RES_ID => dash.hi_res_audio().map(|a| (a, "flac")),
        AudioQuality::DOLBY_ID => dash.dolby_audio().map(|a| (a, "ec3")),
        id => dash
            .normal_audio()
            .iter()
            .find(|a| a.id == id)
            .map(|a| (a, "m4a")),
    };

    if selected.is_some() {
        record.audio_quality_id = requested;
    }
    selected
}

fn best_audio_id(dash: &DashManifest) -> i32 {
    if dash.hi_res_audio().is_some() {
        AudioQuality::HI_RES_ID
    } else if dash.dolby_audio().is_some() {
        AudioQuality::DOLBY_ID
    } else {
        dash.normal_audio()
            .iter()
            .max_by_key(|a| a.bandwidth)
            .map(|a| a.id)
            .unwrap_or(AudioQuality::NONE_ID)
    }
}

/// 自动时取最高；否则精确匹配，没有就取不超过请求的最高清晰度
pub fn select_quality(requested: i32, available: impl IntoIterator<Item = i32>) -> Option<i32> {
    let available: Vec<i32> = available.into_iter().collect();
    if requested == VideoQuality::AUTO_ID {
        return available.iter().copied().max();
    }
    if available.contains(&requested) {
        return Some(requested);
    }
    available.into_iter().filter(|q| *q <= requested).max()
}

// -----------------------------------------------------------------------------------------------

fn resolve_flv(
    record: &mut TaskRecord,
    flv: &FlvManifest,
    options: &StreamOptions,
) -> Result<Vec<StreamDescriptor>, ResolutionError> {
    if flv.durl.is_empty() {
        return Err(ResolutionError::MissingSection("durl"));
    }

    let requested = record.video_quality_id;
    let quality = match select_quality(requested, flv.accept_quality.iter().copied()) {
        Some(q) => q,
        None if requested == VideoQuality::AUTO_ID => flv
            .quality
            .ok_or_else(|| ResolutionError::Malformed("accept_quality 为空".to_string()))?,
        None => {
            // 请求低于所有可选清晰度时不升档，保持请求值
            warn!(
                "没有不高于 {} 的清晰度 (可用: {:?})，保持请求的清晰度",
                requested, flv.accept_quality
            );
            requested
        }
    };

    record.video_quality_id = quality;
    record.video_codec_id = VideoCodec::AVC_ID;
    record.audio_quality_id = AudioQuality::NONE_ID;
    record.download_option = DownloadOption::VideoOnly;
    record.output_container = Some("flv".to_string());

    let parts = flv.durl.len();
    if record.download_items.is_empty() {
        record.download_items = (1..=parts as u32).map(StreamKey::Flv).collect();
    }

    let descriptors = flv
        .durl
        .iter()
        .enumerate()
        .map(|(index, segment)| (index as u32 + 1, segment))
        .filter(|(n, _)| record.download_items.contains(&StreamKey::Flv(*n)))
        .map(|(n, segment)| {
            let file_name = if parts > 1 {
                format!("flv_{}_part{}.flv", record.id, n)
            } else {
                format!("flv_{}.flv", record.id)
            };
            StreamDescriptor {
                key: StreamKey::Flv(n),
                url_list: build_url_list(&segment.url, segment.backup_url.as_deref(), options),
                file_name,
            }
        })
        .collect();

    Ok(descriptors)
}

fn image_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "png"
    } else if path.ends_with(".webp") {
        "webp"
    } else if path.ends_with(".gif") {
        "gif"
    } else {
        "jpg"
    }
}

/// 一个 Dash 任务是否需要合并音视频
pub fn needs_av_merge(record: &TaskRecord) -> bool {
    record.stream_type == Some(StreamType::Dash)
        && record.download_items.contains(&StreamKey::Video)
        && record.download_items.contains(&StreamKey::Audio)
}
