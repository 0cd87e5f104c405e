use itertools::Itertools;
use tracing::debug;
use url::Url;

use crate::common::config::AdvancedConfig;

/// 生成下载地址时用到的设置
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub enable_switch_cdn: bool,
    pub cdn_list: Vec<String>,
    pub always_use_https: bool,
}

impl From<&AdvancedConfig> for StreamOptions {
    fn from(config: &AdvancedConfig) -> Self {
        Self {
            enable_switch_cdn: config.enable_switch_cdn,
            cdn_list: config.cdn_list.clone(),
            always_use_https: config.always_use_https_protocol,
        }
    }
}

/// 组装一个流的候选地址：主地址、备用地址，再加上换成镜像节点的主地址
pub fn build_url_list(base_url: &str, backup: Option<&[String]>, options: &StreamOptions) -> Vec<String> {
    let mut urls: Vec<String> = std::iter::once(base_url)
        .chain(backup.unwrap_or_default().iter().map(String::as_str))
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();

    if options.enable_switch_cdn {
        if let Some(primary) = urls.first().cloned() {
            urls.extend(
                options
                    .cdn_list
                    .iter()
                    .filter_map(|host| replace_host(&primary, host)),
            );
        }
    }

    urls.into_iter()
        .map(|u| {
            if options.always_use_https {
                u
            } else {
                downgrade_to_http(&u)
            }
        })
        .unique()
        .collect()
}

fn replace_host(url: &str, host: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    match parsed.set_host(Some(host)) {
        Ok(()) => Some(parsed.to_string()),
        Err(e) => {
            debug!("替换 CDN 节点失败 {}: {}", host, e);
            None
        }
    }
}

fn downgrade_to_http(url: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) => format!("http://{}", rest),
        None => url.to_string(),
    }
}
