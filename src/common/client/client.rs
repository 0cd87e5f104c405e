use std::io::Read;
use std::time::Duration;

use crate::common::client::error::ApiError;
use crate::common::client::models::common::CommonResponse;
use crate::common::client::models::nav::NavResponse;
use crate::common::config::{AuthConfig, EngineConfig, ProxyConfig, ProxyMode};
use cookie::Cookie;
use flate2::read::GzDecoder;
use reqwest::{
    Client, ClientBuilder, Proxy, Response,
    header::{
        ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderValue, RANGE, REFERER,
        USER_AGENT,
    },
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use tracing::{debug, error};

const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

// 携带登录 Cookie 和代理设置的客户端
#[derive(Debug, Clone)]
pub struct BiliClient {
    pub inner: Client,
    cookie_header: Option<String>,
}

impl BiliClient {
    pub fn new(config: &EngineConfig) -> Result<Self, ApiError> {
        let headers = Self::get_default_headers(&config.advanced.user_agent);

        let builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .default_headers(headers);

        let inner = Self::apply_proxy(builder, &config.proxy)?
            .build()
            .map_err(|e| {
                error!("创建客户端失败: {}", e);
                ApiError::Build(e.to_string())
            })?;

        Ok(Self {
            inner,
            cookie_header: Self::cookie_header(&config.auth),
        })
    }

    pub fn get_default_headers(user_agent: &str) -> HeaderMap {
        // 创建默认请求头
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        headers.insert(REFERER, HeaderValue::from_static("https://www.bilibili.com/"));
        let ua = HeaderValue::from_str(user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(crate::common::config::DEFAULT_USER_AGENT));
        headers.insert(USER_AGENT, ua);

        headers
    }

    fn apply_proxy(builder: ClientBuilder, proxy: &ProxyConfig) -> Result<ClientBuilder, ApiError> {
        match proxy.proxy_mode {
            ProxyMode::Disable => Ok(builder.no_proxy()),
            // reqwest 默认读取系统代理环境变量
            ProxyMode::Follow => Ok(builder),
            ProxyMode::Custom => {
                let port = proxy.proxy_port.ok_or_else(|| {
                    ApiError::Build("自定义代理缺少端口".to_string())
                })?;
                let mut custom = Proxy::all(format!("http://{}:{}", proxy.proxy_ip, port))
                    .map_err(|e| ApiError::Build(format!("代理地址无效: {}", e)))?;
                if proxy.enable_auth {
                    custom = custom.basic_auth(&proxy.auth_username, &proxy.auth_password);
                }
                debug!("使用自定义代理 {}:{}", proxy.proxy_ip, port);
                Ok(builder.proxy(custom))
            }
        }
    }

    fn cookie_header(auth: &AuthConfig) -> Option<String> {
        let pairs = [
            ("SESSDATA", &auth.sessdata),
            ("bili_jct", &auth.bili_jct),
            ("DedeUserID", &auth.dede_user_id),
            ("buvid3", &auth.buvid3),
        ];
        let cookies: Vec<String> = pairs
            .iter()
            .filter_map(|(name, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| Cookie::new(*name, v).to_string())
            })
            .collect();

        if cookies.is_empty() {
            None
        } else {
            Some(cookies.join("; "))
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.cookie_header.is_some()
    }

    // 通用 GET 请求，检查 B站 的 code 字段并取出 data/result
    pub async fn get_json(&self, url: &str, query: &str) -> Result<Value, ApiError> {
        let full_url = if query.is_empty() {
            url.to_string()
        } else {
            format!("{}?{}", url, query)
        };
        debug!("请求接口: {}", full_url);

        let resp = self.request(&full_url).send().await.map_err(|e| {
            error!("请求失败: {}", e);
            e
        })?;

        let body: CommonResponse<Value> = Self::handle_response(resp).await?;
        if body.code != 0 {
            return Err(ApiError::ApiError(body.code, body.message));
        }
        body.into_payload()
            .ok_or_else(|| ApiError::InvalidResponse("响应中缺少 data/result".to_string()))
    }

    /// 获取 WBI 签名用的 img_key 和 sub_key
    pub async fn wbi_keys(&self) -> Result<(String, String), ApiError> {
        let resp = self.request(NAV_URL).send().await?;
        let nav: NavResponse = Self::handle_response(resp).await?;
        debug!("导航接口返回 code: {}", nav.code);

        nav.data
            .and_then(|data| data.wbi_img.keys())
            .ok_or_else(|| ApiError::InvalidResponse("导航接口缺少 wbi_img".to_string()))
    }

    // 下载用的原始响应，offset 大于 0 时带上 Range 头
    pub async fn get_raw_response(
        &self,
        url: &str,
        offset: u64,
        referer: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut request = self
            .request(url)
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        Ok(request.send().await?)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.inner.get(url);
        match &self.cookie_header {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    fn try_decompress(raw: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut decoder = GzDecoder::new(raw);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded)?;
        Ok(decoded)
    }

    async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let status = resp.status();
        if status.is_server_error() {
            return Err(ApiError::RetryLater);
        }

        let url = resp.url().to_string();
        let raw_body = resp.bytes().await?;

        let decompressed = match Self::try_decompress(&raw_body) {
            Ok(data) => data,
            Err(_) => raw_body.to_vec(), // 解压失败则原样使用
        };

        let text = String::from_utf8_lossy(&decompressed);

        match serde_json::from_str::<T>(&text) {
            Ok(data) => Ok(data),
            Err(e) => {
                // 不是 JSON，可能是 HTML 页面
                if text.contains("<!DOCTYPE html>") || text.contains("<html") {
                    return Err(ApiError::HtmlResponse(text.to_string()));
                }
                error!("失败的请求的URL: {}", url);
                error!("JSON 结构匹配失败: {}", e);
                Err(ApiError::InvalidResponse(format!("结构匹配失败: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_cookie_header_from_auth() {
        let auth = AuthConfig {
            sessdata: Some("abc%2C123".to_string()),
            bili_jct: None,
            dede_user_id: Some("42".to_string()),
            buvid3: Some(String::new()),
        };
        assert_eq!(
            BiliClient::cookie_header(&auth).as_deref(),
            Some("SESSDATA=abc%2C123; DedeUserID=42")
        );
        assert!(BiliClient::cookie_header(&AuthConfig::default()).is_none());
    }

    #[test]
    fn custom_proxy_requires_port() {
        let mut config = EngineConfig::default();
        config.proxy.proxy_mode = ProxyMode::Custom;
        config.proxy.proxy_ip = "127.0.0.1".to_string();
        assert!(matches!(BiliClient::new(&config), Err(ApiError::Build(_))));

        config.proxy.proxy_port = Some(7890);
        config.proxy.enable_auth = true;
        assert!(BiliClient::new(&config).is_ok());
    }
}
