use serde_derive::Deserialize;

// 导航接口，未登录时 code 为 -101，但 wbi_img 依然会返回
#[derive(Debug, Deserialize)]
pub struct NavResponse {
    pub code: i64,
    pub data: Option<NavData>,
}

#[derive(Debug, Deserialize)]
pub struct NavData {
    #[serde(rename = "isLogin", default)]
    pub is_login: bool,
    #[serde(default)]
    pub uname: Option<String>,
    pub wbi_img: WbiImg,
}

#[derive(Debug, Deserialize)]
pub struct WbiImg {
    pub img_url: String,
    pub sub_url: String,
}

impl WbiImg {
    /// 从图片地址中截出签名用的 key（文件名去掉扩展名）
    pub fn keys(&self) -> Option<(String, String)> {
        Some((Self::stem(&self.img_url)?, Self::stem(&self.sub_url)?))
    }

    fn stem(url: &str) -> Option<String> {
        let file = url.rsplit('/').next()?;
        let stem = file.split('.').next()?;
        if stem.is_empty() {
            None
        } else {
            Some(stem.to_string())
        }
    }
}
