use serde_derive::Deserialize;

/// B站接口统一的外层结构，番剧接口的负载放在 `result` 里
#[derive(Debug, Deserialize)]
pub struct CommonResponse<T> {
    pub code: i64,

    #[serde(default)]
    pub message: String,

    pub data: Option<T>,

    pub result: Option<T>,
}

impl<T> CommonResponse<T> {
    /// 取出负载，优先 `data`
    pub fn into_payload(self) -> Option<T> {
        self.data.or(self.result)
    }
}
