use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ILLEGAL_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap();
    static ref SPACES: Regex = Regex::new(r"\s+").unwrap();
}

/// 把标题转成合法的文件名
pub fn legal_file_name(title: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(title, "_");
    let collapsed = SPACES.replace_all(replaced.trim(), " ");
    // Windows 不允许以点或空格结尾
    let name = collapsed.trim_end_matches(['.', ' ']).to_string();
    if name.is_empty() {
        "untitled".to_string()
    } else {
        name
    }
}

pub struct FormatTool;

impl FormatTool {
    // 格式化文件大小
    pub fn format_size(size: u64) -> String {
        if size == 0 {
            "0 MB".to_string()
        } else if size > 1024 * 1024 * 1024 {
            format!("{:.2} GB", size as f64 / 1024.0 / 1024.0 / 1024.0)
        } else if size > 1024 * 1024 {
            format!("{:.1} MB", size as f64 / 1024.0 / 1024.0)
        } else {
            format!("{:.1} KB", size as f64 / 1024.0)
        }
    }
}
