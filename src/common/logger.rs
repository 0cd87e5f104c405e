use colored::*;

use crate::common::utils::FormatTool;
use crate::downloader::models::{TaskStatus, TaskView};

/// 终端上给用户看的输出，调试日志走 tracing
pub struct PrettyLogger;

impl PrettyLogger {
    fn line(icon: ColoredString, message: &str) {
        println!("{} {}", icon, message);
    }

    pub fn success(message: impl AsRef<str>) {
        Self::line("✓".green().bold(), message.as_ref());
    }

    pub fn info(message: impl AsRef<str>) {
        Self::line("ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        Self::line("⚠".yellow().bold(), message.as_ref());
    }

    // 错误输出到 stderr，避免和进度条混在一起
    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    pub fn waiting(message: impl AsRef<str>) {
        Self::line("⏳".yellow().bold(), message.as_ref());
    }

    /// 步骤开始，标题加粗
    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    pub fn step_complete(step: impl AsRef<str>) {
        Self::line("✓".green().bold(), &step.as_ref().green().to_string());
    }

    pub fn task_info(title: impl AsRef<str>, detail: impl AsRef<str>) {
        println!(
            "{} {} ({})",
            "🎬".magenta().bold(),
            title.as_ref().bold(),
            detail.as_ref().cyan()
        );
    }

    /// 任务列表中的一行：编号、状态、进度
    pub fn task_row(view: &TaskView) {
        let record = &view.record;
        let total = view
            .total_size()
            .map(FormatTool::format_size)
            .unwrap_or_else(|| "未知".to_string());
        let mut line = format!(
            "{:>9} {} {} {}/{}",
            record.id.to_string().bright_black(),
            Self::status_label(record.status),
            record.title.bold(),
            FormatTool::format_size(view.downloaded()),
            total
        );
        if let Some(failure) = &record.error {
            line.push_str(&format!("\n{:>9} {}", "", failure.to_string().red()));
        }
        println!("{}", line);
    }

    fn status_label(status: TaskStatus) -> ColoredString {
        let text = format!("[{}]", status);
        match status {
            TaskStatus::Complete => text.green(),
            TaskStatus::Downloading | TaskStatus::Merging => text.cyan(),
            TaskStatus::Waiting => text.normal(),
            TaskStatus::Paused => text.yellow(),
            TaskStatus::Error => text.red().bold(),
        }
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        // 中文字符按两个宽度估算
        let width: usize = text.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum();
        let left = 48usize.saturating_sub(width) / 2;
        let right = 48usize.saturating_sub(width + left);
        println!(
            "{} {} {}",
            "─".repeat(left).bright_black(),
            text.bold(),
            "─".repeat(right).bright_black()
        );
    }

    /// 一批任务结束后的汇总
    pub fn completion_summary(headline: impl AsRef<str>, items: Vec<impl AsRef<str>>) {
        println!("\n{}", headline.as_ref().green().bold());
        for item in items {
            println!("  {}", item.as_ref());
        }
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_step {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::step_start(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_complete {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::step_complete(format!($($arg)*))
    };
}