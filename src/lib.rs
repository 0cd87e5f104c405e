//! B站播放地址解析与下载任务引擎
//!
//! - [`parser`]：把播放地址接口返回的清单解析成可下载的流描述
//! - [`downloader`]：任务持久化、并发上限调度、断点续传
//! - [`post_process`]：所有流下载完成后的合并

pub mod common;
pub mod downloader;
pub mod parser;
pub mod post_process;
