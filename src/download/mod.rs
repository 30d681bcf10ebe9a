//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`   — 任务记录（DownloadJob）与状态机
//! - `store`    — 任务记录存储（JobStore / FileJobStore）
//! - `catalog`  — 作品目录与离线章节标记
//! - `paths`    — 章节目录与页面文件命名
//! - `fetcher`  — 图片抓取（来源请求头、403 重试、瞬时错误重试）
//! - `manager`  — 队列、并发调度与暂停/恢复/取消

pub mod catalog;
pub mod fetcher;
pub mod manager;
pub mod models;
pub mod paths;
pub mod store;
