//! 下载相关的数据模型定义。
//!
//! 包含章节下载任务（DownloadJob）、任务状态机、新建任务参数等核心数据结构。

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type JobId = u64;
pub type ContentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 终态任务不会再被 worker 处理。`failed` 可以被重新入队，从头再来。
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// 仍占用"章节槽位"的状态：同一章节已有此类任务时不再新建。
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Downloading | JobStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub content_id: ContentId,
    pub content_title: String,
    pub chapter_number: f64,
    pub chapter_title: Option<String>,
    pub chapter_url: Option<String>,
    pub source: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    pub total_pages: u32,
    pub downloaded_pages: u32,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DownloadJob {
    pub(crate) fn from_new(id: JobId, new: NewJob, now: OffsetDateTime) -> Self {
        Self {
            id,
            content_id: new.content_id,
            content_title: new.content_title,
            chapter_number: new.chapter_number,
            chapter_title: new.chapter_title,
            chapter_url: new.chapter_url,
            source: new.source,
            status: JobStatus::Pending,
            progress: 0.0,
            total_pages: 0,
            downloaded_pages: 0,
            file_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
        self.touch();
    }

    /// 每页落盘后的检查点：已完成页数只增不减，且不超过总页数。
    pub fn checkpoint(&mut self, downloaded: u32, chapter_dir: &std::path::Path) {
        let downloaded = downloaded.max(self.downloaded_pages).min(self.total_pages);
        self.downloaded_pages = downloaded;
        self.progress = if self.total_pages > 0 {
            downloaded as f64 / self.total_pages as f64
        } else {
            0.0
        };
        self.file_path = Some(chapter_dir.to_path_buf());
        self.touch();
    }

    /// 重新开始下载时清零进度（任务从头执行）。
    pub fn begin_attempt(&mut self) {
        self.status = JobStatus::Downloading;
        self.error = None;
        self.touch();
    }

    pub fn set_total_pages(&mut self, total: u32) {
        self.total_pages = total;
        self.downloaded_pages = 0;
        self.progress = 0.0;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// 入队前由调用方准备的任务参数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub content_id: ContentId,
    pub content_title: String,
    pub chapter_number: f64,
    pub chapter_title: Option<String>,
    pub chapter_url: Option<String>,
    pub source: Option<String>,
}
