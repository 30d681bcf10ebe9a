//! 日志：控制台 + `<data_dir>/logs/latest.log`。
//!
//! 文件层始终记录 DEBUG；控制台默认 INFO，`--debug` 时为 DEBUG。
//! 启动时过大的 `latest.log` 先打包，退出时整份打包为 `log_<时间>.zip`。

use std::fs::{self, File};
use std::io::{self, IsTerminal, Write};
use std::panic;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const LATEST: &str = "latest.log";
const ARCHIVE_THRESHOLD: u64 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("log io error: {0}")]
    Io(#[from] io::Error),
    #[error("log archive failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub archive_on_exit: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            archive_on_exit: true,
        }
    }
}

/// 持有文件写入线程；drop 时刷盘并归档。
pub struct LogSystem {
    logs_dir: PathBuf,
    guard: Option<WorkerGuard>,
    archive_on_exit: bool,
}

impl LogSystem {
    pub fn start(options: LogOptions, data_dir: &Path) -> Result<Self, LogError> {
        let logs_dir = data_dir.join("logs");
        fs::create_dir_all(&logs_dir)?;

        let latest = logs_dir.join(LATEST);
        if fs::metadata(&latest).is_ok_and(|m| m.len() >= ARCHIVE_THRESHOLD) {
            archive_latest(&logs_dir)?;
        }

        let (file_writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .finish(tracing_appender::rolling::never(&logs_dir, LATEST));

        let console_level = match options.debug {
            true => LevelFilter::DEBUG,
            false => LevelFilter::INFO,
        };

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(io::stdout().is_terminal())
                    .with_filter(console_level),
            )
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false)
                    .with_writer(file_writer)
                    .with_filter(LevelFilter::DEBUG),
            )
            .try_init()?;

        log_panics();

        Ok(Self {
            logs_dir,
            guard: Some(guard),
            archive_on_exit: options.archive_on_exit,
        })
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        // 先让写入线程把缓冲刷到文件
        if self.guard.take().is_none() {
            return;
        }
        if self.archive_on_exit
            && let Err(err) = archive_latest(&self.logs_dir)
        {
            eprintln!("failed to archive log: {err}");
        }
    }
}

/// 工作任务 panic 不会结束进程，这里只负责把它记进日志。
fn log_panics() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let at = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(target: "startup", location = %at, "panic: {info}");
        previous(info);
    }));
}

/// 把 `latest.log` 打包为 `log_<时间>.zip` 并删除原文件；空文件直接删除。
fn archive_latest(logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let latest = logs_dir.join(LATEST);
    let content = match fs::read(&latest) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() {
        fs::remove_file(&latest)?;
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let mut target = logs_dir.join(format!("log_{stamp}.zip"));
    let mut n = 1;
    while target.exists() {
        target = logs_dir.join(format!("log_{stamp}_{n}.zip"));
        n += 1;
    }

    let mut zip = zip::ZipWriter::new(File::create(&target)?);
    zip.start_file(
        format!("{stamp}.log"),
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    zip.write_all(&content)?;
    zip.finish()?;

    fs::remove_file(&latest)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn missing_and_empty_logs_produce_no_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(archive_latest(dir.path()).unwrap().is_none());

        let latest = dir.path().join(LATEST);
        fs::write(&latest, b"").unwrap();
        assert!(archive_latest(dir.path()).unwrap().is_none());
        assert!(!latest.exists());
    }

    #[test]
    fn archive_holds_log_text_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST);

        fs::write(&latest, b"INFO download: job 1 completed\n").unwrap();
        let first = archive_latest(dir.path()).unwrap().unwrap();
        fs::write(&latest, b"INFO download: job 2 completed\n").unwrap();
        let second = archive_latest(dir.path()).unwrap().unwrap();

        assert_ne!(first, second);
        assert!(!latest.exists());

        let mut zip = zip::ZipArchive::new(File::open(&second).unwrap()).unwrap();
        let mut text = String::new();
        zip.by_index(0).unwrap().read_to_string(&mut text).unwrap();
        assert!(text.contains("job 2"));
    }
}
