//! 章节目录解析（Path Resolver）与页面扩展名判定。
//!
//! 目录布局：`<root>/<作品 slug>/Chapter_<NNN>__<章节标题 slug>`。
//! 目标目录已有内容时追加 `__<job id>`，避免覆盖之前的下载。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::models::JobId;
use crate::base_system::file_utils::dir_has_content;

const UNTITLED: &str = "untitled";

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s_-]+").expect("valid separator regex"))
}

/// 小写化、去除标点、把空白/下划线/连字符折叠成单个 `-`。
pub fn slugify(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_' || *c == '-')
        .collect();
    let collapsed = separator_re().replace_all(&kept, "-");
    let slug = collapsed.trim_matches('-');
    if slug.is_empty() {
        UNTITLED.to_string()
    } else {
        slug.to_string()
    }
}

/// 章节号三位补零；小数章节保留小数部分（10.5 → `010.5`）。
pub fn format_chapter_number(number: f64) -> String {
    if !number.is_finite() || number < 0.0 {
        return "000".to_string();
    }
    let whole = number.trunc() as u64;
    let frac = number - number.trunc();
    if frac.abs() < 1e-9 {
        return format!("{whole:03}");
    }
    let frac_text = format!("{frac:.4}");
    let digits = frac_text
        .trim_start_matches('0')
        .trim_start_matches('.')
        .trim_end_matches('0');
    if digits.is_empty() {
        format!("{whole:03}")
    } else {
        format!("{whole:03}.{digits}")
    }
}

pub fn chapter_dir_name(chapter_number: f64, chapter_title: Option<&str>) -> String {
    format!(
        "Chapter_{}__{}",
        format_chapter_number(chapter_number),
        slugify(chapter_title.unwrap_or(""))
    )
}

/// 解析章节输出目录（不创建目录）。
///
/// 仅"目录已存在且非空"会触发 `__<job id>` 后缀，因此同样的输入在空目标下总是得到同一路径。
pub fn resolve_chapter_dir(
    root: &Path,
    content_title: &str,
    chapter_number: f64,
    chapter_title: Option<&str>,
    job_id: JobId,
) -> PathBuf {
    let content_dir = root.join(slugify(content_title));
    let base_name = chapter_dir_name(chapter_number, chapter_title);
    let candidate = content_dir.join(&base_name);
    if dir_has_content(&candidate) {
        content_dir.join(format!("{base_name}__{job_id}"))
    } else {
        candidate
    }
}

pub fn page_file_name(index: usize, ext: &str) -> String {
    format!("{index:03}.{ext}")
}

const KNOWN_EXTS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

/// URL 路径后缀优先，其次 Content-Type，最后默认 `jpg`。
pub fn detect_extension(url: &str, content_type: Option<&str>) -> &'static str {
    if let Some(ext) = url_path_extension(url) {
        let ext = ext.to_ascii_lowercase();
        if let Some(known) = KNOWN_EXTS.iter().find(|k| **k == ext) {
            return if *known == "jpeg" { "jpg" } else { known };
        }
    }

    if let Some(ct) = content_type.map(|c| c.to_ascii_lowercase()) {
        if ct.contains("png") {
            return "png";
        }
        if ct.contains("webp") {
            return "webp";
        }
        if ct.contains("gif") {
            return "gif";
        }
    }
    "jpg"
}

fn url_path_extension(url: &str) -> Option<&str> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .split_once('/')
        .map(|(_, p)| p)?;
    let last = path.rsplit('/').next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}
