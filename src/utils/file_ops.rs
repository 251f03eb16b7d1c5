use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn app_dir() -> PathBuf {
    exe_dir().join("UWPR")
}

pub fn app_subdir<P: AsRef<Path>>(rel: P) -> PathBuf {
    app_dir().join(rel)
}

pub fn create_initial_directories() {
    for dir in [app_dir(), app_subdir("logs"), app_subdir("config")] {
        if let Err(e) = fs::create_dir_all(&dir) {
            eprintln!("Failed to create directory '{}': {}", dir.display(), e);
        }
    }
}

/// 目录内容统计（不含根目录本身）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

impl TreeStats {
    pub fn entries(&self) -> u64 {
        self.files + self.dirs
    }
}

/// 递归统计文件数、目录数与总大小，忽略无法访问的条目
pub fn tree_stats(path: &Path) -> TreeStats {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let file_type = entry.file_type();
        if file_type.is_dir() {
            stats.dirs += 1;
        } else {
            stats.files += 1;
            if let Ok(md) = entry.metadata() {
                stats.bytes = stats.bytes.saturating_add(md.len());
            }
        }
    }
    stats
}

/// 递归去掉只读属性，返回修改过的条目数
pub fn clear_readonly(path: &Path) -> usize {
    let mut changed = 0;
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(md) = entry.metadata() else { continue };
        let mut perms = md.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            if fs::set_permissions(entry.path(), perms).is_ok() {
                changed += 1;
            }
        }
    }
    changed
}

/// 尝试写入并删除一个探测文件，判断目录是否可写
pub fn probe_writable(dir: &Path) -> io::Result<()> {
    let probe = dir.join("test_write_access.tmp");
    fs::write(&probe, b"probe")?;
    fs::remove_file(&probe)
}

pub fn bytes_to_human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
