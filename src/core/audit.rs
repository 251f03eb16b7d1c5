use crate::result::CoreError;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// 追加式审计日志。
///
/// 打开一次，所有组件共享同一个实例；写入失败只记一条 warn，不影响卸载流程。
#[derive(Debug)]
pub struct AuditLog {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// 不落盘的审计日志
    pub fn disabled() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, message: &str) {
        let mut guard = self.lock();
        let Some(writer) = guard.as_mut() else { return };
        let line = format!(
            "[{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        );
        if let Err(e) = writer.write_all(line.as_bytes()) {
            warn!("写入审计日志失败: {}", e);
        }
    }

    pub fn flush(&self) {
        if let Some(writer) = self.lock().as_mut() {
            if let Err(e) = writer.flush() {
                warn!("刷新审计日志失败: {}", e);
            }
        }
    }

    /// 刷新并关闭，之后的 record 调用会被忽略。返回缓冲内容是否全部落盘
    pub fn close(&self) -> bool {
        let mut guard = self.lock();
        match guard.take() {
            Some(mut writer) => match writer.flush() {
                Ok(()) => true,
                Err(e) => {
                    warn!("关闭审计日志时刷新失败: {}", e);
                    false
                }
            },
            None => true,
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.close();
    }
}
