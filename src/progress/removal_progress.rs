use crate::core::audit::AuditLog;
use crate::core::cancel::CancelFlag;
use crate::core::state::{AttemptAction, AttemptRecord};
use crate::result::AttemptOutcome;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// 进度回调：接收一行叙述文本
pub type ProgressCb = Arc<dyn Fn(String) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 收集一次卸载过程的叙述与尝试记录，并转发给进度回调和审计日志
pub struct Narrator {
    sink: Option<ProgressCb>,
    audit: Arc<AuditLog>,
    lines: Mutex<Vec<String>>,
    attempts: Mutex<Vec<AttemptRecord>>,
}

impl Narrator {
    pub fn new(sink: Option<ProgressCb>, audit: Arc<AuditLog>) -> Self {
        Self {
            sink,
            audit,
            lines: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// 用户可见的一行进度
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.audit.record(&message);
        lock(&self.lines).push(message.clone());

        if let Some(cb) = &self.sink {
            // 回调 panic 不能中断卸载流程
            if catch_unwind(AssertUnwindSafe(|| cb(message))).is_err() {
                warn!("进度回调发生 panic，已忽略");
            }
        }
    }

    /// 只写审计日志的细节
    pub fn detail(&self, message: impl AsRef<str>) {
        tracing::debug!("{}", message.as_ref());
        self.audit.record(message.as_ref());
    }

    /// 记录一次补救尝试及其结果
    pub fn attempt(&self, action: AttemptAction, outcome: &AttemptOutcome) {
        let status = if outcome.succeeded { "成功" } else { "失败" };
        if outcome.diagnostic.is_empty() {
            self.report(format!("  {} {}", action, status));
        } else {
            self.report(format!("  {} {}: {}", action, status, outcome.diagnostic));
        }
        lock(&self.attempts).push(AttemptRecord {
            action,
            succeeded: outcome.succeeded,
            diagnostic: outcome.diagnostic.clone(),
        });
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        lock(&self.attempts).clone()
    }
}

/// 一次卸载流程中各组件共享的上下文
pub struct RunContext {
    pub narrator: Narrator,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(narrator: Narrator, cancel: CancelFlag) -> Self {
        Self { narrator, cancel }
    }

    /// 不接回调、不写审计日志的上下文
    pub fn detached() -> Self {
        Self::new(Narrator::new(None, Arc::new(AuditLog::disabled())), CancelFlag::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
