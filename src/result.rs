use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

/// 核心错误类型
///
/// 只用于启动期与基础设施层（配置、审计日志、进程枚举）。
/// 卸载过程中的预期失败（超时、拒绝访问、找不到包）统一表示为 [`AttemptOutcome`]。
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Task join error: {0}")]
    Join(#[from] JoinError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Process table error: {0}")]
    Process(String),

    #[error("{0}")]
    Other(String),
}

/// 单次尝试失败的大致分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Timeout,
    AccessDenied,
    NotFound,
    Spawn,
    Cancelled,
    Other,
}

/// 任意一次补救操作的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    pub succeeded: bool,
    pub diagnostic: String,
    pub failure: Option<FailureKind>,
}

impl AttemptOutcome {
    pub fn success(diagnostic: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            diagnostic: diagnostic.into(),
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            diagnostic: diagnostic.into(),
            failure: Some(kind),
        }
    }

    pub fn cancelled() -> Self {
        Self::failure(FailureKind::Cancelled, "操作已取消")
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::failure(FailureKind::NotFound, reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(FailureKind::Cancelled)
    }
}
