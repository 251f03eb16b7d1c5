use crate::config::config::{ms, CommandTimeouts, Config, HostConfig, SettleDelays};
use crate::core::appx::identity::PackageTarget;
use crate::core::executor::{CommandSpec, ShellExecutor};
use crate::core::permissions::{EscalationTier, PermissionEscalator};
use crate::core::process::ProcessReconciler;
use crate::core::state::{AttemptAction, Unregistered};
use crate::progress::removal_progress::RunContext;
use crate::result::{AttemptOutcome, FailureKind};
use crate::utils::file_ops::{self, TreeStats};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 文件系统操作，便于在测试中替换
#[async_trait]
pub trait FolderOps: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn stats(&self, path: &Path) -> TreeStats;
    async fn clear_readonly(&self, path: &Path) -> usize;
    async fn remove_tree(&self, path: &Path) -> io::Result<()>;
    async fn remove_empty_dir(&self, path: &Path) -> io::Result<()>;
    /// 新建一个空的临时目录，用作镜像同步的源
    async fn create_scratch_dir(&self) -> io::Result<PathBuf>;
    async fn probe_writable(&self, path: &Path) -> io::Result<()>;
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::other(e.to_string())
}

#[derive(Debug, Default, Clone)]
pub struct LocalFolderOps;

#[async_trait]
impl FolderOps for LocalFolderOps {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn stats(&self, path: &Path) -> TreeStats {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || file_ops::tree_stats(&path))
            .await
            .unwrap_or_default()
    }

    async fn clear_readonly(&self, path: &Path) -> usize {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || file_ops::clear_readonly(&path))
            .await
            .unwrap_or(0)
    }

    async fn remove_tree(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn remove_empty_dir(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn create_scratch_dir(&self) -> io::Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("uwpr-empty-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn probe_writable(&self, path: &Path) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || file_ops::probe_writable(&path))
            .await
            .map_err(join_error)?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeleteStrategy {
    /// 去掉只读属性后直接递归删除
    DirectDelete,
    /// cmd /c rmdir /s /q
    ShellForceDelete,
    /// 用空目录 robocopy /MIR 覆盖后删除
    MirrorSync,
}

impl DeleteStrategy {
    pub const ORDER: [DeleteStrategy; 3] = [
        DeleteStrategy::DirectDelete,
        DeleteStrategy::ShellForceDelete,
        DeleteStrategy::MirrorSync,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FolderRemoval {
    /// `strategy` 为 None 表示开始时就不存在
    Removed { strategy: Option<DeleteStrategy> },
    /// 没删干净，但文件数下降明显，通常重启后即可清除
    SoftRemoved { before: u64, remaining: u64 },
    Persisting { before: u64, remaining: u64 },
}

impl FolderRemoval {
    pub fn is_removed(&self) -> bool {
        matches!(self, FolderRemoval::Removed { .. })
    }

    pub fn is_soft_success(&self) -> bool {
        !matches!(self, FolderRemoval::Persisting { .. })
    }
}

/// 强制删除包目录。调用方必须先证明包已注销。
#[async_trait]
pub trait FolderCleaner: Send + Sync {
    async fn force_delete(&self, path: &Path, proof: &Unregistered, ctx: &RunContext) -> FolderRemoval;
}

pub struct FolderReconciler {
    shell: Arc<dyn ShellExecutor>,
    ops: Arc<dyn FolderOps>,
    escalator: Arc<PermissionEscalator>,
    processes: Option<Arc<ProcessReconciler>>,
    hosts: HostConfig,
    timeouts: CommandTimeouts,
    settle: SettleDelays,
    soft_ratio: f64,
}

impl FolderReconciler {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        ops: Arc<dyn FolderOps>,
        escalator: Arc<PermissionEscalator>,
        config: &Config,
    ) -> Self {
        Self {
            shell,
            ops,
            escalator,
            processes: None,
            hosts: config.hosts.clone(),
            timeouts: config.removal.timeouts.clone(),
            settle: config.removal.settle.clone(),
            soft_ratio: config.removal.soft_success_ratio,
        }
    }

    /// 删除前再次结束占用目录的进程，应用可能在卸载后被重新拉起
    pub fn with_processes(mut self, processes: Arc<ProcessReconciler>) -> Self {
        self.processes = Some(processes);
        self
    }

    async fn settle(&self) {
        let delay = ms(self.settle.filesystem);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_strategy(&self, strategy: DeleteStrategy, path: &Path, ctx: &RunContext) -> AttemptOutcome {
        match strategy {
            DeleteStrategy::DirectDelete => {
                let cleared = self.ops.clear_readonly(path).await;
                debug!("清除只读属性: {} 项", cleared);
                match self.ops.remove_tree(path).await {
                    Ok(()) => AttemptOutcome::success("递归删除完成"),
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        AttemptOutcome::failure(FailureKind::AccessDenied, e.to_string())
                    }
                    Err(e) => AttemptOutcome::failure(FailureKind::Other, e.to_string()),
                }
            }
            DeleteStrategy::ShellForceDelete => {
                let spec = CommandSpec::new(&self.hosts.cmd, ms(self.timeouts.shell_delete))
                    .args(["/c", "rmdir", "/s", "/q"])
                    .path_arg(path);
                self.shell.run(&spec, &ctx.cancel).await.outcome()
            }
            DeleteStrategy::MirrorSync => self.mirror_delete(path, ctx).await,
        }
    }

    async fn mirror_delete(&self, path: &Path, ctx: &RunContext) -> AttemptOutcome {
        let scratch = match self.ops.create_scratch_dir().await {
            Ok(dir) => dir,
            Err(e) => {
                return AttemptOutcome::failure(FailureKind::Other, format!("无法创建临时目录: {}", e))
            }
        };

        let spec = CommandSpec::new(&self.hosts.robocopy, ms(self.timeouts.mirror))
            .path_arg(&scratch)
            .path_arg(path)
            .args(["/MIR", "/R:1", "/W:1", "/NFL", "/NDL", "/NJH", "/NJS", "/NP"]);
        let output = self.shell.run(&spec, &ctx.cancel).await;

        if let Err(e) = self.ops.remove_empty_dir(&scratch).await {
            debug!("清理临时目录失败 {}: {}", scratch.display(), e);
        }

        // robocopy 退出码 0-7 表示成功，8 及以上表示有失败
        let outcome = match output.exit_code {
            Some(code) if (0..8).contains(&code) && !output.timed_out => {
                AttemptOutcome::success(format!("robocopy exit code {}", code))
            }
            _ => {
                let mut failed = output.outcome();
                if failed.succeeded {
                    failed = AttemptOutcome::failure(FailureKind::Other, failed.diagnostic);
                }
                return failed;
            }
        };

        match self.ops.remove_empty_dir(path).await {
            Ok(()) => outcome,
            Err(e) => AttemptOutcome::failure(
                FailureKind::Other,
                format!("镜像后删除空目录失败: {}", e),
            ),
        }
    }

    fn judge_leftovers(&self, before: u64, remaining: u64) -> FolderRemoval {
        let dropped = before.saturating_sub(remaining) as f64;
        if before > 0 && dropped > before as f64 * self.soft_ratio {
            FolderRemoval::SoftRemoved { before, remaining }
        } else {
            FolderRemoval::Persisting { before, remaining }
        }
    }
}

/// 目录名即包全名（WindowsApps 下的约定）
fn folder_owner(path: &Path) -> PackageTarget {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    PackageTarget::new(name, path)
}

#[async_trait]
impl FolderCleaner for FolderReconciler {
    async fn force_delete(&self, path: &Path, _proof: &Unregistered, ctx: &RunContext) -> FolderRemoval {
        if !self.ops.exists(path).await {
            return FolderRemoval::Removed { strategy: None };
        }

        let before = self.ops.stats(path).await.files;
        ctx.narrator
            .report(format!("强制删除残留文件夹 ({} 个文件): {}", before, path.display()));

        self.escalator
            .escalate(path, EscalationTier::FolderCleanup, ctx)
            .await;

        if let Some(processes) = &self.processes {
            processes.terminate_related(&folder_owner(path), ctx).await;
        }

        for strategy in DeleteStrategy::ORDER {
            if ctx.is_cancelled() {
                break;
            }
            let mut outcome = self.run_strategy(strategy, path, ctx).await;
            self.settle().await;

            let gone = !self.ops.exists(path).await;
            if gone && !outcome.succeeded {
                outcome = AttemptOutcome::success(format!("目录已消失 ({})", outcome.diagnostic));
            } else if !gone && outcome.succeeded {
                outcome = AttemptOutcome::failure(FailureKind::Other, "命令成功但目录仍然存在");
            }
            ctx.narrator
                .attempt(AttemptAction::FolderStrategy(strategy), &outcome);

            if gone {
                info!("文件夹已删除: {} ({:?})", path.display(), strategy);
                return FolderRemoval::Removed {
                    strategy: Some(strategy),
                };
            }
        }

        self.settle().await;
        if !self.ops.exists(path).await {
            return FolderRemoval::Removed { strategy: None };
        }

        let remaining = self.ops.stats(path).await.files;
        let result = self.judge_leftovers(before, remaining);
        match result {
            FolderRemoval::SoftRemoved { .. } => ctx.narrator.report(format!(
                "文件夹未完全删除，剩余 {}/{} 个文件，重启后可能会被清除",
                remaining, before
            )),
            _ => {
                warn!("文件夹删除失败: {}", path.display());
                ctx.narrator.report(format!(
                    "文件夹删除失败，剩余 {}/{} 个文件",
                    remaining, before
                ));
            }
        }
        result
    }
}
