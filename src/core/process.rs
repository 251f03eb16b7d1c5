use crate::core::appx::identity::PackageTarget;
use crate::core::state::AttemptAction;
use crate::progress::removal_progress::RunContext;
use crate::result::{AttemptOutcome, CoreError, FailureKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
}

impl ProcessEntry {
    pub fn new(pid: u32, name: impl Into<String>, exe: Option<PathBuf>) -> Self {
        Self {
            pid,
            name: name.into(),
            exe,
        }
    }
}

/// 进程表。方法都是阻塞的，调用方负责放到 blocking 线程上。
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, CoreError>;
    /// 请求正常关闭；返回请求是否被接受
    fn request_close(&self, pid: u32) -> bool;
    fn force_kill(&self, pid: u32) -> bool;
    fn is_alive(&self, pid: u32) -> bool;
}

/// 基于 sysinfo 的进程表
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_system<R>(&self, f: impl FnOnce(&mut System) -> R) -> R {
        let mut guard = self.system.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, CoreError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(CoreError::Process("当前系统不支持枚举进程".to_string()));
        }
        Ok(self.with_system(|sys| {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
            );
            sys.processes()
                .iter()
                .map(|(pid, process)| ProcessEntry {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    exe: process.exe().map(Path::to_path_buf),
                })
                .collect()
        }))
    }

    #[cfg(windows)]
    fn request_close(&self, pid: u32) -> bool {
        use std::os::windows::process::CommandExt;
        // 不带 /F 的 taskkill 会向主窗口发送 WM_CLOSE
        std::process::Command::new("taskkill.exe")
            .args(["/PID", &pid.to_string()])
            .creation_flags(0x0800_0000)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(windows))]
    fn request_close(&self, pid: u32) -> bool {
        self.with_system(|sys| {
            sys.process(Pid::from_u32(pid))
                .and_then(|p| p.kill_with(sysinfo::Signal::Term))
                .unwrap_or(false)
        })
    }

    fn force_kill(&self, pid: u32) -> bool {
        self.with_system(|sys| sys.process(Pid::from_u32(pid)).is_some_and(|p| p.kill()))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.with_system(|sys| {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing(),
            );
            sys.process(pid).is_some()
        })
    }
}

/// 统一为小写和 `\` 分隔符，按字符串比较，与宿主系统的路径规则无关
fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().to_lowercase().replace('/', "\\")
}

fn is_under(exe: &Path, folder: &Path) -> bool {
    let exe = normalize_path(exe);
    let folder = normalize_path(folder);
    let folder = folder.trim_end_matches('\\');
    if folder.is_empty() {
        return false;
    }
    exe == folder || exe.starts_with(&format!("{}\\", folder))
}

/// 进程名包含包名前缀，或可执行文件位于包目录下
pub fn is_related(entry: &ProcessEntry, target: &PackageTarget, own_pid: u32) -> bool {
    if entry.pid == own_pid {
        return false;
    }

    let base = target.base_name().to_lowercase();
    if !base.is_empty() && entry.name.to_lowercase().contains(&base) {
        return true;
    }

    match &entry.exe {
        Some(exe) if !target.folder_path.as_os_str().is_empty() => {
            is_under(exe, &target.folder_path)
        }
        _ => false,
    }
}

/// 结束与目标包相关的进程
pub struct ProcessReconciler {
    table: Arc<dyn ProcessTable>,
    grace: Duration,
    poll: Duration,
}

impl ProcessReconciler {
    pub fn new(table: Arc<dyn ProcessTable>, grace: Duration) -> Self {
        Self {
            table,
            grace,
            poll: Duration::from_millis(100),
        }
    }

    pub async fn find_related(&self, target: &PackageTarget) -> Result<Vec<ProcessEntry>, CoreError> {
        let table = self.table.clone();
        let entries = tokio::task::spawn_blocking(move || table.snapshot()).await??;
        let own_pid = std::process::id();
        Ok(entries
            .into_iter()
            .filter(|entry| is_related(entry, target, own_pid))
            .collect())
    }

    async fn blocking<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn ProcessTable) -> R + Send + 'static,
    {
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || f(table.as_ref())).await.ok()
    }

    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            if !self.blocking(move |t| t.is_alive(pid)).await.unwrap_or(true) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll.min(self.grace)).await;
        }
    }

    /// 先请求正常关闭，宽限期后强制结束。
    ///
    /// 只要进程枚举成功就返回 true，单个进程结束失败只记入叙述。
    pub async fn terminate_related(&self, target: &PackageTarget, ctx: &RunContext) -> bool {
        let related = match self.find_related(target).await {
            Ok(list) => list,
            Err(e) => {
                warn!("枚举进程失败: {}", e);
                ctx.narrator.attempt(
                    AttemptAction::ProcessTermination,
                    &AttemptOutcome::failure(FailureKind::Other, format!("无法枚举进程: {}", e)),
                );
                return false;
            }
        };

        if related.is_empty() {
            ctx.narrator.report("没有发现相关的运行中进程");
            return true;
        }

        let total = related.len();
        let mut stopped = 0usize;
        for entry in related {
            if ctx.is_cancelled() {
                break;
            }
            let pid = entry.pid;
            ctx.narrator
                .report(format!("  结束进程 {} (PID {})", entry.name, pid));

            let accepted = self.blocking(move |t| t.request_close(pid)).await.unwrap_or(false);
            if accepted && self.wait_for_exit(pid).await {
                debug!("进程 {} 已正常退出", pid);
                stopped += 1;
                continue;
            }

            if self.blocking(move |t| t.force_kill(pid)).await.unwrap_or(false) {
                stopped += 1;
            } else if self.blocking(move |t| t.is_alive(pid)).await.unwrap_or(true) {
                // 受保护的系统进程经常拒绝访问，记录后继续
                ctx.narrator
                    .detail(format!("无法结束进程 {} (PID {})，可能被拒绝访问", entry.name, pid));
            } else {
                stopped += 1;
            }
        }

        let outcome = if stopped == total {
            AttemptOutcome::success(format!("已结束 {}/{} 个相关进程", stopped, total))
        } else {
            AttemptOutcome::failure(
                FailureKind::AccessDenied,
                format!("已结束 {}/{} 个相关进程", stopped, total),
            )
        };
        ctx.narrator.attempt(AttemptAction::ProcessTermination, &outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::FakeProcessTable;

    fn target() -> PackageTarget {
        PackageTarget::new(
            "Contoso.Notes_2.1.0.0_x64__abcd1234",
            r"C:\Program Files\WindowsApps\Contoso.Notes_2.1.0.0_x64__abcd1234",
        )
    }

    fn exe(path: &str) -> Option<PathBuf> {
        Some(PathBuf::from(path))
    }

    #[test]
    fn related_by_name_or_folder() {
        let t = target();
        let by_name = ProcessEntry::new(10, "contoso.notes.exe", None);
        let by_path = ProcessEntry::new(
            11,
            "Helper.exe",
            exe(r"c:\program files\windowsapps\CONTOSO.NOTES_2.1.0.0_X64__ABCD1234\helper.exe"),
        );
        let sibling = ProcessEntry::new(
            12,
            "Other.exe",
            exe(r"C:\Program Files\WindowsApps\Contoso.Notes_2.1.0.0_x64__abcd1234-extra\o.exe"),
        );
        let unrelated = ProcessEntry::new(13, "explorer.exe", exe(r"C:\Windows\explorer.exe"));

        assert!(is_related(&by_name, &t, 1));
        assert!(is_related(&by_path, &t, 1));
        assert!(!is_related(&sibling, &t, 1));
        assert!(!is_related(&unrelated, &t, 1));
        assert!(!is_related(&by_name, &t, 10));
    }

    #[test]
    fn folder_match_ignores_separator_style_and_trailing_slash() {
        let t = PackageTarget::new(
            "Fabrikam.Player_1.0.0.0_x64__wxyz",
            r"C:\Program Files\WindowsApps\Fabrikam.Player_1.0.0.0_x64__wxyz\",
        );
        let forward = ProcessEntry::new(
            20,
            "host.exe",
            exe("c:/program files/windowsapps/fabrikam.player_1.0.0.0_x64__wxyz/bin/host.exe"),
        );
        let prefix_only = ProcessEntry::new(
            21,
            "host.exe",
            exe(r"C:\Program Files\WindowsApps\Fabrikam.Player_1.0.0.0_x64__wxyzz\host.exe"),
        );

        assert!(is_related(&forward, &t, 1));
        assert!(!is_related(&prefix_only, &t, 1));
    }

    #[tokio::test]
    async fn graceful_then_forced_termination() {
        let table = Arc::new(
            FakeProcessTable::new(vec![
                ProcessEntry::new(100, "Contoso.Notes.exe", None),
                ProcessEntry::new(101, "Contoso.Notes.Background.exe", None),
                ProcessEntry::new(102, "explorer.exe", None),
            ])
            .ignores_close(101),
        );
        let reconciler = ProcessReconciler::new(table.clone(), Duration::from_millis(50));
        let ctx = RunContext::detached();

        assert!(reconciler.terminate_related(&target(), &ctx).await);

        assert_eq!(table.closed(), vec![100, 101]);
        assert_eq!(table.killed(), vec![101]);
        assert_eq!(table.alive(), vec![102]);
        assert!(ctx.narrator.attempts()[0].succeeded);
    }

    #[tokio::test]
    async fn refused_close_is_killed_immediately() {
        let table = Arc::new(
            FakeProcessTable::new(vec![ProcessEntry::new(200, "Contoso.Notes.exe", None)])
                .refuses_close(200),
        );
        let reconciler = ProcessReconciler::new(table.clone(), Duration::from_secs(30));
        let start = Instant::now();

        assert!(reconciler.terminate_related(&target(), &RunContext::detached()).await);

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(table.killed(), vec![200]);
    }

    #[tokio::test]
    async fn unkillable_process_does_not_fail_the_call() {
        let table = Arc::new(
            FakeProcessTable::new(vec![ProcessEntry::new(300, "Contoso.Notes.exe", None)])
                .refuses_close(300)
                .unkillable(300),
        );
        let reconciler = ProcessReconciler::new(table.clone(), Duration::ZERO);
        let ctx = RunContext::detached();

        assert!(reconciler.terminate_related(&target(), &ctx).await);
        assert!(!ctx.narrator.attempts()[0].succeeded);
        assert_eq!(table.alive(), vec![300]);
    }

    #[tokio::test]
    async fn enumeration_failure_returns_false() {
        let table = Arc::new(FakeProcessTable::new(Vec::new()).failing());
        let reconciler = ProcessReconciler::new(table, Duration::ZERO);
        assert!(!reconciler.terminate_related(&target(), &RunContext::detached()).await);
    }
}
