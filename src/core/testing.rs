//! 测试用的假实现：脚本化的 shell、共享的“世界”状态、假网关/文件系统/进程表

use crate::core::appx::gateway::{PackageGateway, RemovalVariant};
use crate::core::appx::identity::base_name;
use crate::core::cancel::CancelFlag;
use crate::core::executor::{CommandOutput, CommandSpec, ShellExecutor};
use crate::core::folder::{FolderCleaner, FolderOps, FolderRemoval};
use crate::core::process::{ProcessEntry, ProcessTable};
use crate::core::state::Unregistered;
use crate::progress::removal_progress::RunContext;
use crate::result::{AttemptOutcome, CoreError, FailureKind};
use crate::utils::file_ops::TreeStats;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct WorldState {
    registered: BTreeSet<String>,
    sticky: bool,
    folders: BTreeMap<PathBuf, u64>,
    direct_delete_blocked: bool,
    shell_delete_blocked: bool,
    mirror_remaining: Option<u64>,
    read_only: bool,
    events: Vec<String>,
}

/// 包注册表与文件夹的内存模型，被各个假实现共享
#[derive(Clone, Default)]
pub struct FakeWorld {
    inner: Arc<Mutex<WorldState>>,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) {
        lock(&self.inner).registered.insert(id.to_string());
    }

    /// 注销操作不再生效
    pub fn make_registration_sticky(&self) {
        lock(&self.inner).sticky = true;
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut state = lock(&self.inner);
        if state.sticky {
            return false;
        }
        state.registered.remove(id)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.inner).registered.contains(id)
    }

    /// 精确全名，或按包名前缀匹配
    pub fn lookup(&self, approximate: &str) -> Option<String> {
        let state = lock(&self.inner);
        state
            .registered
            .iter()
            .find(|id| id.as_str() == approximate || base_name(id) == approximate)
            .cloned()
    }

    pub fn add_folder(&self, path: &Path, files: u64) {
        lock(&self.inner).folders.insert(path.to_path_buf(), files);
    }

    pub fn folder_exists(&self, path: &Path) -> bool {
        lock(&self.inner).folders.contains_key(path)
    }

    pub fn folder_files(&self, path: &Path) -> Option<u64> {
        lock(&self.inner).folders.get(path).copied()
    }

    fn drop_folder(&self, path: &Path) -> bool {
        lock(&self.inner).folders.remove(path).is_some()
    }

    pub fn block_direct_delete(&self) {
        lock(&self.inner).direct_delete_blocked = true;
    }

    pub fn block_shell_delete(&self) {
        lock(&self.inner).shell_delete_blocked = true;
    }

    pub fn mirror_leaves(&self, files: u64) {
        lock(&self.inner).mirror_remaining = Some(files);
    }

    pub fn make_read_only(&self) {
        lock(&self.inner).read_only = true;
    }

    pub fn log(&self, event: impl Into<String>) {
        lock(&self.inner).events.push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.inner).events.clone()
    }
}

/// 取出 `marker'...'` 中的引号内容
fn quoted_after(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let rest = rest.strip_prefix('\'')?;
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

/// 按规则返回预设输出的执行器；可选地模拟 PowerShell/cmd/robocopy 对 [`FakeWorld`] 的影响
pub struct ScriptedShell {
    rules: Vec<(String, CommandOutput)>,
    fallback: CommandOutput,
    world: Option<FakeWorld>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: CommandOutput::exited(1, "", "unscripted command"),
            world: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn backed_by(world: FakeWorld) -> Self {
        Self {
            world: Some(world),
            fallback: CommandOutput::exited(0, "SUCCESS", ""),
            ..Self::new()
        }
    }

    /// 命令行包含 `pattern` 时返回 `output`，先添加的规则优先
    pub fn on(mut self, pattern: &str, output: CommandOutput) -> Self {
        self.rules.push((pattern.to_string(), output));
        self
    }

    pub fn default_response(mut self, output: CommandOutput) -> Self {
        self.fallback = output;
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    fn simulate(&self, world: &FakeWorld, spec: &CommandSpec, line: &str) -> Option<CommandOutput> {
        if line.contains(".Count") {
            let id = quoted_after(line, "-eq ")?;
            let count = u8::from(world.is_registered(&id));
            return Some(CommandOutput::exited(0, format!("{}\r\n", count), ""));
        }
        if line.contains("Dependencies") {
            return Some(CommandOutput::exited(0, "", ""));
        }
        if line.contains("ExpandProperty PackageFullName") {
            let id = quoted_after(line, "-eq ")?;
            let found = world.lookup(&id).unwrap_or_default();
            return Some(CommandOutput::exited(0, found, ""));
        }
        if line.contains("Remove-AppxPackage") {
            let id = quoted_after(line, "-Package ")?;
            world.log(format!("ps-remove:{}", id));
            return Some(if world.unregister(&id) {
                CommandOutput::exited(0, "SUCCESS", "")
            } else {
                CommandOutput::exited(0, "Access is denied. (0x80070005)", "")
            });
        }
        if line.contains(" rmdir ") {
            let path = PathBuf::from(spec.args.last()?);
            world.log(format!("rmdir:{}", path.display()));
            let blocked = lock(&world.inner).shell_delete_blocked;
            return Some(if blocked {
                CommandOutput::exited(5, "", "Access is denied.")
            } else {
                world.drop_folder(&path);
                CommandOutput::exited(0, "", "")
            });
        }
        if spec.program.contains("robocopy") {
            let path = PathBuf::from(spec.args.get(1)?);
            world.log(format!("robocopy:{}", path.display()));
            let remaining = lock(&world.inner).mirror_remaining.unwrap_or(0);
            if let Some(files) = lock(&world.inner).folders.get_mut(&path) {
                *files = remaining;
            }
            return Some(CommandOutput::exited(if remaining > 0 { 8 } else { 2 }, "", ""));
        }
        None
    }
}

#[async_trait]
impl ShellExecutor for ScriptedShell {
    async fn run(&self, spec: &CommandSpec, cancel: &CancelFlag) -> CommandOutput {
        if cancel.is_cancelled() {
            return CommandOutput::cancelled();
        }
        lock(&self.calls).push(spec.clone());
        let line = spec.display();

        if let Some((_, output)) = self.rules.iter().find(|(pattern, _)| line.contains(pattern)) {
            return output.clone();
        }
        if let Some(world) = &self.world {
            if let Some(output) = self.simulate(world, spec, &line) {
                return output;
            }
        }
        self.fallback.clone()
    }
}

/// 直接操作 [`FakeWorld`] 的网关
pub struct FakeGateway {
    world: FakeWorld,
    accepted: Option<HashSet<RemovalVariant>>,
    provisioned_unregisters: bool,
    cleanup_unregisters: bool,
    cache_unregisters: bool,
    dependents: Vec<String>,
}

impl FakeGateway {
    /// 默认所有卸载变体都会成功
    pub fn new(world: FakeWorld) -> Self {
        Self {
            world,
            accepted: None,
            provisioned_unregisters: false,
            cleanup_unregisters: false,
            cache_unregisters: false,
            dependents: Vec::new(),
        }
    }

    pub fn accepting(mut self, variants: &[RemovalVariant]) -> Self {
        self.accepted = Some(variants.iter().copied().collect());
        self
    }

    pub fn provisioned_unregisters(mut self) -> Self {
        self.provisioned_unregisters = true;
        self
    }

    pub fn cleanup_unregisters(mut self) -> Self {
        self.cleanup_unregisters = true;
        self
    }

    pub fn cache_unregisters(mut self) -> Self {
        self.cache_unregisters = true;
        self
    }

    pub fn with_dependents(mut self, dependents: &[&str]) -> Self {
        self.dependents = dependents.iter().map(|s| s.to_string()).collect();
        self
    }

    fn unregistering(&self, id: &str, effective: bool) -> AttemptOutcome {
        if effective && self.world.unregister(id) {
            AttemptOutcome::success("SUCCESS")
        } else {
            AttemptOutcome::failure(FailureKind::AccessDenied, "Access is denied. (0x80070005)")
        }
    }
}

#[async_trait]
impl PackageGateway for FakeGateway {
    async fn is_registered(&self, package_id: &str, _cancel: &CancelFlag) -> bool {
        self.world.log(format!("query:{}", package_id));
        self.world.is_registered(package_id)
    }

    async fn resolve_canonical_id(&self, approximate_id: &str, _cancel: &CancelFlag) -> Option<String> {
        self.world.log(format!("resolve:{}", approximate_id));
        self.world.lookup(approximate_id)
    }

    async fn remove(&self, package_id: &str, variant: RemovalVariant, _cancel: &CancelFlag) -> AttemptOutcome {
        self.world.log(format!("remove:{:?}", variant));
        let accepted = self
            .accepted
            .as_ref()
            .map_or(true, |set| set.contains(&variant));
        self.unregistering(package_id, accepted)
    }

    async fn remove_provisioned(&self, package_id: &str, _cancel: &CancelFlag) -> AttemptOutcome {
        self.world.log("remove-provisioned");
        self.unregistering(package_id, self.provisioned_unregisters)
    }

    async fn low_level_cleanup(&self, package_id: &str, _cancel: &CancelFlag) -> AttemptOutcome {
        self.world.log("low-level-cleanup");
        self.unregistering(package_id, self.cleanup_unregisters)
    }

    async fn reset_cache(&self, _cancel: &CancelFlag) -> AttemptOutcome {
        self.world.log("reset-cache");
        if self.cache_unregisters {
            let ids: Vec<String> = lock(&self.world.inner).registered.iter().cloned().collect();
            for id in ids {
                self.world.unregister(&id);
            }
        }
        AttemptOutcome::success("")
    }

    async fn dependents(&self, _package_id: &str, _cancel: &CancelFlag) -> Vec<String> {
        self.dependents.clone()
    }
}

/// 基于 [`FakeWorld`] 的文件系统
pub struct FakeFolderOps {
    world: FakeWorld,
}

impl FakeFolderOps {
    pub fn new(world: FakeWorld) -> Self {
        Self { world }
    }
}

#[async_trait]
impl FolderOps for FakeFolderOps {
    async fn exists(&self, path: &Path) -> bool {
        self.world.folder_exists(path)
    }

    async fn stats(&self, path: &Path) -> TreeStats {
        TreeStats {
            files: self.world.folder_files(path).unwrap_or(0),
            ..TreeStats::default()
        }
    }

    async fn clear_readonly(&self, _path: &Path) -> usize {
        0
    }

    async fn remove_tree(&self, path: &Path) -> io::Result<()> {
        self.world.log(format!("remove-tree:{}", path.display()));
        if lock(&self.world.inner).direct_delete_blocked {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "Access is denied."));
        }
        self.world.drop_folder(path);
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &Path) -> io::Result<()> {
        match self.world.folder_files(path) {
            None => Ok(()),
            Some(0) => {
                self.world.drop_folder(path);
                Ok(())
            }
            Some(_) => Err(io::Error::other("directory not empty")),
        }
    }

    async fn create_scratch_dir(&self) -> io::Result<PathBuf> {
        Ok(PathBuf::from("/scratch/empty"))
    }

    async fn probe_writable(&self, path: &Path) -> io::Result<()> {
        if lock(&self.world.inner).read_only || !self.world.folder_exists(path) {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "Access is denied."))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct ProcessState {
    alive: Vec<ProcessEntry>,
    refuse_close: HashSet<u32>,
    ignore_close: HashSet<u32>,
    unkillable: HashSet<u32>,
    closed: Vec<u32>,
    killed: Vec<u32>,
    failing: bool,
}

pub struct FakeProcessTable {
    state: Mutex<ProcessState>,
}

impl FakeProcessTable {
    pub fn new(entries: Vec<ProcessEntry>) -> Self {
        Self {
            state: Mutex::new(ProcessState {
                alive: entries,
                ..ProcessState::default()
            }),
        }
    }

    pub fn refuses_close(self, pid: u32) -> Self {
        lock(&self.state).refuse_close.insert(pid);
        self
    }

    /// 接受关闭请求但不退出
    pub fn ignores_close(self, pid: u32) -> Self {
        lock(&self.state).ignore_close.insert(pid);
        self
    }

    pub fn unkillable(self, pid: u32) -> Self {
        lock(&self.state).unkillable.insert(pid);
        self
    }

    pub fn failing(self) -> Self {
        lock(&self.state).failing = true;
        self
    }

    pub fn closed(&self) -> Vec<u32> {
        lock(&self.state).closed.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.state).killed.clone()
    }

    pub fn alive(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.state).alive.iter().map(|p| p.pid).collect();
        pids.sort_unstable();
        pids
    }
}

impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, CoreError> {
        let state = lock(&self.state);
        if state.failing {
            return Err(CoreError::Process("snapshot failed".to_string()));
        }
        Ok(state.alive.clone())
    }

    fn request_close(&self, pid: u32) -> bool {
        let mut state = lock(&self.state);
        state.closed.push(pid);
        if state.refuse_close.contains(&pid) {
            return false;
        }
        if !state.ignore_close.contains(&pid) {
            state.alive.retain(|p| p.pid != pid);
        }
        true
    }

    fn force_kill(&self, pid: u32) -> bool {
        let mut state = lock(&self.state);
        if state.unkillable.contains(&pid) {
            return false;
        }
        state.alive.retain(|p| p.pid != pid);
        state.killed.push(pid);
        true
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.state).alive.iter().any(|p| p.pid == pid)
    }
}

/// 统计调用次数的文件夹清理器
pub struct CountingFolderCleaner {
    calls: AtomicUsize,
    world: Option<FakeWorld>,
}

impl CountingFolderCleaner {
    /// 每次调用都报告删除失败
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            world: None,
        }
    }

    /// 每次调用都从 world 中删除目录
    pub fn succeeding(world: FakeWorld) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            world: Some(world),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FolderCleaner for CountingFolderCleaner {
    async fn force_delete(&self, path: &Path, _proof: &Unregistered, _ctx: &RunContext) -> FolderRemoval {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.world {
            Some(world) => {
                world.drop_folder(path);
                FolderRemoval::Removed { strategy: None }
            }
            None => FolderRemoval::Persisting {
                before: 1,
                remaining: 1,
            },
        }
    }
}
