use crate::config::config::{ms, Config, SettleDelays};
use crate::core::appx::build_gateway;
use crate::core::appx::gateway::{PackageGateway, RemovalVariant};
use crate::core::appx::identity::PackageTarget;
use crate::core::audit::AuditLog;
use crate::core::cancel::CancelFlag;
use crate::core::diagnostic::{manual_steps, Diagnostician};
use crate::core::executor::{ShellExecutor, SystemShell};
use crate::core::folder::{FolderCleaner, FolderOps, FolderReconciler, LocalFolderOps};
use crate::core::permissions::{EscalationTier, PermissionEscalator};
use crate::core::process::{ProcessReconciler, ProcessTable, SysinfoProcessTable};
use crate::core::removal::analysis::Analyzer;
use crate::core::state::{AttemptAction, AttemptRecord, Phase, ReconciliationState};
use crate::progress::removal_progress::{Narrator, ProgressCb, RunContext};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalOutcome {
    /// 包已注销，文件夹已删除
    Completed,
    /// 经过补救链后才注销成功
    Recovered,
    /// 包已注销，但文件夹删不掉
    FolderPersists,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub package_id: String,
    pub label: String,
    pub outcome: RemovalOutcome,
    pub succeeded: bool,
    /// 最后一次验证的结果；在验证之前就取消时为 None
    pub final_state: Option<ReconciliationState>,
    pub phases: Vec<Phase>,
    pub narrative: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    pub suggestions: Vec<String>,
    pub elapsed_ms: u64,
}

impl RemovalReport {
    pub fn terminal_phase(&self) -> Option<Phase> {
        self.phases.last().copied()
    }
}

struct Verdict {
    outcome: RemovalOutcome,
    state: Option<ReconciliationState>,
}

impl Verdict {
    fn new(outcome: RemovalOutcome, state: ReconciliationState) -> Self {
        Self {
            outcome,
            state: Some(state),
        }
    }

    fn cancelled(state: Option<ReconciliationState>) -> Self {
        Self {
            outcome: RemovalOutcome::Cancelled,
            state,
        }
    }
}

/// 一次卸载流程的运行期状态
struct Run<'a> {
    target: &'a PackageTarget,
    ctx: RunContext,
    phases: Vec<Phase>,
}

impl<'a> Run<'a> {
    fn enter(&mut self, phase: Phase) {
        info!("[{}] 进入阶段 {}", self.target.label(), phase);
        self.ctx.narrator.detail(format!("阶段: {}", phase));
        self.phases.push(phase);
    }

    fn cancel_requested(&mut self, state: Option<ReconciliationState>) -> Option<Verdict> {
        if !self.ctx.is_cancelled() {
            return None;
        }
        warn!("[{}] 卸载已取消", self.target.label());
        self.ctx.narrator.report("操作已取消");
        self.enter(Phase::Cancelled);
        Some(Verdict::cancelled(state))
    }
}

/// 卸载状态机：结束进程、修权限、调用包管理器卸载，然后根据 (是否注册, 目录是否存在) 决定下一步
pub struct RemovalOrchestrator {
    gateway: Arc<dyn PackageGateway>,
    processes: Arc<ProcessReconciler>,
    escalator: Arc<PermissionEscalator>,
    folders: Arc<dyn FolderCleaner>,
    ops: Arc<dyn FolderOps>,
    analyzer: Analyzer,
    audit: Arc<AuditLog>,
    settle: SettleDelays,
    accept_persisting_folder: bool,
}

impl RemovalOrchestrator {
    pub fn new(
        gateway: Arc<dyn PackageGateway>,
        shell: Arc<dyn ShellExecutor>,
        table: Arc<dyn ProcessTable>,
        ops: Arc<dyn FolderOps>,
        audit: Arc<AuditLog>,
        config: &Config,
    ) -> Self {
        let escalator = Arc::new(PermissionEscalator::from_config(shell.clone(), config));
        let processes = Arc::new(ProcessReconciler::new(table, config.removal.grace_period()));
        let folders: Arc<dyn FolderCleaner> = Arc::new(
            FolderReconciler::new(shell, ops.clone(), escalator.clone(), config)
                .with_processes(processes.clone()),
        );
        let analyzer = Analyzer::new(gateway.clone(), processes.clone(), ops.clone());

        Self {
            gateway,
            processes,
            escalator,
            folders,
            ops,
            analyzer,
            audit,
            settle: config.removal.settle.clone(),
            accept_persisting_folder: config.removal.accept_persisting_folder,
        }
    }

    /// 使用真实的 shell、进程表和文件系统
    pub fn from_config(config: &Config, audit: Arc<AuditLog>) -> Self {
        let shell: Arc<dyn ShellExecutor> = Arc::new(SystemShell);
        let gateway = build_gateway(shell.clone(), config);
        Self::new(
            gateway,
            shell,
            Arc::new(SysinfoProcessTable::new()),
            Arc::new(LocalFolderOps),
            audit,
            config,
        )
    }

    pub fn with_folder_cleaner(mut self, folders: Arc<dyn FolderCleaner>) -> Self {
        self.folders = folders;
        self
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn diagnostician(&self) -> Diagnostician {
        Diagnostician::new(self.gateway.clone(), self.processes.clone(), self.ops.clone())
    }

    async fn pause(&self, delay_ms: u64, ctx: &RunContext) {
        if delay_ms > 0 && !ctx.is_cancelled() {
            tokio::time::sleep(ms(delay_ms)).await;
        }
    }

    /// 卸载一个包。不会 panic 或返回错误，所有失败都体现在报告里。
    pub async fn remove(
        &self,
        target: &PackageTarget,
        sink: Option<ProgressCb>,
        cancel: CancelFlag,
    ) -> RemovalReport {
        let started = Instant::now();
        let mut run = Run {
            target,
            ctx: RunContext::new(Narrator::new(sink, self.audit.clone()), cancel),
            phases: Vec::new(),
        };

        let verdict = self.drive(&mut run).await;

        let succeeded = match verdict.outcome {
            RemovalOutcome::Completed | RemovalOutcome::Recovered => true,
            RemovalOutcome::FolderPersists => self.accept_persisting_folder,
            RemovalOutcome::Failed | RemovalOutcome::Cancelled => false,
        };

        let narrator = &run.ctx.narrator;
        let suggestions = match (verdict.outcome, verdict.state) {
            (RemovalOutcome::Failed | RemovalOutcome::FolderPersists, Some(state)) => {
                manual_steps(target, state)
            }
            _ => Vec::new(),
        };
        match verdict.outcome {
            RemovalOutcome::Completed => narrator.report(format!("卸载完成: {}", target.label())),
            RemovalOutcome::Recovered => {
                narrator.report(format!("补救成功，已卸载: {}", target.label()))
            }
            RemovalOutcome::FolderPersists => narrator.report(format!(
                "包已注销，但文件夹仍然存在: {}",
                target.folder_path.display()
            )),
            RemovalOutcome::Failed => {
                error!("[{}] 卸载失败，包仍然注册", target.label());
                narrator.report("卸载失败: 包仍然注册，为保证系统完整性未删除文件夹");
            }
            RemovalOutcome::Cancelled => {}
        }
        if !suggestions.is_empty() {
            narrator.report("建议手动处理:");
            for (i, step) in suggestions.iter().enumerate() {
                narrator.report(format!("  {}. {}", i + 1, step));
            }
        }
        self.audit.flush();

        RemovalReport {
            package_id: target.canonical_id.clone(),
            label: target.label().to_string(),
            outcome: verdict.outcome,
            succeeded,
            final_state: verdict.state,
            phases: run.phases,
            narrative: narrator.lines(),
            attempts: narrator.attempts(),
            suggestions,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn drive(&self, run: &mut Run<'_>) -> Verdict {
        let target = run.target;
        run.enter(Phase::Start);
        run.ctx
            .narrator
            .report(format!("开始卸载 {} ({})", target.label(), target.canonical_id));
        if let Some(v) = run.cancel_requested(None) {
            return v;
        }

        run.enter(Phase::Analyzing);
        let analysis = self.analyzer.analyze(target, &run.ctx.cancel).await;
        analysis.narrate(&run.ctx.narrator);
        if let Some(v) = run.cancel_requested(None) {
            return v;
        }

        run.enter(Phase::TerminatingProcesses);
        self.processes.terminate_related(target, &run.ctx).await;
        if !analysis.related_processes.is_empty() {
            self.pause(self.settle.process, &run.ctx).await;
        }
        if let Some(v) = run.cancel_requested(None) {
            return v;
        }

        run.enter(Phase::RemovingViaPackageManager);
        let package_id = match self
            .gateway
            .resolve_canonical_id(&target.canonical_id, &run.ctx.cancel)
            .await
        {
            Some(id) => {
                if id != target.canonical_id {
                    run.ctx.narrator.report(format!("解析到包全名: {}", id));
                }
                self.remove_via_package_manager(&id, run).await;
                id
            }
            None => {
                run.ctx.narrator.report("包管理器中已找不到该包，跳过卸载命令");
                target.canonical_id.clone()
            }
        };
        if let Some(v) = run.cancel_requested(None) {
            return v;
        }

        self.reconcile(&package_id, run).await
    }

    /// 依次尝试给定的卸载变体，遇到第一个成功即停止
    async fn try_variants(&self, package_id: &str, variants: &[RemovalVariant], ctx: &RunContext) -> bool {
        for &variant in variants {
            if ctx.is_cancelled() {
                return false;
            }
            let outcome = self.gateway.remove(package_id, variant, &ctx.cancel).await;
            ctx.narrator.attempt(AttemptAction::Removal(variant), &outcome);
            if outcome.succeeded {
                return true;
            }
        }
        false
    }

    async fn escalate_if_present(&self, tier: EscalationTier, run: &Run<'_>) {
        let path = &run.target.folder_path;
        if self.ops.exists(path).await {
            self.escalator.escalate(path, tier, &run.ctx).await;
        } else {
            debug!("目录不存在，跳过 {:?} 权限修改", tier);
        }
    }

    async fn remove_via_package_manager(&self, package_id: &str, run: &Run<'_>) -> bool {
        let ctx = &run.ctx;

        // 先拿到所有权，否则 Remove-AppxPackage 常常拒绝访问
        self.escalate_if_present(EscalationTier::Standard, run).await;
        if self.try_variants(package_id, &RemovalVariant::PRIMARY, ctx).await {
            self.pause(self.settle.registry, ctx).await;
            return true;
        }
        if ctx.is_cancelled() {
            return false;
        }

        ctx.narrator.report("常规卸载均失败，使用增强权限后重试");
        self.escalate_if_present(EscalationTier::Enhanced, run).await;
        self.pause(self.settle.retry, ctx).await;
        let removed = self.try_variants(package_id, &RemovalVariant::RETRY, ctx).await;
        if removed {
            self.pause(self.settle.registry, ctx).await;
        }
        removed
    }

    async fn verify(&self, package_id: &str, run: &mut Run<'_>) -> ReconciliationState {
        run.enter(Phase::Verifying);
        let registered = self.gateway.is_registered(package_id, &run.ctx.cancel).await;
        let folder_exists = self.ops.exists(&run.target.folder_path).await;
        let state = ReconciliationState {
            registered,
            folder_exists,
        };
        run.ctx.narrator.report(format!(
            "验证: {}，{}",
            if registered { "包仍注册" } else { "包已注销" },
            if folder_exists { "文件夹仍存在" } else { "文件夹已删除" }
        ));
        run.ctx.narrator.detail(format!("状态 {}", state));
        state
    }

    async fn reconcile(&self, package_id: &str, run: &mut Run<'_>) -> Verdict {
        let mut orphan_pass_done = false;
        let mut recovery_done = false;

        loop {
            if let Some(v) = run.cancel_requested(None) {
                return v;
            }
            let state = self.verify(package_id, run).await;
            let success_phase = if recovery_done {
                Phase::RecoverySuccess
            } else {
                Phase::CompleteSuccess
            };
            let success = if recovery_done {
                RemovalOutcome::Recovered
            } else {
                RemovalOutcome::Completed
            };

            if let Some(proof) = state.unregistered() {
                if !state.folder_exists {
                    run.enter(success_phase);
                    return Verdict::new(success, state);
                }

                run.enter(Phase::FolderPersists);
                let removal = self
                    .folders
                    .force_delete(&run.target.folder_path, &proof, &run.ctx)
                    .await;
                let after = ReconciliationState {
                    registered: false,
                    folder_exists: !removal.is_removed(),
                };
                if removal.is_soft_success() {
                    run.enter(success_phase);
                    return Verdict::new(success, after);
                }
                if let Some(v) = run.cancel_requested(Some(after)) {
                    return v;
                }
                run.enter(Phase::PartialSuccess);
                return Verdict::new(RemovalOutcome::FolderPersists, after);
            }

            // 以下分支包仍然注册，绝不删除文件夹
            if !state.folder_exists && !orphan_pass_done && !recovery_done {
                orphan_pass_done = true;
                run.enter(Phase::OrphanedRegistration);
                run.ctx
                    .narrator
                    .report("文件夹已不存在但包仍注册，再次通过包管理器清理注册");
                self.clear_orphaned_registration(package_id, &run.ctx).await;
                continue;
            }

            if state.folder_exists && !recovery_done {
                recovery_done = true;
                run.enter(Phase::Reconciling);
                run.ctx
                    .narrator
                    .report("包仍注册: 为保证系统完整性，不会手动删除文件夹，改用增强的包管理器方法");
                if self.recover_registration(package_id, &run.ctx).await {
                    continue;
                }
            }

            if let Some(v) = run.cancel_requested(Some(state)) {
                return v;
            }
            run.enter(Phase::Failed);
            return Verdict::new(RemovalOutcome::Failed, state);
        }
    }

    async fn clear_orphaned_registration(&self, package_id: &str, ctx: &RunContext) {
        let outcome = self.gateway.remove_provisioned(package_id, &ctx.cancel).await;
        ctx.narrator.attempt(AttemptAction::ProvisionedRemoval, &outcome);
        if ctx.is_cancelled() {
            return;
        }

        self.try_variants(package_id, &[RemovalVariant::DevModeDisabled], ctx)
            .await;
        if ctx.is_cancelled() {
            return;
        }

        let outcome = self.gateway.reset_cache(&ctx.cancel).await;
        ctx.narrator.attempt(AttemptAction::CacheReset, &outcome);
        self.pause(self.settle.registry, ctx).await;
    }

    async fn still_registered(&self, package_id: &str, ctx: &RunContext) -> bool {
        self.gateway.is_registered(package_id, &ctx.cancel).await
    }

    /// 依次：清缓存后重试、移除预配包后重试、DISM 清理。任一步让包注销即返回 true。
    async fn recover_registration(&self, package_id: &str, ctx: &RunContext) -> bool {
        ctx.narrator.report("方法 1: 清除应用商店缓存后重试");
        let outcome = self.gateway.reset_cache(&ctx.cancel).await;
        ctx.narrator.attempt(AttemptAction::CacheReset, &outcome);
        self.pause(self.settle.cache, ctx).await;
        if ctx.is_cancelled() {
            return false;
        }
        self.try_variants(package_id, &RemovalVariant::RETRY, ctx).await;
        self.pause(self.settle.registry, ctx).await;
        if !self.still_registered(package_id, ctx).await {
            return true;
        }
        if ctx.is_cancelled() {
            return false;
        }

        ctx.narrator.report("方法 2: 移除预配包后重试");
        let outcome = self.gateway.remove_provisioned(package_id, &ctx.cancel).await;
        ctx.narrator.attempt(AttemptAction::ProvisionedRemoval, &outcome);
        self.pause(self.settle.registry, ctx).await;
        if ctx.is_cancelled() {
            return false;
        }
        self.try_variants(package_id, &RemovalVariant::RETRY, ctx).await;
        self.pause(self.settle.registry, ctx).await;
        if !self.still_registered(package_id, ctx).await {
            return true;
        }
        if ctx.is_cancelled() {
            return false;
        }

        ctx.narrator.report("方法 3: 使用 DISM 清理");
        let outcome = self.gateway.low_level_cleanup(package_id, &ctx.cancel).await;
        ctx.narrator.attempt(AttemptAction::LowLevelCleanup, &outcome);
        self.pause(self.settle.cache, ctx).await;
        !self.still_registered(package_id, ctx).await
    }
}
