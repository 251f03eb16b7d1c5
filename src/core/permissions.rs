use crate::config::config::{ms, CommandTimeouts, Config, HostConfig, OutcomePolicy, SettleDelays};
use crate::core::executor::{CommandSpec, ShellExecutor};
use crate::core::powershell::{self, quote};
use crate::core::state::AttemptAction;
use crate::progress::removal_progress::RunContext;
use crate::result::{AttemptOutcome, FailureKind};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EVERYONE_SID: &str = "*S-1-1-0";
const ADMINISTRATORS_SID: &str = "*S-1-5-32-544";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EscalationTier {
    Standard,
    /// Standard 加一次卸载都失败后使用
    Enhanced,
    /// 删除残留文件夹之前使用
    FolderCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStep {
    TakeOwnership,
    /// takeown /a：所有权交给 Administrators 组
    TakeOwnershipForAdministrators,
    GrantUser,
    /// 关闭继承并重新显式授权
    ReplaceInheritedWithUser,
    ResetAcl,
    GrantEveryone,
    GrantAdministrators,
    DisableInheritance,
    AclScript,
    /// 同时改所有者，并递归处理子项
    DeepAclScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum When {
    Always,
    IfOwnershipFailed,
}

#[derive(Debug, Clone, Copy)]
struct TierStep {
    step: PermissionStep,
    when: When,
    /// 是否计入整体结果
    counts: bool,
}

const fn always(step: PermissionStep) -> TierStep {
    TierStep {
        step,
        when: When::Always,
        counts: true,
    }
}

const STANDARD_STEPS: &[TierStep] = &[
    always(PermissionStep::TakeOwnership),
    always(PermissionStep::GrantUser),
    always(PermissionStep::ReplaceInheritedWithUser),
    always(PermissionStep::AclScript),
];

const ENHANCED_STEPS: &[TierStep] = &[
    always(PermissionStep::TakeOwnership),
    TierStep {
        step: PermissionStep::TakeOwnershipForAdministrators,
        when: When::IfOwnershipFailed,
        counts: true,
    },
    always(PermissionStep::ResetAcl),
    always(PermissionStep::GrantEveryone),
    always(PermissionStep::DeepAclScript),
];

const FOLDER_CLEANUP_STEPS: &[TierStep] = &[
    TierStep {
        step: PermissionStep::TakeOwnership,
        when: When::Always,
        counts: false,
    },
    always(PermissionStep::GrantUser),
    always(PermissionStep::GrantEveryone),
    always(PermissionStep::GrantAdministrators),
    TierStep {
        step: PermissionStep::DisableInheritance,
        when: When::Always,
        counts: false,
    },
];

impl EscalationTier {
    fn steps(self) -> &'static [TierStep] {
        match self {
            EscalationTier::Standard => STANDARD_STEPS,
            EscalationTier::Enhanced => ENHANCED_STEPS,
            EscalationTier::FolderCleanup => FOLDER_CLEANUP_STEPS,
        }
    }

    fn settle(self, delays: &SettleDelays) -> Duration {
        match self {
            EscalationTier::Standard => ms(delays.permission),
            EscalationTier::Enhanced => ms(delays.enhanced_permission),
            EscalationTier::FolderCleanup => Duration::ZERO,
        }
    }
}

/// 当前用户名，拿不到时退回 Administrators 组
pub fn current_principal() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| ADMINISTRATORS_SID.to_string())
}

/// 获取所有权并放宽 ACL，按层级依次尝试
pub struct PermissionEscalator {
    shell: Arc<dyn ShellExecutor>,
    hosts: HostConfig,
    timeouts: CommandTimeouts,
    settle: SettleDelays,
    principal: String,
}

impl PermissionEscalator {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        hosts: HostConfig,
        timeouts: CommandTimeouts,
        settle: SettleDelays,
    ) -> Self {
        Self {
            shell,
            hosts,
            timeouts,
            settle,
            principal: current_principal(),
        }
    }

    pub fn from_config(shell: Arc<dyn ShellExecutor>, config: &Config) -> Self {
        Self::new(
            shell,
            config.hosts.clone(),
            config.removal.timeouts.clone(),
            config.removal.settle.clone(),
        )
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    fn timeout(&self, step: PermissionStep, tier: EscalationTier) -> Duration {
        match step {
            PermissionStep::AclScript => ms(self.timeouts.acl_script),
            PermissionStep::DeepAclScript => ms(self.timeouts.enhanced_acl_script),
            PermissionStep::DisableInheritance => ms(self.timeouts.inheritance),
            _ if tier == EscalationTier::Enhanced => ms(self.timeouts.enhanced_ownership),
            _ => ms(self.timeouts.ownership),
        }
    }

    fn icacls(&self, path: &Path, timeout: Duration, tail: &[&str]) -> CommandSpec {
        CommandSpec::new(&self.hosts.icacls, timeout)
            .path_arg(path)
            .args(tail.iter().copied())
    }

    fn command(&self, step: PermissionStep, tier: EscalationTier, path: &Path) -> CommandSpec {
        let timeout = self.timeout(step, tier);
        let user_full = format!("{}:F", self.principal);
        match step {
            PermissionStep::TakeOwnership => CommandSpec::new(&self.hosts.takeown, timeout)
                .arg("/f")
                .path_arg(path)
                .args(["/r", "/d", "y"]),
            PermissionStep::TakeOwnershipForAdministrators => {
                CommandSpec::new(&self.hosts.takeown, timeout)
                    .arg("/f")
                    .path_arg(path)
                    .args(["/r", "/a", "/d", "y"])
            }
            PermissionStep::GrantUser => {
                self.icacls(path, timeout, &["/grant:r", &user_full, "/t", "/c", "/q"])
            }
            PermissionStep::ReplaceInheritedWithUser => self.icacls(
                path,
                timeout,
                &["/inheritance:d", "/grant:r", &user_full, "/t", "/c", "/q"],
            ),
            PermissionStep::ResetAcl => self.icacls(path, timeout, &["/reset", "/t", "/c", "/q"]),
            PermissionStep::GrantEveryone => self.icacls(
                path,
                timeout,
                &["/grant", &format!("{}:F", EVERYONE_SID), "/t", "/c", "/q"],
            ),
            PermissionStep::GrantAdministrators => self.icacls(
                path,
                timeout,
                &["/grant", &format!("{}:F", ADMINISTRATORS_SID), "/t", "/c", "/q"],
            ),
            PermissionStep::DisableInheritance => {
                self.icacls(path, timeout, &["/inheritance:d", "/t", "/c", "/q"])
            }
            PermissionStep::AclScript => {
                powershell::guarded_script(&self.hosts.powershell, &self.acl_script(path, false), timeout)
            }
            PermissionStep::DeepAclScript => {
                powershell::guarded_script(&self.hosts.powershell, &self.acl_script(path, true), timeout)
            }
        }
    }

    fn acl_script(&self, path: &Path, deep: bool) -> String {
        let target = quote(&path.to_string_lossy());
        let user = quote(&self.principal);
        let mut script = format!(
            "$p = {target}; $rule = New-Object System.Security.AccessControl.FileSystemAccessRule({user}, 'FullControl', 'ContainerInherit,ObjectInherit', 'None', 'Allow'); $acl = Get-Acl -LiteralPath $p",
        );
        if deep {
            script.push_str(&format!(
                "; $owner = New-Object System.Security.Principal.NTAccount({user}); $acl.SetOwner($owner)"
            ));
        }
        script.push_str("; $acl.SetAccessRule($rule); Set-Acl -LiteralPath $p -AclObject $acl");
        if deep {
            script.push_str(
                "; Get-ChildItem -LiteralPath $p -Recurse -Force -ErrorAction SilentlyContinue | ForEach-Object { try { $a = Get-Acl -LiteralPath $_.FullName; $a.SetOwner($owner); $a.AddAccessRule((New-Object System.Security.AccessControl.FileSystemAccessRule($owner, 'FullControl', 'Allow'))); Set-Acl -LiteralPath $_.FullName -AclObject $a } catch {} }",
            );
        }
        script
    }

    /// 执行某一层级的全部子步骤，任一计数步骤成功即返回 true
    pub async fn escalate(&self, path: &Path, tier: EscalationTier, ctx: &RunContext) -> bool {
        let steps = tier.steps();
        let mut ownership_ok = false;
        let mut any = false;
        let mut passed = 0usize;
        let mut ran = 0usize;

        for planned in steps {
            if ctx.is_cancelled() {
                break;
            }
            if planned.when == When::IfOwnershipFailed && ownership_ok {
                continue;
            }

            let spec = self.command(planned.step, tier, path);
            let output = self.shell.run(&spec, &ctx.cancel).await;
            let outcome = match planned.step {
                PermissionStep::AclScript | PermissionStep::DeepAclScript => {
                    powershell::interpret(&output, OutcomePolicy::RequireMarker)
                }
                _ => output.outcome(),
            };
            ran += 1;

            ctx.narrator.detail(format!(
                "  权限步骤 {:?}/{:?}: {} {}",
                tier,
                planned.step,
                if outcome.succeeded { "成功" } else { "失败" },
                outcome.diagnostic
            ));

            if outcome.succeeded {
                passed += 1;
                if matches!(
                    planned.step,
                    PermissionStep::TakeOwnership | PermissionStep::TakeOwnershipForAdministrators
                ) {
                    ownership_ok = true;
                }
                if planned.counts {
                    any = true;
                }
            }
        }

        let summary = format!("{}/{} 个子步骤成功", passed, ran);
        let outcome = if any {
            AttemptOutcome::success(summary)
        } else {
            AttemptOutcome::failure(FailureKind::AccessDenied, summary)
        };
        ctx.narrator.attempt(AttemptAction::Escalation(tier), &outcome);

        let settle = tier.settle(&self.settle);
        if any && !settle.is_zero() && !ctx.is_cancelled() {
            debug!("权限修改后等待 {:?}", settle);
            tokio::time::sleep(settle).await;
        }
        any
    }
}
