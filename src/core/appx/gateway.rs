use crate::config::config::{ms, CommandTimeouts, Config, HostConfig};
use crate::core::appx::identity::{base_name, family_name};
use crate::core::cancel::CancelFlag;
use crate::core::executor::{CommandSpec, ShellExecutor};
use crate::core::powershell::{self, first_value, quote};
use crate::result::AttemptOutcome;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use crate::config::config::OutcomePolicy;

/// 卸载命令的几种变体，由编排器决定尝试顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RemovalVariant {
    /// 当前用户
    Standard,
    AllUsers,
    /// 通过 Windows PowerShell 5.1 执行
    AlternateHost,
    /// 带 -DisableDevelopmentMode 的全用户卸载
    DevModeDisabled,
}

impl RemovalVariant {
    /// 首轮依次尝试
    pub const PRIMARY: [RemovalVariant; 3] = [
        RemovalVariant::Standard,
        RemovalVariant::AllUsers,
        RemovalVariant::AlternateHost,
    ];
    /// 增强提权后再试一次
    pub const RETRY: [RemovalVariant; 2] = [RemovalVariant::Standard, RemovalVariant::AllUsers];
}

/// 包管理器的动词接口
#[async_trait]
pub trait PackageGateway: Send + Sync {
    /// 包是否仍然注册。查询本身失败时按“仍注册”处理。
    async fn is_registered(&self, package_id: &str, cancel: &CancelFlag) -> bool;

    /// 把近似名称解析成包管理器使用的全名；`None` 表示已不存在
    async fn resolve_canonical_id(&self, approximate_id: &str, cancel: &CancelFlag) -> Option<String>;

    async fn remove(
        &self,
        package_id: &str,
        variant: RemovalVariant,
        cancel: &CancelFlag,
    ) -> AttemptOutcome;

    /// 移除“为新用户预配”的注册
    async fn remove_provisioned(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome;

    /// 调用系统维护工具（DISM），耗时较长
    async fn low_level_cleanup(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome;

    /// 尽力而为的缓存重置，结果只用于叙述
    async fn reset_cache(&self, cancel: &CancelFlag) -> AttemptOutcome;

    /// 声明依赖于该包的其他包
    async fn dependents(&self, _package_id: &str, _cancel: &CancelFlag) -> Vec<String> {
        Vec::new()
    }
}

/// 通过 powershell.exe / dism.exe 实现的网关
pub struct PowerShellGateway {
    shell: Arc<dyn ShellExecutor>,
    hosts: HostConfig,
    timeouts: CommandTimeouts,
    policy: OutcomePolicy,
}

impl PowerShellGateway {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        hosts: HostConfig,
        timeouts: CommandTimeouts,
        policy: OutcomePolicy,
    ) -> Self {
        Self {
            shell,
            hosts,
            timeouts,
            policy,
        }
    }

    pub fn from_config(shell: Arc<dyn ShellExecutor>, config: &Config) -> Self {
        Self::new(
            shell,
            config.hosts.clone(),
            config.removal.timeouts.clone(),
            config.gateway.outcome_policy,
        )
    }

    fn lookup_filter(package_id: &str) -> String {
        format!(
            "Get-AppxPackage -Name {} | Where-Object {{ $_.PackageFullName -eq {} }}",
            quote(&format!("*{}*", base_name(package_id))),
            quote(package_id)
        )
    }

    fn removal_spec(&self, package_id: &str, variant: RemovalVariant) -> Option<CommandSpec> {
        let id = quote(package_id);
        let spec = match variant {
            RemovalVariant::Standard => powershell::guarded_script(
                &self.hosts.powershell,
                &format!("Remove-AppxPackage -Package {} -Confirm:$false -ErrorAction Stop", id),
                ms(self.timeouts.remove),
            ),
            RemovalVariant::AllUsers => powershell::guarded_script(
                &self.hosts.powershell,
                &format!(
                    "Remove-AppxPackage -Package {} -AllUsers -Confirm:$false -ErrorAction Stop",
                    id
                ),
                ms(self.timeouts.remove_all_users),
            ),
            RemovalVariant::AlternateHost => {
                if !self.hosts.windows_powershell.exists() {
                    return None;
                }
                powershell::guarded_script(
                    &self.hosts.windows_powershell.to_string_lossy(),
                    &format!("Remove-AppxPackage -Package {} -Confirm:$false -ErrorAction Stop", id),
                    ms(self.timeouts.alternate_host),
                )
            }
            RemovalVariant::DevModeDisabled => powershell::guarded_script(
                &self.hosts.powershell,
                &format!(
                    "Remove-AppxPackage -Package {} -AllUsers -Confirm:$false -DisableDevelopmentMode -ErrorAction Stop",
                    id
                ),
                ms(self.timeouts.dev_mode),
            ),
        };
        Some(spec)
    }
}

#[async_trait]
impl PackageGateway for PowerShellGateway {
    async fn is_registered(&self, package_id: &str, cancel: &CancelFlag) -> bool {
        let script = format!("@({}).Count", Self::lookup_filter(package_id));
        let spec = powershell::script(&self.hosts.powershell, &script, ms(self.timeouts.query));
        let output = self.shell.run(&spec, cancel).await;

        if !output.exit_ok() {
            warn!(
                "查询注册状态失败，按仍注册处理: {} ({})",
                package_id,
                output.outcome().diagnostic
            );
            return true;
        }

        match first_value(&output) {
            None => false,
            Some(text) => match text.parse::<u64>() {
                Ok(count) => count > 0,
                Err(_) => {
                    warn!("无法解析注册查询输出 {:?}，按仍注册处理", text);
                    true
                }
            },
        }
    }

    async fn resolve_canonical_id(&self, approximate_id: &str, cancel: &CancelFlag) -> Option<String> {
        let script = format!(
            "Get-AppxPackage -Name {} | Where-Object {{ $_.PackageFullName -eq {id} -or $_.Name -eq {id} }} | Select-Object -First 1 -ExpandProperty PackageFullName",
            quote(&format!("*{}*", base_name(approximate_id))),
            id = quote(approximate_id)
        );
        let spec = powershell::script(&self.hosts.powershell, &script, ms(self.timeouts.query));
        let output = self.shell.run(&spec, cancel).await;

        if !output.exit_ok() {
            warn!(
                "解析包全名失败，沿用原名称: {} ({})",
                approximate_id,
                output.outcome().diagnostic
            );
            return Some(approximate_id.to_string());
        }

        let resolved = first_value(&output);
        match &resolved {
            Some(id) if id != approximate_id => debug!("包名 {} 解析为 {}", approximate_id, id),
            Some(_) => {}
            None => info!("包管理器中已找不到 {}", approximate_id),
        }
        resolved
    }

    async fn remove(
        &self,
        package_id: &str,
        variant: RemovalVariant,
        cancel: &CancelFlag,
    ) -> AttemptOutcome {
        let Some(spec) = self.removal_spec(package_id, variant) else {
            return AttemptOutcome::skipped(format!(
                "备用宿主不存在: {}",
                self.hosts.windows_powershell.display()
            ));
        };
        let output = self.shell.run(&spec, cancel).await;
        let outcome = powershell::interpret(&output, self.policy);
        debug!("remove({:?}) {} -> {:?}", variant, package_id, outcome);
        outcome
    }

    async fn remove_provisioned(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome {
        let body = format!(
            "Get-AppxProvisionedPackage -Online | Where-Object {{ $_.PackageName -like {} -or $_.DisplayName -eq {} }} | Remove-AppxProvisionedPackage -Online -ErrorAction Stop",
            quote(&format!("*{}*", base_name(package_id))),
            quote(base_name(package_id))
        );
        debug!("移除预配包，family = {}", family_name(package_id));
        let spec = powershell::guarded_script(&self.hosts.powershell, &body, ms(self.timeouts.provisioned));
        let output = self.shell.run(&spec, cancel).await;
        powershell::interpret(&output, self.policy)
    }

    async fn low_level_cleanup(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome {
        let spec = CommandSpec::new(&self.hosts.dism, ms(self.timeouts.servicing)).args([
            "/Online".to_string(),
            "/Remove-ProvisionedAppxPackage".to_string(),
            format!("/PackageName:{}", package_id),
        ]);
        self.shell.run(&spec, cancel).await.outcome()
    }

    async fn reset_cache(&self, cancel: &CancelFlag) -> AttemptOutcome {
        let spec = CommandSpec::new(&self.hosts.wsreset, ms(self.timeouts.cache)).arg("/c");
        let outcome = self.shell.run(&spec, cancel).await.outcome();
        if !outcome.succeeded {
            debug!("缓存重置失败（忽略）: {}", outcome.diagnostic);
        }
        outcome
    }

    async fn dependents(&self, package_id: &str, cancel: &CancelFlag) -> Vec<String> {
        let script = format!(
            "$t = {}; if ($t) {{ Get-AppxPackage | Where-Object {{ $_.Dependencies.PackageFullName -contains $t.PackageFullName -or $_.Dependencies.Name -contains $t.Name }} | ForEach-Object {{ $_.PackageFullName }} }}",
            Self::lookup_filter(package_id)
        );
        let spec = powershell::script(&self.hosts.powershell, &script, ms(self.timeouts.query));
        let output = self.shell.run(&spec, cancel).await;
        if !output.exit_ok() {
            return Vec::new();
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}
