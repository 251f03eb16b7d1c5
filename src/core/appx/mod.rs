pub mod gateway;
pub mod identity;
#[cfg(windows)]
pub mod remove;

use crate::config::config::{Config, GatewayBackend};
use crate::core::executor::ShellExecutor;
use gateway::{PackageGateway, PowerShellGateway};
use std::sync::Arc;

/// 按配置选择包管理器后端
pub fn build_gateway(shell: Arc<dyn ShellExecutor>, config: &Config) -> Arc<dyn PackageGateway> {
    let powershell = PowerShellGateway::from_config(shell, config);
    match config.gateway.backend {
        GatewayBackend::Powershell => Arc::new(powershell),
        #[cfg(windows)]
        GatewayBackend::DeploymentApi => Arc::new(remove::DeploymentGateway::new(powershell)),
        #[cfg(not(windows))]
        GatewayBackend::DeploymentApi => {
            tracing::warn!("部署 API 仅在 Windows 上可用，改用 PowerShell");
            Arc::new(powershell)
        }
    }
}
