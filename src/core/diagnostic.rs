//! 卸载后的诊断：包还在不在、文件夹还剩多少、有没有进程占用，以及手动处理的建议

use crate::core::appx::gateway::PackageGateway;
use crate::core::appx::identity::PackageTarget;
use crate::core::cancel::CancelFlag;
use crate::core::folder::FolderOps;
use crate::core::process::{ProcessEntry, ProcessReconciler};
use crate::core::state::ReconciliationState;
use crate::utils::file_ops::{bytes_to_human, TreeStats};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub package_id: String,
    pub folder_path: PathBuf,
    pub registered: bool,
    /// 文件夹不存在时为 None
    pub folder: Option<TreeStats>,
    pub related_processes: Vec<ProcessEntry>,
    /// `%LOCALAPPDATA%\Packages\<family name>`，存在时才有值
    pub data_folder: Option<PathBuf>,
    pub recommendations: Vec<String>,
}

impl Diagnosis {
    pub fn state(&self) -> ReconciliationState {
        ReconciliationState {
            registered: self.registered,
            folder_exists: self.folder.is_some(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.state().is_removed() && self.related_processes.is_empty()
    }

    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![
            format!("包: {}", self.package_id),
            format!("目录: {}", self.folder_path.display()),
        ];

        lines.push(if self.registered {
            "包仍然在包管理器中注册".to_string()
        } else {
            "包已注销".to_string()
        });

        match &self.folder {
            Some(stats) => lines.push(format!(
                "目录仍然存在: {} 个文件, {} 个子目录, {}",
                stats.files,
                stats.dirs,
                bytes_to_human(stats.bytes)
            )),
            None => lines.push("目录已不存在".to_string()),
        }

        if self.related_processes.is_empty() {
            lines.push("没有相关进程在运行".to_string());
        } else {
            for p in &self.related_processes {
                let exe = p
                    .exe
                    .as_ref()
                    .map(|e| e.display().to_string())
                    .unwrap_or_else(|| "未知路径".to_string());
                lines.push(format!("仍在运行: PID {} {} ({})", p.pid, p.name, exe));
            }
        }

        if let Some(data) = &self.data_folder {
            lines.push(format!("用户数据目录仍然存在: {}", data.display()));
        }

        if !self.recommendations.is_empty() {
            lines.push("建议操作:".to_string());
            for (i, step) in self.recommendations.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, step));
            }
        }
        lines
    }
}

/// 按残留状态给出可以手动执行的命令
pub fn manual_steps(target: &PackageTarget, state: ReconciliationState) -> Vec<String> {
    let mut steps = Vec::new();
    let id = &target.canonical_id;
    let base = target.base_name();

    if state.registered {
        steps.push("重启 Windows 后再试一次".to_string());
        steps.push(format!("Remove-AppxPackage -Package '{}' -AllUsers", id));
        steps.push(format!(
            "Get-AppxProvisionedPackage -Online | Where-Object {{ $_.PackageName -like '*{}*' }} | Remove-AppxProvisionedPackage -Online",
            base
        ));
        steps.push(format!("DISM /Online /Remove-ProvisionedAppxPackage /PackageName:{}", id));
        steps.push("在 设置 > 应用 中尝试卸载，或在事件查看器中查看 AppXDeployment-Server 日志".to_string());
    } else if state.folder_exists {
        let path = target.folder_path.display();
        steps.push("结束所有与该应用相关的进程".to_string());
        steps.push(format!("takeown /f \"{}\" /r /d y", path));
        steps.push(format!("icacls \"{}\" /grant Everyone:F /T /C", path));
        steps.push(format!("rmdir /s /q \"{}\"", path));
        steps.push("如果目录仍然存在，重启 Windows 后再删除".to_string());
    }
    steps
}

/// 用户数据目录的位置
pub fn data_folder_in(local_app_data: &Path, target: &PackageTarget) -> PathBuf {
    local_app_data.join("Packages").join(target.family_name())
}

pub struct Diagnostician {
    gateway: Arc<dyn PackageGateway>,
    processes: Arc<ProcessReconciler>,
    ops: Arc<dyn FolderOps>,
    local_app_data: Option<PathBuf>,
}

impl Diagnostician {
    pub fn new(
        gateway: Arc<dyn PackageGateway>,
        processes: Arc<ProcessReconciler>,
        ops: Arc<dyn FolderOps>,
    ) -> Self {
        Self {
            gateway,
            processes,
            ops,
            local_app_data: std::env::var_os("LOCALAPPDATA").map(PathBuf::from),
        }
    }

    pub fn with_local_app_data(mut self, dir: Option<PathBuf>) -> Self {
        self.local_app_data = dir;
        self
    }

    pub async fn diagnose(&self, target: &PackageTarget, cancel: &CancelFlag) -> Diagnosis {
        let registered = self.gateway.is_registered(&target.canonical_id, cancel).await;

        let folder = if self.ops.exists(&target.folder_path).await {
            Some(self.ops.stats(&target.folder_path).await)
        } else {
            None
        };

        let related_processes = self.processes.find_related(target).await.unwrap_or_default();

        let mut data_folder = None;
        if let Some(base) = &self.local_app_data {
            let candidate = data_folder_in(base, target);
            if self.ops.exists(&candidate).await {
                data_folder = Some(candidate);
            }
        }

        let state = ReconciliationState {
            registered,
            folder_exists: folder.is_some(),
        };
        let mut recommendations = manual_steps(target, state);
        if let Some(data) = &data_folder {
            recommendations.push(format!("如不再需要用户数据，可删除 {}", data.display()));
        }

        Diagnosis {
            package_id: target.canonical_id.clone(),
            folder_path: target.folder_path.clone(),
            registered,
            folder,
            related_processes,
            data_folder,
            recommendations,
        }
    }
}
