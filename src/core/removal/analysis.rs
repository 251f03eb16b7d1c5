use crate::core::appx::gateway::PackageGateway;
use crate::core::appx::identity::PackageTarget;
use crate::core::cancel::CancelFlag;
use crate::core::folder::FolderOps;
use crate::core::process::{ProcessEntry, ProcessReconciler};
use crate::progress::removal_progress::Narrator;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn tag(&self) -> &'static str {
        match self {
            Severity::Info => "信息",
            Severity::Warning => "警告",
            Severity::Critical => "严重",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

/// 卸载前的可行性分析结果，只用于叙述，不会阻止卸载
#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    pub findings: Vec<Finding>,
    pub related_processes: Vec<ProcessEntry>,
    /// 包管理器是否能找到该包；取消时为 None
    pub visible: Option<bool>,
    pub folder_exists: bool,
    /// 目录不存在时为 None
    pub folder_writable: Option<bool>,
    pub dependents: Vec<String>,
}

impl Analysis {
    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.findings.push(Finding {
            severity,
            message: message.into(),
        });
    }

    pub fn worst(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    pub fn narrate(&self, narrator: &Narrator) {
        if self.findings.is_empty() {
            narrator.report("分析完成，未发现问题");
            return;
        }
        for finding in &self.findings {
            narrator.report(format!("  [{}] {}", finding.severity.tag(), finding.message));
        }
    }
}

pub struct Analyzer {
    gateway: Arc<dyn PackageGateway>,
    processes: Arc<ProcessReconciler>,
    ops: Arc<dyn FolderOps>,
}

impl Analyzer {
    pub fn new(
        gateway: Arc<dyn PackageGateway>,
        processes: Arc<ProcessReconciler>,
        ops: Arc<dyn FolderOps>,
    ) -> Self {
        Self {
            gateway,
            processes,
            ops,
        }
    }

    pub async fn analyze(&self, target: &PackageTarget, cancel: &CancelFlag) -> Analysis {
        let mut analysis = Analysis::default();

        if target.is_protected {
            analysis.push(Severity::Warning, "该包被标记为受保护组件，删除可能影响系统功能");
        }
        if target.is_system {
            analysis.push(Severity::Warning, "该包是系统应用");
        }
        if target.is_critical_component() {
            analysis.push(
                Severity::Critical,
                format!("{} 是系统关键框架组件，许多应用依赖它", target.base_name()),
            );
        }

        match self.processes.find_related(target).await {
            Ok(list) => {
                for entry in &list {
                    analysis.push(
                        Severity::Info,
                        format!("运行中的相关进程: {} (PID {})", entry.name, entry.pid),
                    );
                }
                analysis.related_processes = list;
            }
            Err(e) => analysis.push(Severity::Warning, format!("无法枚举进程: {}", e)),
        }

        analysis.folder_exists = self.ops.exists(&target.folder_path).await;
        if analysis.folder_exists {
            let writable = match self.ops.probe_writable(&target.folder_path).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("写入探测失败 {}: {}", target.folder_path.display(), e);
                    false
                }
            };
            if !writable {
                analysis.push(Severity::Warning, "包目录不可写，需要先获取所有权");
            }
            analysis.folder_writable = Some(writable);
        } else {
            analysis.push(Severity::Info, "包目录不存在");
        }

        if cancel.is_cancelled() {
            return analysis;
        }

        let visible = self
            .gateway
            .resolve_canonical_id(&target.canonical_id, cancel)
            .await
            .is_some();
        if !visible {
            analysis.push(Severity::Info, "包管理器中找不到该包，可能已被卸载");
        }
        analysis.visible = Some(visible);

        if visible && !cancel.is_cancelled() {
            analysis.dependents = self.gateway.dependents(&target.canonical_id, cancel).await;
            if !analysis.dependents.is_empty() {
                analysis.push(
                    Severity::Warning,
                    format!("以下包依赖于它: {}", analysis.dependents.join(", ")),
                );
            }
        }

        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{FakeFolderOps, FakeGateway, FakeProcessTable, FakeWorld};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const ID: &str = "Contoso.Notes_2.1.0.0_x64__abcd1234";

    fn analyzer(world: &FakeWorld, gateway: FakeGateway, table: FakeProcessTable) -> Analyzer {
        Analyzer::new(
            Arc::new(gateway),
            Arc::new(ProcessReconciler::new(Arc::new(table), Duration::ZERO)),
            Arc::new(FakeFolderOps::new(world.clone())),
        )
    }

    #[tokio::test]
    async fn clean_target_has_only_informational_findings() {
        let world = FakeWorld::new();
        world.register(ID);
        let folder = PathBuf::from("/apps/Contoso.Notes");
        world.add_folder(&folder, 3);

        let analysis = analyzer(&world, FakeGateway::new(world.clone()), FakeProcessTable::new(vec![]))
            .analyze(&PackageTarget::new(ID, &folder), &CancelFlag::new())
            .await;

        assert_eq!(analysis.visible, Some(true));
        assert_eq!(analysis.folder_writable, Some(true));
        assert!(analysis.findings.is_empty());
        assert_eq!(analysis.worst(), None);
    }

    #[tokio::test]
    async fn collects_every_kind_of_problem() {
        let world = FakeWorld::new();
        let id = "Microsoft.VCLibs.140.00_14.0.33519.0_x64__8wekyb3d8bbwe";
        world.register(id);
        let folder = PathBuf::from("/apps/VCLibs");
        world.add_folder(&folder, 12);
        world.make_read_only();

        let table = FakeProcessTable::new(vec![ProcessEntry::new(
            42,
            "helper.exe",
            Some(folder.join("helper.exe")),
        )]);
        let gateway = FakeGateway::new(world.clone()).with_dependents(&["Contoso.Notes_2.1.0.0_x64__abcd1234"]);
        let target = PackageTarget::new(id, &folder).protected(true);

        let analysis = analyzer(&world, gateway, table)
            .analyze(&target, &CancelFlag::new())
            .await;

        assert_eq!(analysis.worst(), Some(Severity::Critical));
        assert_eq!(analysis.related_processes.len(), 1);
        assert_eq!(analysis.folder_writable, Some(false));
        assert_eq!(analysis.dependents.len(), 1);
        assert_eq!(
            analysis
                .findings
                .iter()
                .filter(|f| f.severity == Severity::Warning)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn missing_package_and_folder() {
        let world = FakeWorld::new();
        let analysis = analyzer(&world, FakeGateway::new(world.clone()), FakeProcessTable::new(vec![]))
            .analyze(&PackageTarget::new(ID, Path::new("/apps/gone")), &CancelFlag::new())
            .await;

        assert_eq!(analysis.visible, Some(false));
        assert!(!analysis.folder_exists);
        assert_eq!(analysis.folder_writable, None);
        assert_eq!(analysis.worst(), Some(Severity::Info));
    }

    #[tokio::test]
    async fn enumeration_failure_is_a_warning() {
        let world = FakeWorld::new();
        let analysis = analyzer(
            &world,
            FakeGateway::new(world.clone()),
            FakeProcessTable::new(vec![]).failing(),
        )
        .analyze(&PackageTarget::new(ID, Path::new("/apps/gone")), &CancelFlag::new())
        .await;
        assert_eq!(analysis.worst(), Some(Severity::Warning));
    }
}
