use crate::core::appx::gateway::RemovalVariant;
use crate::core::folder::DeleteStrategy;
use crate::core::permissions::EscalationTier;
use serde::Serialize;
use std::fmt;

/// 编排器推理所依据的两个事实，每次都重新查询
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciliationState {
    pub registered: bool,
    pub folder_exists: bool,
}

impl ReconciliationState {
    pub fn is_removed(&self) -> bool {
        !self.registered && !self.folder_exists
    }

    /// 只有确认包已注销时才能拿到删除文件夹的凭证
    pub fn unregistered(&self) -> Option<Unregistered> {
        (!self.registered).then_some(Unregistered { _private: () })
    }
}

impl fmt::Display for ReconciliationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "registered={}, folder_exists={}",
            self.registered, self.folder_exists
        )
    }
}

/// 包已注销的证明。
///
/// 只能由 [`ReconciliationState::unregistered`] 构造，强制删除文件夹必须持有它。
#[derive(Debug)]
pub struct Unregistered {
    _private: (),
}

#[cfg(test)]
impl Unregistered {
    pub(crate) fn for_tests() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Start,
    Analyzing,
    TerminatingProcesses,
    RemovingViaPackageManager,
    Verifying,
    FolderPersists,
    OrphanedRegistration,
    Reconciling,
    CompleteSuccess,
    RecoverySuccess,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "Start",
            Phase::Analyzing => "Analyzing",
            Phase::TerminatingProcesses => "TerminatingProcesses",
            Phase::RemovingViaPackageManager => "RemovingViaPackageManager",
            Phase::Verifying => "Verifying",
            Phase::FolderPersists => "PartialSuccess_FolderPersists",
            Phase::OrphanedRegistration => "PartialSuccess_OrphanedRegistration",
            Phase::Reconciling => "Reconciling",
            Phase::CompleteSuccess => "CompleteSuccess",
            Phase::RecoverySuccess => "RecoverySuccess",
            Phase::PartialSuccess => "PartialSuccess",
            Phase::Failed => "Failed",
            Phase::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// 一次补救动作的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptAction {
    ProcessTermination,
    Escalation(EscalationTier),
    Removal(RemovalVariant),
    ProvisionedRemoval,
    CacheReset,
    LowLevelCleanup,
    FolderStrategy(DeleteStrategy),
}

impl fmt::Display for AttemptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptAction::ProcessTermination => f.write_str("terminate-processes"),
            AttemptAction::Escalation(tier) => write!(f, "escalate({:?})", tier),
            AttemptAction::Removal(variant) => write!(f, "remove({:?})", variant),
            AttemptAction::ProvisionedRemoval => f.write_str("remove-provisioned"),
            AttemptAction::CacheReset => f.write_str("reset-cache"),
            AttemptAction::LowLevelCleanup => f.write_str("low-level-cleanup"),
            AttemptAction::FolderStrategy(strategy) => write!(f, "folder({:?})", strategy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub action: AttemptAction,
    pub succeeded: bool,
    pub diagnostic: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_only_when_unregistered() {
        let registered = ReconciliationState {
            registered: true,
            folder_exists: false,
        };
        assert!(registered.unregistered().is_none());

        let gone = ReconciliationState {
            registered: false,
            folder_exists: true,
        };
        assert!(gone.unregistered().is_some());
        assert!(!gone.is_removed());
    }

    #[test]
    fn phase_labels() {
        assert_eq!(Phase::FolderPersists.to_string(), "PartialSuccess_FolderPersists");
        assert_eq!(
            AttemptAction::Removal(RemovalVariant::AllUsers).to_string(),
            "remove(AllUsers)"
        );
    }
}
