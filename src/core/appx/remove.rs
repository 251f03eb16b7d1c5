use crate::core::appx::gateway::{PackageGateway, PowerShellGateway, RemovalVariant};
use crate::core::cancel::CancelFlag;
use crate::result::{AttemptOutcome, FailureKind};
use async_trait::async_trait;
use tracing::{error, info};
use windows::core::{HRESULT, HSTRING};
use windows::Management::Deployment::{DeploymentResult, PackageManager, RemovalOptions};

/// E_ACCESSDENIED
const ACCESS_DENIED: HRESULT = HRESULT(0x8007_0005_u32 as i32);
/// ERROR_NOT_FOUND / ERROR_INSTALL_PACKAGE_NOT_FOUND
const NOT_FOUND: [HRESULT; 2] = [
    HRESULT(0x8007_0490_u32 as i32),
    HRESULT(0x8007_3CF1_u32 as i32),
];

fn classify(hr: HRESULT) -> FailureKind {
    if hr == ACCESS_DENIED {
        FailureKind::AccessDenied
    } else if NOT_FOUND.contains(&hr) {
        FailureKind::NotFound
    } else {
        FailureKind::Other
    }
}

/// 通过 Windows.Management.Deployment 卸载，只看返回的 HRESULT，不解析文本
async fn remove_package(package_full_name: &str, options: RemovalOptions) -> AttemptOutcome {
    let package_manager = match PackageManager::new() {
        Ok(pm) => pm,
        Err(e) => {
            error!("无法创建 PackageManager: {:?}", e);
            return AttemptOutcome::failure(FailureKind::Spawn, format!("无法创建 PackageManager: {}", e));
        }
    };

    let async_op = match package_manager
        .RemovePackageWithOptionsAsync(&HSTRING::from(package_full_name), options)
    {
        Ok(op) => op,
        Err(e) => return AttemptOutcome::failure(classify(e.code()), e.message()),
    };

    let result: DeploymentResult = match async_op.await {
        Ok(r) => r,
        Err(e) => return AttemptOutcome::failure(classify(e.code()), e.message()),
    };

    let error_text = match result.ErrorText() {
        Ok(h) => h.to_string_lossy(),
        Err(_) => String::new(),
    };
    judge(package_full_name, result.ExtendedErrorCode(), &error_text)
}

/// 扩展错误码读不出来时按失败处理，不能当作 S_OK
fn judge(package_full_name: &str, extended: windows::core::Result<HRESULT>, error_text: &str) -> AttemptOutcome {
    let extended_hr = match extended {
        Ok(hr) => hr,
        Err(e) => {
            error!("无法读取部署结果的扩展错误代码: {:?}", e);
            return AttemptOutcome::failure(
                classify(e.code()),
                format!("无法读取扩展错误代码 0x{:08X}: {}", e.code().0, e.message()),
            );
        }
    };

    if extended_hr.is_ok() {
        info!("包成功移除: {}", package_full_name);
        AttemptOutcome::success(format!("HRESULT 0x{:08X}", extended_hr.0))
    } else {
        error!(
            "移除包失败，扩展错误代码: {:?}, 错误文本: {}",
            extended_hr, error_text
        );
        AttemptOutcome::failure(
            classify(extended_hr),
            format!("HRESULT 0x{:08X}: {}", extended_hr.0, error_text),
        )
    }
}

/// 用部署 API 执行单用户和全用户卸载，其余操作交给 PowerShell 网关
pub struct DeploymentGateway {
    fallback: PowerShellGateway,
}

impl DeploymentGateway {
    pub fn new(fallback: PowerShellGateway) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl PackageGateway for DeploymentGateway {
    async fn is_registered(&self, package_id: &str, cancel: &CancelFlag) -> bool {
        self.fallback.is_registered(package_id, cancel).await
    }

    async fn resolve_canonical_id(&self, approximate_id: &str, cancel: &CancelFlag) -> Option<String> {
        self.fallback.resolve_canonical_id(approximate_id, cancel).await
    }

    async fn remove(&self, package_id: &str, variant: RemovalVariant, cancel: &CancelFlag) -> AttemptOutcome {
        if cancel.is_cancelled() {
            return AttemptOutcome::cancelled();
        }
        match variant {
            RemovalVariant::Standard => remove_package(package_id, RemovalOptions::None).await,
            RemovalVariant::AllUsers => {
                remove_package(package_id, RemovalOptions::RemoveForAllUsers).await
            }
            RemovalVariant::AlternateHost | RemovalVariant::DevModeDisabled => {
                self.fallback.remove(package_id, variant, cancel).await
            }
        }
    }

    async fn remove_provisioned(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome {
        self.fallback.remove_provisioned(package_id, cancel).await
    }

    async fn low_level_cleanup(&self, package_id: &str, cancel: &CancelFlag) -> AttemptOutcome {
        self.fallback.low_level_cleanup(package_id, cancel).await
    }

    async fn reset_cache(&self, cancel: &CancelFlag) -> AttemptOutcome {
        self.fallback.reset_cache(cancel).await
    }

    async fn dependents(&self, package_id: &str, cancel: &CancelFlag) -> Vec<String> {
        self.fallback.dependents(package_id, cancel).await
    }
}
