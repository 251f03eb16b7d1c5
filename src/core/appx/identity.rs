use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 系统关键组件的名称前缀，删除前需要额外警告
const CRITICAL_PREFIXES: [&str; 4] = [
    "Microsoft.Windows",
    "Microsoft.VCLibs",
    "Microsoft.NET.Native",
    "Microsoft.UI.Xaml",
];

/// 一次卸载的目标包。由调用方构造，卸载期间不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTarget {
    /// 包全名，例如 `Publisher.App_1.0.0.0_x64__hash`；也可能只是近似名称
    pub canonical_id: String,
    #[serde(default)]
    pub display_name: String,
    pub folder_path: PathBuf,
    #[serde(default)]
    pub is_protected: bool,
    #[serde(default)]
    pub is_system: bool,
}

impl PackageTarget {
    pub fn new(canonical_id: impl Into<String>, folder_path: impl Into<PathBuf>) -> Self {
        Self {
            canonical_id: canonical_id.into(),
            display_name: String::new(),
            folder_path: folder_path.into(),
            is_protected: false,
            is_system: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn protected(mut self, value: bool) -> Self {
        self.is_protected = value;
        self
    }

    pub fn base_name(&self) -> &str {
        base_name(&self.canonical_id)
    }

    pub fn family_name(&self) -> String {
        family_name(&self.canonical_id)
    }

    /// 优先显示名称，没有时退回包名前缀
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            self.base_name()
        } else {
            self.display_name.trim()
        }
    }

    pub fn is_critical_component(&self) -> bool {
        is_critical_component(&self.canonical_id)
    }
}

/// 第一个 `_` 之前的部分
pub fn base_name(package_id: &str) -> &str {
    package_id.split('_').next().unwrap_or(package_id)
}

/// `Name_Version_Arch__PublisherId` -> `Name_PublisherId`
pub fn family_name(package_id: &str) -> String {
    let parts: Vec<&str> = package_id.split('_').collect();
    match (parts.first(), parts.last()) {
        (Some(first), Some(last)) if parts.len() >= 2 && !last.is_empty() => {
            format!("{}_{}", first, last)
        }
        _ => package_id.to_string(),
    }
}

pub fn is_critical_component(package_id: &str) -> bool {
    CRITICAL_PREFIXES
        .iter()
        .any(|prefix| package_id.starts_with(prefix))
}
