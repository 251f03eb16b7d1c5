use crate::result::CoreError;
use crate::utils::file_ops::app_subdir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug: bool,
    pub log_dir: PathBuf,
    /// 审计日志文件名（位于 log_dir 下），留空表示不写审计日志
    pub audit_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_dir: app_subdir("logs"),
            audit_file: "deletion.log".to_string(),
        }
    }
}

/// 外部工具的可执行文件位置
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub powershell: String,
    /// Windows PowerShell 5.1，用作备用宿主
    pub windows_powershell: PathBuf,
    pub cmd: String,
    pub dism: String,
    pub robocopy: String,
    pub takeown: String,
    pub icacls: String,
    pub wsreset: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
        Self {
            powershell: "powershell.exe".to_string(),
            windows_powershell: Path::new(&system_root)
                .join("System32")
                .join("WindowsPowerShell")
                .join("v1.0")
                .join("powershell.exe"),
            cmd: "cmd.exe".to_string(),
            dism: "dism.exe".to_string(),
            robocopy: "robocopy.exe".to_string(),
            takeown: "takeown.exe".to_string(),
            icacls: "icacls.exe".to_string(),
            wsreset: "wsreset.exe".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatewayBackend {
    #[default]
    Powershell,
    /// Windows.Management.Deployment（仅 Windows）
    DeploymentApi,
}

/// 如何判断一次卸载命令是否成功
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomePolicy {
    /// 退出码为 0 且输出中含有成功标记
    #[default]
    RequireMarker,
    /// 退出码为 0 或输出中含有成功标记（旧行为）
    ExitCodeOrMarker,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub backend: GatewayBackend,
    pub outcome_policy: OutcomePolicy,
}

/// 各类外部命令的超时（毫秒）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CommandTimeouts {
    pub query: u64,
    pub remove: u64,
    pub remove_all_users: u64,
    pub alternate_host: u64,
    pub dev_mode: u64,
    pub provisioned: u64,
    pub servicing: u64,
    pub cache: u64,
    pub ownership: u64,
    pub enhanced_ownership: u64,
    pub acl_script: u64,
    pub enhanced_acl_script: u64,
    pub inheritance: u64,
    pub shell_delete: u64,
    pub mirror: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            query: 10_000,
            remove: 15_000,
            remove_all_users: 20_000,
            alternate_host: 25_000,
            dev_mode: 20_000,
            provisioned: 15_000,
            servicing: 30_000,
            cache: 10_000,
            ownership: 15_000,
            enhanced_ownership: 20_000,
            acl_script: 10_000,
            enhanced_acl_script: 30_000,
            inheritance: 10_000,
            shell_delete: 30_000,
            mirror: 45_000,
        }
    }
}

/// 各阶段之间的等待时间（毫秒），给系统留出落盘/注销的时间
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SettleDelays {
    pub permission: u64,
    pub enhanced_permission: u64,
    pub retry: u64,
    pub registry: u64,
    pub cache: u64,
    pub filesystem: u64,
    pub process: u64,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            permission: 1_000,
            enhanced_permission: 3_000,
            retry: 2_000,
            registry: 2_000,
            cache: 3_000,
            filesystem: 1_000,
            process: 2_000,
        }
    }
}

impl SettleDelays {
    pub fn none() -> Self {
        Self {
            permission: 0,
            enhanced_permission: 0,
            retry: 0,
            registry: 0,
            cache: 0,
            filesystem: 0,
            process: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemovalSettings {
    pub timeouts: CommandTimeouts,
    pub settle: SettleDelays,
    /// 请求进程正常关闭后等待多久再强制结束
    pub grace_period_ms: u64,
    /// 文件夹未能删净时，文件数减少的比例超过该值即视为“软成功”
    pub soft_success_ratio: f64,
    /// 包已注销但文件夹删不掉时，整体是否仍算成功
    pub accept_persisting_folder: bool,
    /// 批量卸载的并发数，0 表示按 CPU 数自动选择
    pub batch_concurrency: usize,
}

impl Default for RemovalSettings {
    fn default() -> Self {
        Self {
            timeouts: CommandTimeouts::default(),
            settle: SettleDelays::default(),
            grace_period_ms: 2_000,
            soft_success_ratio: 0.5,
            accept_persisting_folder: true,
            batch_concurrency: 0,
        }
    }
}

impl RemovalSettings {
    /// 去掉所有等待，测试用
    pub fn without_delays() -> Self {
        Self {
            settle: SettleDelays::none(),
            grace_period_ms: 0,
            ..Self::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// 把越界的比例限制到 0.0..=1.0，NaN 回退为默认值
    fn sanitize(&mut self) {
        let ratio = self.soft_success_ratio;
        let fixed = if ratio.is_nan() {
            Self::default().soft_success_ratio
        } else {
            ratio.clamp(0.0, 1.0)
        };
        if fixed != ratio {
            warn!("soft_success_ratio = {} 超出范围，改为 {}", ratio, fixed);
            self.soft_success_ratio = fixed;
        }
    }

    pub fn batch_concurrency(&self) -> usize {
        if self.batch_concurrency > 0 {
            self.batch_concurrency
        } else {
            num_cpus::get().clamp(1, 4)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub hosts: HostConfig,
    pub gateway: GatewayConfig,
    pub removal: RemovalSettings,
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub fn get_config_file_path() -> PathBuf {
    app_subdir("config").join("settings.toml")
}

fn ensure_config_file(path: &Path) -> Result<(), CoreError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    if !path.exists() {
        write_config_to(path, &get_default_config())?;
    }
    Ok(())
}

pub fn get_default_config() -> Config {
    Config::default()
}

pub fn read_config() -> Result<Config, CoreError> {
    read_config_from(&get_config_file_path())
}

/// 读取配置；解析失败时把已有的键合并到默认配置上并回写
pub fn read_config_from(path: &Path) -> Result<Config, CoreError> {
    ensure_config_file(path)?;
    let content = fs::read_to_string(path)?;

    let mut config: Config = match toml::from_str(&content) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!("Failed to parse config on first attempt: {:?}", err);

            if let Ok(existing_table) = toml::from_str::<toml::Table>(&content) {
                if let Ok(toml::Value::Table(default_table)) = toml::Value::try_from(get_default_config()) {
                    let merged = merge_tables(default_table, existing_table);
                    let updated = toml::to_string(&toml::Value::Table(merged))?;
                    fs::write(path, updated)?;
                }
            }

            let updated_content = fs::read_to_string(path)?;
            toml::from_str(&updated_content).unwrap_or_else(|second_err| {
                error!("Failed to parse config on second attempt: {:?}", second_err);
                get_default_config()
            })
        }
    };

    config.removal.sanitize();
    debug!("Read config from {}: {:?}", path.display(), config);
    Ok(config)
}

fn merge_tables(
    mut default: toml::map::Map<String, toml::Value>,
    existing: toml::map::Map<String, toml::Value>,
) -> toml::map::Map<String, toml::Value> {
    for (key, existing_value) in existing {
        match default.get_mut(&key) {
            Some(toml::Value::Table(default_table)) => {
                if let toml::Value::Table(existing_table) = existing_value {
                    let merged = merge_tables(std::mem::take(default_table), existing_table);
                    *default_table = merged;
                }
                // 类型不符（表被写成了标量）时保留默认值
            }
            Some(default_value) => {
                if std::mem::discriminant(default_value) == std::mem::discriminant(&existing_value) {
                    *default_value = existing_value;
                }
            }
            None => {
                default.insert(key, existing_value);
            }
        }
    }
    default
}

pub fn write_config_to(path: &Path, config: &Config) -> Result<(), CoreError> {
    let toml_content = toml::to_string(config)?;
    fs::write(path, toml_content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("settings.toml");

        let config = read_config_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.removal.timeouts.servicing, 30_000);
        assert_eq!(config.gateway.outcome_policy, OutcomePolicy::RequireMarker);
    }

    #[test]
    fn partial_file_keeps_user_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "[removal]\ngrace_period_ms = 500\n[gateway]\noutcome_policy = \"exit_code_or_marker\"\n",
        )
        .unwrap();

        let config = read_config_from(&path).unwrap();

        assert_eq!(config.removal.grace_period_ms, 500);
        assert_eq!(config.removal.timeouts.remove, 15_000);
        assert_eq!(config.gateway.outcome_policy, OutcomePolicy::ExitCodeOrMarker);
    }

    #[test]
    fn mistyped_value_is_replaced_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "[removal]\ngrace_period_ms = \"soon\"\nsoft_success_ratio = 0.8\n",
        )
        .unwrap();

        let config = read_config_from(&path).unwrap();

        assert_eq!(config.removal.grace_period_ms, 2_000);
        assert!((config.removal.soft_success_ratio - 0.8).abs() < f64::EPSILON);
        // 合并结果已回写
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("grace_period_ms = 2000"));
    }

    #[test]
    fn out_of_range_soft_ratio_is_clamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        fs::write(&path, "[removal]\nsoft_success_ratio = -0.5\n").unwrap();
        assert_eq!(read_config_from(&path).unwrap().removal.soft_success_ratio, 0.0);

        fs::write(&path, "[removal]\nsoft_success_ratio = 3.0\n").unwrap();
        assert_eq!(read_config_from(&path).unwrap().removal.soft_success_ratio, 1.0);

        fs::write(&path, "[removal]\nsoft_success_ratio = nan\n").unwrap();
        assert_eq!(read_config_from(&path).unwrap().removal.soft_success_ratio, 0.5);
    }

    #[test]
    fn without_delays_zeroes_settles() {
        let settings = RemovalSettings::without_delays();
        assert_eq!(settings.settle.enhanced_permission, 0);
        assert_eq!(settings.grace_period(), Duration::ZERO);
        assert_eq!(settings.timeouts.mirror, 45_000);
    }
}
