use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs, process};
use tracing::{error, info, warn};

use app_lib::config::config::{read_config, read_config_from, Config};
use app_lib::core::audit::AuditLog;
use app_lib::core::removal::batch::remove_many;
use app_lib::utils::file_ops::create_initial_directories;
use app_lib::utils::logger::init_logging;
use app_lib::{CancelFlag, PackageTarget, ProgressCb, RemovalOrchestrator, RemovalReport};

#[derive(Parser)]
#[command(name = "uwp_remover", version, about = "彻底卸载 UWP / Appx 应用", long_about = None)]
struct Cli {
    /// 配置文件路径，默认为程序目录下的 UWPR/config/settings.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    json: bool,

    /// 输出调试日志
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 卸载一个包
    Remove(TargetArgs),
    /// 按 TOML 列表批量卸载
    Batch {
        file: PathBuf,
        /// 并发数，默认读取配置
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// 卸载前分析
    Analyze(TargetArgs),
    /// 卸载后诊断残留
    Diagnose(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// 包全名或包名
    package: String,
    /// 包目录，默认为 %ProgramFiles%\WindowsApps\<package>
    #[arg(long)]
    folder: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    /// 标记为受保护组件
    #[arg(long)]
    protected: bool,
}

impl TargetArgs {
    fn into_target(self) -> PackageTarget {
        let folder = self.folder.unwrap_or_else(|| default_folder(&self.package));
        let mut target = PackageTarget::new(self.package, folder).protected(self.protected);
        if let Some(name) = self.name {
            target = target.with_display_name(name);
        }
        target
    }
}

#[derive(Deserialize)]
struct BatchFile {
    #[serde(default)]
    targets: Vec<PackageTarget>,
}

fn default_folder(package: &str) -> PathBuf {
    let program_files = env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".to_string());
    Path::new(&program_files).join("WindowsApps").join(package)
}

fn read_batch_file(file: &Path) -> Result<Vec<PackageTarget>> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("无法读取批量列表 {}", file.display()))?;
    let list: BatchFile = toml::from_str(&content)
        .with_context(|| format!("批量列表格式错误 {}", file.display()))?;
    Ok(list.targets)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(p) => read_config_from(p),
        None => read_config(),
    };
    config.context("读取配置失败")
}

fn open_audit(config: &Config) -> Arc<AuditLog> {
    if config.logging.audit_file.trim().is_empty() {
        return Arc::new(AuditLog::disabled());
    }
    let path = config.logging.log_dir.join(&config.logging.audit_file);
    match AuditLog::open(&path) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            warn!("无法打开审计日志 {}: {}", path.display(), e);
            Arc::new(AuditLog::disabled())
        }
    }
}

fn log_system_info() {
    let sys_name = sysinfo::System::name().unwrap_or_else(|| "未知系统".to_string());
    let kernel_version = sysinfo::System::kernel_version().unwrap_or_else(|| "未知内核版本".to_string());
    let os_version = sysinfo::System::os_version().unwrap_or_else(|| "未知OS版本".to_string());

    info!(
        "Preinit Done. App Path: {:?} | Commit: {} | Built: {}",
        env::current_exe().unwrap_or_else(|_| Path::new(".").to_path_buf()),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIME")
    );
    info!(
        "System Info: System: {} | Kernel: {} | OS Version: {} | CPU Architecture: {} | CPUs: {}",
        sys_name,
        kernel_version,
        os_version,
        env::consts::ARCH,
        num_cpus::get()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

fn exit_code(reports: &[RemovalReport]) -> i32 {
    if reports.iter().all(|r| r.succeeded) {
        0
    } else {
        2
    }
}

async fn run(cli: Cli, config: Config, cancel: CancelFlag) -> Result<i32> {
    let audit = open_audit(&config);
    let orchestrator = Arc::new(RemovalOrchestrator::from_config(&config, audit.clone()));

    let sink: Option<ProgressCb> = if cli.json {
        None
    } else {
        Some(Arc::new(|line: String| println!("{}", line)))
    };

    let code = match cli.command {
        Commands::Remove(args) => {
            let target = args.into_target();
            let report = orchestrator.remove(&target, sink, cancel).await;
            if cli.json {
                print_json(&report)?;
            }
            exit_code(std::slice::from_ref(&report))
        }
        Commands::Batch { file, concurrency } => {
            let targets = read_batch_file(&file)?;
            let concurrency = concurrency.unwrap_or_else(|| config.removal.batch_concurrency());

            let reports = remove_many(orchestrator, targets, sink, cancel, concurrency).await;
            if cli.json {
                print_json(&reports)?;
            } else {
                for r in &reports {
                    println!("{}: {:?}", r.label, r.outcome);
                }
            }
            exit_code(&reports)
        }
        Commands::Analyze(args) => {
            let target = args.into_target();
            let analysis = orchestrator.analyzer().analyze(&target, &cancel).await;
            if cli.json {
                print_json(&analysis)?;
            } else if analysis.findings.is_empty() {
                println!("未发现问题");
            } else {
                for f in &analysis.findings {
                    println!("[{:?}] {}", f.severity, f.message);
                }
            }
            0
        }
        Commands::Diagnose(args) => {
            let target = args.into_target();
            let diagnosis = orchestrator.diagnostician().diagnose(&target, &cancel).await;
            if cli.json {
                print_json(&diagnosis)?;
            } else {
                print_lines(&diagnosis.render());
            }
            if diagnosis.is_clean() {
                0
            } else {
                2
            }
        }
    };

    audit.close();
    Ok(code)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // 命令行中的相对路径按当前工作目录解析；配置和日志目录是基于 EXE 的绝对路径
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{:?}", e);
            process::exit(1);
        }
    };
    if cli.verbose {
        config.logging.debug = true;
    }

    let guard = init_logging(&config.logging);
    create_initial_directories();
    log_system_info();

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl-C，当前命令结束后停止");
            on_signal.cancel();
        }
    });

    let code = match run(cli, config, cancel).await {
        Ok(code) => {
            info!("Program exited with code {}.", code);
            code
        }
        Err(e) => {
            error!("程序运行失败: {:?}", e);
            1
        }
    };

    drop(guard);
    process::exit(code);
}
