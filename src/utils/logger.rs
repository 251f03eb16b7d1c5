use crate::config::config::LoggingConfig;
use once_cell::sync::Lazy;
use std::fs::create_dir_all;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// 程序启动时间
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

// 自定义启动时间计时器
struct UptimeTimer;

impl FormatTime for UptimeTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> Result<(), std::fmt::Error> {
        write!(w, "{}", elapsed_time())
    }
}

// 返回程序启动后的运行时间
fn elapsed_time() -> String {
    let millis = START_TIME.elapsed().as_millis();
    let seconds = millis / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;

    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours % 24,
        minutes % 60,
        seconds % 60,
        millis % 1000
    )
}

/// 初始化日志系统：控制台 + 按天滚动的日志文件。
///
/// 返回的 guard 需要一直持有到程序退出，否则文件日志会丢失尾部。
/// 初始化失败只在 stderr 提示，不影响程序继续运行。
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    Lazy::force(&START_TIME);

    let log_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 控制台层写 stderr，stdout 留给进度和 JSON 输出
    let console_layer = tracing_subscriber::fmt::layer()
        .with_timer(UptimeTimer)
        .with_ansi(true)
        .with_target(true)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match create_dir_all(&config.log_dir) {
        Ok(_) => {
            let appender = tracing_appender::rolling::daily(&config.log_dir, "uwp_remover.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(UptimeTimer)
                .with_ansi(false) // 文件无 ANSI 转义
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Failed to create logs directory {}: {}",
                config.log_dir.display(),
                e
            );
            (None, None)
        }
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }

    guard
}
