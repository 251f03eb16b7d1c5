use crate::core::cancel::CancelFlag;
use crate::result::{AttemptOutcome, FailureKind};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// 诊断信息的最大长度（字符）
const DIAGNOSTIC_LIMIT: usize = 500;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

static ACCESS_DENIED_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)access (is )?denied|unauthorizedaccess|0x80070005|拒绝访问").ok()
});

static NOT_FOUND_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)not found|cannot find|does not exist|0x80073cf1|找不到|不存在").ok()
});

fn matches(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// 根据命令输出粗略判断失败原因
pub fn classify_failure(text: &str) -> FailureKind {
    if matches(&ACCESS_DENIED_RE, text) {
        FailureKind::AccessDenied
    } else if matches(&NOT_FOUND_RE, text) {
        FailureKind::NotFound
    } else {
        FailureKind::Other
    }
}

/// 截断到指定字符数，保证不切断 UTF-8 字符
pub fn truncate_diagnostic(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(DIAGNOSTIC_LIMIT) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// 一条待执行的外部命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let text = path.to_string_lossy().into_owned();
        self.arg(text)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// 便于日志和测试匹配的单行形式
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// 外部命令的原始结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub spawn_error: Option<String>,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            timed_out: true,
            elapsed,
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn exit_ok(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    pub fn combined_text(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }

    /// 按退出码判断：0 为成功，其余一律失败
    pub fn outcome(&self) -> AttemptOutcome {
        if self.cancelled {
            return AttemptOutcome::cancelled();
        }
        if self.timed_out {
            return AttemptOutcome::failure(
                FailureKind::Timeout,
                format!("命令超时 ({} ms)，已强制结束", self.elapsed.as_millis()),
            );
        }
        if let Some(err) = &self.spawn_error {
            return AttemptOutcome::failure(FailureKind::Spawn, format!("无法启动命令: {}", err));
        }

        let text = self.combined_text();
        match self.exit_code {
            Some(0) => AttemptOutcome::success(truncate_diagnostic(&text)),
            code => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let diagnostic = if text.is_empty() {
                    format!("exit code {}", code)
                } else {
                    format!("exit code {}: {}", code, truncate_diagnostic(&text))
                };
                AttemptOutcome::failure(classify_failure(&text), diagnostic)
            }
        }
    }
}

/// 外部命令执行器
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    /// 运行命令直到退出或超时；任何失败都体现在返回值里，不会 panic 也不会返回 Err。
    async fn run(&self, spec: &CommandSpec, cancel: &CancelFlag) -> CommandOutput;
}

/// 基于 tokio::process 的真实执行器
#[derive(Debug, Default, Clone)]
pub struct SystemShell;

#[async_trait]
impl ShellExecutor for SystemShell {
    async fn run(&self, spec: &CommandSpec, cancel: &CancelFlag) -> CommandOutput {
        if cancel.is_cancelled() {
            debug!("已取消，跳过命令: {}", spec.display());
            return CommandOutput::cancelled();
        }

        debug!("执行命令: {} (timeout {:?})", spec.display(), spec.timeout);
        let start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("无法启动 {}: {}", spec.program, e);
                let mut output = CommandOutput::spawn_failed(e.to_string());
                output.elapsed = start.elapsed();
                return output;
            }
        };

        // 超时后 future 被丢弃，kill_on_drop 负责结束子进程
        match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    elapsed: start.elapsed(),
                    ..CommandOutput::default()
                };
                debug!(
                    "命令结束: {} -> {:?} ({} ms)",
                    spec.program,
                    result.exit_code,
                    result.elapsed.as_millis()
                );
                result
            }
            Ok(Err(e)) => {
                warn!("等待 {} 失败: {}", spec.program, e);
                let mut output = CommandOutput::spawn_failed(e.to_string());
                output.elapsed = start.elapsed();
                output
            }
            Err(_) => {
                warn!("命令超时，已强制结束: {}", spec.display());
                CommandOutput::timed_out(start.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classification() {
        assert_eq!(
            classify_failure("Remove-AppxPackage : Access is denied. (0x80070005)"),
            FailureKind::AccessDenied
        );
        assert_eq!(
            classify_failure("Package was not found. 0x80073CF1"),
            FailureKind::NotFound
        );
        assert_eq!(classify_failure("something odd"), FailureKind::Other);
    }

    #[test]
    fn nonzero_exit_fails_even_with_output() {
        let outcome = CommandOutput::exited(1, "SUCCESS", "").outcome();
        assert!(!outcome.succeeded);
        assert!(outcome.diagnostic.starts_with("exit code 1"));
    }

    #[test]
    fn long_diagnostics_are_truncated() {
        let text = "拒".repeat(DIAGNOSTIC_LIMIT + 20);
        let cut = truncate_diagnostic(&text);
        assert_eq!(cut.chars().count(), DIAGNOSTIC_LIMIT + 1);
    }

    #[test]
    fn spec_display() {
        let spec = CommandSpec::new("takeown.exe", Duration::from_secs(1))
            .args(["/f", r"C:\Apps\Demo"])
            .arg("/r");
        assert_eq!(spec.display(), r"takeown.exe /f C:\Apps\Demo /r");
    }

    #[tokio::test]
    async fn missing_program_becomes_failed_outcome() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-7f3a", Duration::from_secs(5));
        let output = SystemShell.run(&spec, &CancelFlag::new()).await;
        let outcome = output.outcome();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failure, Some(FailureKind::Spawn));
    }

    #[tokio::test]
    async fn cancelled_flag_prevents_spawn() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let spec = CommandSpec::new("definitely-not-a-real-binary-7f3a", Duration::from_secs(5));
        let output = SystemShell.run(&spec, &cancel).await;
        assert!(output.cancelled);
        assert!(output.spawn_error.is_none());
        assert!(output.outcome().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_is_killed_at_timeout() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(300)).arg("10");
        let start = Instant::now();
        let output = SystemShell.run(&spec, &CancelFlag::new()).await;
        let elapsed = start.elapsed();

        assert!(output.timed_out);
        assert!(!output.outcome().succeeded);
        assert_eq!(output.outcome().failure, Some(FailureKind::Timeout));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_codes_and_output_are_captured() {
        let ok = SystemShell
            .run(
                &CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo hello"]),
                &CancelFlag::new(),
            )
            .await;
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.outcome(), AttemptOutcome::success("hello"));

        let bad = SystemShell
            .run(
                &CommandSpec::new("sh", Duration::from_secs(5))
                    .args(["-c", "echo 'Access is denied' 1>&2; exit 3"]),
                &CancelFlag::new(),
            )
            .await;
        assert_eq!(bad.exit_code, Some(3));
        let outcome = bad.outcome();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failure, Some(FailureKind::AccessDenied));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let output = SystemShell
            .run(
                &CommandSpec::new("pwd", Duration::from_secs(5)).current_dir(dir.path()),
                &CancelFlag::new(),
            )
            .await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            Path::new(output.stdout.trim()).canonicalize().unwrap(),
            expected
        );
    }
}
