//! PowerShell 脚本拼装与输出解析

use crate::config::config::OutcomePolicy;
use crate::core::executor::{classify_failure, truncate_diagnostic, CommandOutput, CommandSpec};
use crate::result::{AttemptOutcome, FailureKind};
use std::time::Duration;

/// 包装后的脚本执行成功时输出的标记
pub const SUCCESS_MARKER: &str = "SUCCESS";

/// 转成单引号字符串字面量
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// 把命令包进 try/catch：抛出的异常变成输出文本，成功时追加标记
pub fn guarded(script: &str) -> String {
    format!(
        "try {{ {}; Write-Output '{}' }} catch {{ Write-Output $_.Exception.Message }}",
        script, SUCCESS_MARKER
    )
}

pub fn script(host: &str, script: &str, timeout: Duration) -> CommandSpec {
    CommandSpec::new(host, timeout).args([
        "-NoProfile",
        "-NonInteractive",
        "-ExecutionPolicy",
        "Bypass",
        "-Command",
        script,
    ])
}

pub fn guarded_script(host: &str, body: &str, timeout: Duration) -> CommandSpec {
    script(host, &guarded(body), timeout)
}

pub fn has_marker(output: &CommandOutput) -> bool {
    output
        .stdout
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case(SUCCESS_MARKER))
}

/// 非空、非标记的第一行输出，一般是异常信息或查询结果
pub fn first_value(output: &CommandOutput) -> Option<String> {
    output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.eq_ignore_ascii_case(SUCCESS_MARKER))
        .map(str::to_string)
}

/// 按策略解释一条受 try/catch 保护的命令的结果
pub fn interpret(output: &CommandOutput, policy: OutcomePolicy) -> AttemptOutcome {
    if output.cancelled || output.timed_out || output.spawn_error.is_some() {
        return output.outcome();
    }

    let marker = has_marker(output);
    let exit_ok = output.exit_ok();
    let succeeded = match policy {
        OutcomePolicy::RequireMarker => exit_ok && marker,
        OutcomePolicy::ExitCodeOrMarker => exit_ok || marker,
    };

    let text = output.combined_text();
    let residue: String = text
        .lines()
        .filter(|line| !line.trim().eq_ignore_ascii_case(SUCCESS_MARKER))
        .collect::<Vec<_>>()
        .join("\n");

    if succeeded {
        // 旧策略下即使有异常信息也算成功，但仍把信息带出去
        let diagnostic = if residue.trim().is_empty() {
            SUCCESS_MARKER.to_string()
        } else {
            truncate_diagnostic(&residue)
        };
        AttemptOutcome::success(diagnostic)
    } else {
        let kind = if residue.trim().is_empty() {
            FailureKind::Other
        } else {
            classify_failure(&residue)
        };
        let diagnostic = if residue.trim().is_empty() {
            format!("exit code {:?}, no success marker", output.exit_code)
        } else {
            truncate_diagnostic(&residue)
        };
        AttemptOutcome::failure(kind, diagnostic)
    }
}
