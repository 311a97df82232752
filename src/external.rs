//! 外部コマンドの呼び出し
//!
//! コンパイラやダウンロードツールは成功か失敗かの二択として扱う。

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Command;

use crate::error::PipelineError;

/// 終了したコマンドの出力
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// ログファイル用に標準出力と標準エラーをまとめる
    pub fn combined(&self) -> String {
        let mut log = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&self.stderr);
        }
        log
    }
}

/// コマンドを実行し、終了を待つ
///
/// 起動できない場合と非0で終了した場合はどちらも `ToolFailed`。
pub fn run_tool<I, S>(program: &str, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    log::debug!("実行: {} {:?}", program, args);

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| PipelineError::ToolFailed {
            program: program.to_string(),
            status: format!("could not start: {}", e),
        })
        .with_context(|| format!("Failed to run {}", program))?;

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !output.status.success() {
        for line in result.stderr.lines().take(20) {
            log::error!("[{}] {}", program, line);
        }
        return Err(PipelineError::ToolFailed {
            program: program.to_string(),
            status: output.status.to_string(),
        }
        .into());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_run_tool_captures_output() {
        let output = run_tool("sh", ["-c", "echo hello; echo oops >&2"]).unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.combined(), "hello\noops\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_tool_failure() {
        let err = run_tool("sh", ["-c", "exit 3"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ToolFailed { program, .. }) if program == "sh"
        ));
    }

    #[test]
    fn test_missing_program_is_tool_failure() {
        let err = run_tool("garbage-classifier-no-such-tool", ["--version"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ToolFailed { .. })
        ));
    }
}
