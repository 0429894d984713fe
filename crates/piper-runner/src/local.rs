use crate::config::EnvMap;
use crate::result::JobResult;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

pub const SHELL: &str = "/bin/bash";

/// Working directory and environment frozen into a local job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalParams {
    pub workdir: Option<PathBuf>,
    /// Replaces the inherited environment when set.
    pub env: Option<EnvMap>,
}

/// Runs `command` through bash and captures its output. Never fails.
pub fn run_local(command: &str, params: &LocalParams) -> JobResult {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    if let Some(dir) = &params.workdir {
        cmd.current_dir(dir);
    }
    if let Some(env) = &params.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    debug!(command, "running local job");

    let output = match cmd.output() {
        Ok(output) => output,
        Err(e) => {
            return JobResult::failed(format!(
                "ERROR during call: {}\nMessage: {}",
                command, e
            ))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        return JobResult::new(stdout.trim(), stderr.trim());
    }
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    JobResult::new(
        stdout.into_owned(),
        format!(
            "ERROR from call: {}\nExit code: {}\nMessage: {}",
            command, code, stderr
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_returns_trimmed_stdout_and_no_error() {
        let result = run_local("echo '  hello  '", &LocalParams::default());
        assert_eq!(result, JobResult::new("hello", ""));
    }

    #[test]
    fn nonzero_exit_keeps_stdout_and_reports_code() {
        let result = run_local(
            "echo partial; echo broken >&2; exit 3",
            &LocalParams::default(),
        );
        assert_eq!(result.stdout, "partial\n");
        assert!(result.stderr.starts_with("ERROR from call: echo partial"));
        assert!(result.stderr.contains("Exit code: 3"), "{}", result.stderr);
        assert!(result.stderr.contains("Message: broken"), "{}", result.stderr);
    }

    #[test]
    fn workdir_and_env_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = EnvMap::new();
        env.insert("PIPER_SAMPLE".to_string(), "s1".to_string());
        let params = LocalParams {
            workdir: Some(dir.path().to_path_buf()),
            env: Some(env),
        };
        let result = run_local("echo \"$PIPER_SAMPLE\" && pwd", &params);
        let canonical = dir.path().canonicalize().expect("canonical");
        assert_eq!(
            result.stdout,
            format!("s1\n{}", canonical.display()),
            "stderr: {}",
            result.stderr
        );
    }

    #[test]
    fn spawn_failure_is_reported_as_text() {
        let params = LocalParams {
            workdir: Some(PathBuf::from("/definitely/not/here")),
            env: None,
        };
        let result = run_local("true", &params);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.starts_with("ERROR during call: true"));
    }
}
