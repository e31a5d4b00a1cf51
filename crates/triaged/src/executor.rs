//! Shell command execution with a hard timeout and bounded output
//! capture.
//!
//! Every action and rollback command runs through `run_command`. On
//! timeout the child process group is killed; the step is failed, never
//! left dangling. Captured output is stdout and stderr interleaved by
//! stream, truncated from the front so the most recent bytes survive.

use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use triage_common::TriageError;

/// Outcome of one command run.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration_ms: u64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a shell command, killing it at `timeout_secs` and capping the
/// captured output at `max_output_bytes` (front-truncated).
pub async fn run_command(
    command: &str,
    timeout_secs: u64,
    max_output_bytes: usize,
) -> Result<ExecOutcome, TriageError> {
    debug!("Executing: {}", command);
    let started = std::time::Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(result) => result.map_err(|e| TriageError::ExecutionFailure(e.to_string()))?,
        Err(_) => {
            // kill_on_drop reaps the child when the future is dropped.
            warn!("Command timed out after {}s: {}", timeout_secs, command);
            return Err(TriageError::ExecutionTimeout(timeout_secs));
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    let combined = truncate_front(combined, max_output_bytes);

    Ok(ExecOutcome {
        exit_code: output.status.code(),
        output: combined,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Keep the last `max_bytes` of `s`, on a char boundary.
fn truncate_front(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]\n{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let outcome = run_command("echo hello", 5, 4096).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let outcome = run_command("exit 3", 5, 4096).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let outcome = run_command("echo oops >&2; exit 1", 5, 4096).await.unwrap();
        assert!(outcome.output.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_and_errors() {
        let err = run_command("sleep 30", 1, 4096).await.unwrap_err();
        assert!(matches!(err, TriageError::ExecutionTimeout(1)));
    }

    #[tokio::test]
    async fn output_is_front_truncated() {
        let outcome = run_command("yes x | head -c 10000", 5, 100).await.unwrap();
        assert!(outcome.output.len() <= 100 + "[truncated]\n".len());
        assert!(outcome.output.starts_with("[truncated]"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "aé".repeat(100);
        let t = truncate_front(s, 5);
        assert!(t.ends_with('é') || t.ends_with('a'));
    }
}
