//! External command invocation shared by the stage adapters.
//!
//! The download client, the database insert client and the inference model
//! are all driven through configured shell command templates with
//! `{placeholder}` expansion. Command failures are classified from exit
//! status and stderr so the checkpoint records whether a retry is worth
//! attempting.

use std::process::ExitStatus;

use tokio::process::Command;

use super::{ErrorClass, TaskOutcome};

/// Expand `{name}` placeholders in a command template.
pub fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Run a rendered command through the shell and classify the result.
pub async fn invoke(command: &str) -> TaskOutcome {
    tracing::debug!("invoking: {}", command);

    let output = match Command::new("sh").arg("-c").arg(command).output().await {
        Ok(output) => output,
        Err(e) => {
            return TaskOutcome::failure(
                ErrorClass::Validation,
                format!("failed to spawn command: {}", e),
            )
        }
    };

    if output.status.success() {
        return TaskOutcome::Success;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let (class, message) = classify_failure(output.status, &stderr);
    TaskOutcome::failure(class, message)
}

/// Classify a non-zero exit by its stderr tail.
///
/// OOM and GPU allocation messages are resource exhaustion; malformed input
/// and missing files are validation errors that retry identically; anything
/// else (timeouts, rate limits, killed processes) is treated as transient.
pub fn classify_failure(status: ExitStatus, stderr: &str) -> (ErrorClass, String) {
    let lower = stderr.to_lowercase();

    let class = if lower.contains("out of memory")
        || lower.contains("cannot allocate")
        || lower.contains("cuda")
    {
        ErrorClass::Resource
    } else if lower.contains("invalid")
        || lower.contains("no such file")
        || lower.contains("usage:")
        || lower.contains("unrecognized")
    {
        ErrorClass::Validation
    } else {
        ErrorClass::Transient
    };

    let detail = stderr.lines().rev().find(|line| !line.trim().is_empty());
    let message = match detail {
        Some(line) => format!("command exited with {}: {}", status, line.trim()),
        None => format!("command exited with {}", status),
    };
    (class, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let rendered = render(
            "fetch --cell {cell} --year {year} -o {output}",
            &[
                ("cell", "465".to_string()),
                ("year", "2023".to_string()),
                ("output", "/tmp/cell_465.tif".to_string()),
            ],
        );
        assert_eq!(rendered, "fetch --cell 465 --year 2023 -o /tmp/cell_465.tif");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render("run {cell} {other}", &[("cell", "1".to_string())]);
        assert_eq!(rendered, "run 1 {other}");
    }

    #[tokio::test]
    async fn test_invoke_success() {
        assert!(invoke("exit 0").await.is_success());
    }

    #[tokio::test]
    async fn test_invoke_failure_is_classified() {
        let outcome = invoke("echo 'connection timed out' >&2; exit 1").await;
        match outcome {
            TaskOutcome::Failure { class, message } => {
                assert_eq!(class, ErrorClass::Transient);
                assert!(message.contains("connection timed out"));
            }
            TaskOutcome::Success => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_invoke_resource_exhaustion() {
        let outcome = invoke("echo 'CUDA error: out of memory' >&2; exit 1").await;
        match outcome {
            TaskOutcome::Failure { class, .. } => assert_eq!(class, ErrorClass::Resource),
            TaskOutcome::Success => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_invoke_validation_failure() {
        let outcome = invoke("echo 'invalid period: 20x3' >&2; exit 2").await;
        match outcome {
            TaskOutcome::Failure { class, .. } => assert_eq!(class, ErrorClass::Validation),
            TaskOutcome::Success => panic!("expected failure"),
        }
    }
}
