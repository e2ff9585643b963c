use anyhow::{Context, Result, ensure};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::time::Duration;
use tokio::{process::Command, time::timeout};
use trait_variant::make;

/// Runs host utilities on behalf of the adapter, probe and network configurator
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner {
    /// Run `program` with `args` and return its trimmed stdout
    async fn run(&self, program: &str, args: Vec<String>) -> Result<String>;
}

/// Runs commands as child processes, killing them when they exceed the timeout
#[derive(Clone, Debug)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: Vec<String>) -> Result<String> {
        debug!("run {program} {}", redact_args(&args).join(" "));

        let output = timeout(
            self.timeout,
            Command::new(program).args(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?}", self.timeout))
        .context(format!("failed to run {program}"))?
        .context(format!("failed to spawn {program}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        ensure!(
            output.status.success(),
            "{program} failed with {}: {}",
            output.status,
            if stderr.is_empty() { &stdout } else { &stderr }
        );

        Ok(stdout)
    }
}

/// Helper to build an owned argument list from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

/// Mask the value following a `password` argument for logging
fn redact_args(args: &[String]) -> Vec<&str> {
    let mut redact_next = false;
    args.iter()
        .map(|arg| {
            if std::mem::take(&mut redact_next) {
                "***"
            } else {
                redact_next = arg == "password";
                arg.as_str()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_argument() {
        let args = args(["device", "wifi", "connect", "Net1", "password", "secret"]);
        assert_eq!(
            redact_args(&args),
            vec!["device", "wifi", "connect", "Net1", "password", "***"]
        );
    }

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let out = runner
            .run("echo", args(["hello"]))
            .await
            .expect("echo should succeed");
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let err = runner.run("false", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }

    #[tokio::test]
    async fn reports_missing_program() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let err = runner
            .run("definitely-not-an-installed-tool", vec![])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[tokio::test]
    async fn kills_commands_exceeding_timeout() {
        let runner = SystemCommandRunner::new(Duration::from_millis(100));
        let err = runner.run("sleep", args(["5"])).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }
}
