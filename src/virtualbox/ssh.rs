use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::util::Sleeper;

const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=quiet",
    "-o", "BatchMode=yes",
    "-o", "PasswordAuthentication=no",
    "-o", "ConnectionAttempts=3",
    "-o", "ConnectTimeout=10",
    "-o", "IdentitiesOnly=yes",
];

const READY_ATTEMPTS: usize = 60;
const READY_INTERVAL: Duration = Duration::from_secs(3);

/// Where to reach the guest's sshd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    fn args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-i".to_string(),
            self.key_path.to_string_lossy().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
            command.to_string(),
        ]);
        args
    }
}

#[async_trait]
pub trait SshRunner: Send + Sync {
    /// Run `command` in the guest and return its stdout.
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String>;
}

/// Shells out to the system `ssh` client.
pub struct SystemSshRunner;

#[async_trait]
impl SshRunner for SystemSshRunner {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String> {
        debug!("About to run SSH command: {}", command);

        let output = Command::new("ssh")
            .args(target.args(command))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VBoxError::Ssh(format!("failed to spawn ssh: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("SSH cmd err, output: {:?}: {}", output.status, stdout);

        if !output.status.success() {
            return Err(VBoxError::Ssh(format!(
                "command {:?} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(stdout)
    }
}

/// Poll the guest with `exit 0` until sshd answers.
pub async fn wait_for_ssh(
    runner: &dyn SshRunner,
    sleeper: &dyn Sleeper,
    target: &SshTarget,
) -> Result<()> {
    debug!("Waiting for SSH to be available...");

    for _ in 0..READY_ATTEMPTS {
        match runner.run(target, "exit 0").await {
            Ok(_) => return Ok(()),
            Err(e) => debug!("Error getting ssh command 'exit 0' : {}", e),
        }
        sleeper.sleep(READY_INTERVAL).await;
    }

    Err(VBoxError::Ssh(format!(
        "too many retries waiting for SSH to be available on {}:{}",
        target.host, target.port
    )))
}
