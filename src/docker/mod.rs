#[cfg(test)]
pub mod fake;
pub mod logs;

pub use logs::LogStream;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};

/// Container runtime operations the orchestrator and backup coordinator
/// depend on. Implemented by [`DockerRuntime`]; tests swap in a fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Bring the instance's service up from the manifest.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop the instance's service, keeping the container.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Stop and remove the container. An absent container is success.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Run the one-shot provisioning command against the instance's volume.
    /// Returns the combined output.
    async fn init(&self, id: &str) -> Result<String>;

    /// Follow the container log from the recent tail onwards.
    async fn stream_logs(&self, id: &str) -> Result<LogStream>;

    /// Run an authenticated CLI command inside the running container and
    /// return its raw stdout, which callers parse as JSON.
    async fn exec_json(&self, id: &str, args: &[&str], token: &str) -> Result<String>;

    /// Runtime-reported container state, `not_created` when absent.
    async fn container_state(&self, id: &str) -> Result<String>;

    /// Whether the runtime daemon is reachable.
    async fn health_check(&self) -> bool;
}

#[derive(Debug)]
pub struct DockerOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl DockerOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Best diagnostic text for a failed command.
    fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        "exited with non-zero status".to_string()
    }

    fn is_missing_container(&self) -> bool {
        self.stderr.contains("No such container")
    }
}

/// `docker` / `docker compose` driven through subprocesses.
pub struct DockerRuntime {
    binary: String,
    manifest_path: PathBuf,
    container_prefix: String,
    instance_cli: String,
    init_args: Vec<String>,
    log_tail: u32,
    timeout: Duration,
}

impl DockerRuntime {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            manifest_path: config.manifest_path(),
            container_prefix: config.container_prefix.clone(),
            instance_cli: config.instance_cli.clone(),
            init_args: config.init_args.clone(),
            log_tail: config.log_tail,
            timeout: Duration::from_secs(config.runtime_timeout_secs),
        }
    }

    fn container_name(&self, id: &str) -> String {
        format!("{}{}", self.container_prefix, id)
    }

    /// Run a command to completion under the configured timeout. The child is
    /// killed if the timeout fires.
    async fn exec(&self, args: &[String]) -> Result<DockerOutput> {
        let action = describe(&self.binary, args);
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("running {}", action);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(FleetError::external(
                    action,
                    format!("failed to spawn {}: {}", self.binary, e),
                ))
            }
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", action, self.timeout);
                return Err(FleetError::external(
                    action,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        Ok(DockerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }

    /// `exec` that turns a non-zero exit into `ExternalTool`.
    async fn exec_checked(&self, args: &[String]) -> Result<DockerOutput> {
        let out = self.exec(args).await?;
        if !out.success {
            return Err(FleetError::external(
                describe(&self.binary, args),
                out.diagnostic(),
            ));
        }
        Ok(out)
    }

    async fn require_manifest(&self) -> Result<()> {
        match tokio::fs::try_exists(&self.manifest_path).await {
            Ok(true) => Ok(()),
            _ => Err(FleetError::ManifestAbsent(
                self.manifest_path.display().to_string(),
            )),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, id: &str) -> Result<()> {
        self.require_manifest().await?;
        self.exec_checked(&compose_args(&self.manifest_path, &["up", "-d", id]))
            .await?;
        tracing::info!("started instance {}", id);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.require_manifest().await?;
        self.exec_checked(&compose_args(&self.manifest_path, &["stop", id]))
            .await?;
        tracing::info!("stopped instance {}", id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let name = self.container_name(id);
        for verb in ["stop", "rm"] {
            let args = vec![verb.to_string(), name.clone()];
            let out = self.exec(&args).await?;
            if !out.success && !out.is_missing_container() {
                return Err(FleetError::external(
                    describe(&self.binary, &args),
                    out.diagnostic(),
                ));
            }
        }
        Ok(())
    }

    async fn init(&self, id: &str) -> Result<String> {
        self.require_manifest().await?;
        let args = init_args(&self.manifest_path, id, &self.instance_cli, &self.init_args);
        let out = self.exec_checked(&args).await?;
        Ok(out.combined())
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let name = self.container_name(id);
        let args = logs_args(&name, self.log_tail);
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        LogStream::spawn(cmd, &name)
            .map_err(|e| FleetError::external(describe(&self.binary, &args), e.to_string()))
    }

    async fn exec_json(&self, id: &str, args: &[&str], token: &str) -> Result<String> {
        let name = self.container_name(id);
        let full = exec_args(&name, &self.instance_cli, args, token);
        let out = self.exec(&full).await?;
        if !out.success {
            // The token is part of argv; keep it out of the error.
            let action = format!("{} exec {} {} {}", self.binary, name, self.instance_cli, args.join(" "));
            return Err(FleetError::external(action, out.diagnostic()));
        }
        Ok(out.stdout)
    }

    async fn container_state(&self, id: &str) -> Result<String> {
        let out = self
            .exec_checked(&ps_args(&self.container_name(id)))
            .await?;
        Ok(parse_state(&out.stdout))
    }

    async fn health_check(&self) -> bool {
        let args = vec![
            "info".to_string(),
            "--format".to_string(),
            "{{.ServerVersion}}".to_string(),
        ];
        match self.exec(&args).await {
            Ok(out) => out.success,
            Err(e) => {
                tracing::debug!("runtime health check failed: {}", e);
                false
            }
        }
    }
}

fn describe(binary: &str, args: &[String]) -> String {
    format!("{} {}", binary, args.join(" "))
}

fn compose_args(manifest: &Path, rest: &[&str]) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-f".to_string(),
        manifest.display().to_string(),
    ];
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

fn init_args(manifest: &Path, id: &str, cli: &str, cli_args: &[String]) -> Vec<String> {
    let mut args = compose_args(manifest, &["run", "--rm", "--no-deps", "-T", id, cli]);
    args.extend(cli_args.iter().cloned());
    args
}

fn logs_args(container: &str, tail: u32) -> Vec<String> {
    vec![
        "logs".to_string(),
        "-f".to_string(),
        "--tail".to_string(),
        tail.to_string(),
        container.to_string(),
    ]
}

fn exec_args(container: &str, cli: &str, cli_args: &[&str], token: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string(), container.to_string(), cli.to_string()];
    args.extend(cli_args.iter().map(|s| s.to_string()));
    args.push("--token".to_string());
    args.push(token.to_string());
    args
}

fn ps_args(container: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "-a".to_string(),
        "--filter".to_string(),
        format!("name=^{}$", container),
        "--format".to_string(),
        "{{.State}}".to_string(),
    ]
}

fn parse_state(stdout: &str) -> String {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("not_created")
        .to_string()
}
