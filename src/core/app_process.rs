/// Application launcher
///
/// Starts the application against one environment's database and stops
/// whatever listens on that environment's port.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::connection::Secret;
use crate::core::registry::Environment;
use crate::error::DbctlError;
use crate::utils::app_config::{AppSection, ToolPaths};
use crate::utils::{tail_lines, ERROR_TAIL_LINES};

/// Fully resolved command line for one environment
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub port: u16,
    pub workdir: Option<PathBuf>,
    pub app_env: Option<String>,
    database_url: Secret,
}

impl LaunchPlan {
    /// Environment handed to the child on top of the inherited one
    pub fn child_env(&self) -> BTreeMap<&'static str, String> {
        let mut env = BTreeMap::from([
            ("DATABASE_URL", self.database_url.expose().to_string()),
            ("PORT", self.port.to_string()),
        ]);
        if let Some(app_env) = &self.app_env {
            env.insert("APP_ENV", app_env.clone());
        }
        env
    }

    /// Command line for display
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct AppLauncher {
    settings: AppSection,
    lsof: String,
}

impl AppLauncher {
    pub fn new(settings: AppSection, tools: &ToolPaths) -> Self {
        Self {
            settings,
            lsof: tools.lsof.clone(),
        }
    }

    /// Port for `env`, from the override or the environment settings
    pub fn port_for(&self, env: &Environment, port: Option<u16>) -> Result<u16, DbctlError> {
        port.or(env.app_port).ok_or_else(|| {
            DbctlError::Config(format!(
                "environment '{}' has no port configured; pass --port",
                env.name
            ))
        })
    }

    pub fn plan(&self, env: &Environment, port: Option<u16>) -> Result<LaunchPlan, DbctlError> {
        let port = self.port_for(env, port)?;
        let (program, rest) = self
            .settings
            .command
            .split_first()
            .ok_or_else(|| DbctlError::Config("[app] command is empty".to_string()))?;

        let mut args = rest.to_vec();
        if let Some(flag) = &self.settings.port_flag {
            args.push(flag.clone());
            args.push(port.to_string());
        }

        Ok(LaunchPlan {
            program: program.clone(),
            args,
            port,
            workdir: self.settings.workdir.clone(),
            app_env: env.app_env.clone(),
            database_url: Secret::new(env.connection.to_url()),
        })
    }

    /// Run the application in the foreground until it exits. Ctrl-C stops
    /// the child and returns its exit status.
    pub async fn start(&self, plan: &LaunchPlan) -> Result<ExitStatus, DbctlError> {
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .envs(plan.child_env())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &plan.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| DbctlError::ToolFailed {
            program: plan.program.clone(),
            stderr: e.to_string(),
        })?;
        info!(command = %plan.display(), port = plan.port, pid = ?child.id(), "application started");

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping application");
                child.kill().await?;
                Ok(child.wait().await?)
            }
        }
    }

    /// Processes listening on `port`
    pub async fn listeners(&self, port: u16) -> Result<Vec<u32>, DbctlError> {
        let output = Command::new(&self.lsof)
            .args(["-t", "-i", &format!("tcp:{}", port), "-sTCP:LISTEN"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DbctlError::ToolFailed {
                program: self.lsof.clone(),
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits 1 when nothing matches
        if !output.status.success() && !stdout.trim().is_empty() {
            return Err(DbctlError::ToolFailed {
                program: self.lsof.clone(),
                stderr: tail_lines(&String::from_utf8_lossy(&output.stderr), ERROR_TAIL_LINES),
            });
        }

        Ok(parse_pids(&stdout))
    }

    /// Terminate every process listening on the environment's port
    pub async fn stop(&self, env: &Environment, port: Option<u16>) -> Result<Vec<u32>, DbctlError> {
        let port = self.port_for(env, port)?;
        let pids = self.listeners(port).await?;
        if pids.is_empty() {
            debug!(environment = %env.name, port, "nothing listening");
            return Ok(pids);
        }

        let mut stopped = Vec::new();
        for pid in pids {
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await?;
            if status.success() {
                info!(environment = %env.name, pid, "stopped process");
                stopped.push(pid);
            } else {
                warn!(environment = %env.name, pid, "could not stop process");
            }
        }
        Ok(stopped)
    }
}

fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
