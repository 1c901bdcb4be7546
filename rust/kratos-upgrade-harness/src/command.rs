//! Shell-command backends
//!
//! Node lifecycle and the conformance suite are driven through operator
//! supplied shell templates, e.g. `docker stop {node}` or
//! `./relayer-tests.sh {chain_a} {chain_b} {path}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::cluster::{ChainClient, ClusterError, ClusterNode, ConformanceSuite};
use crate::types::{Identity, RelayPath};

/// Replace `{key}` placeholders in `template`
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Run `command` through `sh -c`, returning stdout on success
async fn run_shell(command: &str) -> Result<String, String> {
    debug!("$ {}", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to spawn `{}`: {}", command, e))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
        "`{}` exited with {}: {}",
        command,
        output.status,
        stderr.trim()
    ))
}

/// Shell templates for node lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommands {
    pub stop: String,
    pub start: String,
    /// Gets `{version}` in addition to `{node}`
    pub swap: String,
}

/// Cluster node controlled through shell commands
pub struct CommandNode {
    name: String,
    validator: Option<Identity>,
    commands: NodeCommands,
}

impl CommandNode {
    pub fn new(
        name: impl Into<String>,
        validator: Option<Identity>,
        commands: NodeCommands,
    ) -> Self {
        Self {
            name: name.into(),
            validator,
            commands,
        }
    }

    async fn exec(&self, template: &str, version: Option<&str>) -> Result<(), ClusterError> {
        let mut vars = vec![("node", self.name.as_str())];
        if let Some(version) = version {
            vars.push(("version", version));
        }

        run_shell(&render(template, &vars))
            .await
            .map(|_| ())
            .map_err(ClusterError::NodeOperation)
    }
}

#[async_trait]
impl ClusterNode for CommandNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn validator(&self) -> Option<&Identity> {
        self.validator.as_ref()
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        self.exec(&self.commands.stop, None).await
    }

    async fn start(&self) -> Result<(), ClusterError> {
        self.exec(&self.commands.start, None).await
    }

    async fn swap_binary(&self, version: &str) -> Result<(), ClusterError> {
        self.exec(&self.commands.swap, Some(version)).await
    }
}

/// Conformance suite run as an external command; exit status decides
pub struct CommandConformance {
    template: String,
}

impl CommandConformance {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl ConformanceSuite for CommandConformance {
    async fn run(
        &self,
        chain_a: &dyn ChainClient,
        chain_b: &dyn ChainClient,
        path: &RelayPath,
    ) -> Result<(), ClusterError> {
        let command = render(
            &self.template,
            &[
                ("chain_a", chain_a.chain_id()),
                ("chain_b", chain_b.chain_id()),
                ("path", path.name.as_str()),
                ("relayer", path.relayer.as_str()),
            ],
        );

        run_shell(&command)
            .await
            .map(|_| ())
            .map_err(ClusterError::Conformance)
    }
}
