// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs shell scripts on a cluster node over ssh.

use std::path::PathBuf;
use std::process::Stdio;

use slog::{debug, info, Logger};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::Error;

/// A remote shell on a node, driven through the system `ssh` binary.
#[derive(Clone, Debug)]
pub struct NodeShell {
    user: String,
    host: Option<String>,
    port: u16,
    identity_file: Option<PathBuf>,
    log: Logger,
}

impl NodeShell {
    pub fn new(
        user: impl Into<String>,
        host: Option<String>,
        port: u16,
        identity_file: Option<PathBuf>,
        log: Logger,
    ) -> Self {
        Self { user: user.into(), host, port, identity_file, log }
    }

    fn ssh_args(&self, node: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        let host = self.host.as_deref().unwrap_or(node);
        args.push(format!("{}@{}", self.user, host));
        args.push("bash -s".to_string());
        args
    }

    /// Runs `commands` on `node` as one script fed to a remote shell. The
    /// script stops at the first failing command.
    pub async fn execute(
        &self,
        node: &str,
        commands: &[String],
    ) -> Result<(), Error> {
        let script = commands.join("\n") + "\n";
        info!(self.log, "running {} commands on node {}", commands.len(), node);
        debug!(self.log, "node script"; "script" => &script);

        let mut child = Command::new("ssh")
            .args(self.ssh_args(node))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                node: node.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn ssh_targets_node_unless_host_is_set() {
        let shell = NodeShell::new("root", None, 22, None, logger());
        assert_eq!(
            shell.ssh_args("pve2"),
            vec!["-o", "BatchMode=yes", "-p", "22", "root@pve2", "bash -s"]
        );

        let shell = NodeShell::new(
            "admin",
            Some("10.0.0.3".to_string()),
            2222,
            Some(PathBuf::from("/keys/id_ed25519")),
            logger(),
        );
        assert_eq!(
            shell.ssh_args("pve2"),
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-i",
                "/keys/id_ed25519",
                "admin@10.0.0.3",
                "bash -s"
            ]
        );
    }
}
