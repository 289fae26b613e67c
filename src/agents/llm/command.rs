//! Model CLI driven through a child process

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandTable, ModelCli, ModelInvocation};
use crate::agents::error::{LlmError, LlmResult};

/// Runs the mapped CLI once per invocation
pub struct CommandModelCli {
    table: CommandTable,
    timeout: Duration,
}

impl CommandModelCli {
    pub fn new(table: CommandTable, timeout: Duration) -> Self {
        Self { table, timeout }
    }
}

#[async_trait]
impl ModelCli for CommandModelCli {
    async fn invoke(&self, invocation: ModelInvocation) -> LlmResult<String> {
        let command = self.table.resolve(&invocation.model)?;
        debug!(
            agent = %invocation.agent,
            program = %command.program,
            cwd = %invocation.working_directory.display(),
            "Invoking model CLI"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&invocation.working_directory)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Spawn {
                command: command.program.clone(),
                reason: e.to_string(),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| LlmError::Spawn {
            command: command.program.clone(),
            reason: "stdin was not captured".to_string(),
        })?;
        let prompt = invocation.prompt;
        let feed = async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(stdin);
            Ok(())
        };

        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(agent = %invocation.agent, "Model CLI timed out after {:?}", self.timeout);
                return Err(LlmError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            return Err(LlmError::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
