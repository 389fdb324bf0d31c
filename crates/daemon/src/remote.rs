// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Remote command execution seam used by the scanner and detector

use async_trait::async_trait;

use tunnel_dash_common::{Result, SshClient};

/// Runs one shell command on the remote host and returns its stdout
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, command: &str) -> Result<String>;
}

#[async_trait]
impl RemoteShell for SshClient {
    async fn run(&self, command: &str) -> Result<String> {
        SshClient::run(self, command).await
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;
    use tunnel_dash_common::Error;

    /// Canned responses keyed by command prefix; unknown commands fail
    #[derive(Default)]
    pub struct FakeShell {
        responses: Vec<(String, std::result::Result<String, String>)>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeShell {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(mut self, prefix: &str, output: &str) -> Self {
            self.responses.push((prefix.to_string(), Ok(output.to_string())));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn fail(mut self, prefix: &str, reason: &str) -> Self {
            self.responses.push((prefix.to_string(), Err(reason.to_string())));
            self
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn run(&self, command: &str) -> Result<String> {
            self.calls.lock().unwrap().push(command.to_string());

            let found = self
                .responses
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, response)| response.clone())
                .unwrap_or_else(|| Err("no canned response".to_string()));

            found.map_err(|reason| Error::RemoteCommand {
                command: command.to_string(),
                reason,
            })
        }
    }
}
