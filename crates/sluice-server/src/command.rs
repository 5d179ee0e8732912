//! Stage behavior delegated to external programs.
//!
//! The envelope goes to the program's stdin; a zero exit status is success
//! and stdout carries the JSON result (an empty stdout means "nothing to
//! report"). The child is killed if the worker gives up on it.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::config::StageEnv;
use sluice_core::envelope::{actions, Envelope};
use sluice_core::error::{ConfigError, ProcessError};
use sluice_core::worker::{
    Analysis, Analyzer, ExtractRequest, IngestReport, IngestRequest, Ingestor, RetrieveRequest,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried into an error.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone)]
pub struct StageCommand {
    program: String,
    args: Vec<String>,
    env: StageEnv,
}

impl StageCommand {
    pub fn new(argv: &[String], env: StageEnv) -> Result<Self, ConfigError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ConfigError::Invalid("stage command must not be empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env,
        })
    }

    /// Run the program once with `input` on stdin and return its stdout.
    pub async fn run(&self, input: &[u8]) -> Result<Vec<u8>, ProcessError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Handler(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await.map_err(|e| {
                ProcessError::Handler(format!("failed to write to {}: {e}", self.program))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ProcessError::Handler(format!("failed to wait for {}: {e}", self.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ProcessError::Handler(format!(
                "{} exited with {}: {excerpt}",
                self.program, output.status
            )));
        }
        debug!(
            program = %self.program,
            stdout_bytes = output.stdout.len(),
            "stage command finished"
        );
        Ok(output.stdout)
    }

    async fn call<T, R>(&self, action: &str, payload: &T) -> Result<R, ProcessError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Default,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProcessError::Handler(format!("cannot encode {action} payload: {e}")))?;
        let stdout = self.run(&Envelope::new(action, payload).to_bytes()).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(R::default());
        }
        serde_json::from_slice(&stdout).map_err(|e| {
            ProcessError::Handler(format!("{} printed an unreadable result: {e}", self.program))
        })
    }
}

/// Ingestion by an external scraper program that prints an [`IngestReport`].
pub struct CommandIngestor {
    command: StageCommand,
}

impl CommandIngestor {
    pub fn new(command: StageCommand) -> Self {
        Self { command }
    }
}

impl Ingestor for CommandIngestor {
    async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, ProcessError> {
        self.command.call(actions::INGEST, request).await
    }
}

/// Analysis by an external program that prints an [`Analysis`].
pub struct CommandAnalyzer {
    command: StageCommand,
}

impl CommandAnalyzer {
    pub fn new(command: StageCommand) -> Self {
        Self { command }
    }
}

impl Analyzer for CommandAnalyzer {
    async fn extract(&self, request: &ExtractRequest) -> Result<Analysis, ProcessError> {
        self.command.call(actions::EVENT_EXTRACTOR, request).await
    }

    async fn retrieve(&self, request: &RetrieveRequest) -> Result<Analysis, ProcessError> {
        self.command.call(actions::EVENT_RETRIEVER, request).await
    }
}
