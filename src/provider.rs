//! Execution providers: the seam where a task description becomes a result.
//!
//! `CommandProvider` runs a headless agent CLI (`claude -p ... --output-format
//! json` by default) and parses its JSON response. Tests and embedders plug
//! in their own `ExecutionProvider`.

use crate::agent::AgentId;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::orchestration::turns::{TurnData, UsageReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// A unit of work handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    pub agent: AgentId,
    /// Outputs of completed dependencies, already truncated.
    #[serde(default)]
    pub context: String,
    /// Free-form options passed through from the caller.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ProviderRequest {
    pub fn new(prompt: &str, agent: AgentId) -> Self {
        Self {
            prompt: prompt.to_string(),
            agent,
            context: String::new(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: String) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Full prompt text including the agent role and dependency context.
    pub fn compose(&self) -> String {
        let mut prompt = format!("You are acting as the {} agent.\n\n", self.agent);
        if !self.context.is_empty() {
            prompt.push_str("Context from completed tasks:\n");
            prompt.push_str(&self.context);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&self.prompt);
        prompt
    }
}

/// What a provider reports back for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub output: String,
    pub tokens_used: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub success: bool,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn success(output: &str, tokens_used: u64) -> Self {
        Self {
            output: output.to_string(),
            tokens_used,
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            success: false,
            error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

impl UsageReport for ProviderResponse {
    fn turn_data(&self) -> TurnData {
        TurnData {
            tokens: self.tokens_used,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.cost_usd,
        }
    }
}

/// Executes task prompts on behalf of agents.
///
/// Implementations must not block indefinitely; the coordinator treats an
/// `Err` as a failed task.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    fn name(&self) -> &str {
        "provider"
    }
}

/// Internal struct for deserializing the CLI's JSON response.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Headless CLI provider.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    /// Path to the agent binary.
    binary: PathBuf,
    /// Extra arguments placed before `-p`.
    args: Vec<String>,
    timeout: Duration,
    cwd: Option<PathBuf>,
}

impl CommandProvider {
    /// Build a provider from config, locating the binary with `which`.
    ///
    /// The configured command may carry extra arguments
    /// (`"claude --model sonnet"`).
    ///
    /// # Errors
    /// Returns `Error::ProviderBinaryNotFound` if the binary is not on PATH.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let mut parts = config.effective_command().split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("provider command is empty".to_string()))?;
        let binary =
            which::which(program).map_err(|_| Error::ProviderBinaryNotFound(program.to_string()))?;
        debug!(binary = %binary.display(), "Provider binary located");
        Ok(Self {
            binary,
            args: parts.map(str::to_string).collect(),
            timeout: config.timeout(),
            cwd: None,
        })
    }

    /// Provider for a specific binary, skipping PATH lookup.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            timeout: ProviderConfig::default().timeout(),
            cwd: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse the CLI's JSON output.
    pub fn parse_json_response(json_str: &str, prompt_chars: usize) -> Result<ProviderResponse> {
        let raw: RawResponse = serde_json::from_str(json_str)?;

        let failed = raw.is_error || raw.subtype.as_deref() == Some("error") || raw.error.is_some();
        let output = raw.result.clone().unwrap_or_default();

        let (input_tokens, output_tokens) = match &raw.usage {
            Some(u) => (
                Some(u.input_tokens + u.cache_creation_input_tokens + u.cache_read_input_tokens),
                Some(u.output_tokens),
            ),
            None => (None, None),
        };
        let tokens_used = match (input_tokens, output_tokens) {
            (Some(i), Some(o)) => i + o,
            _ => estimate_tokens(prompt_chars + output.len()),
        };

        Ok(ProviderResponse {
            output: if failed { String::new() } else { output },
            tokens_used,
            input_tokens,
            output_tokens,
            success: !failed,
            cost_usd: raw.total_cost_usd,
            error: if failed {
                Some(raw.error.or(raw.result).unwrap_or_else(|| "provider reported an error".to_string()))
            } else {
                None
            },
        })
    }
}

#[async_trait]
impl ExecutionProvider for CommandProvider {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        let prompt = request.compose();
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("json")
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        debug!(agent = %request.agent, binary = %self.binary.display(), "Invoking provider");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(response) = Self::parse_json_response(stdout.trim(), prompt.len()) {
            return Ok(response);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "provider exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            warn!(agent = %request.agent, "{}", message);
            return Ok(ProviderResponse::failure(&message));
        }

        // Plain-text output from a CLI that ignored --output-format
        let text = stdout.trim().to_string();
        let tokens = estimate_tokens(prompt.len() + text.len());
        Ok(ProviderResponse::success(&text, tokens))
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Rough token count for text of the given length (four characters per token).
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}
