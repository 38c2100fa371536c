use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PolicyError, PolicyResult};

// ---------------------------------------------------------------------------
// PolicyEngine trait: the external interpreter boundary
// ---------------------------------------------------------------------------

/// An interpreter for sidecar policy documents.
///
/// Treated as a pure function: policy source plus input document in,
/// decision document out. Implementations are called from helper threads
/// and must be `Send + Sync`.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, source: &str, input: &Value) -> PolicyResult<Value>;
}

impl<F> PolicyEngine for F
where
    F: Fn(&str, &Value) -> PolicyResult<Value> + Send + Sync,
{
    fn evaluate(&self, source: &str, input: &Value) -> PolicyResult<Value> {
        self(source, input)
    }
}

// ---------------------------------------------------------------------------
// CommandEngine: OPA-compatible evaluator run as a child process
// ---------------------------------------------------------------------------

/// The `[engine]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_command")]
    pub command: String,

    /// Rego query whose value is the decision document.
    #[serde(default = "default_query")]
    pub query: String,
}

fn default_command() -> String {
    "opa".to_string()
}

fn default_query() -> String {
    "data.policy".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            query: default_query(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> PolicyResult<()> {
        if self.command.trim().is_empty() {
            return Err(PolicyError::ValidationError(
                "engine command must not be empty".into(),
            ));
        }
        if self.query.trim().is_empty() {
            return Err(PolicyError::ValidationError(
                "engine query must not be empty".into(),
            ));
        }
        Ok(())
    }
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs `<command> eval --format json --stdin-input -d <policy.rego> <query>`
/// once per evaluation.
///
/// With a deadline set, a child still running when it passes is killed
/// and reaped, and the evaluation fails.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: EngineConfig,
    deadline: Option<Duration>,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn wait(&self, child: &mut Child) -> PolicyResult<ExitStatus> {
        let failed = |e: std::io::Error| PolicyError::EngineFailed(e.to_string());
        let Some(limit) = self.deadline else {
            return child.wait().map_err(failed);
        };

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(failed)? {
                return Ok(status);
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                if let Err(e) = child.kill() {
                    warn!(pid = child.id(), error = %e, "failed to kill policy engine");
                }
                child.wait().map_err(failed)?;
                return Err(PolicyError::EngineFailed(format!(
                    "{} killed after {} ms",
                    self.config.command,
                    limit.as_millis()
                )));
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(limit - elapsed));
        }
    }
}

// Each pipe gets its own thread so a full pipe cannot hold the child
// past the deadline check.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut out) {
                debug!(error = %e, "policy engine pipe read failed");
            }
        }
        out
    })
}

impl PolicyEngine for CommandEngine {
    fn evaluate(&self, source: &str, input: &Value) -> PolicyResult<Value> {
        let scratch_err = |e: std::io::Error| PolicyError::EngineFailed(format!("scratch file: {}", e));
        let mut policy_file = tempfile::Builder::new()
            .prefix("veil-policy-")
            .suffix(".rego")
            .tempfile()
            .map_err(scratch_err)?;
        policy_file
            .write_all(source.as_bytes())
            .and_then(|_| policy_file.flush())
            .map_err(scratch_err)?;

        let input_bytes = serde_json::to_vec(input)?;

        let mut child = Command::new(&self.config.command)
            .args(["eval", "--format", "json", "--stdin-input", "-d"])
            .arg(policy_file.path())
            .arg(&self.config.query)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PolicyError::EngineLaunch {
                command: self.config.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let feeder = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // An engine that exits without reading its input reports
                // through its exit status.
                if let Err(e) = stdin.write_all(&input_bytes) {
                    debug!(error = %e, "policy engine closed stdin early");
                }
            }
        });
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());
        let status = self.wait(&mut child)?;
        let _ = feeder.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(PolicyError::EngineFailed(format!(
                "{} exited with {}: {}",
                self.config.command,
                status,
                stderr.trim()
            )));
        }

        extract_result(&stdout)
    }
}

/// Pull `result[0].expressions[0].value` out of `opa eval --format json`
/// output.
pub fn extract_result(stdout: &[u8]) -> PolicyResult<Value> {
    let doc: Value = serde_json::from_slice(stdout)
        .map_err(|e| PolicyError::MalformedDecision(format!("engine output: {}", e)))?;
    doc.pointer("/result/0/expressions/0/value")
        .cloned()
        .ok_or_else(|| PolicyError::MalformedDecision("engine returned no result".into()))
}
