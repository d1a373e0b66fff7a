//! Container sandbox for untrusted code. Every execution gets an ephemeral
//! container with no network, a read-only root, a small tmpfs, a non-root
//! user and hard CPU/memory caps. Code travels over stdin so nothing is
//! ever mounted. Overrunning the wall clock or the output cap kills the
//! container.

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;

use super::Language;

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_TIMEOUT: &str = "timeout";

pub const REASON_OUTPUT_LIMIT: &str = "output_limit";
pub const REASON_COMPILE_ERROR: &str = "compile_error";
pub const REASON_TIMEOUT: &str = "timeout";

/// Exit code the Java wrapper script uses to signal a javac failure, so
/// compiler diagnostics can be told apart from runtime errors.
const COMPILE_FAILED_EXIT: i32 = 113;

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: &'static str,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: i64,
    pub failure_reason: Option<String>,
}

impl ExecutionOutcome {
    fn failed(reason: &str, elapsed_ms: i64) -> Self {
        Self {
            status: STATUS_FAILED,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            elapsed_ms,
            failure_reason: Some(reason.to_string()),
        }
    }
}

pub struct SandboxRunner {
    config: Arc<AppConfig>,
    available: AtomicBool,
    unavailable_reason: StdMutex<Option<String>>,
}

impl SandboxRunner {
    pub fn new(config: Arc<AppConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            available: AtomicBool::new(false),
            unavailable_reason: StdMutex::new(Some("not probed yet".to_string())),
        })
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
            || self.config.exec_allow_insecure_fallback
    }

    /// Checks that the container engine answers and the language images are
    /// present. Called at startup; on failure execution endpoints report
    /// `sandbox_unavailable` rather than degrading silently.
    pub async fn probe(&self) -> Result<(), String> {
        let result = self.probe_inner().await;
        match &result {
            Ok(()) => {
                self.available.store(true, Ordering::SeqCst);
                *self.unavailable_reason.lock().expect("reason lock poisoned") = None;
                info!("sandbox engine available");
            }
            Err(reason) => {
                self.available.store(false, Ordering::SeqCst);
                *self.unavailable_reason.lock().expect("reason lock poisoned") =
                    Some(reason.clone());
                warn!(reason, "sandbox unavailable; execution endpoints will refuse requests");
                if self.config.exec_allow_insecure_fallback {
                    warn!("EXEC_ALLOW_INSECURE_FALLBACK is enabled; code will run on the host without isolation");
                }
            }
        }
        result
    }

    async fn probe_inner(&self) -> Result<(), String> {
        let version = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await;
        match version {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err("container engine binary not found".to_string());
            }
            Err(err) => return Err(format!("container engine check failed: {err}")),
            Ok(output) if !output.status.success() => {
                return Err(format!(
                    "container engine unreachable: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
            }
            Ok(_) => {}
        }

        for image in [
            &self.config.exec_image_python,
            &self.config.exec_image_javascript,
            &self.config.exec_image_java,
        ] {
            let inspect = Command::new("docker")
                .args(["image", "inspect", image])
                .output()
                .await
                .map_err(|err| format!("image inspection failed: {err}"))?;
            if !inspect.status.success() {
                return Err(format!("required image '{image}' is not present"));
            }
        }

        Ok(())
    }

    /// Runs one job to completion. Never panics and never returns an error:
    /// every failure mode is folded into the outcome.
    pub async fn run(
        &self,
        job_id: Uuid,
        language: Language,
        code: &str,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let container_name = format!("coderoom-exec-{}", job_id.simple());

        let mut command = if self.available.load(Ordering::SeqCst) {
            match self.container_command(&container_name, language, code) {
                Ok(command) => command,
                Err(reason) => return ExecutionOutcome::failed(&reason, 0),
            }
        } else if self.config.exec_allow_insecure_fallback {
            match host_fallback_command(language) {
                Some(command) => command,
                None => {
                    return ExecutionOutcome::failed(
                        "language not supported by the fallback runner",
                        0,
                    )
                }
            }
        } else {
            return ExecutionOutcome::failed("sandbox_unavailable", 0);
        };

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecutionOutcome::failed(&format!("failed to start runner: {err}"), 0)
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(code.as_bytes()).await {
                warn!(%job_id, error = %err, "failed to feed code to runner");
            }
            let _ = stdin.shutdown().await;
        }

        let cap = self.config.exec_output_max_bytes;
        let total = Arc::new(AtomicUsize::new(0));
        let overflow = Arc::new(Notify::new());
        let overflowed = Arc::new(AtomicBool::new(false));

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(read_capped(
                stdout,
                Arc::clone(&total),
                cap,
                Arc::clone(&overflow),
                Arc::clone(&overflowed),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(read_capped(
                stderr,
                Arc::clone(&total),
                cap,
                Arc::clone(&overflow),
                Arc::clone(&overflowed),
            ))
        });

        enum RunEnd {
            Exited(std::io::Result<std::process::ExitStatus>),
            Overflow,
            TimedOut,
        }

        let end = tokio::select! {
            status = child.wait() => RunEnd::Exited(status),
            _ = overflow.notified() => RunEnd::Overflow,
            _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
        };

        let elapsed_ms = started.elapsed().as_millis() as i64;

        let exit = match end {
            RunEnd::Exited(status) => status,
            RunEnd::TimedOut => {
                kill_container(&container_name).await;
                let _ = child.kill().await;
                let _ = child.wait().await;
                return ExecutionOutcome {
                    status: STATUS_TIMEOUT,
                    stdout: collect(stdout_task).await,
                    stderr: collect(stderr_task).await,
                    exit_code: None,
                    elapsed_ms,
                    failure_reason: Some(REASON_TIMEOUT.to_string()),
                };
            }
            RunEnd::Overflow => {
                // Output cap blown mid-run.
                kill_container(&container_name).await;
                let _ = child.kill().await;
                let _ = child.wait().await;
                return ExecutionOutcome {
                    status: STATUS_FAILED,
                    stdout: collect(stdout_task).await,
                    stderr: collect(stderr_task).await,
                    exit_code: None,
                    elapsed_ms,
                    failure_reason: Some(REASON_OUTPUT_LIMIT.to_string()),
                };
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        if overflowed.load(Ordering::SeqCst) {
            return ExecutionOutcome {
                status: STATUS_FAILED,
                stdout,
                stderr,
                exit_code: None,
                elapsed_ms,
                failure_reason: Some(REASON_OUTPUT_LIMIT.to_string()),
            };
        }

        match exit {
            Ok(status) => {
                let code = status.code();
                if status.success() {
                    ExecutionOutcome {
                        status: STATUS_COMPLETED,
                        stdout,
                        stderr,
                        exit_code: code,
                        elapsed_ms,
                        failure_reason: None,
                    }
                } else if code == Some(COMPILE_FAILED_EXIT) && language == Language::Java {
                    ExecutionOutcome {
                        status: STATUS_FAILED,
                        stdout,
                        stderr,
                        exit_code: code,
                        elapsed_ms,
                        failure_reason: Some(REASON_COMPILE_ERROR.to_string()),
                    }
                } else {
                    ExecutionOutcome {
                        status: STATUS_FAILED,
                        stdout,
                        stderr,
                        exit_code: code,
                        elapsed_ms,
                        failure_reason: Some(format!(
                            "exited with code {}",
                            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
                        )),
                    }
                }
            }
            Err(err) => ExecutionOutcome {
                status: STATUS_FAILED,
                stdout,
                stderr,
                exit_code: None,
                elapsed_ms,
                failure_reason: Some(format!("runner wait failed: {err}")),
            },
        }
    }

    fn container_command(
        &self,
        container_name: &str,
        language: Language,
        code: &str,
    ) -> Result<Command, String> {
        let mut command = Command::new("docker");
        command.args([
            "run",
            "--rm",
            "-i",
            "--name",
            container_name,
            "--network",
            "none",
            "--cpus",
            "1",
            "--memory",
            "256m",
            "--memory-swap",
            "256m",
            "--read-only",
            "--tmpfs",
            "/tmp:rw,size=10m,mode=1777",
            "--user",
            "65534:65534",
        ]);

        match language {
            Language::Python => {
                command.args([self.config.exec_image_python.as_str(), "python3", "-"]);
            }
            Language::Javascript => {
                command.args([self.config.exec_image_javascript.as_str(), "node", "-"]);
            }
            Language::Java => {
                let class = java_class_name(code)?;
                // The class name is interpolated into a shell line; the
                // validator above restricts it to [A-Za-z0-9_]+.
                let script = format!(
                    "cat > /tmp/{class}.java && cd /tmp && {{ javac {class}.java || exit {COMPILE_FAILED_EXIT}; }} && exec java -Xmx200m {class}"
                );
                command.args([
                    self.config.exec_image_java.as_str(),
                    "sh",
                    "-c",
                    &script,
                ]);
            }
        }

        Ok(command)
    }
}

/// Best-effort: `docker kill` by name covers the case where the `docker
/// run` client dies but the container keeps going.
async fn kill_container(name: &str) {
    let result = Command::new("docker").args(["kill", name]).output().await;
    if let Err(err) = result {
        warn!(container = name, error = %err, "failed to kill container");
    }
}

fn host_fallback_command(language: Language) -> Option<Command> {
    let mut command = match language {
        Language::Python => {
            let mut c = Command::new("python3");
            c.arg("-");
            c
        }
        Language::Javascript => {
            let mut c = Command::new("node");
            c.arg("-");
            c
        }
        // No safe single-invocation host path for compiled languages.
        Language::Java => return None,
    };
    command.env_clear();
    command.env("PATH", "/usr/local/bin:/usr/bin:/bin");
    Some(command)
}

/// Extracts the public (or first) class name from a Java submission and
/// restricts it to `[A-Za-z0-9_]+` so it is safe to interpolate.
pub fn java_class_name(code: &str) -> Result<String, String> {
    let mut candidate: Option<&str> = None;
    let mut tokens = code.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token == "class" {
            if let Some(next) = tokens.peek() {
                let name: &str = next
                    .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .next()
                    .unwrap_or("");
                if !name.is_empty() {
                    candidate = Some(name);
                    break;
                }
            }
        }
    }

    let name = candidate.ok_or_else(|| "no class declaration found".to_string())?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.is_empty()
    {
        return Err("invalid class name".to_string());
    }
    Ok(name.to_string())
}

async fn read_capped(
    mut reader: impl AsyncRead + Unpin,
    total: Arc<AtomicUsize>,
    cap: usize,
    overflow: Arc<Notify>,
    overflowed: Arc<AtomicBool>,
) -> Vec<u8> {
    let mut buffer = [0u8; 8192];
    let mut collected = Vec::new();
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let seen = total.fetch_add(n, Ordering::SeqCst) + n;
                if seen > cap {
                    overflowed.store(true, Ordering::SeqCst);
                    overflow.notify_one();
                    let room = cap.saturating_sub(seen - n);
                    collected.extend_from_slice(&buffer[..n.min(room)]);
                    break;
                }
                collected.extend_from_slice(&buffer[..n]);
            }
        }
    }
    collected
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(task) => match task.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}
