//! Python runtime manager for the model worker.
//!
//! Spawns one long-lived interpreter running the worker script and exchanges JSON lines
//! with it over stdin/stdout. Worker stderr is forwarded to `tracing`.

use crate::config::PythonConfig;
use crate::error::TuneError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Managed Python subprocess launcher.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    /// Create a runtime that uses `python3` from `PATH`.
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config.python_path.clone(),
            venv_path: config.venv_path.clone(),
            workspace,
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Get the effective Python command (accounting for venv).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Start `script` as a persistent worker.
    pub async fn spawn_worker(&self, script: &Path) -> Result<WorkerSession, TuneError> {
        let script = if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.workspace.join(script)
        };
        if !script.exists() {
            return Err(TuneError::Python(format!(
                "worker script {} does not exist",
                script.display()
            )));
        }

        debug!(python = %self.python_cmd().display(), script = %script.display(), "Spawning worker");
        let mut child = Command::new(self.python_cmd())
            .arg(&script)
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TuneError::Python(format!("Failed to spawn Python: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TuneError::Python("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TuneError::Python("worker stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "sumtune::worker", "{line}");
                }
            });
        }

        Ok(WorkerSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerSession {
    /// Write one JSON line.
    pub async fn send(&mut self, message: &serde_json::Value) -> Result<(), TuneError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TuneError::Python(format!("failed to write to worker: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| TuneError::Python(format!("failed to flush worker stdin: {e}")))?;
        Ok(())
    }

    /// Next non-empty stdout line; `None` once the worker has exited.
    pub async fn next_line(&mut self) -> Result<Option<String>, TuneError> {
        loop {
            match self.stdout.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Exit status, if the worker has already exited.
    pub fn try_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.try_wait().ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_cmd_prefers_venv() {
        let config = PythonConfig {
            venv_path: Some(PathBuf::from("/opt/venv")),
            ..PythonConfig::default()
        };
        let runtime = PythonRuntime::from_config(&config, PathBuf::from("."));
        let expected = if cfg!(windows) {
            PathBuf::from("/opt/venv/Scripts/python")
        } else {
            PathBuf::from("/opt/venv/bin/python")
        };
        assert_eq!(runtime.python_cmd(), expected);
        assert_eq!(runtime.timeout(), Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn test_missing_script_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime::new(dir.path().to_path_buf());
        let err = runtime
            .spawn_worker(Path::new("missing_worker.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Python(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_session() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        std::fs::write(&script, "while IFS= read -r line; do echo \"$line\"; done\n").unwrap();
        let config = PythonConfig {
            python_path: PathBuf::from("/bin/sh"),
            ..PythonConfig::default()
        };
        let runtime = PythonRuntime::from_config(&config, dir.path().to_path_buf());
        let mut session = runtime.spawn_worker(&script).await.unwrap();
        session
            .send(&serde_json::json!({"op": "ping"}))
            .await
            .unwrap();
        assert_eq!(
            session.next_line().await.unwrap().as_deref(),
            Some("{\"op\":\"ping\"}")
        );
        assert!(session.try_status().is_none());
    }
}
