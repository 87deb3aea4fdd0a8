//! Running ffmpeg and friends as supervised child processes.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// What a successful run printed. Both streams are lossy UTF-8.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// An external program invocation with a hard deadline.
///
/// stdin is closed and the child is killed if the deadline passes, so a
/// wedged tool never outlives the future awaiting it.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Deadline for the whole run, from spawn to exit. Defaults to five
    /// minutes.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Short program name used in errors (`ffmpeg` rather than
    /// `/usr/bin/ffmpeg`).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// The full command line, for logs and invocation descriptors.
    pub fn display_line(&self) -> String {
        let mut line = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Run to completion and capture both streams.
    ///
    /// A spawn failure, an expired deadline, or a non-zero exit all come back
    /// as [`kf_core::Error::Tool`]; the exit case carries the tail of stderr.
    pub async fn execute(&self) -> kf_core::Result<ToolOutput> {
        self.execute_with(|_| ()).await
    }

    /// Execute the command, handing the child's pid to `on_spawn` once the
    /// process is running.
    ///
    /// Whatever `on_spawn` returns is held until the process has been reaped
    /// (or the wait failed) and then dropped, so a registration guard
    /// returned from it is released on every exit path.
    pub async fn execute_with<G>(
        &self,
        on_spawn: impl FnOnce(Option<u32>) -> G,
    ) -> kf_core::Result<ToolOutput> {
        let program_name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the wait future on timeout must take the child with it.
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| kf_core::Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        let guard = on_spawn(child.id());
        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        drop(guard);

        match result {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(kf_core::Error::tool(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            last_lines(&tool_output.stderr, 5)
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(kf_core::Error::tool(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            Err(_elapsed) => Err(kf_core::Error::tool(
                program_name,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// ffmpeg prints its banner and stream map before the actual error; keep
/// only the tail.
fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
