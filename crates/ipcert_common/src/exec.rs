//! Command execution layer
//!
//! Every external collaborator (certbot, package managers, service
//! supervisors, crontab) is reached through [`CommandRunner`]. The system
//! implementation captures exit code and output without interpreting them;
//! callers decide what a failure means.

use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

/// Maximum output length kept per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Result of running one external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Build a successful result (handy for fakes)
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Build a failed result with the given exit code
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, for phrase scanning
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Short description of the exit status
    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Exit status plus the last non-empty line of stderr (or stdout)
    pub fn summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        match text.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) => format!("{}: {}", self.status_text(), line),
            None => self.status_text(),
        }
    }
}

/// Seam for everything that spawns a process or waits on the host
pub trait CommandRunner {
    /// Run a program to completion, capturing its output
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Run a program feeding `input` on stdin
    fn run_with_input(&self, program: &str, args: &[&str], input: &str)
        -> io::Result<CommandOutput>;

    /// Start a program and do not wait for it
    fn spawn_detached(&self, program: &str, args: &[&str]) -> io::Result<()>;

    /// Whether a program is resolvable on PATH
    fn exists(&self, program: &str) -> bool;

    /// Block the current thread (retry delays, lock polling)
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Runner backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

fn capture(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        code: output.status.code(),
        stdout: truncate(String::from_utf8_lossy(&output.stdout).into_owned()),
        stderr: truncate(String::from_utf8_lossy(&output.stderr).into_owned()),
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let start = Instant::now();
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let result = capture(output);
        debug!(
            "ran {} {} -> {} in {}ms",
            program,
            args.join(" "),
            result.status_text(),
            start.elapsed().as_millis()
        );
        Ok(result)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }

        let result = capture(child.wait_with_output()?);
        debug!("ran {} {} (stdin) -> {}", program, args.join(" "), result.status_text());
        Ok(result)
    }

    fn spawn_detached(&self, program: &str, args: &[&str]) -> io::Result<()> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }

    fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Run and collapse spawn failures into a failed output
///
/// Used where "could not start" and "ran and failed" are the same outcome.
pub fn run_lenient(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> CommandOutput {
    match runner.run(program, args) {
        Ok(output) => output,
        Err(e) => CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}
