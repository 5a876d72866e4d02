//! Running external programs.
//!
//! Programs are always spawned from an argv vector, never through a shell.
//! Stdout and stderr are captured separately unless the caller asks for
//! stdout to be folded into stderr. Death by signal is always a failure.

use crate::sysroot::Sysroot;
use nix::fcntl::OFlag;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, ExitStatus, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program}: {}", failure_message(*.code, .stderr))]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program}: killed by signal {signal}")]
    Signaled {
        program: String,
        signal: i32,
        stderr: String,
    },
}

fn failure_message(code: i32, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("exited with status {code}")
    } else {
        stderr.to_string()
    }
}

impl CommandError {
    pub fn errno(&self) -> Option<i32> {
        match self {
            CommandError::Spawn { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// What the program printed on stderr, or the failure itself when it
    /// printed nothing.
    pub fn diagnostic(&self) -> String {
        match self {
            CommandError::Failed { stderr, .. } | CommandError::Signaled { stderr, .. }
                if !stderr.is_empty() =>
            {
                stderr.clone()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(signal)) => ExitState::Signaled(signal),
            // Neither code nor signal only happens for stopped children,
            // which wait() never reports.
            (None, None) => ExitState::Signaled(0),
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitState,
    pub stdout: String,
    /// Captured stderr with trailing newlines removed.
    pub stderr: String,
}

pub struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<OwnedFd>,
    fold_stdout: bool,
    chroot: Option<PathBuf>,
    current_dir: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            fold_stdout: false,
            chroot: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed an already open descriptor to the child as its stdin.
    pub fn stdin_fd(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdin = Some(fd.into());
        self
    }

    /// Send stdout into the stderr buffer, for tools that print diagnostics
    /// on stdout.
    pub fn fold_stdout_on_stderr(mut self) -> Self {
        self.fold_stdout = true;
        self
    }

    /// Run the child inside the guest filesystem.
    pub fn in_sysroot(mut self, sysroot: &Sysroot) -> Self {
        if sysroot.is_prefix_mode() {
            self.current_dir = Some(sysroot.root().to_path_buf());
        } else {
            self.chroot = Some(sysroot.root().to_path_buf());
        }
        self
    }

    fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    fn spawn_error(&self, source: io::Error) -> CommandError {
        CommandError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Build and spawn the child with the given output handles.
    fn spawn_with(&mut self, stdout: Stdio, stderr: Stdio) -> Result<Child, CommandError> {
        tracing::debug!("Running {:?}", self.argv());

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(match self.stdin.take() {
            Some(fd) => Stdio::from(fd),
            None => Stdio::null(),
        });
        cmd.stdout(stdout);
        cmd.stderr(stderr);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        if let Some(root) = self.chroot.clone() {
            // SAFETY: chroot(2) and chdir(2) are async-signal-safe and the
            // paths fit nix's on-stack conversion buffer.
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::chroot(&root)?;
                    nix::unistd::chdir("/")?;
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        // `cmd` owns the parent's copies of any pipe write ends; dropping it
        // here lets the readers see EOF when the child exits.
        drop(cmd);
        Ok(child)
    }

    /// Run to completion and capture output. A non-zero exit is not an error
    /// at this level; see [`Command::run_ok`].
    pub fn run(mut self) -> Result<CommandOutput, CommandError> {
        let (mut child, stdout_pipe, stderr_pipe) = if self.fold_stdout {
            let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
                .map_err(|e| self.spawn_error(io::Error::from(e)))?;
            let write_dup = write.try_clone().map_err(|e| self.spawn_error(e))?;
            let child = self.spawn_with(Stdio::from(write_dup), Stdio::from(write))?;
            (child, None, File::from(read))
        } else {
            let mut child = self.spawn_with(Stdio::piped(), Stdio::piped())?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take().map(OwnedFd::from).map(File::from);
            match stderr {
                Some(stderr) => (child, stdout, stderr),
                None => return Err(self.spawn_error(io::Error::other("stderr not captured"))),
            }
        };

        let stderr_reader = drain_in_background(stderr_pipe);

        let mut stdout = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut stdout)
                .map_err(|e| self.spawn_error(e))?;
        }

        let status = child.wait().map_err(|e| self.spawn_error(e))?;
        let stderr = join_drain(stderr_reader);

        Ok(CommandOutput {
            status: status.into(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: trim_trailing_newlines(stderr),
        })
    }

    /// Run and return stdout, turning any non-success into an error.
    pub fn run_ok(self) -> Result<String, CommandError> {
        let program = self.program.clone();
        let output = self.run()?;
        check_status(&program, output.status, output.stderr)?;
        Ok(output.stdout)
    }

    /// Spawn with stdout available for streaming. Stderr is collected in the
    /// background and reported by [`ChildReader::finish`].
    pub fn spawn_reader(mut self) -> Result<ChildReader, CommandError> {
        let mut child = self.spawn_with(Stdio::piped(), Stdio::piped())?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(self.spawn_error(io::Error::other("child pipes not captured")));
        };

        let stderr_reader = drain_in_background(File::from(OwnedFd::from(stderr)));

        Ok(ChildReader {
            program: std::mem::take(&mut self.program),
            child: Some(child),
            stdout,
            stderr_reader: Some(stderr_reader),
        })
    }
}

fn drain_in_background(mut pipe: File) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::warn!("Reading child stderr: {}", e);
        }
        buf
    })
}

fn join_drain(handle: JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn trim_trailing_newlines(mut s: String) -> String {
    while s.ends_with('\n') {
        s.pop();
    }
    s
}

fn check_status(
    program: &str,
    status: ExitState,
    stderr: String,
) -> Result<(), CommandError> {
    match status {
        ExitState::Exited(0) => Ok(()),
        ExitState::Exited(code) => Err(CommandError::Failed {
            program: program.to_string(),
            code,
            stderr,
        }),
        ExitState::Signaled(signal) => Err(CommandError::Signaled {
            program: program.to_string(),
            signal,
            stderr,
        }),
    }
}

/// A running child whose stdout is read incrementally.
///
/// Dropping it without calling [`ChildReader::finish`] kills and reaps the
/// child.
pub struct ChildReader {
    program: String,
    child: Option<Child>,
    stdout: ChildStdout,
    stderr_reader: Option<JoinHandle<Vec<u8>>>,
}

impl ChildReader {
    pub fn stdout(&mut self) -> &mut ChildStdout {
        &mut self.stdout
    }

    /// Wait for the child and check how it ended.
    pub fn finish(mut self) -> Result<(), CommandError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(|source| CommandError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stderr = self
            .stderr_reader
            .take()
            .map(join_drain)
            .map(trim_trailing_newlines)
            .unwrap_or_default();
        check_status(&self.program, status.into(), stderr)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!("Killing {}", self.program);
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_reader.take() {
            let _ = handle.join();
        }
    }
}

/// Split command output into lines.
///
/// An empty string has no lines, a single trailing newline does not start a
/// new line, and any further blank line is kept.
pub fn split_lines(output: &str) -> Vec<String> {
    if output.is_empty() {
        return Vec::new();
    }
    let body = output.strip_suffix('\n').unwrap_or(output);
    body.split('\n').map(str::to_string).collect()
}

/// Whether `program` can be found on `PATH`.
pub fn prog_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_exit_zero_keeps_stdout() {
        let out = Command::new("sh")
            .args(["-c", "printf 'hello\\nworld\\n'"])
            .run_ok()
            .unwrap();
        assert_eq!(out, "hello\nworld\n");
    }

    #[test]
    fn test_nonzero_exit_carries_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo 'it broke' >&2; exit 3"])
            .run_ok()
            .unwrap_err();
        match &err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(*code, 3);
                assert_eq!(stderr, "it broke");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "sh: it broke");
    }

    #[test]
    fn test_false_has_non_empty_message() {
        let err = Command::new("false").run_ok().unwrap_err();
        assert!(matches!(err, CommandError::Failed { code: 1, .. }));
        assert_eq!(err.to_string(), "false: exited with status 1");
    }

    #[test]
    fn test_signal_is_not_success() {
        let output = Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .run()
            .unwrap();
        assert_eq!(output.status, ExitState::Signaled(Signal::SIGTERM as i32));

        let err = Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .run_ok()
            .unwrap_err();
        assert!(matches!(err, CommandError::Signaled { .. }));
    }

    #[test]
    fn test_spawn_failure_preserves_errno() {
        let err = Command::new("/nonexistent/program").run().unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_fold_stdout_on_stderr() {
        let output = Command::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .fold_stdout_on_stderr()
            .run()
            .unwrap();
        assert_eq!(output.stdout, "");
        assert!(output.stderr.contains("out"));
        assert!(output.stderr.contains("err"));
    }

    #[test]
    fn test_stdin_fd() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();
        let out = Command::new("wc")
            .arg("-l")
            .stdin_fd(File::open(&path).unwrap())
            .run_ok()
            .unwrap();
        assert_eq!(out.trim(), "3");
    }

    #[test]
    fn test_streaming_reader() {
        let mut reader = Command::new("sh")
            .args(["-c", "printf abcdef"])
            .spawn_reader()
            .unwrap();
        let mut out = String::new();
        reader.stdout().read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcdef");
        reader.finish().unwrap();
    }

    #[test]
    fn test_split_lines() {
        assert!(split_lines("").is_empty());
        assert_eq!(split_lines("\n"), vec![""]);
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines("a\nb\n\n"), vec!["a", "b", ""]);
        assert_eq!(split_lines("a\nb"), vec!["a", "b"]);
    }
}
