//! External command execution.
//!
//! Every program the engine drives (PostgreSQL binaries, `psql`, `systemctl`,
//! satellite daemons) goes through a [`CommandRunner`], so tests can swap the
//! host for a scripted fake.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use crate::error::{CommandError, Error, Result};
use crate::sanitize::redact_args;

/// A command line to run, with its environment and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables, added to the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    /// Fail with [`CommandError`] on non-zero exit.
    pub check: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        Self {
            program: program.as_ref().to_string_lossy().into_owned(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stdin: None,
            check: true,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn nocheck(mut self) -> Self {
        self.check = false;
        self
    }

    /// Program and arguments as one vector.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The command line with secrets masked, for logs and errors.
    pub fn display(&self) -> String {
        redact_args(&self.argv()).join(" ")
    }

    /// Program file name, e.g. `pg_ctl` for `/usr/lib/.../bin/pg_ctl`.
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external programs on behalf of the engine.
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` to completion, capturing both output streams.
    fn output(&self, cmd: &Cmd) -> io::Result<Output>;

    /// Runs `a | b`, returning both outputs (`a`'s stdout is consumed by `b`).
    fn pipeline(&self, a: &Cmd, b: &Cmd) -> io::Result<(Output, Output)>;

    /// Starts `cmd` in the background, its output appended to `logfile`.
    /// Returns the child pid.
    fn spawn(&self, cmd: &Cmd, logfile: Option<&Path>) -> io::Result<u32>;
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

fn build(cmd: &Cmd) -> Command {
    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    for (key, value) in &cmd.env {
        command.env(key, value);
    }
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }
    command
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

impl CommandRunner for SystemRunner {
    fn output(&self, cmd: &Cmd) -> io::Result<Output> {
        let mut command = build(cmd);
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        if let (Some(input), Some(mut stdin)) = (cmd.stdin.clone(), child.stdin.take()) {
            // Fed from a thread so a chatty child cannot deadlock on a full pipe.
            thread::spawn(move || {
                let _ = stdin.write_all(input.as_bytes());
            });
        }
        let output = child.wait_with_output()?;
        Ok(Output {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn pipeline(&self, a: &Cmd, b: &Cmd) -> io::Result<(Output, Output)> {
        let mut first = build(a)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pipe = first
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("no stdout on first pipeline command"))?;
        let second = build(b)
            .stdin(Stdio::from(pipe))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let second = match second {
            Ok(child) => child,
            Err(e) => {
                let _ = first.kill();
                let _ = first.wait();
                return Err(e);
            }
        };
        let first_stderr = first.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });
        let second_output = second.wait_with_output()?;
        let first_status = first.wait()?;
        let first_stderr = first_stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok((
            Output {
                exit_code: exit_code(first_status),
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&first_stderr).into_owned(),
            },
            Output {
                exit_code: exit_code(second_output.status),
                stdout: String::from_utf8_lossy(&second_output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&second_output.stderr).into_owned(),
            },
        ))
    }

    fn spawn(&self, cmd: &Cmd, logfile: Option<&Path>) -> io::Result<u32> {
        let mut command = build(cmd);
        command.stdin(Stdio::null());
        match logfile {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                command.stdout(file.try_clone()?).stderr(file);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        let mut child = command.spawn()?;
        let pid = child.id();
        // Reaped in the background, otherwise a stopped child lingers as a
        // zombie and still answers to kill(pid, 0).
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
}

fn spawn_error(cmd: &Cmd, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        return Error::FileNotFound(PathBuf::from(&cmd.program));
    }
    Error::io(PathBuf::from(&cmd.program), err)
}

fn command_error(cmd: &Cmd, output: Output) -> CommandError {
    CommandError {
        cmd: redact_args(&cmd.argv()),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

/// Runs `cmd`, logging its (masked) command line.
///
/// With `cmd.check` set, a non-zero exit turns into [`Error::Command`].
pub fn run(runner: &dyn CommandRunner, cmd: &Cmd) -> Result<Output> {
    log::debug!("{}", cmd.display());
    let output = runner.output(cmd).map_err(|e| spawn_error(cmd, e))?;
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        log::debug!("{}: {}", cmd.program_name(), line);
    }
    if cmd.check && !output.success() {
        return Err(command_error(cmd, output).into());
    }
    Ok(output)
}

/// Runs `a | b`; both exit statuses are checked and the first failing side
/// is reported.
pub fn pipe(runner: &dyn CommandRunner, a: &Cmd, b: &Cmd) -> Result<Output> {
    log::debug!("{} | {}", a.display(), b.display());
    let (first, second) = runner.pipeline(a, b).map_err(|e| spawn_error(a, e))?;
    if !first.success() {
        return Err(command_error(a, first).into());
    }
    if !second.success() {
        return Err(command_error(b, second).into());
    }
    Ok(second)
}

/// Starts `cmd` in the background and returns its pid.
pub fn spawn(runner: &dyn CommandRunner, cmd: &Cmd, logfile: Option<&Path>) -> Result<u32> {
    log::debug!("starting {} in background", cmd.display());
    runner.spawn(cmd, logfile).map_err(|e| spawn_error(cmd, e))
}
