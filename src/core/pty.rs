//! Child process transport
//!
//! Spawns a child either on a pseudo terminal (portable-pty) or on plain
//! pipes (std::process) and hands back its readers, writer, child handle and,
//! for PTYs, a resizer.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to allocate pseudo terminal: {0}")]
    PtyAllocation(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),
}

impl LaunchError {
    /// Whether the failure comes from the system running out of processes,
    /// memory or descriptors
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            LaunchError::Spawn(err) => {
                err.kind() == io::ErrorKind::OutOfMemory
                    || err.raw_os_error().is_some_and(is_exhaustion_code)
            }
            _ => false,
        }
    }
}

#[cfg(unix)]
fn is_exhaustion_code(code: i32) -> bool {
    use nix::errno::Errno;
    [Errno::EAGAIN, Errno::ENOMEM, Errno::EMFILE, Errno::ENFILE]
        .iter()
        .any(|e| *e as i32 == code)
}

#[cfg(windows)]
fn is_exhaustion_code(code: i32) -> bool {
    // ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY, ERROR_NO_SYSTEM_RESOURCES
    matches!(code, 8 | 14 | 1450)
}

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("Failed to resize pseudo terminal: {0}")]
    Pty(String),
}

/// How the child is attached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Pty,
    Pipe,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Pty => write!(f, "pty"),
            TransportKind::Pipe => write!(f, "pipe"),
        }
    }
}

/// Transport selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// PTY, falling back to pipes when no PTY can be allocated
    #[default]
    Auto,
    Pty,
    Pipe,
}

/// Which stream a chunk of output came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputOrigin {
    /// PTY output (stdout and stderr interleaved)
    Merged,
    Stdout,
    Stderr,
}

/// Everything needed to launch a child
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            env: child_env(cols, rows),
            argv,
            workdir: workdir.into(),
            cols,
            rows,
        }
    }
}

/// Environment given to every child
pub fn child_env(cols: u16, rows: u16) -> Vec<(String, String)> {
    vec![
        ("TERM".into(), "xterm-256color".into()),
        ("COLUMNS".into(), cols.to_string()),
        ("LINES".into(), rows.to_string()),
        ("PYTHONUNBUFFERED".into(), "1".into()),
        ("PYTHONIOENCODING".into(), "utf-8".into()),
    ]
}

/// Control over a spawned child
pub trait ChildHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code if the child has exited
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the child to exit
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the child to exit
    fn kill(&mut self) -> io::Result<()>;
}

/// Resizes the terminal the child sees
pub trait Resizer: Send {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), ResizeError>;
}

/// A spawned child and its streams
pub struct Transport {
    pub kind: TransportKind,
    pub pid: Option<u32>,
    pub readers: Vec<(OutputOrigin, Box<dyn Read + Send>)>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn ChildHandle>,
    pub resizer: Option<Box<dyn Resizer>>,
}

/// Spawn `spec` on the transport chosen by `preference`
pub fn spawn(spec: &LaunchSpec, preference: TransportPreference) -> Result<Transport, LaunchError> {
    match preference {
        TransportPreference::Pty => spawn_pty(spec),
        TransportPreference::Pipe => spawn_pipe(spec),
        TransportPreference::Auto => match spawn_pty(spec) {
            Err(LaunchError::PtyAllocation(reason)) => {
                warn!(%reason, "PTY unavailable, falling back to pipes");
                spawn_pipe(spec)
            }
            result => result,
        },
    }
}

fn spawn_pty(spec: &LaunchSpec) -> Result<Transport, LaunchError> {
    let program = spec.argv.first().ok_or(LaunchError::EmptyCommand)?;
    check_program(program, &spec.workdir)?;

    let pair = native_pty_system()
        .openpty(pty_size(spec.cols, spec.rows))
        .map_err(|e| LaunchError::PtyAllocation(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&spec.argv[1..]);
    cmd.cwd(&spec.workdir);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| match e.downcast::<io::Error>() {
            Ok(io_err) => map_io_error(io_err, program),
            Err(other) => LaunchError::Spawn(io::Error::other(other.to_string())),
        })?;
    // The child holds its own copy of the slave side
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| LaunchError::PtyAllocation(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| LaunchError::PtyAllocation(e.to_string()))?;

    let pid = child.process_id();
    debug!(?pid, program = %program, "spawned on pty");

    Ok(Transport {
        kind: TransportKind::Pty,
        pid,
        readers: vec![(OutputOrigin::Merged, reader)],
        writer,
        child: Box::new(PtyChild(child)),
        resizer: Some(Box::new(PtyResizer(pair.master))),
    })
}

fn spawn_pipe(spec: &LaunchSpec) -> Result<Transport, LaunchError> {
    let program = spec.argv.first().ok_or(LaunchError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(&spec.argv[1..])
        .current_dir(&spec.workdir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(|e| map_io_error(e, program))?;

    let missing = |name: &str| LaunchError::Spawn(io::Error::other(format!("{} not captured", name)));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let pid = Some(child.id());
    debug!(?pid, program = %program, "spawned on pipes");

    Ok(Transport {
        kind: TransportKind::Pipe,
        pid,
        readers: vec![
            (OutputOrigin::Stdout, Box::new(stdout)),
            (OutputOrigin::Stderr, Box::new(stderr)),
        ],
        writer: Box::new(stdin),
        child: Box::new(PipeChild(child)),
        resizer: None,
    })
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn map_io_error(err: io::Error, program: &str) -> LaunchError {
    match err.kind() {
        io::ErrorKind::NotFound => LaunchError::NotFound(program.to_string()),
        io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.to_string()),
        _ => LaunchError::Spawn(err),
    }
}

/// Fail early with a typed error when the program cannot be run.
///
/// portable-pty reports these as opaque errors.
fn check_program(program: &str, workdir: &Path) -> Result<(), LaunchError> {
    let path = Path::new(program);
    let candidate = if path.components().count() > 1 {
        let full = if path.is_absolute() { path.to_path_buf() } else { workdir.join(path) };
        full.is_file().then_some(full)
    } else {
        find_in_path(program)
    };

    let candidate = candidate.ok_or_else(|| LaunchError::NotFound(program.to_string()))?;
    if !is_executable(&candidate) {
        return Err(LaunchError::PermissionDenied(program.to_string()));
    }
    Ok(())
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let base = dir.join(program);
        if base.is_file() {
            return Some(base);
        }
        if cfg!(windows) {
            ["exe", "cmd", "bat", "com"]
                .iter()
                .map(|ext| base.with_extension(ext))
                .find(|p| p.is_file())
        } else {
            None
        }
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::unistd::Pid;
    let Some(pid) = pid else {
        return Ok(());
    };
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

struct PtyChild(Box<dyn portable_pty::Child + Send + Sync>);

impl ChildHandle for PtyChild {
    fn pid(&self) -> Option<u32> {
        self.0.process_id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(|status| status.exit_code() as i32))
    }

    /// SIGHUP, as if the terminal went away
    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(self.pid(), nix::sys::signal::Signal::SIGHUP)
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.0.kill()
    }
}

struct PtyResizer(Box<dyn MasterPty + Send>);

impl Resizer for PtyResizer {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), ResizeError> {
        self.0
            .resize(pty_size(cols, rows))
            .map_err(|e| ResizeError::Pty(e.to_string()))
    }
}

struct PipeChild(std::process::Child);

impl ChildHandle for PipeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.0.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(exit_code))
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            if self.0.try_wait()?.is_some() {
                return Ok(());
            }
            send_signal(self.pid(), nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.0.try_wait()?.is_some() {
            return Ok(());
        }
        match self.0.kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Exit code, or 128 + signal number for signal deaths
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_env() {
        let env = child_env(120, 40);
        assert!(env.contains(&("TERM".to_string(), "xterm-256color".to_string())));
        assert!(env.contains(&("COLUMNS".to_string(), "120".to_string())));
        assert!(env.contains(&("LINES".to_string(), "40".to_string())));
        assert!(env.contains(&("PYTHONIOENCODING".to_string(), "utf-8".to_string())));
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_program("definitely-not-a-real-program-4242", dir.path());
        assert!(matches!(result, Err(LaunchError::NotFound(_))));

        let result = check_program("./missing.sh", dir.path());
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        let result = check_program(script.to_str().unwrap(), dir.path());
        assert!(matches!(result, Err(LaunchError::PermissionDenied(_))));
    }

    #[test]
    fn test_resource_exhaustion_classification() {
        assert!(!LaunchError::NotFound("x".into()).is_resource_exhaustion());
        let oom = LaunchError::Spawn(io::Error::from(io::ErrorKind::OutOfMemory));
        assert!(oom.is_resource_exhaustion());
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_spawn_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(
            vec!["sh".into(), "-c".into(), "printf out; printf err >&2; exit 3".into()],
            dir.path(),
            80,
            24,
        );
        let mut transport = spawn(&spec, TransportPreference::Pipe).unwrap();
        assert_eq!(transport.kind, TransportKind::Pipe);
        assert!(transport.resizer.is_none());

        let mut outputs = Vec::new();
        for (origin, mut reader) in transport.readers.drain(..) {
            let mut text = String::new();
            reader.read_to_string(&mut text).unwrap();
            outputs.push((origin, text));
        }
        assert_eq!(
            outputs,
            vec![(OutputOrigin::Stdout, "out".to_string()), (OutputOrigin::Stderr, "err".to_string())]
        );

        let code = loop {
            if let Some(code) = transport.child.try_wait().unwrap() {
                break code;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert_eq!(code, 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_spawn_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(vec!["no-such-binary-4242".into()], dir.path(), 80, 24);
        let result = spawn(&spec, TransportPreference::Pipe);
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
    }
}
