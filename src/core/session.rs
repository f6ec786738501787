//! Session management
//!
//! A `PtyShellSession` owns one child process at a time. Output is read and
//! decoded on background threads and handed to the owner through `poll()`;
//! writes go through a dedicated writer thread so a stuck child cannot block
//! the caller past the write timeout.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use encoding_rs::Encoding;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::codec::{self, ChunkDecoder};
use super::pty::{
    self, ChildHandle, LaunchError, LaunchSpec, OutputOrigin, ResizeError, Resizer, TransportKind,
    TransportPreference,
};

const READ_BUFFER_SIZE: usize = 4096;
/// Largest single write; the deadline is checked between chunks
const WRITE_CHUNK_SIZE: usize = 512;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long output may trail behind the exit status
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Session is not running")]
    NotRunning,

    /// Nothing was sent
    #[error("Write timed out")]
    Timeout,

    /// The deadline passed after part of the request was sent
    #[error("Write timed out after {written} of {total} bytes")]
    Incomplete { written: usize, total: usize },

    #[error("Failed to write to child: {0}")]
    Io(#[source] io::Error),
}

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Finished,
    Errored,
}

/// Session events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Started { pid: Option<u32>, transport: TransportKind },
    Output { text: String, origin: OutputOrigin },
    Finished { exit_code: i32 },
    Errored { cause: String },
}

/// Session tuning
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub transport: TransportPreference,
    /// Pipe children read UTF-8 from stdin
    pub pipe_utf8: bool,
    /// Encoding for non-UTF-8 pipes when the platform has no ANSI code page
    pub legacy_encoding: String,
    pub write_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Auto,
            pipe_utf8: true,
            legacy_encoding: "shift_jis".to_string(),
            write_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Messages from the background threads
enum PumpEvent {
    Output { text: String, origin: OutputOrigin },
    Exited(i32),
    Failed(String),
}

/// Shared between `write` and the writer thread
#[derive(Debug, Default)]
struct WriteProgress {
    written: usize,
    /// A chunk is inside a blocking write
    in_flight: bool,
    cancelled: bool,
}

struct WriteRequest {
    bytes: Vec<u8>,
    deadline: Instant,
    progress: Arc<Mutex<WriteProgress>>,
    ack: Sender<io::Result<()>>,
}

type SharedChild = Arc<Mutex<Box<dyn ChildHandle>>>;

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn ChildHandle>> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_progress(progress: &Mutex<WriteProgress>) -> MutexGuard<'_, WriteProgress> {
    progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A child process attached through a PTY or pipes
pub struct PtyShellSession {
    /// Incremented on every start
    id: u64,
    state: SessionState,
    options: SessionOptions,
    cols: u16,
    rows: u16,
    transport: Option<TransportKind>,
    pid: Option<u32>,
    encoding: &'static Encoding,
    child: Option<SharedChild>,
    resizer: Option<Box<dyn Resizer>>,
    write_tx: Option<Sender<WriteRequest>>,
    events_rx: Option<Receiver<PumpEvent>>,
    pump_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    /// Cleared when the session is being stopped
    running: Arc<AtomicBool>,
    pending: VecDeque<SessionEvent>,
    /// Set by a failed write, reported by the next `poll`
    write_failure: Option<String>,
}

impl Default for PtyShellSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl PtyShellSession {
    pub fn new(options: SessionOptions) -> Self {
        let encoding = codec::ansi_encoding(&options.legacy_encoding);
        Self {
            id: 0,
            state: SessionState::Idle,
            options,
            cols: 80,
            rows: 24,
            transport: None,
            pid: None,
            encoding,
            child: None,
            resizer: None,
            write_tx: None,
            events_rx: None,
            pump_thread: None,
            writer_thread: None,
            running: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            write_failure: None,
        }
    }

    /// Spawn `argv` in `workdir`.
    ///
    /// A session that already ran is stopped first. Launch failures leave
    /// the session `Errored` and produce no event.
    pub fn start(&mut self, argv: &[String], workdir: &Path, cols: u16, rows: u16) -> Result<(), LaunchError> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(LaunchError::EmptyCommand);
        }
        if cols == 0 || rows == 0 {
            return Err(LaunchError::InvalidSize { cols, rows });
        }

        if self.state != SessionState::Idle {
            self.stop();
        }
        self.pending.clear();
        self.write_failure = None;
        self.id += 1;
        self.state = SessionState::Starting;
        self.cols = cols;
        self.rows = rows;

        let workdir = resolve_workdir(workdir);
        let spec = LaunchSpec::new(argv.to_vec(), workdir, cols, rows);
        let transport = match pty::spawn(&spec, self.options.transport) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(session_id = self.id, error = %err, "launch failed");
                self.state = SessionState::Errored;
                return Err(err);
            }
        };

        let kind = transport.kind;
        let pid = transport.pid;
        let child: SharedChild = Arc::new(Mutex::new(transport.child));
        let running = Arc::new(AtomicBool::new(true));

        let (event_tx, event_rx) = mpsc::channel();
        let pump_thread = {
            let child = child.clone();
            let running = running.clone();
            let readers = transport.readers;
            let session_id = self.id;
            thread::Builder::new()
                .name(format!("session-{}-pump", session_id))
                .spawn(move || pump_loop(session_id, readers, child, event_tx, running))
                .map_err(LaunchError::Spawn)
        };

        let (write_tx, write_rx) = mpsc::channel();
        let writer_thread = {
            let running = running.clone();
            let writer = transport.writer;
            thread::Builder::new()
                .name(format!("session-{}-writer", self.id))
                .spawn(move || writer_loop(writer, write_rx, running))
                .map_err(LaunchError::Spawn)
        };

        self.running = running;
        self.child = Some(child);
        self.resizer = transport.resizer;
        self.transport = Some(kind);
        self.pid = pid;

        let (pump_thread, writer_thread) = match (pump_thread, writer_thread) {
            (Ok(p), Ok(w)) => (p, w),
            (p, w) => {
                self.pump_thread = p.ok();
                self.writer_thread = w.ok();
                self.stop();
                self.state = SessionState::Errored;
                return Err(LaunchError::Spawn(io::Error::other("failed to start session threads")));
            }
        };
        self.pump_thread = Some(pump_thread);
        self.writer_thread = Some(writer_thread);
        self.write_tx = Some(write_tx);
        self.events_rx = Some(event_rx);
        self.state = SessionState::Running;

        info!(session_id = self.id, ?pid, transport = %kind, program = %argv[0], "session started");
        self.pending.push_back(SessionEvent::Started { pid, transport: kind });
        Ok(())
    }

    /// Write raw bytes to the child.
    ///
    /// On `Timeout` nothing reached the child. An I/O failure leaves the
    /// session to be reported `Errored` by the next `poll`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        if self.state != SessionState::Running || self.write_failure.is_some() {
            return Err(WriteError::NotRunning);
        }
        let tx = self.write_tx.as_ref().ok_or(WriteError::NotRunning)?;

        let timeout = self.options.write_timeout;
        let progress = Arc::new(Mutex::new(WriteProgress::default()));
        let (ack_tx, ack_rx) = mpsc::channel();
        let request = WriteRequest {
            bytes: bytes.to_vec(),
            deadline: Instant::now() + timeout,
            progress: progress.clone(),
            ack: ack_tx,
        };
        tx.send(request).map_err(|_| WriteError::NotRunning)?;

        match ack_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => cancel_write(&progress, bytes.len()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => Err(WriteError::NotRunning),
            Ok(Err(e)) => {
                warn!(session_id = self.id, error = %e, "write failed");
                self.write_failure = Some(format!("write to child failed: {}", e));
                Err(WriteError::Io(e))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(session_id = self.id, len = bytes.len(), "write timed out");
                cancel_write(&progress, bytes.len())
            }
            Err(RecvTimeoutError::Disconnected) => Err(WriteError::NotRunning),
        }
    }

    /// Write text in the encoding the transport expects
    pub fn write_text(&mut self, text: &str) -> Result<(), WriteError> {
        match self.transport {
            Some(TransportKind::Pipe) => {
                self.write(&codec::encode_for_pipe(text, self.options.pipe_utf8, self.encoding))
            }
            _ => self.write(text.as_bytes()),
        }
    }

    /// Change the terminal size. Only PTY children are told about it.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ResizeError> {
        if cols == 0 || rows == 0 {
            return Err(ResizeError::InvalidSize { cols, rows });
        }
        self.cols = cols;
        self.rows = rows;
        match (&self.resizer, self.state) {
            (Some(resizer), SessionState::Running) => {
                debug!(session_id = self.id, cols, rows, "resize");
                resizer.resize(cols, rows)
            }
            _ => Ok(()),
        }
    }

    /// Drain pending events and apply their state transitions
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let mut events: Vec<SessionEvent> = self.pending.drain(..).collect();
        let mut terminal = false;

        if let Some(rx) = &self.events_rx {
            loop {
                match rx.try_recv() {
                    Ok(PumpEvent::Output { text, origin }) => {
                        if self.state == SessionState::Running {
                            events.push(SessionEvent::Output { text, origin });
                        } else {
                            trace!(session_id = self.id, "output after exit dropped");
                        }
                    }
                    Ok(PumpEvent::Exited(exit_code)) => {
                        if self.state == SessionState::Running {
                            info!(session_id = self.id, exit_code, "session finished");
                            self.state = SessionState::Finished;
                            events.push(SessionEvent::Finished { exit_code });
                        }
                        terminal = true;
                    }
                    Ok(PumpEvent::Failed(cause)) => {
                        if self.state == SessionState::Running {
                            warn!(session_id = self.id, %cause, "session errored");
                            self.state = SessionState::Errored;
                            events.push(SessionEvent::Errored { cause });
                        }
                        terminal = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if self.state == SessionState::Running {
                            self.state = SessionState::Errored;
                            events.push(SessionEvent::Errored {
                                cause: "output pump stopped unexpectedly".to_string(),
                            });
                        }
                        terminal = true;
                        break;
                    }
                }
            }
        }

        if let Some(cause) = self.write_failure.take() {
            if self.state == SessionState::Running {
                warn!(session_id = self.id, %cause, "session errored");
                self.state = SessionState::Errored;
                events.push(SessionEvent::Errored { cause });
                terminal = true;
            }
        }

        if terminal {
            self.running.store(false, Ordering::SeqCst);
            if self.state == SessionState::Errored {
                self.terminate_child();
            }
            self.release();
        }
        events
    }

    /// Terminate the child and release everything. Safe to call in any state.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.terminate_child();

        self.release();
        if matches!(self.state, SessionState::Starting | SessionState::Running) {
            info!(session_id = self.id, "session stopped");
            self.state = SessionState::Finished;
        }
    }

    /// Polite termination, then a kill once the grace period is over
    fn terminate_child(&mut self) {
        if let Some(child) = self.child.take() {
            let mut child = lock_child(&child);
            if !matches!(child.try_wait(), Ok(Some(_))) {
                debug!(session_id = self.id, pid = ?self.pid, "terminating child");
                if let Err(e) = child.terminate() {
                    debug!(session_id = self.id, error = %e, "terminate failed");
                }
                let deadline = Instant::now() + self.options.stop_grace;
                let mut exited = false;
                while Instant::now() < deadline {
                    if matches!(child.try_wait(), Ok(Some(_)) | Err(_)) {
                        exited = true;
                        break;
                    }
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
                if !exited {
                    debug!(session_id = self.id, "grace period expired, killing child");
                    if let Err(e) = child.kill() {
                        warn!(session_id = self.id, error = %e, "kill failed");
                    }
                }
            }
        }
    }

    /// Drop handles and join the background threads with a bounded wait
    fn release(&mut self) {
        self.child = None;
        self.write_tx = None;
        self.events_rx = None;
        if let Some(handle) = self.writer_thread.take() {
            join_bounded(handle, "writer");
        }
        if let Some(handle) = self.pump_thread.take() {
            join_bounded(handle, "pump");
        }
        self.resizer = None;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Transport used by the next `start`
    pub fn set_transport(&mut self, preference: TransportPreference) {
        self.options.transport = preference;
    }
}

impl Drop for PtyShellSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Use `workdir` if it exists, else the current directory
fn resolve_workdir(workdir: &Path) -> PathBuf {
    if workdir.is_dir() {
        return workdir.to_path_buf();
    }
    let fallback = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    warn!(requested = %workdir.display(), fallback = %fallback.display(), "working directory missing");
    fallback
}

fn join_bounded(handle: JoinHandle<()>, name: &str) {
    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, "thread did not exit in time, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
}

/// Spawns one reader per stream, then waits for the child's exit status
/// and for the streams to drain.
fn pump_loop(
    session_id: u64,
    readers: Vec<(OutputOrigin, Box<dyn Read + Send>)>,
    child: SharedChild,
    events: Sender<PumpEvent>,
    running: Arc<AtomicBool>,
) {
    let (closed_tx, closed_rx) = mpsc::channel::<OutputOrigin>();
    let mut open = 0usize;
    for (origin, reader) in readers {
        let events = events.clone();
        let closed = closed_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}-read", session_id))
            .spawn(move || {
                read_stream(origin, reader, &events);
                let _ = closed.send(origin);
            });
        match spawned {
            Ok(_) => open += 1,
            Err(e) => warn!(session_id, error = %e, "failed to spawn reader"),
        }
    }
    drop(closed_tx);

    let mut exit: Option<(i32, Instant)> = None;
    loop {
        match closed_rx.recv_timeout(EXIT_POLL_INTERVAL) {
            Ok(origin) => {
                trace!(session_id, ?origin, "stream closed");
                open = open.saturating_sub(1);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        if !running.load(Ordering::SeqCst) {
            return;
        }

        if exit.is_none() {
            match lock_child(&child).try_wait() {
                Ok(Some(code)) => exit = Some((code, Instant::now() + DRAIN_TIMEOUT)),
                Ok(None) => {}
                Err(e) => {
                    let _ = events.send(PumpEvent::Failed(e.to_string()));
                    return;
                }
            }
        }

        if let Some((code, drain_deadline)) = exit {
            if open == 0 || Instant::now() >= drain_deadline {
                let _ = events.send(PumpEvent::Exited(code));
                return;
            }
        }
    }
}

/// Read a stream to its end, decoding each chunk
fn read_stream(origin: OutputOrigin, mut reader: Box<dyn Read + Send>, events: &Sender<PumpEvent>) {
    let mut decoder = ChunkDecoder::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() && events.send(PumpEvent::Output { text, origin }).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the PTY's child side is gone
            Err(e) if origin == OutputOrigin::Merged => {
                trace!(?origin, error = %e, "read ended");
                break;
            }
            Err(e) => {
                warn!(?origin, error = %e, "read failed");
                flush_decoder(&mut decoder, origin, events);
                let _ = events.send(PumpEvent::Failed(format!("read from {:?} failed: {}", origin, e)));
                return;
            }
        }
    }
    flush_decoder(&mut decoder, origin, events);
}

fn flush_decoder(decoder: &mut ChunkDecoder, origin: OutputOrigin, events: &Sender<PumpEvent>) {
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(PumpEvent::Output { text: rest, origin });
    }
}

/// Perform queued writes, dropping those whose deadline passed
fn writer_loop(mut writer: Box<dyn Write + Send>, requests: Receiver<WriteRequest>, running: Arc<AtomicBool>) {
    for request in requests {
        let result = if !running.load(Ordering::SeqCst) {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        } else {
            write_chunked(writer.as_mut(), &request)
        };
        let _ = request.ack.send(result);
    }
}

/// Send `request` in chunks, stopping at its deadline or on cancellation
fn write_chunked(writer: &mut dyn Write, request: &WriteRequest) -> io::Result<()> {
    for chunk in request.bytes.chunks(WRITE_CHUNK_SIZE) {
        {
            let mut progress = lock_progress(&request.progress);
            if progress.cancelled || Instant::now() > request.deadline {
                progress.cancelled = true;
                trace!(written = progress.written, len = request.bytes.len(), "expired write dropped");
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            progress.in_flight = true;
        }
        let result = writer.write_all(chunk).and_then(|_| writer.flush());
        let mut progress = lock_progress(&request.progress);
        progress.in_flight = false;
        result?;
        progress.written += chunk.len();
    }
    Ok(())
}

/// Stop a request that ran out of time and report how far it got
fn cancel_write(progress: &Mutex<WriteProgress>, total: usize) -> Result<(), WriteError> {
    let mut progress = lock_progress(progress);
    progress.cancelled = true;
    if progress.written == total {
        Ok(())
    } else if progress.written == 0 && !progress.in_flight {
        Err(WriteError::Timeout)
    } else {
        Err(WriteError::Incomplete {
            written: progress.written,
            total,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn pipe_session() -> PtyShellSession {
        PtyShellSession::new(SessionOptions {
            transport: TransportPreference::Pipe,
            ..SessionOptions::default()
        })
    }

    /// Poll until the session leaves `Running` or the timeout passes
    fn drain(session: &mut PtyShellSession, timeout: Duration) -> Vec<SessionEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            events.extend(session.poll());
            if !session.is_running() || Instant::now() >= deadline {
                return events;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn output_of(events: &[SessionEvent], wanted: OutputOrigin) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { text, origin } if *origin == wanted => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_validates_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        assert!(matches!(session.start(&[], dir.path(), 80, 24), Err(LaunchError::EmptyCommand)));
        assert!(matches!(
            session.start(&argv(&["echo"]), dir.path(), 0, 24),
            Err(LaunchError::InvalidSize { cols: 0, rows: 24 })
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_missing_executable_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        assert!(matches!(session.write(b"x"), Err(WriteError::NotRunning)));

        let result = session.start(&argv(&["/nonexistent/bin/tool"]), dir.path(), 80, 24);
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.poll().is_empty());
        assert!(matches!(session.write(b"x"), Err(WriteError::NotRunning)));
    }

    #[test]
    fn test_echo_over_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session.start(&argv(&["echo", "hello"]), dir.path(), 80, 24).unwrap();
        assert_eq!(session.transport(), Some(TransportKind::Pipe));

        let events = drain(&mut session, Duration::from_secs(10));
        assert!(matches!(events.first(), Some(SessionEvent::Started { transport: TransportKind::Pipe, .. })));
        assert_eq!(events.last(), Some(&SessionEvent::Finished { exit_code: 0 }));
        assert_eq!(output_of(&events, OutputOrigin::Stdout), "hello\n");
        assert_eq!(session.state(), SessionState::Finished);

        // Reported once
        assert!(session.poll().is_empty());
    }

    #[test]
    fn test_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session
            .start(&argv(&["sh", "-c", "echo oops >&2; exit 7"]), dir.path(), 80, 24)
            .unwrap();
        let events = drain(&mut session, Duration::from_secs(10));
        assert_eq!(output_of(&events, OutputOrigin::Stderr), "oops\n");
        assert_eq!(events.last(), Some(&SessionEvent::Finished { exit_code: 7 }));
    }

    #[test]
    fn test_write_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session.start(&argv(&["cat"]), dir.path(), 80, 24).unwrap();
        session.write_text("ping\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = String::new();
        while !seen.contains("ping") && Instant::now() < deadline {
            seen.push_str(&output_of(&session.poll(), OutputOrigin::Stdout));
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen, "ping\n");
        session.stop();
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[test]
    fn test_timed_out_write_is_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PtyShellSession::new(SessionOptions {
            transport: TransportPreference::Pipe,
            write_timeout: Duration::from_millis(300),
            ..SessionOptions::default()
        });
        session
            .start(&argv(&["sh", "-c", "sleep 2; cat"]), dir.path(), 80, 24)
            .unwrap();

        // Fills the pipe, then stalls while the child sleeps
        let result = session.write(&vec![b'x'; 200_000]);
        assert!(
            matches!(result, Err(WriteError::Incomplete { total: 200_000, .. })),
            "{:?}",
            result
        );
        // Queued behind the stalled chunk, so none of it goes out
        assert!(matches!(session.write(b"yyyy"), Err(WriteError::Timeout)));

        let until = Instant::now() + Duration::from_secs(4);
        let mut seen = String::new();
        while Instant::now() < until {
            seen.push_str(&output_of(&session.poll(), OutputOrigin::Stdout));
            thread::sleep(Duration::from_millis(20));
        }
        session.stop();

        assert!(!seen.is_empty());
        assert!(seen.len() < 200_000);
        assert!(!seen.contains('y'));
    }

    #[test]
    fn test_write_chunks_until_cancelled() {
        let (ack, _ack_rx) = mpsc::channel();
        let mut request = WriteRequest {
            bytes: vec![b'a'; 2000],
            deadline: Instant::now() + Duration::from_secs(5),
            progress: Arc::new(Mutex::new(WriteProgress::default())),
            ack,
        };
        let mut sink: Vec<u8> = Vec::new();
        write_chunked(&mut sink, &request).unwrap();
        assert_eq!(sink.len(), 2000);
        assert_eq!(lock_progress(&request.progress).written, 2000);

        request.progress = Arc::new(Mutex::new(WriteProgress {
            cancelled: true,
            ..WriteProgress::default()
        }));
        let mut sink: Vec<u8> = Vec::new();
        let err = write_chunked(&mut sink, &request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_cancel_write_reports_progress() {
        let progress = Mutex::new(WriteProgress::default());
        assert!(matches!(cancel_write(&progress, 10), Err(WriteError::Timeout)));
        assert!(lock_progress(&progress).cancelled);

        let progress = Mutex::new(WriteProgress {
            written: 4,
            ..WriteProgress::default()
        });
        assert!(matches!(
            cancel_write(&progress, 10),
            Err(WriteError::Incomplete { written: 4, total: 10 })
        ));

        let progress = Mutex::new(WriteProgress {
            in_flight: true,
            ..WriteProgress::default()
        });
        assert!(matches!(
            cancel_write(&progress, 10),
            Err(WriteError::Incomplete { written: 0, total: 10 })
        ));

        let progress = Mutex::new(WriteProgress {
            written: 10,
            ..WriteProgress::default()
        });
        assert!(cancel_write(&progress, 10).is_ok());
    }

    #[test]
    fn test_broken_stdin_errors_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session
            .start(&argv(&["sh", "-c", "exec 0<&-; sleep 30"]), dir.path(), 80, 24)
            .unwrap();

        // Succeeds until the shell has closed its stdin
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = loop {
            match session.write(b"hello\n") {
                Ok(()) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                other => break other,
            }
        };
        assert!(matches!(result, Err(WriteError::Io(_))), "{:?}", result);
        assert_eq!(session.state(), SessionState::Running);

        let events = session.poll();
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Errored { cause }) if cause.contains("write")
        ));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.poll().is_empty());
        assert!(matches!(session.write(b"x"), Err(WriteError::NotRunning)));
    }

    struct BrokenReader {
        sent: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::other("device error"));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"part");
            Ok(4)
        }
    }

    #[test]
    fn test_pipe_read_error_fails_session() {
        let (tx, rx) = mpsc::channel();
        read_stream(OutputOrigin::Stdout, Box::new(BrokenReader { sent: false }), &tx);
        let events: Vec<PumpEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PumpEvent::Output { text, .. } if text == "part"));
        assert!(matches!(&events[1], PumpEvent::Failed(cause) if cause.contains("device error")));
    }

    #[test]
    fn test_pty_read_error_ends_output() {
        let (tx, rx) = mpsc::channel();
        read_stream(OutputOrigin::Merged, Box::new(BrokenReader { sent: false }), &tx);
        let events: Vec<PumpEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PumpEvent::Output { text, .. } if text == "part"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session.start(&argv(&["sleep", "30"]), dir.path(), 80, 24).unwrap();

        let started = Instant::now();
        session.stop();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Finished);
        assert!(matches!(session.write(b"x"), Err(WriteError::NotRunning)));
    }

    #[test]
    fn test_restart_bumps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        session.start(&argv(&["sleep", "30"]), dir.path(), 80, 24).unwrap();
        let first = session.id();
        session.start(&argv(&["echo", "again"]), dir.path(), 80, 24).unwrap();
        assert_eq!(session.id(), first + 1);

        let events = drain(&mut session, Duration::from_secs(10));
        assert_eq!(output_of(&events, OutputOrigin::Stdout), "again\n");
    }

    #[test]
    fn test_resize() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = pipe_session();
        assert!(matches!(session.resize(0, 10), Err(ResizeError::InvalidSize { .. })));
        session.resize(100, 30).unwrap();
        assert_eq!(session.size(), (100, 30));

        session.start(&argv(&["sleep", "30"]), dir.path(), 80, 24).unwrap();
        // Pipes have no terminal size
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), (120, 40));
    }

    #[test]
    fn test_missing_workdir_falls_back() {
        let mut session = pipe_session();
        session
            .start(&argv(&["echo", "ok"]), Path::new("/nonexistent/workdir"), 80, 24)
            .unwrap();
        let events = drain(&mut session, Duration::from_secs(10));
        assert_eq!(output_of(&events, OutputOrigin::Stdout), "ok\n");
    }

    #[test]
    fn test_echo_over_pty() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PtyShellSession::new(SessionOptions {
            transport: TransportPreference::Pty,
            ..SessionOptions::default()
        });
        // Some sandboxes have no PTY devices
        if let Err(LaunchError::PtyAllocation(_)) = session.start(&argv(&["echo", "hello"]), dir.path(), 80, 24) {
            return;
        }
        let events = drain(&mut session, Duration::from_secs(10));
        assert!(output_of(&events, OutputOrigin::Merged).contains("hello"));
        assert_eq!(events.last(), Some(&SessionEvent::Finished { exit_code: 0 }));
    }

    #[test]
    fn test_resize_reaches_pty_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PtyShellSession::new(SessionOptions {
            transport: TransportPreference::Pty,
            ..SessionOptions::default()
        });
        if let Err(LaunchError::PtyAllocation(_)) =
            session.start(&argv(&["sh", "-c", "sleep 1; stty size"]), dir.path(), 80, 24)
        {
            return;
        }
        session.resize(100, 30).unwrap();

        let events = drain(&mut session, Duration::from_secs(10));
        assert!(output_of(&events, OutputOrigin::Merged).contains("30 100"));
    }
}
