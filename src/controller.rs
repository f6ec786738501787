//! Terminal session controller
//!
//! Ties a `PtyShellSession`, the ANSI interpreters and the `LineBuffer`
//! together. Keystrokes go straight to the child while a PTY-backed program
//! runs (`Interactive`); otherwise they edit the input line locally and Enter
//! either feeds the line to a running pipe child or dispatches it as a
//! built-in or one-shot command (`LocalLineEdit`).
//!
//! All state is mutated on the thread that calls `pump()` and
//! `handle_key_event()`. Hosts learn about changes through the `Event`
//! fields or an attached `TerminalHost`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{home_dir, TerminalConfig};
use crate::core::keys::{Key, KeyMapper, Modifiers};
use crate::core::pty::{LaunchError, OutputOrigin, TransportKind, TransportPreference};
use crate::core::session::{PtyShellSession, SessionEvent, SessionState, WriteError};
use crate::core::term::{AnsiInterpreter, LineBuffer, Row, Style, StyledRun};
use crate::history::HistoryDirection;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Keystroke routing mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalMode {
    /// Keys are written to a PTY-backed child
    Interactive,
    /// Keys edit the input line locally
    LocalLineEdit,
}

/// What to run in `start_shell`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    /// Configured shell, or the platform default
    Default,
    Argv(Vec<String>),
}

/// Callback list
pub struct Event<T> {
    handlers: Vec<Box<dyn FnMut(&T)>>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self { handlers: Vec::new() }
    }
}

impl<T> Event<T> {
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn emit(&mut self, value: &T) {
        for handler in &mut self.handlers {
            handler(value);
        }
    }
}

/// Render surface notified by the controller
pub trait TerminalHost {
    fn buffer_changed(&mut self);
    fn mode_changed(&mut self, mode: TerminalMode);
}

/// Purpose of the running child
#[derive(Clone, Copy, Debug)]
enum SessionRole {
    Shell,
    OneShot { deadline: Instant },
}

/// Create a controller showing a prompt in `initial_workdir`
pub fn create_controller(
    initial_workdir: &Path,
    cols: u16,
    rows: u16,
    config: TerminalConfig,
) -> Result<TerminalSessionController, ControllerError> {
    TerminalSessionController::new(initial_workdir, cols, rows, config)
}

pub struct TerminalSessionController {
    config: TerminalConfig,
    session: PtyShellSession,
    role: Option<SessionRole>,
    /// argv of the running child
    command: Vec<String>,
    interpreter: AnsiInterpreter,
    stderr_interpreter: AnsiInterpreter,
    buffer: LineBuffer,
    mode: TerminalMode,
    workdir: PathBuf,
    prompt: String,
    cols: u16,
    rows: u16,
    dirty: bool,
    /// Query and match index of a Ctrl-R search in progress
    history_search: Option<(String, usize)>,
    pub on_buffer_changed: Event<()>,
    pub on_mode_changed: Event<TerminalMode>,
    pub on_exit_requested: Event<()>,
}

impl TerminalSessionController {
    pub fn new(workdir: &Path, cols: u16, rows: u16, config: TerminalConfig) -> Result<Self, ControllerError> {
        if cols == 0 || rows == 0 {
            return Err(ControllerError::InvalidDimensions { cols, rows });
        }

        let workdir = if workdir.is_dir() {
            workdir.to_path_buf()
        } else {
            warn!(workdir = %workdir.display(), "working directory missing, using current directory");
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        };

        let mut buffer = LineBuffer::new(config.max_rows);
        buffer.set_input_style(Style::default());

        let mut controller = Self {
            session: PtyShellSession::new(config.session_options()),
            config,
            role: None,
            command: Vec::new(),
            interpreter: AnsiInterpreter::new(),
            stderr_interpreter: AnsiInterpreter::new(),
            buffer,
            mode: TerminalMode::LocalLineEdit,
            workdir,
            prompt: "$ ".to_string(),
            cols,
            rows,
            dirty: false,
            history_search: None,
            on_buffer_changed: Event::default(),
            on_mode_changed: Event::default(),
            on_exit_requested: Event::default(),
        };
        controller.show_prompt();
        controller.dirty = false;
        Ok(controller)
    }

    /// Forward buffer and mode notifications to `host`
    pub fn attach_host<H: TerminalHost + 'static>(&mut self, host: Rc<RefCell<H>>) {
        let buffer_host = host.clone();
        self.on_buffer_changed
            .subscribe(move |_| buffer_host.borrow_mut().buffer_changed());
        self.on_mode_changed
            .subscribe(move |mode| host.borrow_mut().mode_changed(*mode));
    }

    /// Start a long-lived child.
    ///
    /// Launch failures are printed inline; only resource exhaustion is
    /// returned as an error.
    pub fn start_shell(&mut self, command: ShellCommand) -> Result<(), ControllerError> {
        let argv = match command {
            ShellCommand::Default => self.default_shell_argv(),
            ShellCommand::Argv(argv) => argv,
        };
        let result = self.launch(argv, self.config.transport, SessionRole::Shell);
        self.notify();
        result
    }

    /// Stop the running child, if any
    pub fn stop_shell(&mut self) {
        if self.role.is_none() {
            return;
        }
        self.session.stop();
        self.flush_interpreters();
        self.buffer.append_status("Process terminated.", self.notice_style());
        self.end_session();
        self.notify();
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ControllerError> {
        if cols == 0 || rows == 0 {
            return Err(ControllerError::InvalidDimensions { cols, rows });
        }
        self.cols = cols;
        self.rows = rows;
        if let Err(e) = self.session.resize(cols, rows) {
            warn!(error = %e, "resize failed");
        }
        Ok(())
    }

    /// Route one keystroke
    pub fn handle_key_event(&mut self, key: Key, modifiers: Modifiers) {
        match self.mode {
            TerminalMode::Interactive => self.handle_interactive_key(key, modifiers),
            TerminalMode::LocalLineEdit => self.handle_line_edit_key(key, modifiers),
        }
        self.notify();
    }

    /// Insert pasted text. Newlines submit lines in LocalLineEdit mode.
    pub fn paste_text(&mut self, text: &str) {
        match self.mode {
            TerminalMode::Interactive => self.write_to_session(text),
            TerminalMode::LocalLineEdit => {
                let text = text.replace("\r\n", "\n").replace('\r', "\n");
                let mut lines = text.split('\n').peekable();
                while let Some(line) = lines.next() {
                    self.ensure_input_region();
                    self.buffer.insert_input_str(line);
                    self.dirty = true;
                    if lines.peek().is_some() {
                        self.submit_line();
                    }
                }
            }
        }
        self.notify();
    }

    /// Drain session events, enforce the one-shot deadline and notify.
    /// Returns whether the buffer changed.
    pub fn pump(&mut self) -> bool {
        for event in self.session.poll() {
            self.apply_session_event(event);
        }

        if let Some(SessionRole::OneShot { deadline }) = self.role {
            if Instant::now() >= deadline && self.session.is_running() {
                info!(command = ?self.command, "one-shot command timed out");
                self.session.stop();
                self.flush_interpreters();
                let notice = format!(
                    "Command timed out after {}s and was stopped.",
                    self.config.one_shot_timeout_secs
                );
                self.buffer.append_status(&notice, self.notice_style());
                self.end_session();
            }
        }

        let changed = self.dirty;
        self.notify();
        changed
    }

    /// Run the configured startup command, as if typed
    pub fn run_startup_command(&mut self) {
        let Some(command) = self.config.startup_command.clone().filter(|c| !c.trim().is_empty()) else {
            return;
        };
        debug!(%command, "running startup command");
        match self.mode {
            TerminalMode::Interactive => {
                let mut line = command;
                line.push_str(
                    std::str::from_utf8(self.config.enter_sequence.as_bytes()).unwrap_or("\r"),
                );
                self.write_to_session(&line);
            }
            TerminalMode::LocalLineEdit => {
                self.ensure_input_region();
                self.buffer.insert_input_str(&command);
                self.submit_line();
            }
        }
        self.notify();
    }

    /// Clear the visible buffer. History survives.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.interpreter.reset();
        self.stderr_interpreter.reset();
        match (self.mode, self.role) {
            (TerminalMode::Interactive, _) => {}
            (TerminalMode::LocalLineEdit, Some(_)) => self.buffer.begin_input_region(),
            (TerminalMode::LocalLineEdit, None) => self.show_prompt(),
        }
        self.dirty = true;
        self.notify();
    }

    /// Change the directory used for new children
    pub fn set_working_directory(&mut self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        self.workdir = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let name = self
            .workdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.workdir.display().to_string());
        self.prompt = format!("{}$ ", name);
        true
    }

    pub fn snapshot_rows(&self) -> Vec<Row> {
        self.buffer.snapshot_rows()
    }

    pub fn mode(&self) -> TerminalMode {
        self.mode
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.role.and(self.session.transport())
    }

    pub fn is_child_running(&self) -> bool {
        self.role.is_some()
    }

    pub fn line_buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    /// Window title last set by the child
    pub fn title(&self) -> Option<&str> {
        self.interpreter.title()
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    fn handle_interactive_key(&mut self, key: Key, modifiers: Modifiers) {
        if let Some(bytes) = KeyMapper::map(key, modifiers, self.config.enter_sequence) {
            match self.session.write(&bytes) {
                Ok(()) => {}
                Err(WriteError::NotRunning) => debug!("key dropped, session not running"),
                Err(e) => warn!(error = %e, "key write failed"),
            }
        }
    }

    fn handle_line_edit_key(&mut self, key: Key, modifiers: Modifiers) {
        self.ensure_input_region();
        let search = self.history_search.take();

        if modifiers.contains(Modifiers::CTRL) {
            if let Key::Char(ch) = key {
                match ch.to_ascii_lowercase() {
                    'c' => self.cancel_line(),
                    'l' if self.role.is_none() => self.clear(),
                    'r' => self.reverse_search(search),
                    // Ctrl-D and Ctrl-Z have no meaning without a line discipline
                    _ => {}
                }
                return;
            }
        }

        match key {
            Key::Char(ch) if !modifiers.contains(Modifiers::ALT) => self.buffer.insert_input_char(ch),
            Key::Tab => self.buffer.insert_input_char('\t'),
            Key::Backspace => self.buffer.delete_input_char_before_cursor(),
            Key::Delete => self.buffer.delete_input_char_at_cursor(),
            Key::Left => self.buffer.move_input_cursor_left(),
            Key::Right => self.buffer.move_input_cursor_right(),
            Key::Home => self.buffer.move_input_cursor_home(),
            Key::End => self.buffer.move_input_cursor_end(),
            Key::Up => self.buffer.recall_history(HistoryDirection::Older),
            Key::Down => self.buffer.recall_history(HistoryDirection::Newer),
            Key::Enter => self.submit_line(),
            _ => return,
        }
        self.dirty = true;
    }

    /// Ctrl-R: show the newest history entry containing the typed text.
    /// Repeating steps to older matches.
    fn reverse_search(&mut self, previous: Option<(String, usize)>) {
        let (query, skip) = match previous {
            Some((query, skip)) => (query, skip + 1),
            None => (self.buffer.input_text().to_string(), 0),
        };
        if self.buffer.search_history(&query, skip) {
            self.history_search = Some((query, skip));
            self.dirty = true;
        } else if skip > 0 {
            // Stay on the oldest match
            self.history_search = Some((query, skip - 1));
        }
    }

    /// Ctrl-C in LocalLineEdit: stop a running child, else drop the input
    fn cancel_line(&mut self) {
        if self.role.is_some() {
            self.stop_shell();
            return;
        }
        self.buffer.abandon_input_line("^C");
        self.buffer.append_output([StyledRun::plain("\n")]);
        self.show_prompt();
        self.dirty = true;
    }

    /// Commit the input line and send or dispatch it
    fn submit_line(&mut self) {
        let line = self.buffer.commit_input_line();
        self.buffer.append_output([StyledRun::plain("\n")]);
        self.dirty = true;

        if self.role.is_some() {
            self.write_to_session(&format!("{}\n", line));
            self.buffer.begin_input_region();
        } else {
            self.dispatch(&line);
        }
    }

    /// Built-ins, interactive programs, then one-shot commands
    fn dispatch(&mut self, line: &str) {
        let command = line.trim();
        let mut words = command.split_whitespace();
        let Some(first) = words.next() else {
            self.show_prompt();
            return;
        };
        let has_args = words.next().is_some();

        match first.to_ascii_lowercase().as_str() {
            "exit" | "quit" if !has_args => {
                self.on_exit_requested.emit(&());
                self.show_prompt();
            }
            "clear" | "cls" if !has_args => self.clear(),
            "cd" => {
                let target = command[first.len()..].trim();
                self.change_directory(target);
                self.show_prompt();
            }
            _ if self.config.interactive_programs.iter().any(|p| p == first) => {
                let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
                if let Err(e) = self.launch(argv, self.config.transport, SessionRole::Shell) {
                    warn!(error = %e, "interactive program failed to start");
                }
            }
            _ => self.run_one_shot(command),
        }
    }

    fn change_directory(&mut self, target: &str) {
        let path = expand_home(target);
        let path = if path.is_absolute() { path } else { self.workdir.join(path) };
        if self.set_working_directory(&path) {
            let message = format!("Changed directory to: {}\n", self.workdir.display());
            self.buffer.append_output([StyledRun::plain(message)]);
        } else {
            let message = format!("Directory not found: {}", target);
            self.buffer.append_status(&message, self.error_style());
        }
        self.dirty = true;
    }

    fn run_one_shot(&mut self, command: &str) {
        let argv = shell_wrapper(command);
        let deadline = Instant::now() + self.config.one_shot_timeout();
        if let Err(e) = self.launch(argv, TransportPreference::Pipe, SessionRole::OneShot { deadline }) {
            warn!(error = %e, "one-shot command failed to start");
        }
    }

    /// Start `argv`, printing launch failures inline
    fn launch(
        &mut self,
        argv: Vec<String>,
        transport: TransportPreference,
        role: SessionRole,
    ) -> Result<(), ControllerError> {
        if self.role.is_some() {
            self.session.stop();
            self.end_session_quietly();
        }
        self.buffer.end_input_region();
        self.interpreter.reset();
        self.stderr_interpreter.reset();
        self.session.set_transport(transport);
        self.dirty = true;

        match self.session.start(&argv, &self.workdir, self.cols, self.rows) {
            Ok(()) => {
                self.command = argv;
                self.role = Some(role);
                if self.session.transport() == Some(TransportKind::Pty) {
                    self.set_mode(TerminalMode::Interactive);
                } else {
                    self.set_mode(TerminalMode::LocalLineEdit);
                    self.buffer.begin_input_region();
                }
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to start {}: {}", argv.join(" "), e);
                self.buffer.append_status(&message, self.error_style());
                self.set_mode(TerminalMode::LocalLineEdit);
                self.show_prompt();
                if e.is_resource_exhaustion() {
                    Err(e.into())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Started { pid, transport } => {
                debug!(?pid, %transport, "child started");
                if matches!(self.role, Some(SessionRole::Shell)) {
                    let message = format!("Started: {}", self.command.join(" "));
                    self.buffer.append_status(&message, self.started_style());
                    self.dirty = true;
                }
            }
            SessionEvent::Output { text, origin } => {
                let runs: Vec<StyledRun> = match origin {
                    OutputOrigin::Stderr => {
                        let tint = self.config.colors.stderr;
                        self.stderr_interpreter
                            .consume(&text)
                            .into_iter()
                            .map(|run| {
                                let mut style = run.style();
                                if style.fg.is_none() {
                                    style.fg = Some(tint);
                                }
                                run.restyled(style)
                            })
                            .collect()
                    }
                    _ => self.interpreter.consume(&text),
                };
                self.buffer.append_output(runs);
                self.dirty = true;
            }
            SessionEvent::Finished { exit_code } => {
                self.flush_interpreters();
                let message = format!("Process finished with exit code {}", exit_code);
                self.buffer.append_status(&message, self.notice_style());
                self.end_session();
            }
            SessionEvent::Errored { cause } => {
                self.flush_interpreters();
                let message = format!("Process error: {}", cause);
                self.buffer.append_status(&message, self.error_style());
                self.end_session();
            }
        }
    }

    /// Back to the local prompt after the child is gone
    fn end_session(&mut self) {
        self.end_session_quietly();
        self.show_prompt();
    }

    fn end_session_quietly(&mut self) {
        self.role = None;
        self.command.clear();
        self.buffer.end_input_region();
        self.set_mode(TerminalMode::LocalLineEdit);
        self.dirty = true;
    }

    /// Drop partial escape sequences left by a finished child
    fn flush_interpreters(&mut self) {
        self.interpreter.reset();
        self.stderr_interpreter.reset();
    }

    fn show_prompt(&mut self) {
        let prompt = StyledRun::new(self.prompt.clone(), Style::with_fg(self.config.colors.prompt));
        self.buffer.append_output([prompt]);
        self.buffer.begin_input_region();
        self.dirty = true;
    }

    fn ensure_input_region(&mut self) {
        if !self.buffer.has_input_region() {
            if self.role.is_some() {
                self.buffer.begin_input_region();
            } else {
                self.show_prompt();
            }
        }
    }

    fn write_to_session(&mut self, text: &str) {
        if let Err(e) = self.session.write_text(text) {
            warn!(error = %e, "write to child failed");
            if !matches!(e, WriteError::NotRunning) {
                let message = format!("Write failed: {}", e);
                self.buffer.append_status(&message, self.error_style());
                self.dirty = true;
            }
        }
    }

    fn set_mode(&mut self, mode: TerminalMode) {
        if self.mode != mode {
            debug!(?mode, "mode changed");
            self.mode = mode;
            self.on_mode_changed.emit(&mode);
        }
    }

    fn notify(&mut self) {
        if std::mem::take(&mut self.dirty) {
            self.on_buffer_changed.emit(&());
        }
    }

    fn default_shell_argv(&self) -> Vec<String> {
        if let Some(shell) = self.config.shell.as_ref().filter(|s| !s.trim().is_empty()) {
            let mut argv = vec![shell.clone()];
            argv.extend(self.config.shell_args.iter().cloned());
            return argv;
        }
        platform_shell()
    }

    fn error_style(&self) -> Style {
        Style::with_fg(self.config.colors.error)
    }

    fn notice_style(&self) -> Style {
        Style::with_fg(self.config.colors.notice)
    }

    fn started_style(&self) -> Style {
        Style::with_fg(self.config.colors.started)
    }
}

/// Interactive shell of the platform
#[cfg(unix)]
pub fn platform_shell() -> Vec<String> {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    vec![shell, "-i".to_string()]
}

#[cfg(not(unix))]
pub fn platform_shell() -> Vec<String> {
    vec!["cmd.exe".to_string()]
}

/// argv running `command` through the platform shell
pub fn shell_wrapper(command: &str) -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".into(), "/C".into(), command.into()]
    } else {
        vec!["sh".into(), "-c".into(), command.into()]
    }
}

/// `~` and `~/...` relative to the home directory; empty means home
fn expand_home(target: &str) -> PathBuf {
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("."));
    match target {
        "" | "~" => home(),
        t if t.starts_with("~/") || t.starts_with("~\\") => home().join(&t[2..]),
        t => PathBuf::from(t),
    }
}
