//! termbridge: child process bridge with ANSI interpretation and a
//! line-editing scrollback buffer.
//!
//! A `TerminalSessionController` spawns a shell or program on a
//! pseudo terminal (or pipes when no PTY is available), turns its output
//! into styled runs, keeps them in a bounded `LineBuffer` and routes
//! keystrokes back to the child.

pub mod config;
pub mod controller;
pub mod core;
pub mod history;

pub use config::{ConfigError, TerminalConfig};
pub use controller::{
    create_controller, ControllerError, Event, ShellCommand, TerminalHost, TerminalMode,
    TerminalSessionController,
};
pub use core::keys::{EnterSequence, Key, Modifiers};
pub use core::pty::{LaunchError, OutputOrigin, ResizeError, TransportKind, TransportPreference};
pub use core::session::{PtyShellSession, SessionEvent, SessionOptions, SessionState, WriteError};
pub use core::term::{AnsiInterpreter, LineBuffer, Rgb, Row, Style, StyledRun};
