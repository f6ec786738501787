//! Core terminal emulation components.
//!
//! - **pty**: child process transport (portable-pty or plain pipes)
//! - **codec**: output decoding and pipe input encoding
//! - **session**: one child process with background output pumping
//! - **term**: ANSI interpreter, styles and the scrollback line buffer
//! - **keys**: key model and VT input mapping
//!
//! # Architecture
//!
//! ```text
//! PtyShellSession
//! ├── Transport (PTY master or stdin/stdout/stderr pipes)
//! ├── pump thread ── reader threads ── ChunkDecoder
//! └── writer thread
//!
//! AnsiInterpreter ── StyledRun ──> LineBuffer
//!                                  └── CommandHistory
//! ```

pub mod codec;
pub mod keys;
pub mod pty;
pub mod session;
pub mod term;
