//! ANSI interpretation and the scrollback line buffer

pub mod buffer;
pub mod parser;
pub mod style;

pub use buffer::{row_text, LineBuffer, Row, DEFAULT_MAX_ROWS};
pub use parser::AnsiInterpreter;
pub use style::{coalesce_runs, color_256, Rgb, Style, StyleFlags, StyledRun};
