//! Console front end for the demo host.
//!
//! - **renderer**: paints the controller's rows and a status line
//! - **input**: crossterm key events to controller keys

pub mod input;
pub mod renderer;

pub use input::{is_ctrl_shift, translate_key};
pub use renderer::Renderer;

use termbridge::{TerminalHost, TerminalMode};

/// Host that records whether a repaint is due
#[derive(Debug)]
pub struct RepaintFlag {
    dirty: bool,
}

impl Default for RepaintFlag {
    fn default() -> Self {
        Self { dirty: true }
    }
}

impl RepaintFlag {
    /// Mark a repaint as due
    pub fn request(&mut self) {
        self.dirty = true;
    }

    /// Return and reset the flag
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl TerminalHost for RepaintFlag {
    fn buffer_changed(&mut self) {
        self.dirty = true;
    }

    fn mode_changed(&mut self, mode: TerminalMode) {
        tracing::debug!(?mode, "mode changed");
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repaint_flag() {
        let mut flag = RepaintFlag::default();
        assert!(flag.take());
        assert!(!flag.take());

        flag.mode_changed(TerminalMode::Interactive);
        assert!(flag.take());

        flag.buffer_changed();
        assert!(flag.take());
    }
}
