//! Terminal renderer using crossterm
//!
//! Paints the tail of the controller's rows, wrapped to the console width,
//! with a status line on the bottom row.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{
        Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor,
        SetForegroundColor,
    },
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use termbridge::config::ColorConfig;
use termbridge::core::term::row_text;
use termbridge::{Rgb, Row, Style, StyledRun, TerminalMode, TerminalSessionController};

const TAB_WIDTH: usize = 8;

/// One screen line after wrapping
pub type VisualLine = Vec<StyledRun>;

/// Terminal renderer
pub struct Renderer {
    initialized: bool,
    /// Visual lines scrolled back from the bottom
    scroll_offset: usize,
    /// Visual line count of the last frame
    last_line_count: usize,
    colors: ColorConfig,
}

impl Renderer {
    pub fn new(colors: ColorConfig) -> Self {
        Self {
            initialized: false,
            scroll_offset: 0,
            last_line_count: 0,
            colors,
        }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            crossterm::event::EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the console
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset));
        let _ = execute!(stdout, Show);
        let _ = execute!(stdout, EnableLineWrap);
        let _ = execute!(stdout, crossterm::event::DisableBracketedPaste);
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = stdout.flush();

        terminal::disable_raw_mode()?;
        println!();
        Ok(())
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll_offset = (self.scroll_offset + lines).min(self.last_line_count);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }

    pub fn is_scrolled(&self) -> bool {
        self.scroll_offset > 0
    }

    /// Render a full frame
    pub fn render(&mut self, controller: &TerminalSessionController) -> io::Result<()> {
        let (cols, rows) = terminal::size()?;
        let width = cols.max(1) as usize;
        let body = rows.saturating_sub(1) as usize;

        let snapshot = controller.snapshot_rows();
        let mut lines: Vec<VisualLine> = Vec::new();
        for row in &snapshot {
            lines.extend(wrap_row(row, width));
        }

        // Cursor inside the last row, in visual lines from its first line
        let cursor = snapshot.last().map(|last| {
            let buffer = controller.line_buffer();
            let index = if controller.mode() == TerminalMode::LocalLineEdit && buffer.has_input_region() {
                buffer.boundary().1 + buffer.input_cursor()
            } else {
                row_text(last).chars().count()
            };
            let (line, col) = cursor_position(last, index, width);
            let last_len = wrap_row(last, width).len();
            (lines.len() - last_len + line, col)
        });
        if let Some((line, _)) = cursor {
            while lines.len() <= line {
                lines.push(Vec::new());
            }
        }

        self.last_line_count = lines.len().saturating_sub(body);
        self.scroll_offset = self.scroll_offset.min(self.last_line_count);
        let end = lines.len() - self.scroll_offset;
        let start = end.saturating_sub(body);

        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());

        // Begin synchronized update
        write!(out, "\x1b[?2026h")?;
        queue!(out, Hide)?;

        for y in 0..body {
            queue!(
                out,
                MoveTo(0, y as u16),
                SetBackgroundColor(to_color(self.colors.background)),
                SetForegroundColor(to_color(self.colors.foreground))
            )?;
            if let Some(line) = lines.get(start + y) {
                self.paint_line(&mut out, line)?;
            }
            queue!(
                out,
                SetAttribute(Attribute::Reset),
                SetBackgroundColor(to_color(self.colors.background)),
                Clear(ClearType::UntilNewLine)
            )?;
        }

        self.paint_status(&mut out, controller, rows.saturating_sub(1), width)?;

        if let Some((line, col)) = cursor {
            if self.scroll_offset == 0 && line >= start && line < end {
                queue!(out, MoveTo(col as u16, (line - start) as u16), Show)?;
            }
        }

        // End synchronized update
        write!(out, "\x1b[?2026l")?;
        out.flush()
    }

    fn paint_line<W: Write>(&self, out: &mut W, line: &VisualLine) -> io::Result<()> {
        for run in line {
            let style = run.style();
            queue!(
                out,
                SetAttribute(Attribute::Reset),
                SetForegroundColor(to_color(style.fg.unwrap_or(self.colors.foreground))),
                SetBackgroundColor(to_color(style.bg.unwrap_or(self.colors.background)))
            )?;
            if style.bold() {
                queue!(out, SetAttribute(Attribute::Bold))?;
            }
            if style.italic() {
                queue!(out, SetAttribute(Attribute::Italic))?;
            }
            if style.underline() {
                queue!(out, SetAttribute(Attribute::Underlined))?;
            }
            queue!(out, Print(run.text()))?;
        }
        Ok(())
    }

    fn paint_status<W: Write>(
        &self,
        out: &mut W,
        controller: &TerminalSessionController,
        y: u16,
        width: usize,
    ) -> io::Result<()> {
        let text = fit_to_width(&status_text(controller, self.scroll_offset), width);
        queue!(
            out,
            MoveTo(0, y),
            SetAttribute(Attribute::Reset),
            SetForegroundColor(to_color(self.colors.background)),
            SetBackgroundColor(to_color(self.colors.foreground)),
            Print(text),
            ResetColor
        )
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn to_color(rgb: Rgb) -> Color {
    Color::Rgb {
        r: rgb.r,
        g: rgb.g,
        b: rgb.b,
    }
}

/// Status line: workdir, mode, session state, title and scroll position
pub fn status_text(controller: &TerminalSessionController, scroll_offset: usize) -> String {
    let mode = match controller.mode() {
        TerminalMode::Interactive => "interactive",
        TerminalMode::LocalLineEdit => "line edit",
    };
    let mut text = format!(
        " {} | {} | {:?}",
        controller.workdir().display(),
        mode,
        controller.session_state()
    );
    if let Some(transport) = controller.transport() {
        text.push_str(&format!(" ({})", transport));
    }
    if let Some(title) = controller.title().filter(|t| !t.is_empty()) {
        text.push_str(" | ");
        text.push_str(title);
    }
    if scroll_offset > 0 {
        text.push_str(&format!(" | -{}", scroll_offset));
    }
    text.push(' ');
    text
}

/// Truncate or pad `text` to exactly `width` columns
pub fn fit_to_width(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        result.push(ch);
        used += w;
    }
    result.push_str(&" ".repeat(width.saturating_sub(used)));
    debug_assert!(result.width() <= width);
    result
}

/// Display width of `ch` at column `col`
fn char_width(ch: char, col: usize) -> usize {
    if ch == '\t' {
        TAB_WIDTH - col % TAB_WIDTH
    } else {
        ch.width().unwrap_or(0)
    }
}

/// Split a row into screen lines of at most `width` columns. Tabs become
/// spaces up to the next tab stop.
pub fn wrap_row(row: &Row, width: usize) -> Vec<VisualLine> {
    let width = width.max(1);
    let mut lines: Vec<VisualLine> = vec![Vec::new()];
    let mut col = 0;

    for run in row {
        let style = run.style();
        let mut segment = String::new();
        for ch in run.text().chars() {
            let w = char_width(ch, col);
            if col + w > width && col > 0 {
                flush(&mut lines, &mut segment, style);
                lines.push(Vec::new());
                col = 0;
            }
            if ch == '\t' {
                let w = char_width(ch, col).min(width - col);
                segment.extend(std::iter::repeat(' ').take(w));
                col += w;
            } else {
                segment.push(ch);
                col += w;
            }
        }
        flush(&mut lines, &mut segment, style);
    }
    lines
}

fn flush(lines: &mut [VisualLine], segment: &mut String, style: Style) {
    if segment.is_empty() {
        return;
    }
    if let Some(line) = lines.last_mut() {
        line.push(StyledRun::new(std::mem::take(segment), style));
    }
}

/// Screen (line, column) of the char at `index` within a wrapped row
pub fn cursor_position(row: &Row, index: usize, width: usize) -> (usize, usize) {
    let width = width.max(1);
    let (mut line, mut col) = (0, 0);
    for ch in row.iter().flat_map(|run| run.text().chars()).take(index) {
        let w = char_width(ch, col);
        if col + w > width && col > 0 {
            line += 1;
            col = 0;
        }
        col += if ch == '\t' { w.min(width - col) } else { w };
    }
    if col >= width {
        line += 1;
        col = 0;
    }
    (line, col)
}
