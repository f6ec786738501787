//! Scrollback line buffer
//!
//! Committed output lives in a bounded deque of styled rows. The editable
//! input region is kept apart from the rows and only joins them on commit,
//! so nothing typed can reach text that was already committed.

use std::collections::VecDeque;

use super::style::{push_coalesced, Style, StyledRun};
use crate::history::{CommandHistory, HistoryDirection};

/// Default maximum number of rows kept
pub const DEFAULT_MAX_ROWS: usize = 500;

/// One display row
pub type Row = Vec<StyledRun>;

/// Editable input after the committed boundary
#[derive(Debug, Clone, Default)]
struct InputRegion {
    text: String,
    /// Cursor as a char index into `text`
    cursor: usize,
}

impl InputRegion {
    fn byte_index(&self, char_index: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_index)
            .map_or(self.text.len(), |(i, _)| i)
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Bounded store of styled rows with an editable input line
#[derive(Debug, Clone)]
pub struct LineBuffer {
    rows: VecDeque<Row>,
    max_rows: usize,
    input: Option<InputRegion>,
    input_style: Style,
    history: CommandHistory,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROWS)
    }
}

impl LineBuffer {
    pub fn new(max_rows: usize) -> Self {
        let mut rows = VecDeque::new();
        rows.push_back(Row::new());
        Self {
            rows,
            max_rows: max_rows.max(1),
            input: None,
            input_style: Style::default(),
            history: CommandHistory::new(),
        }
    }

    /// Append process output.
    ///
    /// `\n` starts a new row, `\x08` erases the last committed character of
    /// the current row, `\r` and other control characters except tab are
    /// dropped. Pending input stays after the new output.
    pub fn append_output<I>(&mut self, runs: I)
    where
        I: IntoIterator<Item = StyledRun>,
    {
        for run in runs {
            let style = run.style();
            let mut segment = String::new();
            for ch in run.text().chars() {
                match ch {
                    '\n' => {
                        self.push_segment(&mut segment, style);
                        self.rows.push_back(Row::new());
                    }
                    '\x08' => {
                        self.push_segment(&mut segment, style);
                        self.pop_char();
                    }
                    '\t' => segment.push(ch),
                    c if c.is_control() => {}
                    c => segment.push(c),
                }
            }
            self.push_segment(&mut segment, style);
        }
        self.enforce_row_cap();
    }

    /// Append a whole line in a single color, starting on a fresh row
    pub fn append_status(&mut self, text: &str, style: Style) {
        let mut line = String::new();
        if !self.current_row_is_empty() {
            line.push('\n');
        }
        line.push_str(text);
        line.push('\n');
        self.append_output([StyledRun::new(line, style)]);
    }

    /// Open (or reopen) the editable region at the end of the buffer
    pub fn begin_input_region(&mut self) {
        self.input = Some(InputRegion::default());
        self.history.reset_cursor();
    }

    pub fn has_input_region(&self) -> bool {
        self.input.is_some()
    }

    /// Drop the editable region and its text without committing
    pub fn end_input_region(&mut self) {
        self.input = None;
    }

    pub fn set_input_style(&mut self, style: Style) {
        self.input_style = style;
    }

    /// Insert a character at the input cursor. Control characters other than
    /// tab are rejected.
    pub fn insert_input_char(&mut self, ch: char) {
        if ch.is_control() && ch != '\t' {
            return;
        }
        if let Some(input) = self.input.as_mut() {
            let at = input.byte_index(input.cursor);
            input.text.insert(at, ch);
            input.cursor += 1;
        }
    }

    pub fn insert_input_str(&mut self, text: &str) {
        for ch in text.chars() {
            self.insert_input_char(ch);
        }
    }

    /// Backspace. A no-op when the cursor sits on the boundary.
    pub fn delete_input_char_before_cursor(&mut self) {
        if let Some(input) = self.input.as_mut() {
            if input.cursor == 0 {
                return;
            }
            input.cursor -= 1;
            let at = input.byte_index(input.cursor);
            input.text.remove(at);
        }
    }

    /// Delete key
    pub fn delete_input_char_at_cursor(&mut self) {
        if let Some(input) = self.input.as_mut() {
            if input.cursor < input.char_len() {
                let at = input.byte_index(input.cursor);
                input.text.remove(at);
            }
        }
    }

    /// Left arrow; stops at the boundary
    pub fn move_input_cursor_left(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.cursor = input.cursor.saturating_sub(1);
        }
    }

    pub fn move_input_cursor_right(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.cursor = (input.cursor + 1).min(input.char_len());
        }
    }

    pub fn move_input_cursor_home(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.cursor = 0;
        }
    }

    pub fn move_input_cursor_end(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.cursor = input.char_len();
        }
    }

    /// Current editable text
    pub fn input_text(&self) -> &str {
        self.input.as_ref().map_or("", |i| i.text.as_str())
    }

    /// Cursor position within the input, in chars
    pub fn input_cursor(&self) -> usize {
        self.input.as_ref().map_or(0, |i| i.cursor)
    }

    /// Commit the editable region.
    ///
    /// The text becomes committed output (without a newline; the caller
    /// appends one), is recorded in history, and the region closes.
    pub fn commit_input_line(&mut self) -> String {
        let text = self.input.take().map(|i| i.text).unwrap_or_default();
        self.history.add(&text);
        if !text.is_empty() {
            let run = StyledRun::new(text.clone(), self.input_style);
            self.append_output([run]);
        }
        text
    }

    /// Commit the input followed by `suffix` as plain output, bypassing
    /// history. Used when a line is cancelled.
    pub fn abandon_input_line(&mut self, suffix: &str) {
        let mut text = self.input.take().map(|i| i.text).unwrap_or_default();
        text.push_str(suffix);
        self.history.reset_cursor();
        self.append_output([StyledRun::new(text, self.input_style)]);
    }

    /// Replace the input with the history entry in `direction`
    pub fn recall_history(&mut self, direction: HistoryDirection) {
        if self.input.is_none() {
            return;
        }
        let recalled = self.history.recall(direction).map(str::to_string);
        if let (Some(text), Some(input)) = (recalled, self.input.as_mut()) {
            input.cursor = text.chars().count();
            input.text = text;
        }
    }

    /// Replace the input with the `skip`-th newest history entry containing
    /// `query`. Returns false when there is none.
    pub fn search_history(&mut self, query: &str, skip: usize) -> bool {
        let Some(found) = self.history.search(query).get(skip).map(|e| e.to_string()) else {
            return false;
        };
        let Some(input) = self.input.as_mut() else {
            return false;
        };
        input.cursor = found.chars().count();
        input.text = found;
        true
    }

    /// Empty all rows. History entries survive.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.rows.push_back(Row::new());
        self.input = None;
        self.history.reset_cursor();
    }

    /// Committed rows plus the pending input appended to the last row
    pub fn snapshot_rows(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self.rows.iter().cloned().collect();
        if let Some(input) = self.input.as_ref().filter(|i| !i.text.is_empty()) {
            if let Some(last) = rows.last_mut() {
                push_coalesced(last, StyledRun::new(input.text.clone(), self.input_style));
            }
        }
        rows
    }

    /// Committed rows only
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Position (row, column in chars) where committed text ends
    pub fn boundary(&self) -> (usize, usize) {
        let row = self.rows.len() - 1;
        (row, row_text(&self.rows[row]).chars().count())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn set_max_rows(&mut self, max_rows: usize) {
        self.max_rows = max_rows.max(1);
        self.enforce_row_cap();
    }

    /// Committed text without styles, rows joined by newlines
    pub fn plain_text(&self) -> String {
        self.rows.iter().map(|r| row_text(r)).collect::<Vec<_>>().join("\n")
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    fn current_row_is_empty(&self) -> bool {
        self.rows.back().map_or(true, |r| r.iter().all(StyledRun::is_empty))
    }

    fn push_segment(&mut self, segment: &mut String, style: Style) {
        if segment.is_empty() {
            return;
        }
        if let Some(row) = self.rows.back_mut() {
            push_coalesced(row, StyledRun::new(std::mem::take(segment), style));
        }
    }

    fn pop_char(&mut self) {
        let Some(row) = self.rows.back_mut() else {
            return;
        };
        while let Some(last) = row.pop() {
            let mut text = last.text().to_string();
            if text.pop().is_some() {
                if !text.is_empty() {
                    row.push(StyledRun::new(text, last.style()));
                }
                return;
            }
        }
    }

    fn enforce_row_cap(&mut self) {
        while self.rows.len() > self.max_rows {
            self.rows.pop_front();
        }
    }
}

/// Text of a row without styles
pub fn row_text(row: &Row) -> String {
    row.iter().map(StyledRun::text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::style::Rgb;

    fn committed(buffer: &LineBuffer) -> Vec<Row> {
        buffer.rows().cloned().collect()
    }

    #[test]
    fn test_append_splits_rows_on_newline() {
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("one\r\ntwo\nthr"), StyledRun::plain("ee")]);
        assert_eq!(buffer.plain_text(), "one\ntwo\nthree");
        assert_eq!(buffer.row_count(), 3);
        assert_eq!(buffer.boundary(), (2, 5));
    }

    #[test]
    fn test_backspace_echo_erases() {
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("abc"), StyledRun::plain("\x08 \x08")]);
        assert_eq!(buffer.plain_text(), "ab");
    }

    #[test]
    fn test_row_cap_keeps_most_recent() {
        let max = 500;
        let mut buffer = LineBuffer::new(max);
        let lines: Vec<String> = (0..max + 50).map(|i| format!("line{}", i)).collect();
        buffer.append_output([StyledRun::plain(lines.join("\n"))]);

        assert_eq!(buffer.row_count(), max);
        let texts: Vec<String> = buffer.rows().map(|r| row_text(r)).collect();
        assert_eq!(texts, lines[50..].to_vec());
    }

    #[test]
    fn test_row_cap_across_many_appends() {
        let mut buffer = LineBuffer::new(10);
        for i in 0..25 {
            buffer.append_output([StyledRun::plain(format!("{}\n", i))]);
        }
        assert_eq!(buffer.row_count(), 10);
        assert_eq!(row_text(buffer.rows().next().unwrap_or(&Row::new())), "16");
    }

    #[test]
    fn test_styles_are_kept_per_run() {
        let red = Style::with_fg(Rgb::new(255, 0, 0));
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::new("err", red), StyledRun::plain(" ok")]);
        let rows = buffer.snapshot_rows();
        assert_eq!(rows[0], vec![StyledRun::new("err", red), StyledRun::plain(" ok")]);
    }

    #[test]
    fn test_chunked_runs_merge() {
        let red = Style::with_fg(Rgb::new(128, 0, 0));
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::new("RE", red)]);
        buffer.append_output([StyledRun::new("D", red), StyledRun::plain(" ok")]);
        assert_eq!(
            buffer.snapshot_rows()[0],
            vec![StyledRun::new("RED", red), StyledRun::plain(" ok")]
        );
    }

    #[test]
    fn test_input_containment() {
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("$ ")]);
        buffer.begin_input_region();
        let before = committed(&buffer);
        let boundary = buffer.boundary();

        // Deterministic pseudo-random edit sequence
        let mut seed: u32 = 12345;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            match (seed >> 16) % 6 {
                0 | 1 => buffer.insert_input_char(char::from(b'a' + (seed % 26) as u8)),
                2 => buffer.delete_input_char_before_cursor(),
                3 => buffer.move_input_cursor_left(),
                4 => buffer.move_input_cursor_home(),
                _ => buffer.delete_input_char_at_cursor(),
            }
            assert_eq!(committed(&buffer), before);
            assert_eq!(buffer.boundary(), boundary);
        }
    }

    #[test]
    fn test_backspace_at_boundary_is_noop() {
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("$ ")]);
        buffer.begin_input_region();
        buffer.delete_input_char_before_cursor();
        buffer.move_input_cursor_left();
        buffer.insert_input_char('x');
        assert_eq!(buffer.input_text(), "x");
        assert_eq!(buffer.plain_text(), "$ ");
    }

    #[test]
    fn test_cursor_editing_mid_line() {
        let mut buffer = LineBuffer::default();
        buffer.begin_input_region();
        buffer.insert_input_str("héllo");
        buffer.move_input_cursor_left();
        buffer.move_input_cursor_left();
        buffer.insert_input_char('X');
        assert_eq!(buffer.input_text(), "hélXlo");
        buffer.move_input_cursor_home();
        buffer.delete_input_char_at_cursor();
        assert_eq!(buffer.input_text(), "élXlo");
        buffer.move_input_cursor_end();
        assert_eq!(buffer.input_cursor(), 5);
    }

    #[test]
    fn test_commit_moves_input_into_rows() {
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("$ ")]);
        buffer.begin_input_region();
        buffer.insert_input_str("ls -la");
        assert_eq!(buffer.snapshot_rows().len(), 1);
        assert_eq!(row_text(&buffer.snapshot_rows()[0]), "$ ls -la");

        let line = buffer.commit_input_line();
        assert_eq!(line, "ls -la");
        assert!(!buffer.has_input_region());
        buffer.append_output([StyledRun::plain("\n")]);
        assert_eq!(buffer.plain_text(), "$ ls -la\n");
        assert_eq!(buffer.history().entries(), &["ls -la"]);
    }

    #[test]
    fn test_history_round_trip() {
        let mut buffer = LineBuffer::default();
        for cmd in ["a", "b", "c"] {
            buffer.begin_input_region();
            buffer.insert_input_str(cmd);
            buffer.commit_input_line();
        }
        buffer.begin_input_region();
        let mut recalled = Vec::new();
        for _ in 0..4 {
            buffer.recall_history(HistoryDirection::Older);
            recalled.push(buffer.input_text().to_string());
        }
        assert_eq!(recalled, vec!["c", "b", "a", "a"]);

        buffer.recall_history(HistoryDirection::Newer);
        assert_eq!(buffer.input_text(), "b");
        buffer.recall_history(HistoryDirection::Newer);
        buffer.recall_history(HistoryDirection::Newer);
        assert_eq!(buffer.input_text(), "");
        assert_eq!(buffer.history().cursor(), buffer.history().len());
    }

    #[test]
    fn test_clear_keeps_history() {
        let mut buffer = LineBuffer::default();
        buffer.begin_input_region();
        buffer.insert_input_str("echo hi");
        buffer.commit_input_line();
        buffer.append_output([StyledRun::plain("\nhi\n")]);
        buffer.clear();
        assert_eq!(buffer.plain_text(), "");
        assert_eq!(buffer.row_count(), 1);
        assert_eq!(buffer.history().len(), 1);
        assert_eq!(buffer.history().cursor(), 1);
    }

    #[test]
    fn test_output_while_typing_keeps_input_last() {
        let mut buffer = LineBuffer::default();
        buffer.begin_input_region();
        buffer.insert_input_str("typed");
        buffer.append_output([StyledRun::plain("async\n")]);
        let rows = buffer.snapshot_rows();
        assert_eq!(row_text(&rows[0]), "async");
        assert_eq!(row_text(&rows[1]), "typed");
    }

    #[test]
    fn test_status_line_starts_fresh_row() {
        let yellow = Style::with_fg(Rgb::new(255, 255, 0));
        let mut buffer = LineBuffer::default();
        buffer.append_output([StyledRun::plain("partial")]);
        buffer.append_status("done", yellow);
        assert_eq!(buffer.plain_text(), "partial\ndone\n");
        assert_eq!(buffer.snapshot_rows()[1], vec![StyledRun::new("done", yellow)]);
    }
}
