//! ANSI escape sequence interpreter
//!
//! Turns decoded process output into styled runs. The parser is a
//! character-level state machine, so a sequence split across two `consume`
//! calls resumes exactly where it stopped.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::style::{color_256, Rgb, Style, StyleFlags, StyledRun, BRIGHT_COLORS, STANDARD_COLORS};

/// Longest OSC payload kept; anything beyond is dropped
const MAX_OSC_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    OscString,
    EscapeInOsc, // ESC received within OSC, waiting for backslash
}

/// Style mutation bound to one SGR code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SgrOp {
    Reset,
    Set(StyleFlags),
    Clear(StyleFlags),
    Fg(Rgb),
    Bg(Rgb),
    DefaultFg,
    DefaultBg,
    /// 38: followed by `5;N` or `2;R;G;B`
    ExtendedFg,
    /// 48: followed by `5;N` or `2;R;G;B`
    ExtendedBg,
}

impl SgrOp {
    fn apply(self, style: &mut Style) {
        match self {
            SgrOp::Reset => *style = Style::default(),
            SgrOp::Set(flags) => style.flags |= flags,
            SgrOp::Clear(flags) => style.flags &= !flags,
            SgrOp::Fg(color) => style.fg = Some(color),
            SgrOp::Bg(color) => style.bg = Some(color),
            SgrOp::DefaultFg => style.fg = None,
            SgrOp::DefaultBg => style.bg = None,
            SgrOp::ExtendedFg | SgrOp::ExtendedBg => {}
        }
    }
}

/// Code -> operation table for every recognized SGR parameter.
/// Codes missing from the table are ignored.
fn sgr_table() -> &'static HashMap<u16, SgrOp> {
    static TABLE: OnceLock<HashMap<u16, SgrOp>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(0, SgrOp::Reset);
        table.insert(1, SgrOp::Set(StyleFlags::BOLD));
        table.insert(22, SgrOp::Clear(StyleFlags::BOLD));
        table.insert(3, SgrOp::Set(StyleFlags::ITALIC));
        table.insert(23, SgrOp::Clear(StyleFlags::ITALIC));
        table.insert(4, SgrOp::Set(StyleFlags::UNDERLINE));
        table.insert(24, SgrOp::Clear(StyleFlags::UNDERLINE));
        for (i, color) in (0u16..).zip(STANDARD_COLORS) {
            table.insert(30 + i, SgrOp::Fg(color));
            table.insert(40 + i, SgrOp::Bg(color));
        }
        for (i, color) in (0u16..).zip(BRIGHT_COLORS) {
            table.insert(90 + i, SgrOp::Fg(color));
            table.insert(100 + i, SgrOp::Bg(color));
        }
        table.insert(38, SgrOp::ExtendedFg);
        table.insert(48, SgrOp::ExtendedBg);
        table.insert(39, SgrOp::DefaultFg);
        table.insert(49, SgrOp::DefaultBg);
        table
    })
}

/// Read the arguments of an extended color (`5;N` or `2;R;G;B`).
/// Missing or out-of-range arguments yield `None`.
fn extended_color<'a>(args: &mut impl Iterator<Item = &'a u16>) -> Option<Rgb> {
    match args.next().copied()? {
        5 => {
            let index = *args.next()?;
            u8::try_from(index).ok().map(color_256)
        }
        2 => {
            let r = u8::try_from(*args.next()?).ok()?;
            let g = u8::try_from(*args.next()?).ok()?;
            let b = u8::try_from(*args.next()?).ok()?;
            Some(Rgb::new(r, g, b))
        }
        _ => None,
    }
}

/// Incremental ANSI interpreter
#[derive(Debug, Default)]
pub struct AnsiInterpreter {
    state: ParserState,
    style: Style,
    params: Vec<u16>,
    current_param: Option<u16>,
    /// Private markers and intermediate bytes of the CSI in progress
    intermediates: Vec<char>,
    osc_string: String,
    title: Option<String>,
    /// Text seen in the current call but not emitted yet
    pending: String,
}

impl AnsiInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of decoded output and collect the runs it completes
    pub fn consume(&mut self, text: &str) -> Vec<StyledRun> {
        let mut runs = Vec::new();
        for ch in text.chars() {
            self.feed(ch, &mut runs);
        }
        self.flush(&mut runs);
        runs
    }

    /// Back to the default style, dropping any half-read sequence
    pub fn reset(&mut self) {
        *self = Self {
            title: self.title.take(),
            ..Self::default()
        };
    }

    /// Style applied to the next emitted text
    pub fn current_style(&self) -> Style {
        self.style
    }

    /// Whether a sequence is partially buffered
    pub fn in_sequence(&self) -> bool {
        self.state != ParserState::Ground
    }

    /// Last window title set through OSC 0 or OSC 2
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    fn feed(&mut self, ch: char, runs: &mut Vec<StyledRun>) {
        // ESC restarts a sequence from anywhere except inside OSC
        if ch == '\x1b' && !matches!(self.state, ParserState::OscString | ParserState::EscapeInOsc) {
            self.enter_escape();
            return;
        }

        match self.state {
            ParserState::Ground => self.pending.push(ch),
            ParserState::Escape => self.escape(ch),
            ParserState::EscapeIntermediate => self.escape_intermediate(ch),
            ParserState::Csi => self.csi(ch, runs),
            ParserState::OscString => self.osc_string_state(ch),
            ParserState::EscapeInOsc => self.escape_in_osc(ch),
        }
    }

    fn flush(&mut self, runs: &mut Vec<StyledRun>) {
        if !self.pending.is_empty() {
            runs.push(StyledRun::new(std::mem::take(&mut self.pending), self.style));
        }
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
    }

    fn escape(&mut self, ch: char) {
        match ch {
            '[' => self.state = ParserState::Csi,
            ']' => {
                self.osc_string.clear();
                self.state = ParserState::OscString;
            }
            'c' => {
                // RIS - full reset
                self.style = Style::default();
                self.state = ParserState::Ground;
            }
            '\x20'..='\x2f' => self.state = ParserState::EscapeIntermediate,
            _ => self.state = ParserState::Ground,
        }
    }

    fn escape_intermediate(&mut self, ch: char) {
        // Charset designations and similar; swallowed
        if !('\x20'..='\x2f').contains(&ch) {
            self.state = ParserState::Ground;
        }
    }

    fn csi(&mut self, ch: char, runs: &mut Vec<StyledRun>) {
        match ch {
            '0'..='9' => {
                let digit = ch as u16 - '0' as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            ';' | ':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
            }
            '<'..='?' | '\x20'..='\x2f' => self.intermediates.push(ch),
            '\x40'..='\x7e' => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                self.execute_csi(ch, runs);
                self.state = ParserState::Ground;
            }
            // CAN / SUB abort the sequence
            '\x18' | '\x1a' => self.state = ParserState::Ground,
            // Other controls inside a sequence are executed, i.e. passed on as text
            c if c.is_control() => self.pending.push(c),
            _ => self.state = ParserState::Ground,
        }
    }

    fn execute_csi(&mut self, final_char: char, runs: &mut Vec<StyledRun>) {
        if final_char == 'm' && self.intermediates.is_empty() {
            let mut style = self.style;
            apply_sgr(&self.params, &mut style);
            if style != self.style {
                self.flush(runs);
                self.style = style;
            }
            return;
        }

        // Erase-in-line (K), cursor movement and the rest carry no style
        tracing::trace!(
            params = ?self.params,
            final_char = %final_char,
            "Ignoring CSI sequence"
        );
    }

    fn osc_string_state(&mut self, ch: char) {
        match ch {
            '\x07' | '\u{9c}' => {
                self.execute_osc();
                self.state = ParserState::Ground;
            }
            '\x1b' => self.state = ParserState::EscapeInOsc,
            _ => {
                if self.osc_string.len() < MAX_OSC_LEN {
                    self.osc_string.push(ch);
                }
            }
        }
    }

    fn escape_in_osc(&mut self, ch: char) {
        self.execute_osc();
        if ch == '\\' {
            // ST (ESC \) - String Terminator
            self.state = ParserState::Ground;
        } else {
            // Not ST: the ESC starts a new sequence
            self.enter_escape();
            self.escape(ch);
        }
    }

    fn execute_osc(&mut self) {
        if let Some((code, text)) = self.osc_string.split_once(';') {
            if code == "0" || code == "2" {
                self.title = Some(text.to_string());
            }
        }
        self.osc_string.clear();
    }
}

/// Apply SGR parameters left to right; later codes override earlier ones
fn apply_sgr(params: &[u16], style: &mut Style) {
    if params.is_empty() {
        *style = Style::default();
        return;
    }

    let table = sgr_table();
    let mut iter = params.iter();
    while let Some(code) = iter.next() {
        match table.get(code) {
            Some(SgrOp::ExtendedFg) => {
                if let Some(color) = extended_color(&mut iter) {
                    style.fg = Some(color);
                }
            }
            Some(SgrOp::ExtendedBg) => {
                if let Some(color) = extended_color(&mut iter) {
                    style.bg = Some(color);
                }
            }
            Some(op) => op.apply(style),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::style::coalesce_runs;

    fn red() -> Rgb {
        Rgb::new(128, 0, 0)
    }

    fn consume_chunks(chunks: &[&str]) -> Vec<StyledRun> {
        let mut interp = AnsiInterpreter::new();
        let mut runs = Vec::new();
        for chunk in chunks {
            runs.extend(interp.consume(chunk));
        }
        coalesce_runs(runs)
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut interp = AnsiInterpreter::new();
        let runs = interp.consume("hello\r\nworld");
        assert_eq!(runs, vec![StyledRun::plain("hello\r\nworld")]);
    }

    #[test]
    fn test_sgr_red_then_reset() {
        let runs = consume_chunks(&["\x1b[31mRED\x1b[0m after"]);
        assert_eq!(
            runs,
            vec![
                StyledRun::new("RED", Style::with_fg(red())),
                StyledRun::plain(" after"),
            ]
        );
    }

    #[test]
    fn test_split_sequence_resumes() {
        let runs = consume_chunks(&["\x1b[3", "1mRED\x1b[0m"]);
        assert_eq!(runs, vec![StyledRun::new("RED", Style::with_fg(red()))]);
    }

    #[test]
    fn test_every_split_point_matches_whole_stream() {
        let stream = "a\x1b[1;31mb\x1b[38;5;196mcd\x1b[0m\x1b]0;title\x07e\x1b[4mf\x1b[24mg\x1b[Kh";
        let whole = consume_chunks(&[stream]);
        let boundaries: Vec<usize> = stream.char_indices().map(|(i, _)| i).collect();
        for &i in &boundaries {
            for &j in boundaries.iter().filter(|&&j| j >= i) {
                let split = consume_chunks(&[&stream[..i], &stream[i..j], &stream[j..]]);
                assert_eq!(split, whole, "split at {} and {}", i, j);
            }
        }
    }

    #[test]
    fn test_incomplete_sequence_is_buffered() {
        let mut interp = AnsiInterpreter::new();
        assert_eq!(interp.consume("ab\x1b[38;5"), vec![StyledRun::plain("ab")]);
        assert!(interp.in_sequence());
        let runs = interp.consume(";196mX");
        assert_eq!(runs, vec![StyledRun::new("X", Style::with_fg(Rgb::new(255, 0, 0)))]);
    }

    #[test]
    fn test_256_color_indices() {
        let cases = [
            (16u16, Rgb::new(0, 0, 0)),
            (21, Rgb::new(0, 0, 255)),
            (196, Rgb::new(255, 0, 0)),
            (231, Rgb::new(255, 255, 255)),
            (232, Rgb::new(8, 8, 8)),
            (255, Rgb::new(238, 238, 238)),
        ];
        for (index, expected) in cases {
            let mut interp = AnsiInterpreter::new();
            let runs = interp.consume(&format!("\x1b[38;5;{}mX", index));
            assert_eq!(runs[0].style().fg, Some(expected), "index {}", index);
        }
    }

    #[test]
    fn test_true_color_background() {
        let mut interp = AnsiInterpreter::new();
        let runs = interp.consume("\x1b[48;2;10;20;30mX");
        assert_eq!(runs[0].style().bg, Some(Rgb::new(10, 20, 30)));
        assert_eq!(runs[0].style().fg, None);
    }

    #[test]
    fn test_attribute_toggles() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[1;3;4m");
        let style = interp.current_style();
        assert!(style.bold() && style.italic() && style.underline());

        interp.consume("\x1b[22;23m");
        let style = interp.current_style();
        assert!(!style.bold() && !style.italic() && style.underline());

        interp.consume("\x1b[24m");
        assert!(interp.current_style().is_default());
    }

    #[test]
    fn test_last_write_wins_within_sequence() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[31;32;94;41m");
        let style = interp.current_style();
        assert_eq!(style.fg, Some(BRIGHT_COLORS[4]));
        assert_eq!(style.bg, Some(STANDARD_COLORS[1]));
    }

    #[test]
    fn test_bright_backgrounds() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[107m");
        assert_eq!(interp.current_style().bg, Some(Rgb::new(255, 255, 255)));
    }

    #[test]
    fn test_unknown_codes_are_ignored() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[1m\x1b[5;7;9;53m");
        let style = interp.current_style();
        assert!(style.bold());
        assert_eq!(style.fg, None);
    }

    #[test]
    fn test_reset_restores_default_exactly() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[1;3;4;31;42m\x1b[0m");
        assert!(interp.current_style().is_default());
        interp.consume("\x1b[33m\x1b[m");
        assert!(interp.current_style().is_default());
    }

    #[test]
    fn test_erase_line_and_cursor_sequences_swallowed() {
        let runs = consume_chunks(&["a\x1b[K", "b\x1b[2J\x1b[?25lc\x1b[10;5H"]);
        assert_eq!(runs, vec![StyledRun::plain("abc")]);
    }

    #[test]
    fn test_private_sgr_is_not_style() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[>4;2m");
        assert!(interp.current_style().is_default());
    }

    #[test]
    fn test_osc_title_captured() {
        let mut interp = AnsiInterpreter::new();
        let runs = interp.consume("\x1b]0;my shell\x07$ ");
        assert_eq!(runs, vec![StyledRun::plain("$ ")]);
        assert_eq!(interp.title(), Some("my shell"));

        let runs = interp.consume("\x1b]2;other\x1b\\x");
        assert_eq!(runs, vec![StyledRun::plain("x")]);
        assert_eq!(interp.title(), Some("other"));
    }

    #[test]
    fn test_incomplete_extended_color_ignored() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[38;2;10m");
        assert_eq!(interp.current_style().fg, None);
        interp.consume("\x1b[38;5;300m");
        assert_eq!(interp.current_style().fg, None);
    }

    #[test]
    fn test_reset_drops_partial_sequence() {
        let mut interp = AnsiInterpreter::new();
        interp.consume("\x1b[31mx\x1b[4");
        interp.reset();
        assert!(!interp.in_sequence());
        assert_eq!(interp.consume("2m"), vec![StyledRun::plain("2m")]);
    }
}
