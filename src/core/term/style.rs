//! Text styles and styled runs
//!
//! A `Style` is what the interpreter applies to text that has not been
//! emitted yet; a `StyledRun` is an immutable span of text sharing one style.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StyleFlags: u8 {
        const BOLD      = 0b0001;
        const ITALIC    = 0b0010;
        const UNDERLINE = 0b0100;
    }
}

/// Rendering style of a run. `None` colors inherit the terminal defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Style {
    pub fg: Option<Rgb>,
    pub bg: Option<Rgb>,
    pub flags: StyleFlags,
}

impl Style {
    /// Style with only a foreground color set
    pub fn with_fg(color: Rgb) -> Self {
        Self {
            fg: Some(color),
            ..Self::default()
        }
    }

    pub fn bold(&self) -> bool {
        self.flags.contains(StyleFlags::BOLD)
    }

    pub fn italic(&self) -> bool {
        self.flags.contains(StyleFlags::ITALIC)
    }

    pub fn underline(&self) -> bool {
        self.flags.contains(StyleFlags::UNDERLINE)
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// An immutable (text, style) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    text: String,
    style: Style,
}

impl StyledRun {
    pub fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }

    /// Run in the terminal's default style
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Style::default())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Same text, different style
    pub fn restyled(&self, style: Style) -> Self {
        Self::new(self.text.clone(), style)
    }

    /// New run holding this run's text followed by `other`'s.
    /// Only meaningful when both styles are equal.
    pub(crate) fn joined(&self, other: &StyledRun) -> Self {
        let mut text = String::with_capacity(self.text.len() + other.text.len());
        text.push_str(&self.text);
        text.push_str(&other.text);
        Self::new(text, self.style)
    }
}

/// Merge adjacent runs sharing a style and drop empty runs.
///
/// Output chunking decides where the interpreter cuts runs; coalescing makes
/// the result independent of those cuts.
pub fn coalesce_runs(runs: impl IntoIterator<Item = StyledRun>) -> Vec<StyledRun> {
    let mut out: Vec<StyledRun> = Vec::new();
    for run in runs {
        push_coalesced(&mut out, run);
    }
    out
}

/// Append `run`, joining it to the last run when the styles match
pub fn push_coalesced(runs: &mut Vec<StyledRun>, run: StyledRun) {
    if run.is_empty() {
        return;
    }
    match runs.last_mut() {
        Some(last) if last.style == run.style => *last = last.joined(&run),
        _ => runs.push(run),
    }
}

/// Standard ("dark") palette for SGR 30-37 / 40-47
pub const STANDARD_COLORS: [Rgb; 8] = [
    Rgb::new(0, 0, 0),
    Rgb::new(128, 0, 0),
    Rgb::new(0, 128, 0),
    Rgb::new(128, 128, 0),
    Rgb::new(0, 0, 128),
    Rgb::new(128, 0, 128),
    Rgb::new(0, 128, 128),
    Rgb::new(192, 192, 192),
];

/// Bright palette for SGR 90-97 / 100-107
pub const BRIGHT_COLORS: [Rgb; 8] = [
    Rgb::new(128, 128, 128),
    Rgb::new(255, 0, 0),
    Rgb::new(0, 255, 0),
    Rgb::new(255, 255, 0),
    Rgb::new(0, 0, 255),
    Rgb::new(255, 0, 255),
    Rgb::new(0, 255, 255),
    Rgb::new(255, 255, 255),
];

/// Resolve an index of the xterm 256-color palette.
///
/// 0-15 are the standard and bright colors, 16-231 the 6x6x6 cube and
/// 232-255 a 24-step grayscale ramp.
pub fn color_256(index: u8) -> Rgb {
    match index {
        0..=7 => STANDARD_COLORS[index as usize],
        8..=15 => BRIGHT_COLORS[(index - 8) as usize],
        16..=231 => {
            let n = index - 16;
            Rgb::new((n / 36) * 51, ((n % 36) / 6) * 51, (n % 6) * 51)
        }
        232..=255 => {
            let gray = 8 + (index - 232) * 10;
            Rgb::new(gray, gray, gray)
        }
    }
}
