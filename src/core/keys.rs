//! Key model and mapping to terminal input
//!
//! The library keeps its own key type so hosts can feed keystrokes from any
//! windowing or terminal toolkit. `KeyMapper` converts keys to the VT byte
//! sequences a program running on a PTY expects.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

/// A logical key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Delete,
    Insert,
    Tab,
    BackTab,
    Esc,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    F(u8),
}

/// Bytes sent for Enter in interactive mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnterSequence {
    #[default]
    Cr,
    CrLf,
}

impl EnterSequence {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            EnterSequence::Cr => b"\r",
            EnterSequence::CrLf => b"\r\n",
        }
    }
}

/// Key mapper for converting keys to bytes
pub struct KeyMapper;

impl KeyMapper {
    /// Map a key to the bytes written to the child, or `None` for keys with
    /// no terminal encoding
    pub fn map(key: Key, mods: Modifiers, enter: EnterSequence) -> Option<Vec<u8>> {
        match key {
            Key::Char(ch) => Some(Self::map_char(ch, mods)),
            Key::Enter => Some(enter.as_bytes().to_vec()),
            Key::Backspace => {
                if mods.contains(Modifiers::ALT) {
                    Some(vec![0x1B, 0x7F])
                } else {
                    Some(vec![0x7F])
                }
            }
            Key::Tab if mods.contains(Modifiers::SHIFT) => Some(b"\x1b[Z".to_vec()),
            Key::Tab => Some(vec![0x09]),
            Key::BackTab => Some(b"\x1b[Z".to_vec()),
            Key::Esc => Some(vec![0x1B]),

            Key::Up => Some(Self::cursor_key(b'A', mods)),
            Key::Down => Some(Self::cursor_key(b'B', mods)),
            Key::Right => Some(Self::cursor_key(b'C', mods)),
            Key::Left => Some(Self::cursor_key(b'D', mods)),
            Key::Home => Some(Self::cursor_key(b'H', mods)),
            Key::End => Some(Self::cursor_key(b'F', mods)),

            Key::PageUp => Some(Self::tilde_key(5, mods)),
            Key::PageDown => Some(Self::tilde_key(6, mods)),
            Key::Insert => Some(Self::tilde_key(2, mods)),
            Key::Delete => Some(Self::tilde_key(3, mods)),

            Key::F(n) => Self::function_key(n, mods),
        }
    }

    /// Control code for Ctrl+`ch`, if there is one
    pub fn ctrl_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | '`' | ' ' => Some(0x00),
            '[' => Some(0x1B),
            '\\' => Some(0x1C),
            ']' => Some(0x1D),
            '^' | '~' => Some(0x1E),
            '_' | '?' => Some(0x1F),
            _ => None,
        }
    }

    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        if ctrl {
            if let Some(code) = Self::ctrl_code(ch) {
                return if alt { vec![0x1B, code] } else { vec![code] };
            }
        }

        let mut bytes = Vec::with_capacity(5);
        if alt {
            bytes.push(0x1B);
        }
        let mut utf8 = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
        bytes
    }

    /// Arrows, Home and End: `ESC [ X` or `ESC [ 1 ; mod X`
    fn cursor_key(key: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            vec![0x1B, b'[', key]
        } else {
            format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
        }
    }

    /// PageUp, PageDown, Insert, Delete
    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, Self::modifier_code(mods)).into_bytes()
        }
    }

    fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
        // F1-F4 are SS3 keys, the rest use tilde codes
        let tilde = match n {
            1..=4 => {
                let key = b"PQRS"[(n - 1) as usize];
                return Some(if mods.is_empty() {
                    vec![0x1B, b'O', key]
                } else {
                    format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
                });
            }
            5 => 15,
            6 => 17,
            7 => 18,
            8 => 19,
            9 => 20,
            10 => 21,
            11 => 23,
            12 => 24,
            _ => return None,
        };
        Some(Self::tilde_key(tilde, mods))
    }

    /// xterm modifier parameter
    fn modifier_code(mods: Modifiers) -> u8 {
        1 + if mods.contains(Modifiers::SHIFT) { 1 } else { 0 }
            + if mods.contains(Modifiers::ALT) { 2 } else { 0 }
            + if mods.contains(Modifiers::CTRL) { 4 } else { 0 }
    }
}
