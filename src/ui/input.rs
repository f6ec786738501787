//! crossterm key events to controller keys

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use termbridge::{Key, Modifiers};

/// Convert modifier state
pub fn modifiers_from(mods: KeyModifiers) -> Modifiers {
    let mut result = Modifiers::empty();
    if mods.contains(KeyModifiers::SHIFT) {
        result |= Modifiers::SHIFT;
    }
    if mods.contains(KeyModifiers::CONTROL) {
        result |= Modifiers::CTRL;
    }
    if mods.contains(KeyModifiers::ALT) {
        result |= Modifiers::ALT;
    }
    result
}

/// Translate a key press. Releases, repeats of unknown keys and media keys
/// yield `None`.
pub fn translate_key(event: &KeyEvent) -> Option<(Key, Modifiers)> {
    if event.kind == KeyEventKind::Release {
        return None;
    }

    let key = match event.code {
        KeyCode::Char(ch) => Key::Char(ch),
        KeyCode::Enter => Key::Enter,
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Delete => Key::Delete,
        KeyCode::Insert => Key::Insert,
        KeyCode::Tab => Key::Tab,
        KeyCode::BackTab => Key::BackTab,
        KeyCode::Esc => Key::Esc,
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::F(n) => Key::F(n),
        _ => return None,
    };

    Some((key, modifiers_from(event.modifiers)))
}

/// Ctrl+Shift+<ch>, with crossterm reporting either case
pub fn is_ctrl_shift(event: &KeyEvent, ch: char) -> bool {
    let wanted = KeyModifiers::CONTROL | KeyModifiers::SHIFT;
    event.modifiers.contains(wanted)
        && matches!(event.code, KeyCode::Char(c) if c.eq_ignore_ascii_case(&ch))
}
