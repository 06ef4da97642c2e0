//! Crossterm key events to terminal keystrokes.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Keystroke string for a key press, as a terminal would send it.
///
/// Returns `None` for releases and for keys with no terminal encoding.
#[must_use]
pub fn key_to_input(key: &KeyEvent) -> Option<String> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    let seq = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let lower = c.to_ascii_lowercase();
            if !lower.is_ascii_lowercase() {
                return None;
            }
            // Ctrl+A is 0x01 through Ctrl+Z at 0x1a
            char::from(lower as u8 - b'a' + 1).to_string()
        }
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "\r".into(),
        KeyCode::Backspace => "\x7f".into(),
        KeyCode::Tab => "\t".into(),
        KeyCode::Esc => "\x1b".into(),
        KeyCode::Up => "\x1b[A".into(),
        KeyCode::Down => "\x1b[B".into(),
        KeyCode::Right => "\x1b[C".into(),
        KeyCode::Left => "\x1b[D".into(),
        KeyCode::Home => "\x1b[H".into(),
        KeyCode::End => "\x1b[F".into(),
        KeyCode::PageUp => "\x1b[5~".into(),
        KeyCode::PageDown => "\x1b[6~".into(),
        KeyCode::Delete => "\x1b[3~".into(),
        KeyCode::Insert => "\x1b[2~".into(),
        KeyCode::F(n @ 1..=4) => format!("\x1bO{}", char::from(b'P' + n - 1)),
        KeyCode::F(n) => {
            let code = match n {
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
            format!("\x1b[{code}~")
        }
        _ => return None,
    };
    Some(seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_control_chars() {
        let ctrl_c = press(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_to_input(&ctrl_c).as_deref(), Some("\x03"));
        let ctrl_h = press(KeyCode::Char('H'), KeyModifiers::CONTROL);
        assert_eq!(key_to_input(&ctrl_h).as_deref(), Some("\x08"));
    }

    #[test]
    fn test_editing_keys() {
        assert_eq!(
            key_to_input(&press(KeyCode::Enter, KeyModifiers::NONE)).as_deref(),
            Some("\r")
        );
        assert_eq!(
            key_to_input(&press(KeyCode::Backspace, KeyModifiers::NONE)).as_deref(),
            Some("\x7f")
        );
        assert_eq!(
            key_to_input(&press(KeyCode::Char('é'), KeyModifiers::NONE)).as_deref(),
            Some("é")
        );
    }

    #[test]
    fn test_function_keys() {
        assert_eq!(
            key_to_input(&press(KeyCode::F(1), KeyModifiers::NONE)).as_deref(),
            Some("\x1bOP")
        );
        assert_eq!(
            key_to_input(&press(KeyCode::F(12), KeyModifiers::NONE)).as_deref(),
            Some("\x1b[24~")
        );
        assert_eq!(key_to_input(&press(KeyCode::F(13), KeyModifiers::NONE)), None);
    }
}
