//! Frame rendering: turns the emulator grid into one string with embedded
//! SGR sequences, emitting a sequence only where the style changes.

use std::fmt::Write;

use super::emulator::{display_char, Cell, Color, Cursor, VtEmulator};

const RESET: &str = "\x1b[0m";

/// Visual style of one rendered cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Style {
    fg: Color,
    bg: Color,
    bold: bool,
    underline: bool,
    inverse: bool,
}

impl Style {
    fn of(cell: &Cell) -> Self {
        Self {
            fg: cell.fg,
            bg: cell.bg,
            bold: cell.bold,
            underline: cell.underline,
            inverse: cell.inverse,
        }
    }

    /// Reverse-video version used for the cursor cell. Default-on-default has
    /// nothing to swap, so SGR 7 is used instead.
    fn cursor(mut self) -> Self {
        if self.inverse {
            self.inverse = false;
        } else if self.fg == Color::Default && self.bg == Color::Default {
            self.inverse = true;
        } else {
            std::mem::swap(&mut self.fg, &mut self.bg);
        }
        self
    }

    fn is_plain(&self) -> bool {
        *self == Style::default()
    }

    fn write_sgr(&self, out: &mut String) {
        out.push_str("\x1b[0");
        if self.bold {
            out.push_str(";1");
        }
        if self.underline {
            out.push_str(";4");
        }
        if self.inverse {
            out.push_str(";7");
        }
        write_color(out, self.fg, 30, 90, 38);
        write_color(out, self.bg, 40, 100, 48);
        out.push('m');
    }
}

fn write_color(out: &mut String, color: Color, base: u8, bright: u8, extended: u8) {
    // Writing into a String cannot fail.
    let _ = match color {
        Color::Default => Ok(()),
        Color::Indexed(n) if n < 8 => write!(out, ";{}", base + n),
        Color::Indexed(n) if n < 16 => write!(out, ";{}", bright + n - 8),
        Color::Indexed(n) => write!(out, ";{};5;{}", extended, n),
        Color::Rgb(r, g, b) => write!(out, ";{};2;{};{};{}", extended, r, g, b),
    };
}

/// Render the full grid: `rows` lines joined by `\n`, each exactly `cols`
/// display columns wide. The cursor cell is drawn in reverse video when visible.
pub fn render_frame(emulator: &VtEmulator) -> String {
    let (cols, rows) = emulator.size();
    let cursor = emulator.cursor_visible().then(|| emulator.cursor());
    let mut out = String::with_capacity((cols + 1) * rows * 2);

    for y in 0..rows {
        if y > 0 {
            out.push('\n');
        }
        let Some(row) = emulator.row(y) else { continue };
        let mut current = Style::default();
        for (x, cell) in row.iter().enumerate() {
            let Some(ch) = display_char(row, x) else { continue };
            let mut style = Style::of(cell);
            if cursor == Some(Cursor { x, y }) {
                style = style.cursor();
            }
            if style != current {
                if style.is_plain() {
                    out.push_str(RESET);
                } else {
                    style.write_sgr(&mut out);
                }
                current = style;
            }
            out.push(ch);
        }
        if !current.is_plain() {
            out.push_str(RESET);
        }
    }

    out
}

#[cfg(test)]
pub(crate) fn strip_sgr(frame: &str) -> String {
    let mut out = String::with_capacity(frame.len());
    let mut chars = frame.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            for c in chars.by_ref() {
                if c == 'm' {
                    break;
                }
            }
        } else {
            out.push(ch);
        }
    }
    out
}
