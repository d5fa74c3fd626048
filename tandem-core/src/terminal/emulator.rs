use unicode_width::UnicodeWidthChar;
use vte::{Params, Parser, Perform};

/// VT100/ANSI escape sequence parser wrapping `vte` crate.
/// Tracks cursor position, text attributes, and screen content.
///
/// Only the subset interactive shells rely on is interpreted; anything else
/// is consumed by the parser and dropped.
pub struct VtEmulator {
    parser: Parser,
    screen: Screen,
}

/// A single cell in the terminal grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub underline: bool,
    /// Reverse video on default colors, where swapping fg/bg has no effect.
    pub inverse: bool,
    /// Display columns: 1 for normal characters, 2 for the left half of a
    /// wide character, 0 for the right half placeholder.
    pub width: u8,
}

/// Terminal color representation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// Cursor position, zero-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub x: usize,
    pub y: usize,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: Color::Default,
            bg: Color::Default,
            bold: false,
            underline: false,
            inverse: false,
            width: 1,
        }
    }
}

impl VtEmulator {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            parser: Parser::new(),
            screen: Screen::new(cols.max(1), rows.max(1)),
        }
    }

    /// Feed raw bytes from PTY into the VT parser.
    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.screen, bytes);
    }

    /// Resize the emulator grid.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.screen.resize(cols.max(1), rows.max(1));
    }

    /// Grid dimensions as `(cols, rows)`.
    pub fn size(&self) -> (usize, usize) {
        (self.screen.cols, self.screen.rows)
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<&Cell> {
        self.screen.cells.get(y).and_then(|row| row.get(x))
    }

    pub fn row(&self, y: usize) -> Option<&[Cell]> {
        self.screen.cells.get(y).map(Vec::as_slice)
    }

    pub fn cursor(&self) -> Cursor {
        self.screen.cursor
    }

    pub fn cursor_visible(&self) -> bool {
        self.screen.cursor_visible
    }

    /// Get the text content of a specific line.
    pub fn line_text(&self, row: usize) -> String {
        self.screen
            .cells
            .get(row)
            .map(|cells| (0..cells.len()).filter_map(|x| display_char(cells, x)).collect())
            .unwrap_or_default()
    }
}

/// Character drawn for cell `x` of a row, or `None` for the right half of an
/// intact wide character. A wide character whose pair was broken by erase or
/// resize is drawn as a blank, so every row spans exactly its cell count.
pub fn display_char(row: &[Cell], x: usize) -> Option<char> {
    let cell = row.get(x)?;
    match cell.width {
        0 if x > 0 && row[x - 1].width == 2 => None,
        0 => Some(' '),
        2 if row.get(x + 1).map(|c| c.width) == Some(0) => Some(cell.ch),
        2 => Some(' '),
        _ => Some(cell.ch),
    }
}

/// Current graphic rendition applied to printed characters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Pen {
    fg: Color,
    bg: Color,
    bold: bool,
    underline: bool,
    reverse: bool,
}

impl Pen {
    fn cell(&self, ch: char, width: u8) -> Cell {
        let plain = self.fg == Color::Default && self.bg == Color::Default;
        let (fg, bg) = if self.reverse {
            (self.bg, self.fg)
        } else {
            (self.fg, self.bg)
        };
        Cell {
            ch,
            fg,
            bg,
            bold: self.bold,
            underline: self.underline,
            inverse: self.reverse && plain,
            width,
        }
    }
}

#[derive(Clone, Copy)]
struct SavedCursor {
    cursor: Cursor,
    pen: Pen,
}

/// Primary screen contents stashed while the alternate screen is active.
struct PrimaryScreen {
    cells: Vec<Vec<Cell>>,
    cursor: Cursor,
}

struct Screen {
    cols: usize,
    rows: usize,
    cells: Vec<Vec<Cell>>,
    cursor: Cursor,
    cursor_visible: bool,
    /// Set after printing into the last column; the wrap happens on the next print.
    wrap_pending: bool,
    autowrap: bool,
    pen: Pen,
    /// Inclusive scroll region rows.
    scroll_top: usize,
    scroll_bottom: usize,
    saved: Option<SavedCursor>,
    primary: Option<PrimaryScreen>,
}

impl Screen {
    fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            cells: blank_grid(cols, rows),
            cursor: Cursor::default(),
            cursor_visible: true,
            wrap_pending: false,
            autowrap: true,
            pen: Pen::default(),
            scroll_top: 0,
            scroll_bottom: rows - 1,
            saved: None,
            primary: None,
        }
    }

    fn resize(&mut self, cols: usize, rows: usize) {
        if let Some(primary) = self.primary.as_mut() {
            let shift = resize_grid(&mut primary.cells, cols, rows, primary.cursor.y);
            primary.cursor.y = (primary.cursor.y - shift).min(rows - 1);
            primary.cursor.x = primary.cursor.x.min(cols - 1);
        }
        let shift = resize_grid(&mut self.cells, cols, rows, self.cursor.y);
        self.cols = cols;
        self.rows = rows;
        self.cursor.y = (self.cursor.y - shift).min(rows - 1);
        self.cursor.x = self.cursor.x.min(cols - 1);
        self.wrap_pending = false;
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
    }

    fn goto(&mut self, x: usize, y: usize) {
        self.cursor.x = x.min(self.cols - 1);
        self.cursor.y = y.min(self.rows - 1);
        self.wrap_pending = false;
    }

    /// Write a cell, blanking the other half of any wide character it
    /// overwrites.
    fn put(&mut self, x: usize, y: usize, cell: Cell) {
        let row = &mut self.cells[y];
        if row[x].width == 0 && x > 0 && row[x - 1].width == 2 {
            row[x - 1] = Cell::default();
        }
        if row[x].width == 2 && x + 1 < row.len() {
            row[x + 1] = Cell::default();
        }
        row[x] = cell;
    }

    fn blank_row(&self) -> Vec<Cell> {
        vec![Cell::default(); self.cols]
    }

    fn scroll_up(&mut self, n: usize) {
        let (top, bottom) = (self.scroll_top, self.scroll_bottom);
        for _ in 0..n.min(bottom - top + 1) {
            self.cells.remove(top);
            self.cells.insert(bottom, self.blank_row());
        }
    }

    fn scroll_down(&mut self, n: usize) {
        let (top, bottom) = (self.scroll_top, self.scroll_bottom);
        for _ in 0..n.min(bottom - top + 1) {
            self.cells.remove(bottom);
            self.cells.insert(top, self.blank_row());
        }
    }

    fn linefeed(&mut self) {
        self.wrap_pending = false;
        if self.cursor.y == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor.y + 1 < self.rows {
            self.cursor.y += 1;
        }
    }

    fn reverse_index(&mut self) {
        self.wrap_pending = false;
        if self.cursor.y == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor.y > 0 {
            self.cursor.y -= 1;
        }
    }

    fn clear_cells(&mut self, y: usize, from: usize, to: usize) {
        if let Some(row) = self.cells.get_mut(y) {
            let to = to.min(row.len());
            for cell in row.iter_mut().take(to).skip(from) {
                *cell = Cell::default();
            }
        }
    }

    fn erase_display(&mut self, mode: u16) {
        let Cursor { x, y } = self.cursor;
        match mode {
            0 => {
                self.clear_cells(y, x, self.cols);
                for row in (y + 1)..self.rows {
                    self.clear_cells(row, 0, self.cols);
                }
            }
            1 => {
                for row in 0..y {
                    self.clear_cells(row, 0, self.cols);
                }
                self.clear_cells(y, 0, x + 1);
            }
            2 | 3 => {
                self.cells = blank_grid(self.cols, self.rows);
            }
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let Cursor { x, y } = self.cursor;
        match mode {
            0 => self.clear_cells(y, x, self.cols),
            1 => self.clear_cells(y, 0, x + 1),
            2 => self.clear_cells(y, 0, self.cols),
            _ => {}
        }
    }

    fn insert_lines(&mut self, n: usize) {
        let y = self.cursor.y;
        if y < self.scroll_top || y > self.scroll_bottom {
            return;
        }
        for _ in 0..n.min(self.scroll_bottom - y + 1) {
            self.cells.remove(self.scroll_bottom);
            self.cells.insert(y, self.blank_row());
        }
        self.cursor.x = 0;
        self.wrap_pending = false;
    }

    fn delete_lines(&mut self, n: usize) {
        let y = self.cursor.y;
        if y < self.scroll_top || y > self.scroll_bottom {
            return;
        }
        for _ in 0..n.min(self.scroll_bottom - y + 1) {
            self.cells.remove(y);
            self.cells.insert(self.scroll_bottom, self.blank_row());
        }
        self.cursor.x = 0;
        self.wrap_pending = false;
    }

    fn delete_chars(&mut self, n: usize) {
        let Cursor { x, y } = self.cursor;
        let cols = self.cols;
        let row = &mut self.cells[y];
        let end = (x + n).min(cols);
        row.drain(x..end);
        row.resize(cols, Cell::default());
        self.wrap_pending = false;
    }

    fn insert_chars(&mut self, n: usize) {
        let Cursor { x, y } = self.cursor;
        let cols = self.cols;
        let row = &mut self.cells[y];
        for _ in 0..n.min(cols - x) {
            row.insert(x, Cell::default());
        }
        row.truncate(cols);
        self.wrap_pending = false;
    }

    fn save_cursor(&mut self) {
        self.saved = Some(SavedCursor {
            cursor: self.cursor,
            pen: self.pen,
        });
    }

    fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved {
            self.pen = saved.pen;
            self.goto(saved.cursor.x, saved.cursor.y);
        }
    }

    fn enter_alternate_screen(&mut self) {
        if self.primary.is_some() {
            return;
        }
        let cells = std::mem::replace(&mut self.cells, blank_grid(self.cols, self.rows));
        self.primary = Some(PrimaryScreen {
            cells,
            cursor: self.cursor,
        });
        self.goto(0, 0);
    }

    fn leave_alternate_screen(&mut self) {
        if let Some(primary) = self.primary.take() {
            self.cells = primary.cells;
            self.goto(primary.cursor.x, primary.cursor.y);
        }
    }

    fn set_private_modes(&mut self, params: &Params, enable: bool) {
        for param in params.iter() {
            match param.first().copied().unwrap_or(0) {
                25 => self.cursor_visible = enable,
                7 => {
                    self.autowrap = enable;
                    if !enable {
                        self.wrap_pending = false;
                    }
                }
                1049 | 1047 | 47 => {
                    if enable {
                        self.enter_alternate_screen();
                    } else {
                        self.leave_alternate_screen();
                    }
                }
                _ => {}
            }
        }
    }

    fn set_graphic_rendition(&mut self, params: &Params) {
        let mut iter = params.iter();
        if params.iter().next().is_none() {
            self.pen = Pen::default();
            return;
        }
        while let Some(param) = iter.next() {
            let code = param.first().copied().unwrap_or(0);
            match code {
                0 => self.pen = Pen::default(),
                1 => self.pen.bold = true,
                4 => self.pen.underline = true,
                7 => self.pen.reverse = true,
                22 => self.pen.bold = false,
                24 => self.pen.underline = false,
                27 => self.pen.reverse = false,
                30..=37 => self.pen.fg = Color::Indexed((code - 30) as u8),
                38 => {
                    if let Some(color) = extended_color(param, &mut iter) {
                        self.pen.fg = color;
                    }
                }
                39 => self.pen.fg = Color::Default,
                40..=47 => self.pen.bg = Color::Indexed((code - 40) as u8),
                48 => {
                    if let Some(color) = extended_color(param, &mut iter) {
                        self.pen.bg = color;
                    }
                }
                49 => self.pen.bg = Color::Default,
                90..=97 => self.pen.fg = Color::Indexed((code - 90 + 8) as u8),
                100..=107 => self.pen.bg = Color::Indexed((code - 100 + 8) as u8),
                _ => {}
            }
        }
    }
}

/// Parse the `5;n` / `2;r;g;b` tail of an SGR 38/48 parameter, in either the
/// semicolon form (separate params) or the colon form (sub-params).
fn extended_color<'a, I>(param: &[u16], iter: &mut I) -> Option<Color>
where
    I: Iterator<Item = &'a [u16]>,
{
    if param.len() > 1 {
        return match param[1] {
            5 => param.get(2).map(|&n| Color::Indexed(n as u8)),
            2 => {
                // 38:2::r:g:b carries an (empty) color space id
                let rgb = if param.len() >= 6 { &param[3..] } else { &param[2..] };
                match rgb {
                    [r, g, b, ..] => Some(Color::Rgb(*r as u8, *g as u8, *b as u8)),
                    _ => None,
                }
            }
            _ => None,
        };
    }

    let mut next = || iter.next().and_then(|p| p.first().copied());
    match next()? {
        5 => next().map(|n| Color::Indexed(n as u8)),
        2 => {
            let (r, g, b) = (next()?, next()?, next()?);
            Some(Color::Rgb(r as u8, g as u8, b as u8))
        }
        _ => None,
    }
}

fn blank_grid(cols: usize, rows: usize) -> Vec<Vec<Cell>> {
    vec![vec![Cell::default(); cols]; rows]
}

/// Resize a grid in place. Rows are dropped from the top when the cursor
/// would otherwise fall off the bottom; returns how many were dropped.
fn resize_grid(cells: &mut Vec<Vec<Cell>>, cols: usize, rows: usize, cursor_row: usize) -> usize {
    let mut shift = 0;
    if cells.len() > rows && cursor_row >= rows {
        shift = cursor_row + 1 - rows;
        cells.drain(..shift);
    }
    cells.resize(rows, vec![Cell::default(); cols]);
    for row in cells.iter_mut() {
        row.resize(cols, Cell::default());
    }
    shift
}

impl Perform for Screen {
    fn print(&mut self, ch: char) {
        // Combining marks and other zero-width characters are dropped.
        let width = match ch.width() {
            Some(0) => return,
            Some(2) if self.cols >= 2 => 2,
            _ => 1,
        };

        if width == 2 && !self.wrap_pending && self.cursor.x + 1 >= self.cols {
            if self.autowrap {
                // No room for both halves: blank the last column and wrap.
                let Cursor { x, y } = self.cursor;
                self.put(x, y, Cell::default());
                self.wrap_pending = true;
            } else {
                self.cursor.x = self.cols - 2;
            }
        }
        if self.wrap_pending {
            self.cursor.x = 0;
            self.linefeed();
        }

        let Cursor { x, y } = self.cursor;
        let cell = self.pen.cell(ch, width as u8);
        if width == 2 {
            self.put(x + 1, y, Cell::default());
            self.put(x, y, cell);
            self.cells[y][x + 1] = Cell { ch: ' ', width: 0, ..cell };
        } else {
            self.put(x, y, cell);
        }

        if x + width >= self.cols {
            self.cursor.x = self.cols - 1;
            self.wrap_pending = self.autowrap;
        } else {
            self.cursor.x = x + width;
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            // Newline (LF, VT, FF)
            b'\n' | 0x0b | 0x0c => self.linefeed(),
            // Carriage return
            b'\r' => {
                self.cursor.x = 0;
                self.wrap_pending = false;
            }
            // Backspace
            0x08 => {
                self.cursor.x = self.cursor.x.saturating_sub(1);
                self.wrap_pending = false;
            }
            // Tab
            b'\t' => {
                let next_tab = (self.cursor.x / 8 + 1) * 8;
                self.goto(next_tab, self.cursor.y);
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if ignore {
            return;
        }
        if intermediates == [b'?'] {
            match action {
                'h' => self.set_private_modes(params, true),
                'l' => self.set_private_modes(params, false),
                _ => {}
            }
            return;
        }
        if !intermediates.is_empty() {
            return;
        }

        let args: Vec<u16> = params
            .iter()
            .map(|p| p.first().copied().unwrap_or(0))
            .collect();
        // Missing or zero parameters fall back to the sequence default.
        let arg = |i: usize, default: usize| match args.get(i) {
            Some(&0) | None => default,
            Some(&v) => v as usize,
        };
        let Cursor { x, y } = self.cursor;

        match action {
            // Cursor Up / Down / Forward / Back
            'A' => self.goto(x, y.saturating_sub(arg(0, 1))),
            'B' | 'e' => self.goto(x, y + arg(0, 1)),
            'C' | 'a' => self.goto(x + arg(0, 1), y),
            'D' => self.goto(x.saturating_sub(arg(0, 1)), y),
            // Cursor Next / Previous Line
            'E' => self.goto(0, y + arg(0, 1)),
            'F' => self.goto(0, y.saturating_sub(arg(0, 1))),
            // Cursor Horizontal Absolute
            'G' | '`' => self.goto(arg(0, 1) - 1, y),
            // Cursor Position
            'H' | 'f' => self.goto(arg(1, 1) - 1, arg(0, 1) - 1),
            // Line Position Absolute
            'd' => self.goto(x, arg(0, 1) - 1),
            'J' => self.erase_display(args.first().copied().unwrap_or(0)),
            'K' => self.erase_line(args.first().copied().unwrap_or(0)),
            'L' => self.insert_lines(arg(0, 1)),
            'M' => self.delete_lines(arg(0, 1)),
            'P' => self.delete_chars(arg(0, 1)),
            '@' => self.insert_chars(arg(0, 1)),
            // Erase Characters
            'X' => {
                let n = arg(0, 1);
                self.clear_cells(y, x, x + n);
                self.wrap_pending = false;
            }
            'S' => self.scroll_up(arg(0, 1)),
            'T' => self.scroll_down(arg(0, 1)),
            // Set scrolling region
            'r' => {
                let top = arg(0, 1) - 1;
                let bottom = arg(1, self.rows) - 1;
                if top < bottom && bottom < self.rows {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                    self.goto(0, 0);
                }
            }
            'm' => self.set_graphic_rendition(params),
            's' => self.save_cursor(),
            'u' => self.restore_cursor(),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        // Charset designations (ESC ( B and friends) carry intermediates.
        if !intermediates.is_empty() {
            return;
        }
        match byte {
            b'7' => self.save_cursor(),
            b'8' => self.restore_cursor(),
            b'D' => self.linefeed(),
            b'E' => {
                self.cursor.x = 0;
                self.linefeed();
            }
            b'M' => self.reverse_index(),
            b'c' => *self = Screen::new(self.cols, self.rows),
            _ => {}
        }
    }
}
