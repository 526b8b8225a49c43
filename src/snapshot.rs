//! Buffer snapshot: the materialized view of a session's terminal (§3) and
//! its binary wire encoding, version 1 (§6).
//!
//! The header is fixed at 32 bytes. The named fields in §6 (magic, version,
//! flags, cols, rows, `viewportY`, cursorX, cursorY, reserved) sum to 28
//! bytes; this implementation pads with a second reserved `u32` to reach
//! the declared 32-byte total (see DESIGN.md).
//!
//! Per-cell width (§3: `width ∈ {0,1,2}`) is a rendering concern derived
//! from the character itself; it is not part of the wire format in §6, so
//! it round-trips through `encode`/`decode` as a best-effort default rather
//! than a transmitted field (see DESIGN.md).

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire format version this module implements.
pub const WIRE_VERSION: u8 = 1;

const MAGIC: u16 = 0x5654;
const HEADER_LEN: usize = 32;

const ROW_MARKER_EMPTY: u8 = 0xFE;
const ROW_MARKER_CELLS: u8 = 0xFD;

const CELL_FLAG_EXTENDED: u8 = 0b1000_0000;
const CELL_FLAG_UNICODE: u8 = 0b0100_0000;
const CELL_FLAG_HAS_FG: u8 = 0b0010_0000;
const CELL_FLAG_HAS_BG: u8 = 0b0001_0000;
const CELL_FLAG_FG_RGB: u8 = 0b0000_1000;
const CELL_FLAG_BG_RGB: u8 = 0b0000_0100;
const CELL_KIND_MASK: u8 = 0b0000_0011;
const CELL_KIND_SPACE: u8 = 0b00;
const CELL_KIND_ASCII: u8 = 0b01;
const CELL_KIND_UNICODE: u8 = 0b10;

/// Text attribute bitfield (§3).
pub mod attrs {
    /// Bold.
    pub const BOLD: u8 = 0x01;
    /// Italic.
    pub const ITALIC: u8 = 0x02;
    /// Underline.
    pub const UNDERLINE: u8 = 0x04;
    /// Dim / faint.
    pub const DIM: u8 = 0x08;
    /// Reverse video.
    pub const INVERSE: u8 = 0x10;
    /// Invisible / concealed.
    pub const INVISIBLE: u8 = 0x20;
    /// Strikethrough.
    pub const STRIKETHROUGH: u8 = 0x40;
}

/// Foreground/background color of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// 256-color palette index.
    Palette(u8),
    /// 24-bit truecolor.
    Rgb(u8, u8, u8),
}

/// One terminal cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// The displayed character.
    pub ch: char,
    /// Display width: 0 (combining/continuation), 1, or 2 columns.
    pub width: u8,
    /// Foreground color, if not the default.
    pub fg: Option<Color>,
    /// Background color, if not the default.
    pub bg: Option<Color>,
    /// Text attribute bitfield (see [`attrs`]).
    pub attributes: u8,
}

impl Cell {
    /// A single blank cell with default colors and no attributes — the
    /// canonical "simple space" cell encoded as a bare `0x00`.
    #[must_use]
    pub const fn blank() -> Self {
        Self {
            ch: ' ',
            width: 1,
            fg: None,
            bg: None,
            attributes: 0,
        }
    }

    fn is_blank(&self) -> bool {
        *self == Self::blank()
    }
}

/// A materialized terminal view: the bottom `rows` rows of the emulator's
/// buffer (the viewport), trailing blank cells and trailing blank rows
/// trimmed, always keeping at least one row and at least one cell per row.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot {
    /// Declared terminal width in columns.
    pub cols: u32,
    /// Declared terminal height in rows.
    pub rows: u32,
    /// Scrollback offset of the viewport's first displayed row.
    pub viewport_y: i32,
    /// Cursor column.
    pub cursor_x: i32,
    /// Cursor row, relative to the viewport.
    pub cursor_y: i32,
    /// Trimmed rows, each itself trimmed of trailing blank cells.
    pub cell_rows: Vec<Vec<Cell>>,
}

impl BufferSnapshot {
    /// Build a snapshot from an untrimmed `rows x cols` grid, applying the
    /// trailing-blank trimming rules from §3.
    #[must_use]
    pub fn from_grid(
        cols: u32,
        rows: u32,
        viewport_y: i32,
        cursor_x: i32,
        cursor_y: i32,
        mut grid: Vec<Vec<Cell>>,
    ) -> Self {
        for row in &mut grid {
            while row.len() > 1 && row.last().is_some_and(Cell::is_blank) {
                row.pop();
            }
        }
        while grid.len() > 1 && grid.last().is_some_and(|r| r.len() == 1 && r[0].is_blank()) {
            grid.pop();
        }

        Self {
            cols,
            rows,
            viewport_y,
            cursor_x,
            cursor_y,
            cell_rows: grid,
        }
    }

    /// Encode this snapshot per the version-1 binary format (§6).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);

        buf.put_u16_le(MAGIC);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(0); // flags
        buf.put_u32_le(self.cols);
        buf.put_u32_le(self.rows);
        buf.put_i32_le(self.viewport_y);
        buf.put_i32_le(self.cursor_x);
        buf.put_i32_le(self.cursor_y);
        buf.put_u32_le(0); // reserved
        buf.put_u32_le(0); // reserved (padding to 32-byte header)
        debug_assert_eq!(buf.len(), HEADER_LEN);

        let mut row_iter = self.cell_rows.iter().peekable();
        while let Some(row) = row_iter.next() {
            if row.len() == 1 && row[0].is_blank() {
                let mut run = 1u32;
                while row_iter
                    .peek()
                    .is_some_and(|r| r.len() == 1 && r[0].is_blank())
                    && run < u32::from(u8::MAX)
                {
                    row_iter.next();
                    run += 1;
                }
                buf.put_u8(ROW_MARKER_EMPTY);
                #[expect(clippy::cast_possible_truncation, reason = "run capped at u8::MAX above")]
                buf.put_u8(run as u8);
            } else {
                buf.put_u8(ROW_MARKER_CELLS);
                #[expect(clippy::cast_possible_truncation, reason = "rows are bounded by terminal width")]
                buf.put_u16_le(row.len() as u16);
                for cell in row {
                    encode_cell(cell, &mut buf);
                }
            }
        }

        buf.freeze()
    }
}

fn encode_cell(cell: &Cell, buf: &mut BytesMut) {
    if cell.is_blank() {
        buf.put_u8(0);
        return;
    }

    let is_ascii = cell.ch.is_ascii() && cell.ch != ' ';
    let kind = if cell.ch == ' ' {
        CELL_KIND_SPACE
    } else if is_ascii {
        CELL_KIND_ASCII
    } else {
        CELL_KIND_UNICODE
    };

    let has_extended = cell.attributes != 0 || cell.fg.is_some() || cell.bg.is_some();
    let mut type_byte = kind;
    if has_extended {
        type_byte |= CELL_FLAG_EXTENDED;
    }
    if kind == CELL_KIND_UNICODE {
        type_byte |= CELL_FLAG_UNICODE;
    }
    if let Some(fg) = cell.fg {
        type_byte |= CELL_FLAG_HAS_FG;
        if matches!(fg, Color::Rgb(..)) {
            type_byte |= CELL_FLAG_FG_RGB;
        }
    }
    if let Some(bg) = cell.bg {
        type_byte |= CELL_FLAG_HAS_BG;
        if matches!(bg, Color::Rgb(..)) {
            type_byte |= CELL_FLAG_BG_RGB;
        }
    }

    buf.put_u8(type_byte);

    match kind {
        CELL_KIND_ASCII => buf.put_u8(cell.ch as u8),
        CELL_KIND_UNICODE => {
            let mut char_buf = [0u8; 4];
            let encoded = cell.ch.encode_utf8(&mut char_buf);
            #[expect(clippy::cast_possible_truncation, reason = "a char is at most 4 UTF-8 bytes")]
            buf.put_u8(encoded.len() as u8);
            buf.put_slice(encoded.as_bytes());
        }
        _ => {}
    }

    if has_extended {
        buf.put_u8(cell.attributes);
        if let Some(fg) = cell.fg {
            put_color(fg, buf);
        }
        if let Some(bg) = cell.bg {
            put_color(bg, buf);
        }
    }
}

fn put_color(color: Color, buf: &mut BytesMut) {
    match color {
        Color::Palette(idx) => buf.put_u8(idx),
        Color::Rgb(r, g, b) => {
            buf.put_u8(r);
            buf.put_u8(g);
            buf.put_u8(b);
        }
    }
}

/// Errors returned while decoding a buffer snapshot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header length.
    #[error("snapshot shorter than the 32-byte header")]
    TruncatedHeader,
    /// Magic bytes did not match `"VT"`.
    #[error("bad magic: {0:#06x}")]
    BadMagic(u16),
    /// Unsupported wire version.
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u8),
    /// Buffer ended mid-row or mid-cell.
    #[error("truncated snapshot body: {0}")]
    Truncated(&'static str),
    /// A cell's UTF-8 payload was not valid UTF-8.
    #[error("invalid UTF-8 in cell payload")]
    InvalidUtf8,
}

/// Decode a version-1 buffer snapshot, mainly for round-trip testing —
/// production clients render snapshots rather than re-parsing them here.
///
/// # Errors
///
/// Returns [`DecodeError`] if the header is malformed or the body is
/// truncated.
pub fn decode(mut bytes: Bytes) -> Result<BufferSnapshot, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedHeader);
    }

    let magic = bytes.get_u16_le();
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = bytes.get_u8();
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let _flags = bytes.get_u8();
    let cols = bytes.get_u32_le();
    let rows = bytes.get_u32_le();
    let viewport_y = bytes.get_i32_le();
    let cursor_x = bytes.get_i32_le();
    let cursor_y = bytes.get_i32_le();
    let _reserved = bytes.get_u32_le();
    let _reserved2 = bytes.get_u32_le();

    let mut cell_rows = Vec::new();
    while bytes.has_remaining() {
        let marker = bytes.get_u8();
        match marker {
            ROW_MARKER_EMPTY => {
                if bytes.is_empty() {
                    return Err(DecodeError::Truncated("empty-row count"));
                }
                let count = bytes.get_u8();
                for _ in 0..count {
                    cell_rows.push(vec![Cell::blank()]);
                }
            }
            ROW_MARKER_CELLS => {
                if bytes.remaining() < 2 {
                    return Err(DecodeError::Truncated("cell count"));
                }
                let count = bytes.get_u16_le();
                let mut row = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    row.push(decode_cell(&mut bytes)?);
                }
                cell_rows.push(row);
            }
            other => return Err(DecodeError::Truncated(row_marker_name(other))),
        }
    }

    Ok(BufferSnapshot {
        cols,
        rows,
        viewport_y,
        cursor_x,
        cursor_y,
        cell_rows,
    })
}

const fn row_marker_name(_byte: u8) -> &'static str {
    "unknown row marker"
}

fn decode_cell(bytes: &mut Bytes) -> Result<Cell, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Truncated("cell type byte"));
    }
    let type_byte = bytes.get_u8();
    if type_byte == 0 {
        return Ok(Cell::blank());
    }

    let kind = type_byte & CELL_KIND_MASK;
    let has_extended = type_byte & CELL_FLAG_EXTENDED != 0;
    let has_fg = type_byte & CELL_FLAG_HAS_FG != 0;
    let has_bg = type_byte & CELL_FLAG_HAS_BG != 0;
    let fg_rgb = type_byte & CELL_FLAG_FG_RGB != 0;
    let bg_rgb = type_byte & CELL_FLAG_BG_RGB != 0;

    let ch = match kind {
        CELL_KIND_SPACE => ' ',
        CELL_KIND_ASCII => {
            if bytes.is_empty() {
                return Err(DecodeError::Truncated("ascii char"));
            }
            char::from(bytes.get_u8())
        }
        CELL_KIND_UNICODE => {
            if bytes.is_empty() {
                return Err(DecodeError::Truncated("unicode char length"));
            }
            let len = bytes.get_u8() as usize;
            if bytes.remaining() < len {
                return Err(DecodeError::Truncated("unicode char bytes"));
            }
            let char_bytes = bytes.copy_to_bytes(len);
            std::str::from_utf8(&char_bytes)
                .ok()
                .and_then(|s| s.chars().next())
                .ok_or(DecodeError::InvalidUtf8)?
        }
        _ => return Err(DecodeError::Truncated("unknown char kind")),
    };

    let mut attributes = 0u8;
    let mut fg = None;
    let mut bg = None;
    if has_extended {
        if bytes.is_empty() {
            return Err(DecodeError::Truncated("attributes byte"));
        }
        attributes = bytes.get_u8();
        if has_fg {
            fg = Some(decode_color(bytes, fg_rgb)?);
        }
        if has_bg {
            bg = Some(decode_color(bytes, bg_rgb)?);
        }
    }

    let width = if kind == CELL_KIND_UNICODE && is_wide(ch) { 2 } else { 1 };

    Ok(Cell {
        ch,
        width,
        fg,
        bg,
        attributes,
    })
}

fn decode_color(bytes: &mut Bytes, is_rgb: bool) -> Result<Color, DecodeError> {
    if is_rgb {
        if bytes.remaining() < 3 {
            return Err(DecodeError::Truncated("rgb color"));
        }
        Ok(Color::Rgb(bytes.get_u8(), bytes.get_u8(), bytes.get_u8()))
    } else {
        if bytes.is_empty() {
            return Err(DecodeError::Truncated("palette color"));
        }
        Ok(Color::Palette(bytes.get_u8()))
    }
}

/// Coarse East-Asian-width heuristic used only to round-trip `width` for
/// decoded cells; real width negotiation is a client rendering concern.
fn is_wide(ch: char) -> bool {
    let cp = ch as u32;
    matches!(cp,
        0x1100..=0x115F | 0x2E80..=0xA4CF | 0xAC00..=0xD7A3 |
        0xF900..=0xFAFF | 0xFF00..=0xFF60 | 0x20000..=0x3FFFD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn simple_grid(cols: u32, rows: u32) -> Vec<Vec<Cell>> {
        vec![vec![Cell::blank(); cols as usize]; rows as usize]
    }

    #[test]
    fn all_blank_grid_trims_to_one_row_one_cell() {
        let snapshot = BufferSnapshot::from_grid(80, 24, 0, 0, 0, simple_grid(80, 24));
        assert_eq!(snapshot.cell_rows.len(), 1);
        assert_eq!(snapshot.cell_rows[0].len(), 1);
    }

    #[test]
    fn trailing_blank_cells_trimmed_leading_content_kept() {
        let mut row = vec![Cell::blank(); 10];
        row[0].ch = 'h';
        row[0].attributes = 0;
        let snapshot = BufferSnapshot::from_grid(10, 1, 0, 1, 0, vec![row]);
        assert_eq!(snapshot.cell_rows[0].len(), 1);
        assert_eq!(snapshot.cell_rows[0][0].ch, 'h');
    }

    #[test]
    fn bare_zero_byte_round_trips_as_blank_cell() {
        let mut buf = BytesMut::new();
        encode_cell(&Cell::blank(), &mut buf);
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn encode_decode_round_trip_mixed_content() {
        let mut row1 = vec![Cell::blank(); 5];
        row1[0] = Cell {
            ch: 'A',
            width: 1,
            fg: Some(Color::Palette(2)),
            bg: None,
            attributes: attrs::BOLD,
        };
        row1[1] = Cell {
            ch: '★',
            width: 1,
            fg: Some(Color::Rgb(10, 20, 30)),
            bg: Some(Color::Rgb(1, 2, 3)),
            attributes: attrs::UNDERLINE | attrs::ITALIC,
        };

        let snapshot = BufferSnapshot::from_grid(5, 3, 7, 1, 2, vec![row1, vec![Cell::blank(); 5], vec![Cell::blank(); 5]]);
        let encoded = snapshot.encode();
        let decoded = decode(encoded).unwrap();

        assert_eq!(decoded.cols, 5);
        assert_eq!(decoded.rows, 3);
        assert_eq!(decoded.viewport_y, 7);
        assert_eq!(decoded.cursor_x, 1);
        assert_eq!(decoded.cursor_y, 2);
        assert_eq!(decoded.cell_rows[0][0].ch, 'A');
        assert_eq!(decoded.cell_rows[0][0].fg, Some(Color::Palette(2)));
        assert_eq!(decoded.cell_rows[0][1].ch, '★');
        assert_eq!(decoded.cell_rows[0][1].bg, Some(Color::Rgb(1, 2, 3)));
        // two trailing blank rows collapse into a single empty-row run
        assert_eq!(decoded.cell_rows.len(), 2);
    }

    #[test]
    fn encoding_is_deterministic_for_identical_input() {
        let snapshot = BufferSnapshot::from_grid(80, 24, 0, 3, 1, simple_grid(80, 24));
        assert_eq!(snapshot.encode(), snapshot.encode());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x1234);
        buf.resize(HEADER_LEN, 0);
        let err = decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic(0x1234)));
    }

    proptest::proptest! {
        /// A single row of printable ASCII cells with arbitrary attributes
        /// round-trips character and attribute bits exactly; the row is
        /// never trimmed because its last cell is forced non-blank.
        #[test]
        fn ascii_row_round_trips_chars_and_attributes(
            chars in proptest::collection::vec(proptest::char::range('!', '~'), 1..40),
            attributes in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..40),
        ) {
            let len = chars.len().min(attributes.len()).max(1);
            let row: Vec<Cell> = (0..len)
                .map(|i| Cell {
                    ch: chars[i % chars.len()],
                    width: 1,
                    fg: None,
                    bg: None,
                    attributes: attributes[i % attributes.len()],
                })
                .collect();

            let snapshot = BufferSnapshot::from_grid(len as u32, 1, 0, 0, 0, vec![row.clone()]);
            let decoded = decode(snapshot.encode()).unwrap();

            prop_assert_eq!(decoded.cell_rows.len(), 1);
            prop_assert_eq!(decoded.cell_rows[0].len(), row.len());
            for (got, want) in decoded.cell_rows[0].iter().zip(row.iter()) {
                prop_assert_eq!(got.ch, want.ch);
                prop_assert_eq!(got.attributes, want.attributes);
            }
        }
    }
}
