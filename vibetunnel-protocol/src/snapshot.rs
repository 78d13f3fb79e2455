// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary encoding for grid snapshots.
//!
//! Wire format (see header/row/cell layout below), in the same kind-tag +
//! length-prefix style as the daemon's own `Chunk` framing: a fixed magic,
//! a fixed-size header, then a stream of row records, each either a
//! run-length-encoded span of empty rows or an explicit cell list.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// `0x56 0x54` read as a little-endian u16 ("VT").
pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 32;

pub const FLAG_BELL: u8 = 0b0000_0001;

const ROW_EMPTY_RUN: u8 = 0xFE;
const ROW_CELLS: u8 = 0xFD;

const CELL_DEFAULT_SPACE: u8 = 0x00;

const CELL_FLAG_EXTENDED: u8 = 0b1000_0000;
const CELL_FLAG_UNICODE: u8 = 0b0100_0000;
const CELL_FLAG_FG_PRESENT: u8 = 0b0010_0000;
const CELL_FLAG_BG_PRESENT: u8 = 0b0001_0000;
const CELL_FLAG_FG_RGB: u8 = 0b0000_1000;
const CELL_FLAG_BG_RGB: u8 = 0b0000_0100;
const CELL_CHAR_TYPE_MASK: u8 = 0b0000_0011;
const CELL_CHAR_SPACE: u8 = 0b00;
const CELL_CHAR_ASCII: u8 = 0b01;
const CELL_CHAR_UNICODE: u8 = 0b10;
/// Same payload shape as [`CELL_CHAR_UNICODE`], but the character occupies
/// two display columns (e.g. wide CJK ideographs). ASCII is always
/// single-width, so the double-width bit only needs to exist for the
/// Unicode branch — it reuses the otherwise-unused fourth value of the
/// 2-bit char-type field rather than costing an extra byte on the wire.
const CELL_CHAR_UNICODE_WIDE: u8 = 0b11;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error decoding snapshot: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic bytes, expected 'VT'")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("cols/rows out of bounds: {0}x{1}")]
    OutOfBounds(u32, u32),
    #[error("unknown row tag byte {0:#x}")]
    MalformedRow(u8),
    #[error("invalid utf-8 in cell payload")]
    InvalidUtf8,
}

/// A palette index (0-255) or a 24-bit RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Palette(u8),
    Rgb(u8, u8, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attrs {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
}

impl Attrs {
    fn to_byte(&self) -> u8 {
        (self.bold as u8) | ((self.italic as u8) << 1) | ((self.underline as u8) << 2) | ((self.inverse as u8) << 3)
    }

    fn from_byte(b: u8) -> Self {
        Attrs {
            bold: b & 0b0001 != 0,
            italic: b & 0b0010 != 0,
            underline: b & 0b0100 != 0,
            inverse: b & 0b1000 != 0,
        }
    }
}

/// A single grid cell. `width` is 0, 1, or 2 — 0 marks the trailing slot of a
/// wide character (the character itself lives in the preceding cell with
/// `width == 2`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub width: u8,
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub attrs: Option<Attrs>,
}

impl Cell {
    pub fn default_space() -> Self {
        Cell { ch: ' ', width: 1, fg: None, bg: None, attrs: None }
    }

    fn is_default_space(&self) -> bool {
        self.ch == ' ' && self.width == 1 && self.fg.is_none() && self.bg.is_none() && self.attrs.is_none()
    }
}

/// A point-in-time terminal grid, trimmed of trailing empty rows and
/// trailing default-space cells per row as the specification requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSnapshot {
    pub cols: u32,
    pub viewport_y: i32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub bell: bool,
    /// One entry per encoded row; trailing fully-empty rows are not stored
    /// here (they are implied by the decoder once `rows` in the header is
    /// reached, via the empty-run record).
    pub rows: Vec<Vec<Cell>>,
}

impl GridSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.rows.len() * 16);
        self.encode_into(&mut out).expect("writing to a Vec<u8> cannot fail");
        out
    }

    pub fn encode_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(MAGIC)?;
        w.write_u8(VERSION)?;
        w.write_u8(if self.bell { FLAG_BELL } else { 0 })?;
        w.write_u32::<LittleEndian>(self.cols)?;
        w.write_u32::<LittleEndian>(self.rows.len() as u32)?;
        w.write_i32::<LittleEndian>(self.viewport_y)?;
        w.write_i32::<LittleEndian>(self.cursor_x)?;
        w.write_i32::<LittleEndian>(self.cursor_y)?;
        w.write_all(&[0u8; 4])?;

        let mut run_of_empty: u32 = 0;
        for row in &self.rows {
            let trimmed = trim_trailing_default(row);
            if trimmed.is_empty() {
                run_of_empty += 1;
                // flush in chunks of 255 since the run length is a single byte
                if run_of_empty == 255 {
                    w.write_u8(ROW_EMPTY_RUN)?;
                    w.write_u8(255)?;
                    run_of_empty = 0;
                }
                continue;
            }
            if run_of_empty > 0 {
                w.write_u8(ROW_EMPTY_RUN)?;
                w.write_u8(run_of_empty as u8)?;
                run_of_empty = 0;
            }
            w.write_u8(ROW_CELLS)?;
            w.write_u16::<LittleEndian>(trimmed.len() as u16)?;
            for cell in trimmed {
                encode_cell(w, cell)?;
            }
        }
        if run_of_empty > 0 {
            w.write_u8(ROW_EMPTY_RUN)?;
            w.write_u8(run_of_empty as u8)?;
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = io::Cursor::new(buf);
        Self::decode_from(&mut cursor)
    }

    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let magic = r.read_u16::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = r.read_u8()?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let flags = r.read_u8()?;
        let cols = r.read_u32::<LittleEndian>()?;
        let encoded_rows = r.read_u32::<LittleEndian>()?;
        let viewport_y = r.read_i32::<LittleEndian>()?;
        let cursor_x = r.read_i32::<LittleEndian>()?;
        let cursor_y = r.read_i32::<LittleEndian>()?;
        let mut reserved = [0u8; 4];
        r.read_exact(&mut reserved)?;

        if !(1..=1000).contains(&cols) || !(1..=1000).contains(&encoded_rows) {
            return Err(CodecError::OutOfBounds(cols, encoded_rows));
        }

        let mut rows: Vec<Vec<Cell>> = Vec::with_capacity(encoded_rows as usize);
        while (rows.len() as u32) < encoded_rows {
            let tag = r.read_u8()?;
            match tag {
                ROW_EMPTY_RUN => {
                    let count = r.read_u8()?;
                    for _ in 0..count {
                        rows.push(Vec::new());
                    }
                }
                ROW_CELLS => {
                    let cell_count = r.read_u16::<LittleEndian>()?;
                    let mut row = Vec::with_capacity(cell_count as usize);
                    for _ in 0..cell_count {
                        row.push(decode_cell(r)?);
                    }
                    rows.push(row);
                }
                other => return Err(CodecError::MalformedRow(other)),
            }
        }

        let cursor_x = cursor_x.clamp(0, cols as i32 - 1);
        let cursor_y = cursor_y.clamp(0, encoded_rows as i32 - 1);

        Ok(GridSnapshot {
            cols,
            viewport_y,
            cursor_x,
            cursor_y,
            bell: flags & FLAG_BELL != 0,
            rows,
        })
    }
}

fn trim_trailing_default(row: &[Cell]) -> &[Cell] {
    let mut end = row.len();
    while end > 0 && row[end - 1].is_default_space() {
        end -= 1;
    }
    &row[..end]
}

fn encode_cell<W: Write>(w: &mut W, cell: &Cell) -> io::Result<()> {
    if cell.is_default_space() {
        return w.write_u8(CELL_DEFAULT_SPACE);
    }

    let is_space = cell.ch == ' ';
    let is_ascii = cell.ch.is_ascii() && !is_space;
    let char_type = if is_space {
        CELL_CHAR_SPACE
    } else if is_ascii {
        CELL_CHAR_ASCII
    } else if cell.width == 2 {
        CELL_CHAR_UNICODE_WIDE
    } else {
        CELL_CHAR_UNICODE
    };
    let extended = cell.attrs.is_some();

    let mut flag = char_type;
    if extended {
        flag |= CELL_FLAG_EXTENDED;
    }
    if char_type == CELL_CHAR_UNICODE || char_type == CELL_CHAR_UNICODE_WIDE {
        flag |= CELL_FLAG_UNICODE;
    }
    if cell.fg.is_some() {
        flag |= CELL_FLAG_FG_PRESENT;
        if matches!(cell.fg, Some(Color::Rgb(..))) {
            flag |= CELL_FLAG_FG_RGB;
        }
    }
    if cell.bg.is_some() {
        flag |= CELL_FLAG_BG_PRESENT;
        if matches!(cell.bg, Some(Color::Rgb(..))) {
            flag |= CELL_FLAG_BG_RGB;
        }
    }

    w.write_u8(flag)?;

    match char_type {
        CELL_CHAR_ASCII => {
            w.write_u8(cell.ch as u8)?;
        }
        CELL_CHAR_UNICODE | CELL_CHAR_UNICODE_WIDE => {
            let mut buf = [0u8; 4];
            let s = cell.ch.encode_utf8(&mut buf);
            w.write_u8(s.len() as u8)?;
            w.write_all(s.as_bytes())?;
        }
        _ => unreachable!("char_type is always ascii or unicode for a non-default cell"),
    }

    if let Some(attrs) = &cell.attrs {
        w.write_u8(attrs.to_byte())?;
    }
    if let Some(fg) = cell.fg {
        write_color(w, fg)?;
    }
    if let Some(bg) = cell.bg {
        write_color(w, bg)?;
    }

    Ok(())
}

fn write_color<W: Write>(w: &mut W, color: Color) -> io::Result<()> {
    match color {
        Color::Palette(idx) => w.write_u8(idx),
        Color::Rgb(r, g, b) => {
            w.write_u8(r)?;
            w.write_u8(g)?;
            w.write_u8(b)
        }
    }
}

fn read_color<R: Read>(r: &mut R, is_rgb: bool) -> io::Result<Color> {
    if is_rgb {
        let rgb = [r.read_u8()?, r.read_u8()?, r.read_u8()?];
        Ok(Color::Rgb(rgb[0], rgb[1], rgb[2]))
    } else {
        Ok(Color::Palette(r.read_u8()?))
    }
}

fn decode_cell<R: Read>(r: &mut R) -> Result<Cell, CodecError> {
    let flag = r.read_u8()?;
    if flag == CELL_DEFAULT_SPACE {
        return Ok(Cell::default_space());
    }

    let char_type = flag & CELL_CHAR_TYPE_MASK;
    let (ch, width) = match char_type {
        CELL_CHAR_ASCII => (r.read_u8()? as char, 1),
        CELL_CHAR_UNICODE => (read_unicode_char(r)?, 1),
        CELL_CHAR_UNICODE_WIDE => (read_unicode_char(r)?, 2),
        CELL_CHAR_SPACE | _ => (' ', 1),
    };

    let attrs = if flag & CELL_FLAG_EXTENDED != 0 {
        Some(Attrs::from_byte(r.read_u8()?))
    } else {
        None
    };

    let fg = if flag & CELL_FLAG_FG_PRESENT != 0 {
        Some(read_color(r, flag & CELL_FLAG_FG_RGB != 0)?)
    } else {
        None
    };
    let bg = if flag & CELL_FLAG_BG_PRESENT != 0 {
        Some(read_color(r, flag & CELL_FLAG_BG_RGB != 0)?)
    } else {
        None
    };

    Ok(Cell { ch, width, fg, bg, attrs })
}

fn read_unicode_char<R: Read>(r: &mut R) -> Result<char, CodecError> {
    let len = r.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    std::str::from_utf8(&bytes).ok().and_then(|s| s.chars().next()).ok_or(CodecError::InvalidUtf8)
}

#[cfg(test)]
mod test {
    use super::*;

    fn hello_row() -> Vec<Cell> {
        "Hello"
            .chars()
            .map(|ch| Cell { ch, width: 1, fg: None, bg: None, attrs: None })
            .collect()
    }

    #[test]
    fn round_trip_hello_grid() {
        let mut rows = vec![hello_row()];
        for _ in 0..22 {
            rows.push(Vec::new());
        }
        rows.push(Vec::new());

        let snap = GridSnapshot {
            cols: 80,
            viewport_y: 0,
            cursor_x: 0,
            cursor_y: 23,
            bell: false,
            rows,
        };

        let encoded = snap.encode();
        assert_eq!(&encoded[0..3], &[0x56, 0x54, 0x01]);

        let decoded = GridSnapshot::decode(&encoded).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn round_trip_with_colors_and_attrs() {
        let row = vec![
            Cell {
                ch: 'x',
                width: 1,
                fg: Some(Color::Palette(9)),
                bg: Some(Color::Rgb(10, 20, 30)),
                attrs: Some(Attrs { bold: true, italic: false, underline: true, inverse: false }),
            },
            Cell::default_space(),
        ];
        let snap = GridSnapshot { cols: 10, viewport_y: 0, cursor_x: 0, cursor_y: 0, bell: true, rows: vec![row] };
        let encoded = snap.encode();
        let decoded = GridSnapshot::decode(&encoded).unwrap();
        assert_eq!(decoded, snap);
        assert_ne!(decoded.encode()[3] & FLAG_BELL, 0);
    }

    #[test]
    fn round_trip_preserves_wide_cell_width() {
        let row = vec![
            Cell { ch: '\u{4e2d}', width: 2, fg: None, bg: None, attrs: None },
            Cell { ch: 'x', width: 1, fg: None, bg: None, attrs: None },
        ];
        let snap = GridSnapshot { cols: 10, viewport_y: 0, cursor_x: 0, cursor_y: 0, bell: false, rows: vec![row] };
        let decoded = GridSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.rows[0][0].width, 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; HEADER_LEN];
        let err = GridSnapshot::decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::BadMagic));
    }

    #[test]
    fn rejects_out_of_bounds_dimensions() {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(MAGIC).unwrap();
        buf.write_u8(VERSION).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // cols = 0, out of bounds
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap();
        buf.write_all(&[0u8; 4]).unwrap();

        let err = GridSnapshot::decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::OutOfBounds(0, 1)));
    }

    #[test]
    fn empty_run_splits_across_255_boundary() {
        let rows: Vec<Vec<Cell>> = (0..300).map(|_| Vec::new()).collect();
        let snap = GridSnapshot { cols: 80, viewport_y: 0, cursor_x: 0, cursor_y: 0, rows, bell: false };
        let encoded = snap.encode();
        let decoded = GridSnapshot::decode(&encoded).unwrap();
        assert_eq!(decoded.rows.len(), 300);
    }
}
