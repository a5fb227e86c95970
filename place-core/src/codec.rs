//! Packed bitmap codec for whole-board snapshots.
//!
//! Wire format (shared with every viewer, do not change without a version marker):
//! ```text
//! ┌──────────────────┬─────────────────────────────────────────────┐
//! │ timestamp        │ bitmap                                      │
//! │ u32 little-endian│ ceil(W*H / 2) bytes, two cells per byte     │
//! │ 4 bytes          │ even offset = high nibble, odd = low nibble │
//! └──────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Cells never written decode as color 0.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

use crate::model::{BoardDims, Color, MAX_NIBBLE_COLOR};

/// Length of the timestamp prefix.
pub const TIMESTAMP_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("color {color} at offset {offset} does not fit in a nibble")]
    ColorOutOfRange { offset: usize, color: Color },

    #[error("coordinate ({x}, {y}) is outside the {dims} board")]
    CoordinateOutOfRange { x: u32, y: u32, dims: BoardDims },

    #[error("grid holds {actual} cells, {dims} board needs {expected}")]
    GridSizeMismatch {
        dims: BoardDims,
        expected: usize,
        actual: usize,
    },

    #[error("snapshot is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Snapshot timestamp: whole seconds since the epoch, saturated to `u32`.
pub fn snapshot_timestamp(now: DateTime<Utc>) -> u32 {
    now.timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

/// Write `color` into the nibble of `byte` that belongs to `offset`.
#[inline]
pub fn pack_nibble(byte: u8, offset: usize, color: Color) -> u8 {
    if offset % 2 == 0 {
        (byte & 0x0F) | (color << 4)
    } else {
        (byte & 0xF0) | (color & 0x0F)
    }
}

/// Read the nibble of `byte` that belongs to `offset`.
#[inline]
pub fn unpack_nibble(byte: u8, offset: usize) -> Color {
    if offset % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

/// Dense coordinate-indexed color grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    dims: BoardDims,
    cells: Vec<Color>,
}

impl Grid {
    /// An all-zero grid.
    pub fn new(dims: BoardDims) -> Self {
        Self {
            dims,
            cells: vec![0; dims.cell_count()],
        }
    }

    /// Build from row-major cells, rejecting wrong sizes and wide colors.
    pub fn from_cells(dims: BoardDims, cells: Vec<Color>) -> Result<Self, CodecError> {
        if cells.len() != dims.cell_count() {
            return Err(CodecError::GridSizeMismatch {
                dims,
                expected: dims.cell_count(),
                actual: cells.len(),
            });
        }
        if let Some((offset, &color)) = cells
            .iter()
            .enumerate()
            .find(|(_, &c)| c > MAX_NIBBLE_COLOR)
        {
            return Err(CodecError::ColorOutOfRange { offset, color });
        }
        Ok(Self { dims, cells })
    }

    pub fn dims(&self) -> BoardDims {
        self.dims
    }

    pub fn cells(&self) -> &[Color] {
        &self.cells
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.dims.width || y >= self.dims.height {
            return None;
        }
        Some(self.cells[self.dims.offset(x, y)])
    }

    pub fn set(&mut self, x: u32, y: u32, color: Color) -> Result<(), CodecError> {
        if x >= self.dims.width || y >= self.dims.height {
            return Err(CodecError::CoordinateOutOfRange {
                x,
                y,
                dims: self.dims,
            });
        }
        let offset = self.dims.offset(x, y);
        if color > MAX_NIBBLE_COLOR {
            return Err(CodecError::ColorOutOfRange { offset, color });
        }
        self.cells[offset] = color;
        Ok(())
    }
}

/// Encoded snapshot bytes: timestamp prefix plus packed bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    bytes: Vec<u8>,
}

impl BoardSnapshot {
    /// Wrap raw bytes received from elsewhere, checking the length for `dims`.
    pub fn from_bytes(dims: BoardDims, bytes: Vec<u8>) -> Result<Self, CodecError> {
        let expected = TIMESTAMP_LEN + dims.packed_len();
        if bytes.len() != expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    fn from_parts(timestamp: u32, bitmap: impl IntoIterator<Item = u8>) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes.extend(bitmap);
        Self { bytes }
    }

    pub fn timestamp(&self) -> u32 {
        let mut buf = [0u8; TIMESTAMP_LEN];
        buf.copy_from_slice(&self.bytes[..TIMESTAMP_LEN]);
        u32::from_le_bytes(buf)
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bytes[TIMESTAMP_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pack `grid` into a snapshot stamped with `timestamp`.
pub fn encode(grid: &Grid, timestamp: u32) -> Result<BoardSnapshot, CodecError> {
    let mut bitmap = vec![0u8; grid.dims.packed_len()];
    for (offset, &color) in grid.cells.iter().enumerate() {
        if color > MAX_NIBBLE_COLOR {
            return Err(CodecError::ColorOutOfRange { offset, color });
        }
        let idx = offset / 2;
        bitmap[idx] = pack_nibble(bitmap[idx], offset, color);
    }
    Ok(BoardSnapshot::from_parts(timestamp, bitmap))
}

/// Unpack a snapshot for a board of `dims`.
pub fn decode(dims: BoardDims, bytes: &[u8]) -> Result<(u32, Grid), CodecError> {
    let expected = TIMESTAMP_LEN + dims.packed_len();
    if bytes.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(&bytes[..TIMESTAMP_LEN]);
    let bitmap = &bytes[TIMESTAMP_LEN..];

    let cells = (0..dims.cell_count())
        .map(|offset| unpack_nibble(bitmap[offset / 2], offset))
        .collect();

    Ok((u32::from_le_bytes(ts), Grid { dims, cells }))
}

/// Live nibble-packed board with one addressable 4-bit field per cell.
///
/// Single-cell writes are a CAS on the byte that holds the cell, so
/// concurrent writers to the two halves of one byte never clobber each
/// other and no board-wide lock is needed.
pub struct PackedBoard {
    dims: BoardDims,
    bytes: Vec<AtomicU8>,
}

impl PackedBoard {
    pub fn new(dims: BoardDims) -> Self {
        Self {
            dims,
            bytes: (0..dims.packed_len()).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn from_grid(grid: &Grid) -> Result<Self, CodecError> {
        let board = Self::new(grid.dims);
        for (offset, &color) in grid.cells.iter().enumerate() {
            board.set_offset(offset, color)?;
        }
        Ok(board)
    }

    /// Restore from a snapshot payload.
    pub fn from_snapshot(dims: BoardDims, bytes: &[u8]) -> Result<(u32, Self), CodecError> {
        let expected = TIMESTAMP_LEN + dims.packed_len();
        if bytes.len() != expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(&bytes[..TIMESTAMP_LEN]);
        let board = Self {
            dims,
            bytes: bytes[TIMESTAMP_LEN..].iter().map(|&b| AtomicU8::new(b)).collect(),
        };
        Ok((u32::from_le_bytes(ts), board))
    }

    pub fn dims(&self) -> BoardDims {
        self.dims
    }

    pub fn set(&self, x: u32, y: u32, color: Color) -> Result<(), CodecError> {
        if x >= self.dims.width || y >= self.dims.height {
            return Err(CodecError::CoordinateOutOfRange {
                x,
                y,
                dims: self.dims,
            });
        }
        self.set_offset(self.dims.offset(x, y), color)
    }

    fn set_offset(&self, offset: usize, color: Color) -> Result<(), CodecError> {
        if color > MAX_NIBBLE_COLOR {
            return Err(CodecError::ColorOutOfRange { offset, color });
        }
        // The closure never returns None, so fetch_update cannot fail.
        let _ = self.bytes[offset / 2].fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
            Some(pack_nibble(b, offset, color))
        });
        Ok(())
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.dims.width || y >= self.dims.height {
            return None;
        }
        let offset = self.dims.offset(x, y);
        Some(unpack_nibble(
            self.bytes[offset / 2].load(Ordering::Acquire),
            offset,
        ))
    }

    /// Copy the current bytes out into an encoded snapshot.
    pub fn to_snapshot(&self, timestamp: u32) -> BoardSnapshot {
        BoardSnapshot::from_parts(
            timestamp,
            self.bytes.iter().map(|b| b.load(Ordering::Acquire)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BoardDims {
        BoardDims::new(4, 3)
    }

    #[test]
    fn test_nibble_order() {
        let mut grid = Grid::new(small());
        grid.set(0, 0, 0xA).unwrap();
        grid.set(1, 0, 0x3).unwrap();
        let snapshot = encode(&grid, 7).unwrap();
        assert_eq!(snapshot.bitmap()[0], 0xA3);
        assert_eq!(snapshot.bitmap()[1], 0x00);
    }

    #[test]
    fn test_timestamp_little_endian() {
        let snapshot = encode(&Grid::new(small()), 0x0102_0304).unwrap();
        assert_eq!(&snapshot.as_bytes()[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(snapshot.timestamp(), 0x0102_0304);
    }

    #[test]
    fn test_snapshot_length() {
        let snapshot = encode(&Grid::new(BoardDims::new(1000, 1000)), 0).unwrap();
        assert_eq!(snapshot.len(), 4 + 500_000);
    }

    #[test]
    fn test_odd_board_last_byte_half_used() {
        let dims = BoardDims::new(3, 1);
        let mut grid = Grid::new(dims);
        grid.set(2, 0, 0xF).unwrap();
        let snapshot = encode(&grid, 0).unwrap();
        assert_eq!(snapshot.bitmap(), &[0x00, 0xF0]);

        let (_, decoded) = decode(dims, snapshot.as_bytes()).unwrap();
        assert_eq!(decoded, grid);
    }

    #[test]
    fn test_roundtrip_patterned_grid() {
        let dims = BoardDims::new(17, 9);
        let cells = (0..dims.cell_count()).map(|i| (i * 7 % 16) as u8).collect();
        let grid = Grid::from_cells(dims, cells).unwrap();

        let snapshot = encode(&grid, 1_491_000_000).unwrap();
        let (ts, decoded) = decode(dims, snapshot.as_bytes()).unwrap();
        assert_eq!(ts, 1_491_000_000);
        assert_eq!(decoded, grid);
    }

    #[test]
    fn test_unset_cells_decode_as_zero() {
        let dims = small();
        let mut grid = Grid::new(dims);
        grid.set(3, 2, 9).unwrap();
        let snapshot = encode(&grid, 0).unwrap();
        let (_, decoded) = decode(dims, snapshot.as_bytes()).unwrap();
        assert_eq!(decoded.get(3, 2), Some(9));
        assert_eq!(decoded.get(0, 0), Some(0));
    }

    #[test]
    fn test_rejects_wide_color() {
        let mut grid = Grid::new(small());
        assert!(matches!(
            grid.set(0, 0, 16),
            Err(CodecError::ColorOutOfRange { color: 16, .. })
        ));
        assert!(Grid::from_cells(small(), vec![16; 12]).is_err());
    }

    #[test]
    fn test_rejects_out_of_grid() {
        let mut grid = Grid::new(small());
        assert!(matches!(
            grid.set(4, 0, 1),
            Err(CodecError::CoordinateOutOfRange { x: 4, .. })
        ));
        assert_eq!(grid.get(0, 3), None);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let err = decode(small(), &[0u8; 5]).unwrap_err();
        assert_eq!(
            err,
            CodecError::LengthMismatch {
                expected: 10,
                actual: 5
            }
        );
        assert!(BoardSnapshot::from_bytes(small(), vec![0; 11]).is_err());
    }

    #[test]
    fn test_packed_board_matches_encoder() {
        let dims = BoardDims::new(5, 5);
        let mut grid = Grid::new(dims);
        let board = PackedBoard::new(dims);
        for (x, y, c) in [(0, 0, 1), (1, 0, 2), (4, 4, 15), (3, 2, 8)] {
            grid.set(x, y, c).unwrap();
            board.set(x, y, c).unwrap();
        }
        assert_eq!(board.to_snapshot(42), encode(&grid, 42).unwrap());
        assert_eq!(board.get(4, 4), Some(15));
    }

    #[test]
    fn test_packed_board_overwrite_keeps_neighbour() {
        let board = PackedBoard::new(small());
        board.set(0, 0, 0xC).unwrap();
        board.set(1, 0, 0x5).unwrap();
        board.set(0, 0, 0x1).unwrap();
        assert_eq!(board.get(0, 0), Some(0x1));
        assert_eq!(board.get(1, 0), Some(0x5));
    }

    #[test]
    fn test_packed_board_from_snapshot() {
        let dims = small();
        let mut grid = Grid::new(dims);
        grid.set(2, 1, 6).unwrap();
        let snapshot = encode(&grid, 99).unwrap();

        let (ts, board) = PackedBoard::from_snapshot(dims, snapshot.as_bytes()).unwrap();
        assert_eq!(ts, 99);
        assert_eq!(board.get(2, 1), Some(6));
        assert!(PackedBoard::from_snapshot(dims, &[0; 3]).is_err());
    }

    #[test]
    fn test_snapshot_timestamp_saturates() {
        use chrono::TimeZone;
        let before_epoch = Utc.timestamp_opt(-5, 0).unwrap();
        assert_eq!(snapshot_timestamp(before_epoch), 0);
        let t = Utc.timestamp_opt(1_491_004_800, 500).unwrap();
        assert_eq!(snapshot_timestamp(t), 1_491_004_800);
    }
}
