//! Canvas state model: geometry, actors and immutable placements.
//!
//! ```text
//! (0,0) ─────────────► x            offset = y * width + x
//!   │  ┌──┬──┬──┬──┐
//!   │  │ 0│ 1│ 2│ 3│                 even offset → high nibble
//!   │  ├──┼──┼──┼──┤                 odd offset  → low nibble
//!   ▼  │ 4│ 5│ 6│ 7│
//!   y  └──┴──┴──┴──┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Palette index of a single cell.
pub type Color = u8;

/// Highest color a 4-bit cell can hold.
pub const MAX_NIBBLE_COLOR: Color = 0x0F;

/// Fixed board geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDims {
    pub width: u32,
    pub height: u32,
}

impl BoardDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of cells on the board.
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bitmap bytes needed to pack every cell as a nibble.
    pub fn packed_len(&self) -> usize {
        self.cell_count().div_ceil(2)
    }

    /// Whether a signed coordinate pair addresses a cell on this board.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        self.contains_x(x) && self.contains_y(y)
    }

    pub fn contains_x(&self, x: i64) -> bool {
        x >= 0 && x < i64::from(self.width)
    }

    pub fn contains_y(&self, y: i64) -> bool {
        y >= 0 && y < i64::from(self.height)
    }

    /// Linear offset of `(x, y)`. Callers must check bounds first.
    pub fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Inverse of [`BoardDims::offset`].
    pub fn coord_at(&self, offset: usize) -> (u32, u32) {
        let width = self.width as usize;
        ((offset % width) as u32, (offset / width) as u32)
    }
}

impl fmt::Display for BoardDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identity attributed to a placement, as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Actor record supplied by the external identity collaborator.
///
/// The canvas never looks these up itself: the caller authenticates the
/// request and hands over the account facts the eligibility gate needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    /// Account creation time, compared against the account-age cutoff.
    pub created_at: DateTime<Utc>,
    /// Administrators bypass cooldowns and may draw rectangles.
    pub privileged: bool,
    pub banned: bool,
    /// Temporary suspension ("timeout").
    pub suspended: bool,
}

impl Actor {
    pub fn new(id: impl Into<ActorId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            privileged: false,
            banned: false,
            suspended: false,
        }
    }

    /// Mark this actor as an administrator.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Time-ordered placement identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacementId(Uuid);

impl PlacementId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PlacementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlacementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One immutable fact: `color` was set at `(x, y)` at `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub id: PlacementId,
    /// `None` for administrative blanking.
    pub actor: Option<ActorId>,
    pub color: Color,
    pub x: u32,
    pub y: u32,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
}

impl Placement {
    pub fn new(
        actor: Option<ActorId>,
        x: u32,
        y: u32,
        color: Color,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PlacementId::new(),
            actor,
            color,
            x,
            y,
            created_at,
        }
    }

    /// Placements without an actor are administrative blanks.
    pub fn is_anonymous(&self) -> bool {
        self.actor.is_none()
    }

    /// Last-write-wins ordering: later timestamp wins, ties go to the
    /// higher placement id.
    pub fn supersedes(&self, other: &Placement) -> bool {
        (self.created_at, self.id) > (other.created_at, other.id)
    }

    pub fn record(&self) -> PixelRecord {
        PixelRecord {
            id: self.id,
            x: self.x,
            y: self.y,
            color: self.color,
            created_at: self.created_at,
        }
    }
}

/// Projection of a placement used by full scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRecord {
    pub id: PlacementId,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub created_at: DateTime<Utc>,
}

impl PixelRecord {
    pub fn supersedes(&self, other: &PixelRecord) -> bool {
        (self.created_at, self.id) > (other.created_at, other.id)
    }
}
