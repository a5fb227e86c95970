//! # place-core — canvas model and snapshot codec
//!
//! Leaf types shared by the storage, cache and broadcast layers. Nothing
//! here performs I/O.
//!
//! ## Modules
//!
//! - [`model`] — board geometry, actors, immutable placements
//! - [`codec`] — packed bitmap snapshot encode/decode and the live packed board
//! - [`config`] — startup configuration
//! - [`error`] — placement error taxonomy

pub mod codec;
pub mod config;
pub mod error;
pub mod model;

pub use codec::{
    decode, encode, snapshot_timestamp, BoardSnapshot, CodecError, Grid, PackedBoard,
    TIMESTAMP_LEN,
};
pub use config::{ConfigError, PlaceConfig, RectAttribution};
pub use error::{FieldError, FieldErrorKind, ForbiddenReason, PlaceError};
pub use model::{
    Actor, ActorId, BoardDims, Color, PixelRecord, Placement, PlacementId, MAX_NIBBLE_COLOR,
};
