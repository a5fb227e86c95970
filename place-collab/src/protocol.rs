//! JSON wire messages exchanged with viewers.
//!
//! Server → viewer (text frames):
//! ```text
//! {"type": "place",       "payload": {"author": "t2_a", "x": 1, "y": 2, "color": 5}}
//! {"type": "batch-place", "payload": {"cells": [{"x": 1, "y": 2, "color": 0}, ...]}}
//! {"type": "activity",    "payload": {"count": 42}}
//! {"type": "resync",      "payload": {"missed": 17}}
//! {"type": "reply",       "payload": {"action": "draw", "status": 200, "body": {...}}}
//! ```
//!
//! Viewer → server (text frames):
//! ```text
//! {"action": "draw", "x": 1, "y": 2, "color": 5}
//! {"action": "draw-rect", "x": 0, "y": 0, "width": 4, "height": 4, "color": 0}
//! {"action": "time-to-wait"} | {"action": "pixel", "x": 1, "y": 2} | {"action": "board"}
//! ```
//! A `board` request is answered with one binary frame holding the snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use place_core::{Color, Placement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacePayload {
    /// `None` for administrative blanks.
    pub author: Option<String>,
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPayload {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlacePayload {
    pub cells: Vec<CellPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub count: usize,
}

/// The viewer fell behind and lost `missed` events; it should fetch the
/// board again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncPayload {
    pub missed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub action: String,
    pub status: u16,
    pub body: serde_json::Value,
}

/// Event fanned out to every viewer of a namespace, plus direct replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    Place(PlacePayload),
    BatchPlace(BatchPlacePayload),
    Activity(ActivityPayload),
    /// Sent only to a connection that lagged.
    Resync(ResyncPayload),
    /// Sent only to the connection that issued the request.
    Reply(ReplyPayload),
}

impl BroadcastEvent {
    pub fn place(placement: &Placement) -> Self {
        Self::Place(PlacePayload {
            author: placement.actor.as_ref().map(|a| a.to_string()),
            x: placement.x,
            y: placement.y,
            color: placement.color,
        })
    }

    pub fn batch_place(placements: &[Placement]) -> Self {
        Self::BatchPlace(BatchPlacePayload {
            cells: placements
                .iter()
                .map(|p| CellPayload {
                    x: p.x,
                    y: p.y,
                    color: p.color,
                })
                .collect(),
        })
    }

    pub fn activity(count: usize) -> Self {
        Self::Activity(ActivityPayload { count })
    }

    pub fn resync(missed: u64) -> Self {
        Self::Resync(ResyncPayload { missed })
    }

    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Place(_) => "place",
            Self::BatchPlace(_) => "batch-place",
            Self::Activity(_) => "activity",
            Self::Resync(_) => "resync",
            Self::Reply(_) => "reply",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Request sent upstream by a viewer connection.
///
/// Coordinates are signed so out-of-range values reach validation and are
/// reported per field instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientRequest {
    Draw {
        x: i64,
        y: i64,
        color: i64,
    },
    DrawRect {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        color: i64,
    },
    TimeToWait,
    Pixel {
        x: i64,
        y: i64,
    },
    Board,
}

impl ClientRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::DrawRect { .. } => "draw-rect",
            Self::TimeToWait => "time-to-wait",
            Self::Pixel { .. } => "pixel",
            Self::Board => "board",
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("connection closed")]
    ConnectionClosed,
}
