//! Endpoint adapters: turn service results into status, body and cache
//! headers for whatever routing layer fronts the canvas.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use place_core::{Actor, PlaceError};

use crate::service::{BoardRead, PlacementService};

/// Which cache tier a board read should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardTier {
    /// Edge-cacheable, served from the live cache.
    Edge,
    /// Same data as `Edge`, but not cacheable by shared proxies.
    Private,
    /// Straight from the durable log.
    Direct,
    /// Rebuild the cache first.
    Rebuild,
}

impl BoardTier {
    fn cache_control(self, max_age_secs: u64) -> String {
        match self {
            Self::Edge => format!("public, max-age={max_age_secs}"),
            Self::Private => format!("private, max-age={max_age_secs}"),
            Self::Direct | Self::Rebuild => "no-cache".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Json(Value),
    Bytes(Vec<u8>),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ApiBody,
    pub cache_control: Option<String>,
}

impl ApiResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ApiBody::Json(body),
            cache_control: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: ApiBody::Empty,
            cache_control: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// JSON body, or `null` for binary and empty bodies.
    pub fn json_body(&self) -> Value {
        match &self.body {
            ApiBody::Json(value) => value.clone(),
            ApiBody::Bytes(_) | ApiBody::Empty => Value::Null,
        }
    }
}

/// Map a placement error to its status and body.
pub fn error_response(err: &PlaceError) -> ApiResponse {
    match err {
        PlaceError::InvalidArgument { fields } => ApiResponse::json(400, json!({ "fields": fields })),
        PlaceError::Forbidden { reason } => {
            ApiResponse::json(403, json!({ "error": 403, "reason": reason }))
        }
        PlaceError::RateLimited { wait_seconds } => ApiResponse::json(
            429,
            json!({ "error": 429, "wait_seconds": wait_seconds }),
        ),
        PlaceError::StorageUnavailable(_) => {
            ApiResponse::json(503, json!({ "error": 503, "message": "storage unavailable" }))
        }
        PlaceError::CacheInconsistent(_) => {
            ApiResponse::json(500, json!({ "error": 500, "message": "internal error" }))
        }
    }
}

/// `POST draw {x, y, color}`.
pub async fn draw(
    service: &PlacementService,
    actor: &Actor,
    x: i64,
    y: i64,
    color: i64,
    now: DateTime<Utc>,
) -> ApiResponse {
    match service.place(actor, x, y, color, now).await {
        Ok(placed) => ApiResponse::json(200, json!({ "wait_seconds": placed.wait_seconds })),
        Err(e) => error_response(&e),
    }
}

/// Admin rectangle fill.
#[allow(clippy::too_many_arguments)]
pub async fn draw_rect(
    service: &PlacementService,
    actor: &Actor,
    x: i64,
    y: i64,
    width: i64,
    height: i64,
    color: i64,
    now: DateTime<Utc>,
) -> ApiResponse {
    match service
        .place_rectangle(actor, x, y, width, height, color, now)
        .await
    {
        Ok(rect) => ApiResponse::json(
            200,
            json!({
                "cells": rect.cells(),
                "x": rect.x,
                "y": rect.y,
                "width": rect.width,
                "height": rect.height,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// `GET time-to-wait`.
pub fn time_to_wait(service: &PlacementService, actor: &Actor, now: DateTime<Utc>) -> ApiResponse {
    match service.wait_seconds_for(actor, now) {
        Ok(wait_seconds) => ApiResponse::json(200, json!({ "wait_seconds": wait_seconds })),
        Err(e) => error_response(&e),
    }
}

/// `GET board-bitmap`: raw snapshot bytes.
pub async fn board_bitmap(
    service: &PlacementService,
    tier: BoardTier,
    now: DateTime<Utc>,
) -> ApiResponse {
    let read: Result<BoardRead, PlaceError> = match tier {
        BoardTier::Edge | BoardTier::Private => service.get_board().await,
        BoardTier::Direct => service.get_board_uncached(now),
        BoardTier::Rebuild => service.get_board_rebuilt(now).await,
    };
    match read {
        Ok(read) => {
            log::trace!("board served from {:?} for {tier:?}", read.source);
            ApiResponse {
                status: 200,
                body: ApiBody::Bytes(read.snapshot.as_bytes().to_vec()),
                cache_control: Some(
                    tier.cache_control(service.config().snapshot_max_age.as_secs().max(1)),
                ),
            }
        }
        Err(e) => error_response(&e),
    }
}

/// `GET pixel?x&y`.
pub fn pixel(service: &PlacementService, x: i64, y: i64) -> ApiResponse {
    match service.get_pixel(x, y) {
        Ok(Some(placement)) => ApiResponse::json(
            200,
            json!({
                "x": placement.x,
                "y": placement.y,
                "color": placement.color,
                "user": placement.actor.as_ref().map(|a| a.as_str()),
                "timestamp": placement.created_at.timestamp_micros() as f64 / 1_000_000.0,
            }),
        ),
        Ok(None) => ApiResponse::not_found(),
        Err(e) => error_response(&e),
    }
}
