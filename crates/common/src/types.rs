// Core domain types shared between the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canvas id used by the single global session.
pub const DEFAULT_CANVAS_ID: &str = "main";

/// Default canvas background color.
pub const DEFAULT_BACKGROUND: &str = "#ffffff";

/// A single sampled pen position in normalized canvas coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrokePoint {
    /// Horizontal position in `[0, 1]`.
    pub x: f64,
    /// Vertical position in `[0, 1]`.
    pub y: f64,
    /// Server receive time, milliseconds since the unix epoch.
    pub t: i64,
}

impl StrokePoint {
    pub fn distance_to(&self, other: &StrokePoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// One continuous pen-down-to-pen-up drawing path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: String,
    pub owner_id: String,
    pub color: String,
    pub width: f64,
    #[serde(default)]
    pub points: Vec<StrokePoint>,
    #[serde(default)]
    pub completed: bool,
    /// Set when the server closed the stroke on the owner's behalf.
    #[serde(default)]
    pub forced_end: bool,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub server_sequence: u64,
}

impl Stroke {
    pub fn last_point(&self) -> Option<&StrokePoint> {
        self.points.last()
    }

    /// Close the stroke. `forced` marks server-side termination.
    pub fn finish(&mut self, forced: bool, at: DateTime<Utc>) {
        self.completed = true;
        self.forced_end = self.forced_end || forced;
        self.end_time = Some(at);
    }
}

/// The full authoritative canvas state at an instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasSnapshot {
    pub canvas_id: String,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
    pub background: String,
    /// Raster fallback pushed by clients that do not track strokes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub last_sequence: u64,
}

impl CanvasSnapshot {
    pub fn empty(canvas_id: impl Into<String>) -> Self {
        Self {
            canvas_id: canvas_id.into(),
            strokes: Vec::new(),
            background: DEFAULT_BACKGROUND.to_string(),
            image_data: None,
            last_modified: Utc::now(),
            last_sequence: 0,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.strokes.is_empty() && self.image_data.is_none()
    }

    /// Latest stroke `owner_id` drew under `stroke_id`. Different users may
    /// pick the same id.
    pub fn stroke_mut(&mut self, owner_id: &str, stroke_id: &str) -> Option<&mut Stroke> {
        self.strokes
            .iter_mut()
            .rev()
            .find(|stroke| stroke.owner_id == owner_id && stroke.id == stroke_id)
    }
}

/// Roster entry as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: String,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
}

/// A stored chat line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub nickname: String,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}
