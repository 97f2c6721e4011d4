// Input validation helpers.
//
// - Identity fields: user ids are checked, nicknames are sanitized.
// - Chat text is stripped of control characters and length-capped.
// - Drawing coordinates must be finite and inside the unit square.
// - Snapshot and opaque signal payloads are size-bounded.

use canvasync_common::types::{CanvasSnapshot, StrokePoint};
use thiserror::Error;

use crate::config::RelayConfig;

/// Maximum WebSocket frame payload in bytes (256 KiB), on top of the
/// snapshot ceiling for frames that carry a canvas.
pub const MAX_WS_FRAME_BYTES: usize = 256 * 1024;

pub const MAX_USER_ID_CHARS: usize = 64;
pub const MAX_NICKNAME_CHARS: usize = 32;
pub const MAX_CHAT_CHARS: usize = 500;
pub const MAX_SIGNAL_BYTES: usize = 64 * 1024;
pub const MIN_BRUSH_SIZE: f64 = 0.5;
pub const MAX_BRUSH_SIZE: f64 = 100.0;
pub const DEFAULT_COLOR: &str = "#000000";
pub const DEFAULT_BRUSH_SIZE: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Drawing and snapshot bounds shared by the session and the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_stroke_points: usize,
    pub max_point_movement: f64,
    pub max_snapshot_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_stroke_points: 1_000, max_point_movement: 0.2, max_snapshot_bytes: 10 * 1024 * 1024 }
    }
}

impl From<&RelayConfig> for Limits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_stroke_points: config.max_stroke_points,
            max_point_movement: config.max_point_movement,
            max_snapshot_bytes: config.max_snapshot_bytes,
        }
    }
}

// ── Identity ───────────────────────────────────────────────────────

pub fn validate_user_id(raw: &str) -> Result<String, ValidationError> {
    let user_id = raw.trim();
    if user_id.is_empty() {
        return Err(ValidationError::new("userId", "must not be empty"));
    }
    if user_id.chars().count() > MAX_USER_ID_CHARS {
        return Err(ValidationError::new("userId", format!("exceeds {MAX_USER_ID_CHARS} characters")));
    }
    if !user_id.chars().all(is_id_char) {
        return Err(ValidationError::new("userId", "contains unsupported characters"));
    }
    Ok(user_id.to_string())
}

/// Strip markup and control characters, collapse whitespace, cap length.
pub fn sanitize_nickname(raw: &str) -> Result<String, ValidationError> {
    let cleaned = raw
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '"' | '\'' | '&'))
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(ValidationError::new("nickname", "must not be empty"));
    }
    Ok(collapsed.chars().take(MAX_NICKNAME_CHARS).collect())
}

// ── Chat ───────────────────────────────────────────────────────────

pub fn sanitize_chat_text(raw: &str) -> Result<String, ValidationError> {
    let cleaned = raw
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect::<String>();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("message", "must not be empty"));
    }
    if trimmed.chars().count() > MAX_CHAT_CHARS {
        return Err(ValidationError::new("message", format!("exceeds {MAX_CHAT_CHARS} characters")));
    }
    Ok(trimmed.to_string())
}

// ── Drawing ────────────────────────────────────────────────────────

pub fn validate_point(x: f64, y: f64) -> Result<(), ValidationError> {
    if !x.is_finite() || !y.is_finite() {
        return Err(ValidationError::new("point", "coordinates must be finite"));
    }
    if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
        return Err(ValidationError::new("point", format!("({x}, {y}) is outside the canvas")));
    }
    Ok(())
}

/// Accept `#rgb`, `#rrggbb` and `#rrggbbaa`; anything else becomes the default.
pub fn normalize_color(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(color)
            if color.starts_with('#')
                && matches!(color.len(), 4 | 7 | 9)
                && color[1..].chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            color.to_ascii_lowercase()
        }
        _ => DEFAULT_COLOR.to_string(),
    }
}

pub fn normalize_brush_size(raw: Option<f64>) -> f64 {
    match raw {
        Some(size) if size.is_finite() => size.clamp(MIN_BRUSH_SIZE, MAX_BRUSH_SIZE),
        _ => DEFAULT_BRUSH_SIZE,
    }
}

pub fn validate_stroke_id(raw: &str) -> Result<String, ValidationError> {
    let stroke_id = raw.trim();
    if stroke_id.is_empty() || stroke_id.chars().count() > MAX_USER_ID_CHARS {
        return Err(ValidationError::new("strokeId", "must be 1-64 characters"));
    }
    if !stroke_id.chars().all(is_id_char) {
        return Err(ValidationError::new("strokeId", "contains unsupported characters"));
    }
    Ok(stroke_id.to_string())
}

/// Canvas ids name files on disk, so only id characters are allowed.
pub fn validate_canvas_id(raw: &str) -> Result<String, ValidationError> {
    let canvas_id = raw.trim();
    if canvas_id.is_empty() || canvas_id.chars().count() > MAX_USER_ID_CHARS {
        return Err(ValidationError::new("canvasId", "must be 1-64 characters"));
    }
    if canvas_id.starts_with('.') || !canvas_id.chars().all(is_id_char) {
        return Err(ValidationError::new("canvasId", "contains unsupported characters"));
    }
    Ok(canvas_id.to_string())
}

// ── Snapshots & opaque payloads ────────────────────────────────────

/// Check a snapshot against schema-level bounds. Returns the serialized
/// size on success.
pub fn validate_snapshot(snapshot: &CanvasSnapshot, limits: &Limits) -> Result<usize, ValidationError> {
    for stroke in &snapshot.strokes {
        if stroke.points.len() > limits.max_stroke_points {
            return Err(ValidationError::new(
                "strokes",
                format!("stroke `{}` holds {} points", stroke.id, stroke.points.len()),
            ));
        }
        if let Some(StrokePoint { x, y, .. }) =
            stroke.points.iter().find(|p| validate_point(p.x, p.y).is_err())
        {
            return Err(ValidationError::new("strokes", format!("point ({x}, {y}) is out of bounds")));
        }
    }

    if let Some(image_data) = &snapshot.image_data {
        if !image_data.starts_with("data:image/") {
            return Err(ValidationError::new("imageData", "must be an image data URL"));
        }
    }

    let size = serde_json::to_vec(snapshot)
        .map_err(|error| ValidationError::new("snapshot", error.to_string()))?
        .len();
    if size > limits.max_snapshot_bytes {
        return Err(ValidationError::new(
            "snapshot",
            format!("{size} bytes exceeds limit of {} bytes", limits.max_snapshot_bytes),
        ));
    }
    Ok(size)
}

/// Opaque payloads are never inspected, only size-bounded.
pub fn validate_signal_payload(payload: &serde_json::Value) -> Result<(), ValidationError> {
    let size = serde_json::to_vec(payload)
        .map_err(|error| ValidationError::new("signal", error.to_string()))?
        .len();
    if size > MAX_SIGNAL_BYTES {
        return Err(ValidationError::new(
            "signal",
            format!("{size} bytes exceeds limit of {MAX_SIGNAL_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Largest frame accepted on the realtime channel.
pub fn ws_frame_limit(limits: &Limits) -> usize {
    limits.max_snapshot_bytes.saturating_add(MAX_WS_FRAME_BYTES)
}

/// Check if a WebSocket frame exceeds the size limit.
pub fn check_ws_frame_size(payload: &[u8], limit: usize) -> Result<(), String> {
    if payload.len() > limit {
        Err(format!("frame size {} bytes exceeds limit of {} bytes", payload.len(), limit))
    } else {
        Ok(())
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvasync_common::types::Stroke;
    use chrono::Utc;
    use serde_json::json;

    fn stroke_with(points: Vec<StrokePoint>) -> Stroke {
        Stroke {
            id: "s-1".into(),
            owner_id: "u1".into(),
            color: "#000".into(),
            width: 2.0,
            points,
            completed: true,
            forced_end: false,
            start_time: Utc::now(),
            end_time: None,
            server_sequence: 1,
        }
    }

    // ── Identity ───────────────────────────────────────────────────

    #[test]
    fn user_id_accepts_common_forms() {
        assert_eq!(validate_user_id(" user-1 ").unwrap(), "user-1");
        assert!(validate_user_id("a1b2c3d4-e5f6-7890-abcd-ef1234567890").is_ok());
    }

    #[test]
    fn user_id_rejects_empty_long_and_odd_characters() {
        assert!(validate_user_id("   ").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
        assert!(validate_user_id("<script>").is_err());
        assert!(validate_user_id("a b").is_err());
    }

    #[test]
    fn nickname_is_sanitized_and_capped() {
        assert_eq!(sanitize_nickname("  Ada \t Lovelace ").unwrap(), "Ada Lovelace");
        assert_eq!(sanitize_nickname("<b>Bob</b>").unwrap(), "bBob/b");
        assert_eq!(sanitize_nickname(&"n".repeat(80)).unwrap().chars().count(), MAX_NICKNAME_CHARS);
        assert!(sanitize_nickname("<>\u{7}").is_err());
    }

    // ── Chat ───────────────────────────────────────────────────────

    #[test]
    fn chat_text_strips_control_characters() {
        assert_eq!(sanitize_chat_text(" hi\u{0}there \n").unwrap(), "hithere");
        assert!(sanitize_chat_text(" \u{1b} ").is_err());
        assert!(sanitize_chat_text(&"x".repeat(MAX_CHAT_CHARS + 1)).is_err());
    }

    // ── Drawing ────────────────────────────────────────────────────

    #[test]
    fn points_must_be_inside_unit_square() {
        assert!(validate_point(0.0, 1.0).is_ok());
        assert!(validate_point(0.5, 0.5).is_ok());
        assert!(validate_point(-0.01, 0.5).is_err());
        assert!(validate_point(0.5, 1.01).is_err());
        assert!(validate_point(f64::NAN, 0.5).is_err());
        assert!(validate_point(0.5, f64::INFINITY).is_err());
    }

    #[test]
    fn colors_fall_back_to_default() {
        assert_eq!(normalize_color(Some("#FF0000")), "#ff0000");
        assert_eq!(normalize_color(Some("#abc")), "#abc");
        assert_eq!(normalize_color(Some("red")), DEFAULT_COLOR);
        assert_eq!(normalize_color(Some("#12345")), DEFAULT_COLOR);
        assert_eq!(normalize_color(None), DEFAULT_COLOR);
    }

    #[test]
    fn brush_size_is_clamped() {
        assert_eq!(normalize_brush_size(Some(500.0)), MAX_BRUSH_SIZE);
        assert_eq!(normalize_brush_size(Some(0.0)), MIN_BRUSH_SIZE);
        assert_eq!(normalize_brush_size(Some(f64::NAN)), DEFAULT_BRUSH_SIZE);
        assert_eq!(normalize_brush_size(None), DEFAULT_BRUSH_SIZE);
    }

    #[test]
    fn canvas_id_cannot_escape_the_data_dir() {
        assert_eq!(validate_canvas_id("main").unwrap(), "main");
        assert!(validate_canvas_id("../etc/passwd").is_err());
        assert!(validate_canvas_id("a/b").is_err());
        assert!(validate_canvas_id("").is_err());
        assert!(validate_canvas_id(".hidden").is_err());
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_with_too_many_points_is_rejected() {
        let limits = Limits { max_stroke_points: 2, ..Limits::default() };
        let mut snapshot = CanvasSnapshot::empty("main");
        snapshot.strokes.push(stroke_with(vec![StrokePoint { x: 0.1, y: 0.1, t: 0 }; 3]));
        let error = validate_snapshot(&snapshot, &limits).unwrap_err();
        assert_eq!(error.field, "strokes");
    }

    #[test]
    fn snapshot_with_out_of_bounds_point_is_rejected() {
        let mut snapshot = CanvasSnapshot::empty("main");
        snapshot.strokes.push(stroke_with(vec![StrokePoint { x: 1.5, y: 0.1, t: 0 }]));
        assert!(validate_snapshot(&snapshot, &Limits::default()).is_err());
    }

    #[test]
    fn oversized_snapshot_is_rejected() {
        let limits = Limits { max_snapshot_bytes: 64, ..Limits::default() };
        let snapshot = CanvasSnapshot::empty("main");
        assert_eq!(validate_snapshot(&snapshot, &limits).unwrap_err().field, "snapshot");
    }

    #[test]
    fn image_data_must_be_data_url() {
        let mut snapshot = CanvasSnapshot::empty("main");
        snapshot.image_data = Some("https://example.com/a.png".into());
        assert!(validate_snapshot(&snapshot, &Limits::default()).is_err());
        snapshot.image_data = Some("data:image/png;base64,AAAA".into());
        assert!(validate_snapshot(&snapshot, &Limits::default()).is_ok());
    }

    #[test]
    fn signal_payload_is_only_size_checked() {
        assert!(validate_signal_payload(&json!({ "anything": ["goes", 1, null] })).is_ok());
        let huge = json!({ "sdp": "x".repeat(MAX_SIGNAL_BYTES) });
        assert!(validate_signal_payload(&huge).is_err());
    }

    #[test]
    fn ws_frame_size_limit() {
        let limits = Limits { max_snapshot_bytes: 1024, ..Limits::default() };
        let limit = ws_frame_limit(&limits);
        assert_eq!(limit, 1024 + MAX_WS_FRAME_BYTES);
        assert!(check_ws_frame_size(&vec![0; limit], limit).is_ok());
        assert!(check_ws_frame_size(&vec![0; limit + 1], limit).is_err());
    }
}
