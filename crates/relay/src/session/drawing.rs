// Per-identity drawing state machine.
//
//   Idle    --start-->  Drawing
//   Drawing --start-->  Drawing   (previous stroke force-ended)
//   Drawing --point-->  Drawing
//   Drawing --end---->  Idle
//
// `point`/`end` while Idle are soft rejections.

use canvasync_common::protocol::ws::DrawingData;
use canvasync_common::types::{Stroke, StrokePoint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::persistence::CanvasCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawPhase {
    Idle,
    Drawing,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DrawRejection {
    #[error("point moved {distance:.3} (max {max})")]
    MovementTooLarge { distance: f64, max: f64 },
    #[error("no stroke in progress")]
    NotDrawing,
    #[error("point is outside the canvas")]
    OutOfBounds,
    /// The stroke hit its point ceiling and was closed by the server.
    #[error("stroke `{stroke_id}` reached its point limit")]
    StrokeFull { stroke_id: String, forced_end: Box<DrawAccepted> },
    #[error("user `{0}` is not in the session")]
    UnknownUser(String),
}

impl DrawRejection {
    /// Soft rejections are dropped silently; the rest are reported.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::MovementTooLarge { .. } | Self::NotDrawing)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::MovementTooLarge { .. } => "movement_too_large",
            Self::NotDrawing => "not_drawing",
            Self::OutOfBounds => "out_of_bounds",
            Self::StrokeFull { .. } => "stroke_full",
            Self::UnknownUser(_) => "unknown_user",
        }
    }
}

/// An accepted drawing step: what to broadcast and what to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawAccepted {
    pub sequence: u64,
    /// Normalized payload for fan-out.
    pub data: DrawingData,
    pub commands: Vec<CanvasCommand>,
}

#[derive(Debug, Default, Clone)]
pub struct DrawingState {
    active: Option<Stroke>,
    stroke_count: u64,
}

impl DrawingState {
    pub fn phase(&self) -> DrawPhase {
        if self.active.is_some() {
            DrawPhase::Drawing
        } else {
            DrawPhase::Idle
        }
    }

    pub fn active_stroke(&self) -> Option<&Stroke> {
        self.active.as_ref()
    }

    pub fn last_point(&self) -> Option<&StrokePoint> {
        self.active.as_ref().and_then(Stroke::last_point)
    }

    pub fn stroke_count(&self) -> u64 {
        self.stroke_count
    }

    /// Open `stroke`, returning the previous stroke if one had to be
    /// force-ended.
    pub(super) fn start(&mut self, stroke: Stroke, at: DateTime<Utc>) -> Option<Stroke> {
        let previous = self.finish(true, at);
        self.active = Some(stroke);
        self.stroke_count += 1;
        previous
    }

    pub(super) fn append(&mut self, point: StrokePoint, max_movement: f64) -> Result<&Stroke, DrawRejection> {
        let stroke = self.active.as_mut().ok_or(DrawRejection::NotDrawing)?;
        if let Some(last) = stroke.last_point() {
            let distance = last.distance_to(&point);
            if distance > max_movement {
                return Err(DrawRejection::MovementTooLarge { distance, max: max_movement });
            }
        }
        stroke.points.push(point);
        Ok(stroke)
    }

    pub(super) fn point_count(&self) -> Option<usize> {
        self.active.as_ref().map(|stroke| stroke.points.len())
    }

    /// Close the active stroke, if any.
    pub(super) fn finish(&mut self, forced: bool, at: DateTime<Utc>) -> Option<Stroke> {
        let mut stroke = self.active.take()?;
        stroke.finish(forced, at);
        Some(stroke)
    }

    pub(super) fn reset(&mut self) -> Option<Stroke> {
        self.active.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(id: &str, x: f64, y: f64) -> Stroke {
        Stroke {
            id: id.into(),
            owner_id: "u1".into(),
            color: "#000000".into(),
            width: 3.0,
            points: vec![StrokePoint { x, y, t: 0 }],
            completed: false,
            forced_end: false,
            start_time: Utc::now(),
            end_time: None,
            server_sequence: 1,
        }
    }

    #[test]
    fn starts_idle() {
        let state = DrawingState::default();
        assert_eq!(state.phase(), DrawPhase::Idle);
        assert!(state.last_point().is_none());
    }

    #[test]
    fn start_mid_stroke_force_ends_previous() {
        let mut state = DrawingState::default();
        assert!(state.start(stroke("a", 0.1, 0.1), Utc::now()).is_none());
        let previous = state.start(stroke("b", 0.5, 0.5), Utc::now()).unwrap();

        assert_eq!(previous.id, "a");
        assert!(previous.completed);
        assert!(previous.forced_end);
        assert_eq!(state.active_stroke().map(|s| s.id.as_str()), Some("b"));
        assert_eq!(state.stroke_count(), 2);
    }

    #[test]
    fn append_rejects_large_jumps_without_mutation() {
        let mut state = DrawingState::default();
        state.start(stroke("a", 0.1, 0.1), Utc::now());

        let rejection = state.append(StrokePoint { x: 0.9, y: 0.9, t: 1 }, 0.2).unwrap_err();
        assert!(matches!(rejection, DrawRejection::MovementTooLarge { .. }));
        assert!(rejection.is_soft());
        assert_eq!(state.point_count(), Some(1));

        state.append(StrokePoint { x: 0.2, y: 0.2, t: 2 }, 0.2).unwrap();
        assert_eq!(state.last_point().map(|p| (p.x, p.y)), Some((0.2, 0.2)));
    }

    #[test]
    fn append_while_idle_is_soft() {
        let mut state = DrawingState::default();
        let rejection = state.append(StrokePoint { x: 0.2, y: 0.2, t: 0 }, 0.2).unwrap_err();
        assert_eq!(rejection, DrawRejection::NotDrawing);
        assert!(rejection.is_soft());
        assert!(!DrawRejection::OutOfBounds.is_soft());
    }

    #[test]
    fn finish_returns_to_idle() {
        let mut state = DrawingState::default();
        state.start(stroke("a", 0.1, 0.1), Utc::now());
        let done = state.finish(false, Utc::now()).unwrap();
        assert!(done.completed);
        assert!(!done.forced_end);
        assert_eq!(state.phase(), DrawPhase::Idle);
        assert!(state.finish(false, Utc::now()).is_none());
    }
}
