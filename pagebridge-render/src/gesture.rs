//! Raw pointer input to zoom and selection intents.

use std::time::Duration;

use pagebridge_core::{GestureConfig, Point, ZoomDirection};
use tracing::trace;

use crate::session::SandboxSession;

/// Pointer input in container coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum PointerEvent {
    TouchStart { touches: Vec<Point> },
    TouchMove { touches: Vec<Point> },
    /// `touches` holds the points still down.
    TouchEnd { touches: Vec<Point> },
    Wheel { delta_y: f32 },
    /// A single tap; `at_ms` is a monotonic timestamp.
    Tap { point: Point, at_ms: u64 },
    DoubleClick { point: Point },
    /// The platform's own selection changed.
    SelectionChanged { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GestureIntent {
    Zoom(ZoomDirection),
    ZoomTo(f32),
    Select(String),
}

#[derive(Debug)]
pub struct GestureController {
    dead_zone: f32,
    double_tap_window: Duration,
    double_tap_zoom: bool,
    pinch_reference: Option<f32>,
    last_tap_ms: Option<u64>,
}

impl GestureController {
    pub fn new(config: &GestureConfig) -> Self {
        Self {
            dead_zone: config.pinch_dead_zone_px.max(0.0),
            double_tap_window: config.double_tap_window,
            double_tap_zoom: config.double_tap_zoom,
            pinch_reference: None,
            last_tap_ms: None,
        }
    }

    pub fn handle(&mut self, event: PointerEvent, session: &SandboxSession) -> Option<GestureIntent> {
        match event {
            PointerEvent::TouchStart { touches } => {
                self.pinch_reference = pinch_distance(&touches);
                None
            }
            PointerEvent::TouchMove { touches } => self.pinch(&touches),
            PointerEvent::TouchEnd { touches } => {
                if touches.len() < 2 {
                    self.pinch_reference = None;
                }
                None
            }
            PointerEvent::Wheel { delta_y } => Some(GestureIntent::Zoom(if delta_y < 0.0 {
                ZoomDirection::In
            } else {
                ZoomDirection::Out
            })),
            PointerEvent::Tap { point, at_ms } => {
                let window = self.double_tap_window.as_millis() as u64;
                match self.last_tap_ms.take() {
                    Some(previous) if at_ms.saturating_sub(previous) <= window => {
                        self.double_tap(point, session)
                    }
                    _ => {
                        self.last_tap_ms = Some(at_ms);
                        None
                    }
                }
            }
            PointerEvent::DoubleClick { point } => self.double_tap(point, session),
            PointerEvent::SelectionChanged { text } => {
                let text = text.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(GestureIntent::Select(text.to_owned()))
                }
            }
        }
    }

    fn pinch(&mut self, touches: &[Point]) -> Option<GestureIntent> {
        let distance = pinch_distance(touches)?;
        let Some(reference) = self.pinch_reference else {
            self.pinch_reference = Some(distance);
            return None;
        };
        let change = distance - reference;
        if change.abs() <= self.dead_zone {
            return None;
        }
        trace!(reference, distance, "pinch step");
        self.pinch_reference = Some(distance);
        Some(GestureIntent::Zoom(if change > 0.0 {
            ZoomDirection::In
        } else {
            ZoomDirection::Out
        }))
    }

    fn double_tap(&mut self, point: Point, session: &SandboxSession) -> Option<GestureIntent> {
        if let Some(item) = session.hit_test(point) {
            let text = item.text.trim();
            if !text.is_empty() {
                return Some(GestureIntent::Select(text.to_owned()));
            }
        }
        if !self.double_tap_zoom || session.document().is_none() {
            return None;
        }
        let fit = session.fit_scale();
        let scale = session.viewport().scale;
        let target = if (scale - fit).abs() < 1e-4 {
            session.limits().clamp(fit * 2.0)
        } else {
            fit
        };
        Some(GestureIntent::ZoomTo(target))
    }
}

fn pinch_distance(touches: &[Point]) -> Option<f32> {
    match touches {
        [a, b, ..] => Some(a.distance(*b)),
        _ => None,
    }
}
