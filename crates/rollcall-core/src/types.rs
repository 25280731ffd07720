use serde::{Deserialize, Serialize};

/// Label reported when the recognizer is untrained or has no match.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Axis-aligned bounding box for a detected face, in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Center of the box, in source-image pixels.
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    /// Scale the box by a uniform factor (detector downscale undo).
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: (self.x as f32 * factor).round() as i32,
            y: (self.y as f32 * factor).round() as i32,
            width: (self.width as f32 * factor).round().max(1.0) as u32,
            height: (self.height as f32 * factor).round().max(1.0) as u32,
        }
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width as i32).min(other.x + other.width as i32);
        let y2 = (self.y + self.height as i32).min(other.y + other.height as i32);

        let inter_w = (x2 - x1).max(0) as u64;
        let inter_h = (y2 - y1).max(0) as u64;
        let inter = inter_w * inter_h;

        let union = self.area() + other.area() - inter;
        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// Identity prediction from the recognizer. Lower distance = better match.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub distance: f32,
}

impl Prediction {
    /// The prediction returned when no model is available or nothing matches.
    pub fn unknown() -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            distance: f32::INFINITY,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}
