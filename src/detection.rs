use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::bbox::{BBox, Ltwh};
use crate::error::Error;

/// The fixed set of object classes the pipeline understands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Player,
    Goalkeeper,
    Referee,
    Ball,
}

impl ObjectClass {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "player" | "players" => Some(Self::Player),
            "goalkeeper" | "goalkeepers" => Some(Self::Goalkeeper),
            "referee" | "referees" => Some(Self::Referee),
            "ball" | "sports ball" => Some(Self::Ball),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Goalkeeper => "goalkeeper",
            Self::Referee => "referee",
            Self::Ball => "ball",
        }
    }

    /// Classes that represent a person on the pitch.
    #[inline]
    pub fn is_person(&self) -> bool {
        !matches!(self, Self::Ball)
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untrusted payload as handed over by a detector adapter.
///
/// Box is in pixel space, (x, y) is the left-top corner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(rename = "p")]
    pub confidence: f32,
    #[serde(rename = "c")]
    pub class: String,
}

/// A validated per-frame detection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub frame_index: u64,
    pub bbox: BBox<Ltwh>,
    pub class: ObjectClass,
    pub confidence: f32,
}

impl Detection {
    pub fn new(frame_index: u64, bbox: BBox<Ltwh>, class: ObjectClass, confidence: f32) -> Self {
        Self {
            frame_index,
            bbox,
            class,
            confidence,
        }
    }

    /// Strict validation at the adapter boundary.
    pub fn validate(frame_index: u64, raw: &RawDetection) -> Result<Self, Error> {
        let invalid = |reason: String| Error::InvalidDetection {
            frame_index,
            reason,
        };

        let class = ObjectClass::from_label(&raw.class)
            .ok_or_else(|| invalid(format!("unknown class label {:?}", raw.class)))?;

        let bbox = BBox::ltwh(raw.x, raw.y, raw.w, raw.h);
        if !bbox.is_finite() {
            return Err(invalid("non-finite bounding box".into()));
        }

        if raw.w <= 0.0 || raw.h <= 0.0 {
            return Err(invalid(format!(
                "degenerate bounding box {}x{}",
                raw.w, raw.h
            )));
        }

        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(invalid(format!(
                "confidence {} outside [0, 1]",
                raw.confidence
            )));
        }

        Ok(Self::new(frame_index, bbox, class, raw.confidence))
    }

    #[inline]
    pub fn iou(&self, other: &Detection) -> f32 {
        self.bbox.iou(&other.bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class: &str, w: f32, confidence: f32) -> RawDetection {
        RawDetection {
            x: 10.0,
            y: 10.0,
            w,
            h: 30.0,
            confidence,
            class: class.into(),
        }
    }

    #[test]
    fn accepts_known_classes() {
        let det = Detection::validate(3, &raw("Goalkeeper", 10.0, 0.8)).unwrap();
        assert_eq!(det.class, ObjectClass::Goalkeeper);
        assert_eq!(det.frame_index, 3);
    }

    #[test]
    fn rejects_unknown_class() {
        assert!(matches!(
            Detection::validate(0, &raw("corner flag", 10.0, 0.8)),
            Err(Error::InvalidDetection { .. })
        ));
    }

    #[test]
    fn rejects_bad_geometry_and_confidence() {
        assert!(Detection::validate(0, &raw("player", 0.0, 0.8)).is_err());
        assert!(Detection::validate(0, &raw("player", f32::NAN, 0.8)).is_err());
        assert!(Detection::validate(0, &raw("player", 10.0, 1.5)).is_err());
    }

    #[test]
    fn raw_payload_uses_compact_keys() {
        let json = r#"{"x":1,"y":2,"w":3,"h":4,"p":0.9,"c":"ball"}"#;
        let raw: RawDetection = serde_json::from_str(json).unwrap();
        let det = Detection::validate(7, &raw).unwrap();
        assert_eq!(det.class, ObjectClass::Ball);
    }
}
