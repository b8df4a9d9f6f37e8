use super::fitter::points_value;
use super::{ProcessingBlock, UnitType};
use crate::context::Context;
use crate::detector::FaceDetector;
use crate::error::Result;
use crate::frame::ImageRef;
use crate::types::BoundingBox;
use crate::value::Value;

/// `FACE_DETECTOR`: replaces `objects` with one entry per detected face.
///
/// Faces that come with detector landmarks also get a `landmarks` point
/// list, which the fitter uses when its own re-detection misses.
pub struct FaceDetectorBlock {
    detector: FaceDetector,
}

impl FaceDetectorBlock {
    pub fn new(detector: FaceDetector) -> Self {
        Self { detector }
    }
}

impl ProcessingBlock for FaceDetectorBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::FaceDetector
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let (faces, width, height) = {
            let image = ImageRef::from_context_root(ctx.root()?)?;
            (self.detector.detect(&image)?, image.width, image.height)
        };
        tracing::debug!(faces = faces.len(), width, height, "faces detected");
        ctx.root_mut()?.insert("objects", objects_value(&faces, width, height))
    }
}

fn object_value(id: usize, face: &BoundingBox, width: u32, height: u32) -> Value {
    let bbox = face.normalized(width, height).into_iter().map(Value::Float).collect();
    let mut entries = vec![
        ("id".to_string(), Value::Int(id as i64)),
        ("class".to_string(), Value::from("face")),
        ("confidence".to_string(), Value::Float(face.confidence as f64)),
        ("bbox".to_string(), Value::Array(bbox)),
    ];
    if let Some(landmarks) = &face.landmarks {
        entries.push(("landmarks".to_string(), points_value(landmarks, width, height)));
    }
    Value::Object(entries)
}

fn objects_value(faces: &[BoundingBox], width: u32, height: u32) -> Value {
    Value::Array(
        faces
            .iter()
            .enumerate()
            .map(|(id, face)| object_value(id, face, width, height))
            .collect(),
    )
}
