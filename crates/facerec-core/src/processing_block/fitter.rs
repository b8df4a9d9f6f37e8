use super::{object_bbox, objects, write_per_object, ProcessingBlock, UnitType};
use crate::alignment::{ALIGNED_SIZE, REFERENCE_LANDMARKS_112};
use crate::context::Context;
use crate::detector::{iou, FaceDetector};
use crate::error::{Error, Result};
use crate::frame::ImageRef;
use crate::types::BoundingBox;
use crate::value::Value;

const KEYPOINT_NAMES: [&str; 5] = ["left_eye", "right_eye", "nose", "mouth_left", "mouth_right"];

/// Fraction of the box size added on every side before re-detection.
const CROP_MARGIN: f32 = 0.5;
/// Minimum overlap between the re-detected face and the input box.
const MIN_MATCH_IOU: f32 = 0.3;

/// `FACE_FITTER`: five-point landmarks for every object.
///
/// Runs the landmark-capable detector on a margin crop around each box and
/// keeps the detection overlapping the box best. When none overlaps, the
/// object's detector `landmarks` are used, and failing those the reference
/// layout scaled into the box.
pub struct FaceFitterBlock {
    detector: FaceDetector,
}

impl FaceFitterBlock {
    pub fn new(detector: FaceDetector) -> Self {
        Self { detector }
    }

    fn fit(&mut self, image: &ImageRef<'_>, object: &Value) -> Result<[(f32, f32); 5]> {
        let bbox = object_bbox(object)?;
        let face = BoundingBox::from_normalized(bbox, image.width, image.height, 1.0);
        let (x0, y0, w, h) = margin_region(&face, image.width, image.height);
        let (crop, cw, ch) = image.crop(x0, y0, w, h);
        let crop_ref = ImageRef { data: &crop, width: cw, height: ch };

        let target = BoundingBox {
            x: face.x - x0 as f32,
            y: face.y - y0 as f32,
            ..face.clone()
        };
        let best = self
            .detector
            .detect(&crop_ref)?
            .into_iter()
            .filter_map(|d| d.landmarks.map(|lm| (iou(&d, &target), lm)))
            .filter(|(overlap, _)| *overlap >= MIN_MATCH_IOU)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        Ok(match best {
            Some((_, lm)) => lm.map(|(x, y)| (x + x0 as f32, y + y0 as f32)),
            None => match read_detector_landmarks(object, image.width, image.height) {
                Some(lm) => {
                    tracing::debug!(?bbox, "no landmark detection matched the box, using detector landmarks");
                    lm
                }
                None => {
                    tracing::debug!(?bbox, "no landmarks for the box, using reference layout");
                    prior_landmarks(&face)
                }
            },
        })
    }
}

impl ProcessingBlock for FaceFitterBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::FaceFitter
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let (fitted, width, height) = {
            let root = ctx.root()?;
            let image = ImageRef::from_context_root(root)?;
            let objects = objects(root)?;
            let fitted = (0..objects.len()?)
                .map(|i| -> Result<_> { self.fit(&image, objects.get_by_index(i)?) })
                .collect::<Result<Vec<_>>>()?;
            (fitted, image.width, image.height)
        };
        let values = fitted.iter().map(|lm| keypoints_value(lm, width, height)).collect();
        write_per_object(ctx, "keypoints", values)
    }
}

/// Box grown by [`CROP_MARGIN`] on each side, clamped to the image.
fn margin_region(face: &BoundingBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x0 = (face.x - mx).max(0.0).floor();
    let y0 = (face.y - my).max(0.0).floor();
    let x1 = (face.x + face.width + mx).min(width as f32).ceil();
    let y1 = (face.y + face.height + my).min(height as f32).ceil();
    (
        x0 as u32,
        y0 as u32,
        (x1 - x0).max(1.0) as u32,
        (y1 - y0).max(1.0) as u32,
    )
}

/// Reference landmark layout stretched over the box.
fn prior_landmarks(face: &BoundingBox) -> [(f32, f32); 5] {
    let s = ALIGNED_SIZE as f32;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (face.x + x / s * face.width, face.y + y / s * face.height))
}

fn proj(x: f32, y: f32, width: u32, height: u32) -> Value {
    let coords = vec![
        Value::Float(x as f64 / width.max(1) as f64),
        Value::Float(y as f64 / height.max(1) as f64),
    ];
    Value::Object(vec![("proj".to_string(), Value::Array(coords))])
}

/// Ordered `[{proj: [x, y]}]` list, normalised.
pub(crate) fn points_value(landmarks: &[(f32, f32); 5], width: u32, height: u32) -> Value {
    Value::Array(landmarks.iter().map(|&(x, y)| proj(x, y, width, height)).collect())
}

/// `keypoints` object: named points plus the ordered `points` list, normalised.
pub(crate) fn keypoints_value(landmarks: &[(f32, f32); 5], width: u32, height: u32) -> Value {
    let mut entries: Vec<(String, Value)> = KEYPOINT_NAMES
        .iter()
        .zip(landmarks)
        .map(|(name, &(x, y))| (name.to_string(), proj(x, y, width, height)))
        .collect();
    entries.push(("points".to_string(), points_value(landmarks, width, height)));
    Value::Object(entries)
}

/// Five points in pixel coordinates from a `[{proj}]` list; `None` if malformed.
fn read_points(points: &Value, width: u32, height: u32) -> Option<[(f32, f32); 5]> {
    if points.len().ok()? < 5 {
        return None;
    }
    let mut out = [(0.0f32, 0.0f32); 5];
    for (i, slot) in out.iter_mut().enumerate() {
        let proj = points.get_by_index(i).ok()?.get_by_key("proj").ok()?;
        let coord = |j: usize| proj.get_by_index(j).ok().and_then(Value::as_f64);
        *slot = (coord(0)? as f32 * width as f32, coord(1)? as f32 * height as f32);
    }
    Some(out)
}

/// Landmarks the detector stored on the object, if any.
fn read_detector_landmarks(object: &Value, width: u32, height: u32) -> Option<[(f32, f32); 5]> {
    read_points(object.get_by_key("landmarks").ok()?, width, height)
}

/// Landmarks of one object in pixel coordinates, read from `keypoints.points`.
pub(crate) fn read_landmarks(object: &Value, width: u32, height: u32) -> Result<[(f32, f32); 5]> {
    object
        .get_by_key("keypoints")
        .and_then(|k| k.get_by_key("points"))
        .ok()
        .and_then(|points| read_points(points, width, height))
        .ok_or_else(|| Error::Processing("object has no keypoints; run FACE_FITTER first".into()))
}
