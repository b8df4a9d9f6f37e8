use super::{object_bbox, object_confidence, objects, write_per_object, ProcessingBlock, UnitType};
use crate::context::Context;
use crate::error::Result;
use crate::frame::{avg_brightness, laplacian_variance, ImageRef};
use crate::types::BoundingBox;
use crate::value::Value;

/// Normalisation points for the image-based scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityOptions {
    /// Face side length, in pixels, that earns a full size score.
    pub reference_face_size: f32,
    /// Laplacian variance that earns a full sharpness score.
    pub sharpness_reference: f32,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            reference_face_size: 112.0,
            sharpness_reference: 100.0,
        }
    }
}

/// `QUALITY_ASSESSMENT_ESTIMATOR`: heuristic per-face quality in `[0, 1]`.
///
/// `total_score` is the mean of the detection, size, brightness and
/// sharpness scores.
pub struct QualityBlock {
    options: QualityOptions,
}

impl QualityBlock {
    pub fn new(options: QualityOptions) -> Self {
        Self { options }
    }

    fn assess(&self, image: &ImageRef<'_>, object: &Value) -> Result<Value> {
        let face = BoundingBox::from_normalized(object_bbox(object)?, image.width, image.height, 1.0);
        let (crop, w, h) = image.crop(
            face.x.max(0.0) as u32,
            face.y.max(0.0) as u32,
            face.width.max(1.0) as u32,
            face.height.max(1.0) as u32,
        );
        let gray = ImageRef { data: &crop, width: w, height: h }.to_grayscale();

        let detection = object_confidence(object).clamp(0.0, 1.0);
        let size = (face.width.min(face.height) / self.options.reference_face_size).clamp(0.0, 1.0);
        let brightness = 1.0 - ((avg_brightness(&gray) - 128.0).abs() / 128.0).clamp(0.0, 1.0);
        let sharpness =
            (laplacian_variance(&gray, w as usize, h as usize) / self.options.sharpness_reference).clamp(0.0, 1.0);
        let total = (detection + size + brightness + sharpness) / 4.0;

        let scores = [("detection", detection), ("size", size), ("brightness", brightness), ("sharpness", sharpness)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::Float(v as f64)))
            .collect();
        Ok(Value::Object(vec![
            ("total_score".to_string(), Value::Float(total as f64)),
            ("scores".to_string(), Value::Object(scores)),
        ]))
    }
}

impl Default for QualityBlock {
    fn default() -> Self {
        Self::new(QualityOptions::default())
    }
}

impl ProcessingBlock for QualityBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::QualityAssessmentEstimator
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let assessed = {
            let root = ctx.root()?;
            let image = ImageRef::from_context_root(root)?;
            let objects = objects(root)?;
            (0..objects.len()?)
                .map(|i| -> Result<Value> { self.assess(&image, objects.get_by_index(i)?) })
                .collect::<Result<Vec<_>>>()?
        };
        write_per_object(ctx, "quality", assessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::image_value;
    use serde_json::json;

    fn context(rgb: Vec<u8>, width: u32, height: u32, objects: serde_json::Value) -> Context {
        let mut ctx = Context::new();
        let root = ctx.root_mut().unwrap();
        root.insert("image", image_value(rgb, width, height)).unwrap();
        root.insert("objects", Value::from(objects)).unwrap();
        ctx
    }

    fn checkerboard(size: u32) -> Vec<u8> {
        (0..size * size)
            .flat_map(|i| {
                let v = if (i % size + i / size) % 2 == 0 { 0 } else { 255 };
                [v, v, v]
            })
            .collect()
    }

    #[test]
    fn test_scores_in_unit_range() {
        let mut ctx = context(
            checkerboard(64),
            64,
            64,
            json!([{"confidence": 0.8, "bbox": [0.0, 0.0, 1.0, 1.0]}, {"bbox": [0.25, 0.25, 0.5, 0.5]}]),
        );
        QualityBlock::default().process(&mut ctx).unwrap();

        let objects = ctx.get_by_key("objects").unwrap();
        for i in 0..2 {
            let quality = objects.get_by_index(i).unwrap().get_by_key("quality").unwrap();
            let total = quality.get_by_key("total_score").unwrap().get_float().unwrap();
            assert!((0.0..=1.0).contains(&total));
            let scores = quality.get_by_key("scores").unwrap();
            assert_eq!(scores.keys().unwrap(), vec!["detection", "size", "brightness", "sharpness"]);
        }
        let first = objects.get_by_index(0).unwrap().get_by_key("quality").unwrap().get_by_key("scores").unwrap();
        assert!((first.get_by_key("detection").unwrap().get_float().unwrap() - 0.8).abs() < 1e-6);
        // A checkerboard is as sharp as it gets.
        assert_eq!(first.get_by_key("sharpness").unwrap().get_float().unwrap(), 1.0);
    }

    #[test]
    fn test_flat_dark_face_scores_low() {
        let mut ctx = context(vec![0u8; 32 * 32 * 3], 32, 32, json!([{"confidence": 1.0, "bbox": [0.0, 0.0, 1.0, 1.0]}]));
        QualityBlock::default().process(&mut ctx).unwrap();
        let quality = ctx.get_by_key("objects").unwrap().get_by_index(0).unwrap().get_by_key("quality").unwrap();
        let scores = quality.get_by_key("scores").unwrap();
        assert_eq!(scores.get_by_key("brightness").unwrap().get_float().unwrap(), 0.0);
        assert_eq!(scores.get_by_key("sharpness").unwrap().get_float().unwrap(), 0.0);
        let expected_size = 32.0f32 / 112.0;
        let total = quality.get_by_key("total_score").unwrap().get_float().unwrap();
        assert!((total - ((1.0 + expected_size) / 4.0) as f64).abs() < 1e-6);
    }
}
