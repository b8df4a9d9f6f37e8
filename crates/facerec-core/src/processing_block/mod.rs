//! Processing blocks: pipeline stages that read and extend a [`Context`].
//!
//! Each block reads its inputs from the context tree and writes its outputs
//! back into it. Blocks are built by [`crate::FacerecService::create_processing_block`]
//! from a config tree such as `{"unit_type": "FACE_DETECTOR", "modification": "scrfd"}`.
//!
//! Detection results live under `objects`, one entry per face:
//!
//! ```text
//! {"id", "class": "face", "confidence", "bbox": [x1, y1, x2, y2],
//!  "keypoints": {...}, "face_template": {"template": <Template>}, "quality": {...}}
//! ```
//!
//! Coordinates are normalised to `[0, 1]` by the image size.

mod detector_block;
mod extractor;
mod fitter;
mod matcher;
mod quality;
mod verification;

pub use detector_block::FaceDetectorBlock;
pub use extractor::TemplateExtractorBlock;
pub use fitter::FaceFitterBlock;
pub use matcher::{MatcherBlock, DEFAULT_KNN};
pub use quality::{QualityBlock, QualityOptions};
pub use verification::{VerificationBlock, DEFAULT_THRESHOLD as DEFAULT_VERIFICATION_THRESHOLD};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::template::ContextTemplate;
use crate::value::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One pipeline stage.
///
/// `process` takes `&mut self`; share a block across threads only behind a lock.
pub trait ProcessingBlock: Send {
    fn unit_type(&self) -> UnitType;

    fn process(&mut self, ctx: &mut Context) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitType {
    FaceDetector,
    FaceFitter,
    FaceTemplateExtractor,
    MatcherModule,
    VerificationModule,
    QualityAssessmentEstimator,
    EmotionEstimator,
    AgeEstimator,
    GenderEstimator,
    MaskEstimator,
    GlassesEstimator,
    EyeOpennessEstimator,
    LivenessEstimator,
    DeepfakeEstimator,
}

impl UnitType {
    pub const ALL: [UnitType; 14] = [
        UnitType::FaceDetector,
        UnitType::FaceFitter,
        UnitType::FaceTemplateExtractor,
        UnitType::MatcherModule,
        UnitType::VerificationModule,
        UnitType::QualityAssessmentEstimator,
        UnitType::EmotionEstimator,
        UnitType::AgeEstimator,
        UnitType::GenderEstimator,
        UnitType::MaskEstimator,
        UnitType::GlassesEstimator,
        UnitType::EyeOpennessEstimator,
        UnitType::LivenessEstimator,
        UnitType::DeepfakeEstimator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitType::FaceDetector => "FACE_DETECTOR",
            UnitType::FaceFitter => "FACE_FITTER",
            UnitType::FaceTemplateExtractor => "FACE_TEMPLATE_EXTRACTOR",
            UnitType::MatcherModule => "MATCHER_MODULE",
            UnitType::VerificationModule => "VERIFICATION_MODULE",
            UnitType::QualityAssessmentEstimator => "QUALITY_ASSESSMENT_ESTIMATOR",
            UnitType::EmotionEstimator => "EMOTION_ESTIMATOR",
            UnitType::AgeEstimator => "AGE_ESTIMATOR",
            UnitType::GenderEstimator => "GENDER_ESTIMATOR",
            UnitType::MaskEstimator => "MASK_ESTIMATOR",
            UnitType::GlassesEstimator => "GLASSES_ESTIMATOR",
            UnitType::EyeOpennessEstimator => "EYE_OPENNESS_ESTIMATOR",
            UnitType::LivenessEstimator => "LIVENESS_ESTIMATOR",
            UnitType::DeepfakeEstimator => "DEEPFAKE_ESTIMATOR",
        }
    }

    /// Whether this build ships an implementation for the unit.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            UnitType::FaceDetector
                | UnitType::FaceFitter
                | UnitType::FaceTemplateExtractor
                | UnitType::MatcherModule
                | UnitType::VerificationModule
                | UnitType::QualityAssessmentEstimator
        )
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UnitType::ALL
            .into_iter()
            .find(|u| u.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown unit_type {s:?}")))
    }
}

/// Parsed block configuration. Unit-specific keys stay in the raw tree.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    pub unit_type: UnitType,
    pub modification: Option<String>,
    pub version: Option<u32>,
    /// Overrides the model file resolved from the model directory.
    pub model_path: Option<PathBuf>,
    params: Value,
}

impl BlockConfig {
    pub fn new(unit_type: UnitType) -> Self {
        Self {
            unit_type,
            modification: None,
            version: None,
            model_path: None,
            params: Value::Null,
        }
    }

    pub fn from_value(config: &Value) -> Result<Self> {
        let unit_type = config
            .get_by_key("unit_type")
            .and_then(Value::get_string)
            .map_err(|_| Error::Config("block config requires string \"unit_type\"".into()))?
            .parse()?;

        let modification = match config.get_by_key("modification") {
            Ok(v) => Some(
                v.get_string()
                    .map_err(|_| Error::Config("\"modification\" must be a string".into()))?
                    .to_string(),
            ),
            Err(_) => None,
        };
        let version = match config.get_by_key("version") {
            Ok(v) => Some(
                v.as_i64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| Error::Config("\"version\" must be a non-negative integer".into()))?,
            ),
            Err(_) => None,
        };
        let model_path = match config.get_by_key("model_path") {
            Ok(v) => Some(PathBuf::from(
                v.get_string()
                    .map_err(|_| Error::Config("\"model_path\" must be a string".into()))?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            unit_type,
            modification,
            version,
            model_path,
            params: config.clone(),
        })
    }

    pub fn with_modification(mut self, modification: impl Into<String>) -> Self {
        self.modification = Some(modification.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.params.insert(key, value.into())?;
        Ok(self)
    }

    pub fn modification_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.modification.as_deref().unwrap_or(default)
    }

    /// Numeric parameter, or `default` when absent.
    pub fn f32_param(&self, key: &str, default: f32) -> Result<f32> {
        match self.params.get_by_key(key) {
            Ok(v) => v
                .as_f64()
                .map(|n| n as f32)
                .ok_or_else(|| Error::Config(format!("\"{key}\" must be a number"))),
            Err(_) => Ok(default),
        }
    }

    /// Positive integer parameter, or `default` when absent.
    pub fn usize_param(&self, key: &str, default: usize) -> Result<usize> {
        match self.params.get_by_key(key) {
            Ok(v) => v
                .as_i64()
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::Config(format!("\"{key}\" must be a positive integer"))),
            Err(_) => Ok(default),
        }
    }
}

/// Ordered blocks run one after another on the same context.
#[derive(Default)]
pub struct Pipeline {
    blocks: Vec<Box<dyn ProcessingBlock>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: Box<dyn ProcessingBlock>) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn unit_types(&self) -> Vec<UnitType> {
        self.blocks.iter().map(|b| b.unit_type()).collect()
    }

    /// Run every block in order, stopping at the first failure.
    pub fn process(&mut self, ctx: &mut Context) -> Result<()> {
        for block in &mut self.blocks {
            let unit = block.unit_type();
            block.process(ctx).map_err(|e| {
                tracing::debug!(unit = %unit, error = %e, "block failed");
                e
            })?;
        }
        Ok(())
    }
}

impl FromIterator<Box<dyn ProcessingBlock>> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Box<dyn ProcessingBlock>>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

/// Detection, landmark fitting and template extraction for enrolment and probes.
pub struct FaceTemplatePipeline {
    detection: Pipeline,
    extractor: Box<dyn ProcessingBlock>,
}

impl FaceTemplatePipeline {
    /// `detection` holds the detector and fitter stages.
    pub fn new(detection: Pipeline, extractor: Box<dyn ProcessingBlock>) -> Self {
        Self { detection, extractor }
    }

    /// Run every stage, whatever the number of detected faces.
    pub fn process(&mut self, ctx: &mut Context) -> Result<()> {
        self.detection.process(ctx)?;
        self.extractor.process(ctx)
    }

    /// Template of the only face in `ctx`.
    ///
    /// Fails with [`Error::FaceCount`] unless exactly one face is detected;
    /// extraction is skipped in that case.
    pub fn single_face_template(&mut self, ctx: &mut Context) -> Result<ContextTemplate> {
        self.detection.process(ctx)?;
        let found = face_count(ctx)?;
        if found != 1 {
            return Err(Error::FaceCount { found });
        }
        self.extractor.process(ctx)?;
        first_face_template(ctx)
    }
}

/// Number of entries under `objects`; zero when absent.
pub fn face_count(ctx: &Context) -> Result<usize> {
    match ctx.root()?.get_by_key("objects") {
        Ok(objects) => objects.len(),
        Err(Error::NotFound(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// `objects[0].face_template.template`.
pub fn first_face_template(ctx: &Context) -> Result<ContextTemplate> {
    let first = ctx.root()?.get_by_key("objects")?.get_by_index(0)?;
    first
        .get_by_key("face_template")?
        .get_by_key("template")?
        .get_template()
        .cloned()
}

/// Accepts a Template, or an object holding one under `template` or `face_template`.
pub(crate) fn template_of(value: &Value) -> Result<ContextTemplate> {
    match value {
        Value::Template(t) => Ok(t.clone()),
        Value::Object(_) => {
            if let Ok(inner) = value.get_by_key("template") {
                template_of(inner)
            } else if let Ok(inner) = value.get_by_key("face_template") {
                template_of(inner)
            } else {
                Err(Error::Processing("object holds no template".into()))
            }
        }
        other => Err(Error::Processing(format!("expected a template, found {}", other.kind()))),
    }
}

/// The `objects` array a stage iterates over.
pub(crate) fn objects(root: &Value) -> Result<&Value> {
    let objects = root
        .get_by_key("objects")
        .map_err(|_| Error::Processing("context has no objects; run FACE_DETECTOR first".into()))?;
    if !objects.is_array() {
        return Err(Error::Processing(format!("objects must be an array, found {}", objects.kind())));
    }
    Ok(objects)
}

/// Normalised `[x1, y1, x2, y2]` of one object.
pub(crate) fn object_bbox(object: &Value) -> Result<[f64; 4]> {
    let bbox = object
        .get_by_key("bbox")
        .map_err(|_| Error::Processing("object has no bbox".into()))?;
    let mut out = [0.0; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = bbox
            .get_by_index(i)
            .ok()
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::Processing("bbox must hold four numbers".into()))?;
    }
    Ok(out)
}

/// Object confidence, defaulting to 1 when the detector left none.
pub(crate) fn object_confidence(object: &Value) -> f32 {
    object
        .get_by_key("confidence")
        .ok()
        .and_then(Value::as_f64)
        .unwrap_or(1.0) as f32
}

/// Write `value` under `key` of every object, in order.
pub(crate) fn write_per_object(ctx: &mut Context, key: &str, values: Vec<Value>) -> Result<()> {
    let objects = ctx.get_or_insert_by_key("objects")?;
    for (i, value) in values.into_iter().enumerate() {
        objects.get_by_index_mut(i)?.insert(key, value)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn face(id: i64) -> Value {
        Value::from(json!({"id": id, "class": "face", "confidence": 0.9, "bbox": [0.1, 0.1, 0.5, 0.5]}))
    }

    fn template_pipeline(faces: usize) -> (FaceTemplatePipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let detection: Pipeline =
            std::iter::once(Box::new(FixedObjects((0..faces as i64).map(face).collect())) as Box<dyn ProcessingBlock>)
                .collect();
        let extractor = Box::new(ConstantExtractor { calls: calls.clone() });
        (FaceTemplatePipeline::new(detection, extractor), calls)
    }

    #[test]
    fn test_unit_type_names_roundtrip() {
        for unit in UnitType::ALL {
            assert_eq!(unit.as_str().parse::<UnitType>().unwrap(), unit);
        }
        assert!(matches!("FACE_FINDER".parse::<UnitType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_block_config_parsing() {
        let cfg = BlockConfig::from_value(&Value::from(json!({
            "unit_type": "FACE_DETECTOR",
            "modification": "scrfd_500m",
            "version": 2,
            "confidence_threshold": 0.7,
        })))
        .unwrap();
        assert_eq!(cfg.unit_type, UnitType::FaceDetector);
        assert_eq!(cfg.modification_or("scrfd"), "scrfd_500m");
        assert_eq!(cfg.version, Some(2));
        assert!((cfg.f32_param("confidence_threshold", 0.5).unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(cfg.f32_param("iou_threshold", 0.4).unwrap(), 0.4);
    }

    #[test]
    fn test_block_config_rejects_bad_fields() {
        for bad in [
            json!({}),
            json!({"unit_type": 3}),
            json!({"unit_type": "FACE_DETECTOR", "version": "one"}),
            json!({"unit_type": "FACE_DETECTOR", "modification": 1}),
        ] {
            assert!(matches!(BlockConfig::from_value(&Value::from(bad)), Err(Error::Config(_))));
        }
        let cfg = BlockConfig::new(UnitType::MatcherModule).with_param("knn", "many").unwrap();
        assert!(matches!(cfg.usize_param("knn", 1), Err(Error::Config(_))));
    }

    #[test]
    fn test_single_face_template() {
        let (mut pipeline, calls) = template_pipeline(1);
        let mut ctx = Context::new();
        let t = pipeline.single_face_template(&mut ctx).unwrap();
        assert_eq!(t.embedding().values, vec![0.0, 1.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_face_template_skips_extraction_on_wrong_count() {
        for faces in [0, 2] {
            let (mut pipeline, calls) = template_pipeline(faces);
            let mut ctx = Context::new();
            let err = pipeline.single_face_template(&mut ctx).unwrap_err();
            assert!(matches!(err, Error::FaceCount { found } if found == faces));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_pipeline_runs_blocks_in_order() {
        let (mut pipeline, calls) = template_pipeline(2);
        let mut ctx = Context::new();
        pipeline.process(&mut ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(face_count(&ctx).unwrap(), 2);
        let second = ctx.get_by_key("objects").unwrap().get_by_index(1).unwrap();
        assert_eq!(template_of(second).unwrap().embedding().values, vec![1.0, 1.0]);
    }

    #[test]
    fn test_template_of_accepts_wrappers() {
        let t = template(&[1.0]);
        let mut wrapped = Value::Null;
        wrapped.insert("template", Value::Template(t.clone())).unwrap();
        let mut face = Value::Null;
        face.insert("face_template", wrapped.clone()).unwrap();

        assert_eq!(template_of(&Value::Template(t.clone())).unwrap(), t);
        assert_eq!(template_of(&wrapped).unwrap(), t);
        assert_eq!(template_of(&face).unwrap(), t);
        assert!(matches!(template_of(&Value::Int(1)), Err(Error::Processing(_))));
    }

    #[test]
    fn test_object_bbox() {
        assert_eq!(object_bbox(&face(0)).unwrap(), [0.1, 0.1, 0.5, 0.5]);
        let no_box = Value::from(json!({"id": 0}));
        assert!(matches!(object_bbox(&no_box), Err(Error::Processing(_))));
    }
}
