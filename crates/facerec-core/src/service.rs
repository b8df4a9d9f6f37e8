//! Entry point that turns config trees into processing blocks and indexes.

use crate::context::Context;
use crate::detector::{DetectorOptions, FaceDetector, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD};
use crate::error::{Error, Result};
use crate::processing_block::{
    BlockConfig, FaceDetectorBlock, FaceFitterBlock, MatcherBlock, ProcessingBlock, QualityBlock, QualityOptions,
    TemplateExtractorBlock, UnitType, VerificationBlock, DEFAULT_KNN, DEFAULT_VERIFICATION_THRESHOLD,
};
use crate::recognizer::FaceRecognizer;
use crate::template::{ContextTemplate, Method};
use crate::template_index::{DynamicTemplateIndex, IndexConfig};
use crate::value::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Default template version when a config names none.
pub const DEFAULT_TEMPLATE_VERSION: u32 = 1;

const DETECTOR_MODELS: &[(&str, &str)] = &[("scrfd", "det_10g.onnx"), ("scrfd_500m", "det_500m.onnx")];
const FITTER_MODELS: &[(&str, &str)] = &[("scrfd_kps", "det_10g.onnx")];
const EXTRACTOR_MODELS: &[(&str, &str)] = &[("arcface_r50", "w600k_r50.onnx"), ("arcface_mbf", "w600k_mbf.onnx")];
const QUALITY_MODIFICATIONS: &[&str] = &["assessment"];

/// Model directory: `$FACEREC_MODEL_DIR`, else `$XDG_DATA_HOME/facerec/models`,
/// else `~/.local/share/facerec/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEREC_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facerec/models")
}

/// Builds blocks and indexes. Holds only the model directory.
#[derive(Debug, Clone)]
pub struct FacerecService {
    model_dir: PathBuf,
}

impl FacerecService {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Build a block from `{unit_type, modification?, version?, model_path?, ...}`.
    pub fn create_processing_block(&self, config: &Value) -> Result<Box<dyn ProcessingBlock>> {
        self.create_block(&BlockConfig::from_value(config)?)
    }

    /// Build a block from a JSON config file.
    pub fn create_processing_block_from_file(&self, path: &Path) -> Result<Box<dyn ProcessingBlock>> {
        let config = Context::from_json_file(path)?;
        self.create_processing_block(config.root()?)
    }

    pub fn create_block(&self, config: &BlockConfig) -> Result<Box<dyn ProcessingBlock>> {
        let unit = config.unit_type;
        let block: Box<dyn ProcessingBlock> = match unit {
            UnitType::FaceDetector => {
                let model = self.model_path(config, DETECTOR_MODELS)?;
                let options = DetectorOptions {
                    confidence_threshold: config.f32_param("confidence_threshold", DEFAULT_CONFIDENCE_THRESHOLD)?,
                    iou_threshold: config.f32_param("iou_threshold", DEFAULT_IOU_THRESHOLD)?,
                };
                Box::new(FaceDetectorBlock::new(FaceDetector::load(&model, options)?))
            }
            UnitType::FaceFitter => {
                let model = self.model_path(config, FITTER_MODELS)?;
                // Low threshold: the crop is already known to hold a face.
                let options = DetectorOptions {
                    confidence_threshold: config.f32_param("confidence_threshold", 0.3)?,
                    iou_threshold: config.f32_param("iou_threshold", DEFAULT_IOU_THRESHOLD)?,
                };
                Box::new(FaceFitterBlock::new(FaceDetector::load(&model, options)?))
            }
            UnitType::FaceTemplateExtractor => {
                let model = self.model_path(config, EXTRACTOR_MODELS)?;
                let method = extractor_method(config);
                Box::new(TemplateExtractorBlock::new(FaceRecognizer::load(&model)?, method))
            }
            UnitType::MatcherModule => Box::new(MatcherBlock::new(config.usize_param("knn", DEFAULT_KNN)?)),
            UnitType::VerificationModule => Box::new(VerificationBlock::new(
                config.f32_param("threshold", DEFAULT_VERIFICATION_THRESHOLD)?,
            )),
            UnitType::QualityAssessmentEstimator => {
                let modification = config.modification_or(QUALITY_MODIFICATIONS[0]);
                if !QUALITY_MODIFICATIONS.contains(&modification) {
                    return Err(unknown_modification(unit, modification, QUALITY_MODIFICATIONS.iter().copied()));
                }
                let defaults = QualityOptions::default();
                Box::new(QualityBlock::new(QualityOptions {
                    reference_face_size: config.f32_param("reference_face_size", defaults.reference_face_size)?,
                    sharpness_reference: config.f32_param("sharpness_reference", defaults.sharpness_reference)?,
                }))
            }
            other => {
                return Err(Error::Config(format!("unit_type {other} is not available in this build")));
            }
        };
        tracing::info!(unit = %unit, modification = ?config.modification, "processing block created");
        Ok(block)
    }

    /// Model file for a block: `model_path` when given, else the file the
    /// modification maps to inside the model directory. The first table entry
    /// is the default modification.
    fn model_path(&self, config: &BlockConfig, table: &[(&str, &str)]) -> Result<PathBuf> {
        if let Some(path) = &config.model_path {
            return Ok(path.clone());
        }
        let default = table.first().map(|(m, _)| *m).unwrap_or_default();
        let modification = config.modification_or(default);
        table
            .iter()
            .find(|(m, _)| *m == modification)
            .map(|(_, file)| self.model_dir.join(file))
            .ok_or_else(|| unknown_modification(config.unit_type, modification, table.iter().map(|(m, _)| *m)))
    }

    pub fn create_dynamic_template_index(&self, config: &Value) -> Result<DynamicTemplateIndex> {
        DynamicTemplateIndex::create(IndexConfig::from_value(config)?)
    }

    pub fn create_dynamic_template_index_with_templates<S: AsRef<str>>(
        &self,
        templates: &[ContextTemplate],
        ids: &[S],
        config: &Value,
    ) -> Result<DynamicTemplateIndex> {
        DynamicTemplateIndex::create_with_templates(templates, ids, IndexConfig::from_value(config)?)
    }

    pub fn load_dynamic_template_index(&self, path: &Path) -> Result<DynamicTemplateIndex> {
        DynamicTemplateIndex::load(path)
    }

    pub fn load_context_template<R: Read>(&self, reader: R) -> Result<ContextTemplate> {
        ContextTemplate::load(reader)
    }
}

/// Template method produced by an extractor config.
///
/// The default modification and version apply when the config names none,
/// so an index config derived from the same file always matches.
pub fn extractor_method(config: &BlockConfig) -> Method {
    Method::new(
        config.modification_or(EXTRACTOR_MODELS[0].0),
        config.version.unwrap_or(DEFAULT_TEMPLATE_VERSION),
    )
}

fn unknown_modification<'a>(unit: UnitType, modification: &str, known: impl Iterator<Item = &'a str>) -> Error {
    Error::Config(format!(
        "unknown modification {modification:?} for {unit} (available: {})",
        known.collect::<Vec<_>>().join(", ")
    ))
}
