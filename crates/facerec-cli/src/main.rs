use anyhow::{bail, Context as _, Result};
use clap::Parser;
use facerec_core::{BlockConfig, Context, FacerecService, Pipeline, UnitType};
use serde_json::Value as Json;
use std::path::PathBuf;

/// Short names accepted by `--unit-type`, next to the canonical ones.
const UNIT_ALIASES: &[(&str, UnitType)] = &[
    ("face", UnitType::FaceDetector),
    ("fitter", UnitType::FaceFitter),
    ("template", UnitType::FaceTemplateExtractor),
    ("quality", UnitType::QualityAssessmentEstimator),
    ("emotions", UnitType::EmotionEstimator),
    ("age", UnitType::AgeEstimator),
    ("gender", UnitType::GenderEstimator),
    ("mask", UnitType::MaskEstimator),
    ("glasses", UnitType::GlassesEstimator),
    ("eye_openness", UnitType::EyeOpennessEstimator),
    ("liveness", UnitType::LivenessEstimator),
    ("deepfake", UnitType::DeepfakeEstimator),
];

#[derive(Parser, Debug)]
#[command(
    name = "processing-block",
    about = "Run one processing block over an image",
    disable_version_flag = true
)]
struct Cli {
    /// face|fitter|template|quality, or a canonical unit type such as FACE_DETECTOR
    #[arg(long, default_value = "face", value_parser = parse_unit)]
    unit_type: UnitType,

    /// Modification of the unit; the unit's default when omitted
    #[arg(long)]
    modification: Option<String>,

    /// Version of the modification
    #[arg(long)]
    version: Option<u32>,

    #[arg(long)]
    image_path: PathBuf,

    /// Directory containing ONNX model files
    #[arg(long, env = "FACEREC_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Print the whole result tree as JSON
    #[arg(long)]
    json: bool,
}

fn parse_unit(s: &str) -> Result<UnitType, String> {
    UNIT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == s)
        .map(|(_, unit)| Ok(*unit))
        .unwrap_or_else(|| s.parse::<UnitType>().map_err(|e| e.to_string()))
}

/// Block configs to run for `unit`: detector and fitter prerequisites first.
fn pipeline_configs(unit: UnitType, modification: Option<&str>, version: Option<u32>) -> Vec<BlockConfig> {
    let mut configs = Vec::with_capacity(3);
    if unit != UnitType::FaceDetector {
        configs.push(BlockConfig::new(UnitType::FaceDetector));
        if unit != UnitType::FaceFitter {
            configs.push(BlockConfig::new(UnitType::FaceFitter));
        }
    }
    let mut target = BlockConfig::new(unit);
    if let Some(m) = modification {
        target = target.with_modification(m);
    }
    if let Some(v) = version {
        target = target.with_version(v);
    }
    configs.push(target);
    configs
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let service = FacerecService::new(cli.model_dir.clone().unwrap_or_else(facerec_core::default_model_dir));

    let mut pipeline = pipeline_configs(cli.unit_type, cli.modification.as_deref(), cli.version)
        .iter()
        .map(|config| service.create_block(config))
        .collect::<facerec_core::Result<Pipeline>>()?;
    tracing::debug!(units = ?pipeline.unit_types(), "pipeline built");

    let bytes = std::fs::read(&cli.image_path).with_context(|| format!("reading {}", cli.image_path.display()))?;
    let mut ctx = Context::from_encoded_image(&bytes)?;
    pipeline.process(&mut ctx)?;
    let result = ctx.to_json()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for line in format_results(cli.unit_type, &result)? {
        println!("{line}");
    }
    Ok(())
}

/// Human-readable lines for the unit's output; pixel coordinates are truncated.
fn format_results(unit: UnitType, result: &Json) -> Result<Vec<String>> {
    let objects = match result["objects"].as_array() {
        Some(objects) if !objects.is_empty() => objects,
        _ => bail!("No faces detected"),
    };
    let (width, height) = image_size(result)?;
    let mut lines = Vec::new();

    for object in objects {
        match unit {
            UnitType::FaceDetector => {
                let bbox = numbers(&object["bbox"], 4).context("object has no bbox")?;
                lines.push(format!(
                    "Bounding box coordinates: ({}, {}) ({}, {})",
                    (bbox[0] * width) as i64,
                    (bbox[1] * height) as i64,
                    (bbox[2] * width) as i64,
                    (bbox[3] * height) as i64,
                ));
            }
            UnitType::FaceFitter => {
                let points = object["keypoints"]["points"]
                    .as_array()
                    .context("object has no keypoints")?;
                for point in points {
                    let proj = numbers(&point["proj"], 2).context("keypoint has no proj")?;
                    lines.push(format!("Point: ({}, {})", (proj[0] * width) as i64, (proj[1] * height) as i64));
                }
                lines.push(String::new());
            }
            UnitType::FaceTemplateExtractor => {
                let template = &object["face_template"]["template"]["$template"];
                lines.push(format!(
                    "Template: {} v{}, {} bytes",
                    template["method"].as_str().context("object has no template")?,
                    template["version"],
                    template["size"],
                ));
            }
            UnitType::QualityAssessmentEstimator => {
                let score = object["quality"]["total_score"]
                    .as_f64()
                    .context("object has no quality score")?;
                lines.push(format!("Quality total score: {score:.6}"));
            }
            other => bail!("no printer for {other}"),
        }
    }
    Ok(lines)
}

/// `(width, height)` from the image shape `[h, w, c]`.
fn image_size(result: &Json) -> Result<(f64, f64)> {
    let shape = numbers(&result["image"]["shape"], 3).context("Can't find image")?;
    Ok((shape[1], shape[0]))
}

fn numbers(value: &Json, len: usize) -> Option<Vec<f64>> {
    let items = value.as_array().filter(|a| a.len() >= len)?;
    items.iter().take(len).map(Json::as_f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(objects: Json) -> Json {
        json!({
            "image": {"blob": {"$binary": {"size": 30000}}, "dtype": "uint8_t", "format": "NDARRAY", "shape": [100, 200, 3]},
            "objects": objects,
        })
    }

    #[test]
    fn test_parse_unit() {
        assert_eq!(parse_unit("face").unwrap(), UnitType::FaceDetector);
        assert_eq!(parse_unit("quality").unwrap(), UnitType::QualityAssessmentEstimator);
        assert_eq!(parse_unit("MATCHER_MODULE").unwrap(), UnitType::MatcherModule);
        assert!(parse_unit("faces").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["processing-block", "--image-path", "a.jpg"]).unwrap();
        assert_eq!(cli.unit_type, UnitType::FaceDetector);
        assert!(cli.modification.is_none() && cli.version.is_none());

        let cli = Cli::try_parse_from(["processing-block", "--image-path", "a.jpg", "--unit-type", "fitter", "--version", "2"])
            .unwrap();
        assert_eq!(cli.unit_type, UnitType::FaceFitter);
        assert_eq!(cli.version, Some(2));
    }

    #[test]
    fn test_prerequisites() {
        let units = |unit| {
            pipeline_configs(unit, None, None)
                .iter()
                .map(|c| c.unit_type)
                .collect::<Vec<_>>()
        };
        assert_eq!(units(UnitType::FaceDetector), vec![UnitType::FaceDetector]);
        assert_eq!(units(UnitType::FaceFitter), vec![UnitType::FaceDetector, UnitType::FaceFitter]);
        assert_eq!(
            units(UnitType::QualityAssessmentEstimator),
            vec![UnitType::FaceDetector, UnitType::FaceFitter, UnitType::QualityAssessmentEstimator]
        );

        let configs = pipeline_configs(UnitType::FaceTemplateExtractor, Some("arcface_mbf"), Some(2));
        let target = configs.last().unwrap();
        assert_eq!(target.modification.as_deref(), Some("arcface_mbf"));
        assert_eq!(target.version, Some(2));
        assert!(configs[0].modification.is_none());
    }

    #[test]
    fn test_format_detector() {
        let r = result(json!([{"bbox": [0.1, 0.2, 0.5, 0.9]}, {"bbox": [0.0, 0.0, 1.0, 1.0]}]));
        assert_eq!(
            format_results(UnitType::FaceDetector, &r).unwrap(),
            vec!["Bounding box coordinates: (20, 20) (100, 90)", "Bounding box coordinates: (0, 0) (200, 100)"]
        );
    }

    #[test]
    fn test_format_fitter() {
        let r = result(json!([{"keypoints": {"points": [{"proj": [0.5, 0.5]}, {"proj": [0.25, 0.1]}]}}]));
        assert_eq!(
            format_results(UnitType::FaceFitter, &r).unwrap(),
            vec!["Point: (100, 50)", "Point: (50, 10)", ""]
        );
    }

    #[test]
    fn test_format_quality_and_template() {
        let r = result(json!([{
            "quality": {"total_score": 0.75},
            "face_template": {"template": {"$template": {"method": "arcface_r50", "version": 1, "size": 2048}}},
        }]));
        assert_eq!(
            format_results(UnitType::QualityAssessmentEstimator, &r).unwrap(),
            vec!["Quality total score: 0.750000"]
        );
        assert_eq!(
            format_results(UnitType::FaceTemplateExtractor, &r).unwrap(),
            vec!["Template: arcface_r50 v1, 2048 bytes"]
        );
    }

    #[test]
    fn test_no_faces() {
        for objects in [json!([]), Json::Null] {
            let err = format_results(UnitType::FaceDetector, &result(objects)).unwrap_err();
            assert_eq!(err.to_string(), "No faces detected");
        }
    }
}
