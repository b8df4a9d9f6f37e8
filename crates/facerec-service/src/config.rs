use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Service configuration, from flags with `FACEREC_*` environment fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(name = "facerec-service", version, about = "Face matching and verification over HTTP")]
pub struct Config {
    /// Directory of images enrolled at startup, searched recursively.
    #[arg(long, env = "FACEREC_IMAGES_PATH")]
    pub images_path: Option<PathBuf>,

    /// Face detector block config.
    #[arg(long, env = "FACEREC_DETECTOR_CONFIG", default_value = "./detector.json")]
    pub detector_config: PathBuf,

    /// Face fitter block config.
    #[arg(long, env = "FACEREC_FITTER_CONFIG", default_value = "./fitter.json")]
    pub fitter_config: PathBuf,

    /// Face template extractor block config. Its modification and version
    /// also bind the template index.
    #[arg(
        long,
        env = "FACEREC_FACE_TEMPLATE_EXTRACTOR_CONFIG",
        default_value = "./face_template_extractor.json"
    )]
    pub face_template_extractor_config: PathBuf,

    /// Matcher block config.
    #[arg(long, env = "FACEREC_MATCHER_CONFIG", default_value = "./matcher.json")]
    pub matcher_config: PathBuf,

    /// Verification block config.
    #[arg(long, env = "FACEREC_VERIFICATION_CONFIG", default_value = "./verification.json")]
    pub verification_config: PathBuf,

    /// Upper bound on enrolled templates.
    #[arg(long, env = "FACEREC_MAX_LICENSE_COUNT", default_value_t = 1000)]
    pub max_license_count: usize,

    /// Template index capacity before the license bound applies.
    #[arg(long, env = "FACEREC_INDEX_CAPACITY", default_value_t = 1000)]
    pub capacity: usize,

    /// Directory containing ONNX model files.
    #[arg(long, env = "FACEREC_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Start from a saved template index instead of an empty one.
    #[arg(long, env = "FACEREC_INDEX_PATH")]
    pub index_path: Option<PathBuf>,

    /// Extra templates to enrol, stored back to back in one file.
    #[arg(long, env = "FACEREC_TEMPLATES_PATH")]
    pub templates_path: Option<PathBuf>,

    /// Save the template index here once enrolment finishes.
    #[arg(long, env = "FACEREC_SAVE_INDEX")]
    pub save_index: Option<PathBuf>,

    /// Replace an existing file at `--save-index`.
    #[arg(long, env = "FACEREC_OVERWRITE_INDEX")]
    pub overwrite_index: bool,

    #[arg(long, env = "FACEREC_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,
}

impl Config {
    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(facerec_core::default_model_dir)
    }
}
