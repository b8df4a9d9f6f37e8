//! facerec-core: face recognition SDK.
//!
//! A [`Context`] tree carries an image through a chain of processing blocks
//! (SCRFD detection, landmark fitting, ArcFace template extraction) running
//! on ONNX Runtime. Templates are matched against a [`DynamicTemplateIndex`].

pub mod alignment;
pub mod context;
pub mod detector;
pub mod error;
pub mod frame;
pub mod processing_block;
pub mod recognizer;
pub mod service;
pub mod template;
pub mod template_index;
pub mod types;
pub mod value;

pub use context::Context;
pub use error::{Error, Result};
pub use frame::PixelFormat;
pub use processing_block::{BlockConfig, FaceTemplatePipeline, Pipeline, ProcessingBlock, UnitType};
pub use service::{default_model_dir, FacerecService};
pub use template::{ContextTemplate, Method};
pub use template_index::{DynamicTemplateIndex, IndexConfig};
pub use types::{BoundingBox, Embedding, SearchResult, Similarity};
pub use value::Value;
