use crate::config::Config;
use facerec_core::processing_block::{FaceTemplatePipeline, Pipeline, ProcessingBlock};
use facerec_core::service::extractor_method;
use facerec_core::{BlockConfig, Context, ContextTemplate, DynamicTemplateIndex, FacerecService, Method, Value};
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Facerec(#[from] facerec_core::Error),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Every processing block the service runs. Lives on the engine thread.
pub struct Engine {
    templates: FaceTemplatePipeline,
    matcher: Box<dyn ProcessingBlock>,
    verification: Box<dyn ProcessingBlock>,
}

impl Engine {
    pub fn new(
        templates: FaceTemplatePipeline,
        matcher: Box<dyn ProcessingBlock>,
        verification: Box<dyn ProcessingBlock>,
    ) -> Self {
        Self {
            templates,
            matcher,
            verification,
        }
    }

    /// Build every block from the config files named in `config`.
    ///
    /// Also returns the method the extractor produces, which the template
    /// index must be bound to.
    pub fn from_config(service: &FacerecService, config: &Config) -> Result<(Self, Method), EngineError> {
        let detector = load_block(service, &config.detector_config)?;
        let fitter = load_block(service, &config.fitter_config)?;

        let extractor_ctx = read_block_config(&config.face_template_extractor_config)?;
        let extractor_config = BlockConfig::from_value(extractor_ctx.root()?)?;
        let method = extractor_method(&extractor_config);
        let extractor = service.create_block(&extractor_config)?;

        let matcher = load_block(service, &config.matcher_config)?;
        let verification = load_block(service, &config.verification_config)?;

        let detection: Pipeline = [detector, fitter].into_iter().collect();
        let templates = FaceTemplatePipeline::new(detection, extractor);
        Ok((Self::new(templates, matcher, verification), method))
    }

    /// Template of the only face in an encoded image.
    fn template(&mut self, image: &[u8]) -> facerec_core::Result<ContextTemplate> {
        let mut ctx = Context::from_encoded_image(image)?;
        self.templates.single_face_template(&mut ctx)
    }

    /// Search `index` with the face in `image`; returns the whole matcher context.
    fn matching(&mut self, image: &[u8], index: &DynamicTemplateIndex) -> facerec_core::Result<serde_json::Value> {
        let query = self.template(image)?;
        let mut ctx = Context::new();
        let root = ctx.root_mut()?;
        root.insert("queries", Value::Template(query))?;
        root.insert("template_index", Value::TemplateIndex(index.clone()))?;
        self.matcher.process(&mut ctx)?;
        ctx.to_json()
    }

    /// Compare the faces in two encoded images; returns the verification result.
    fn verify(&mut self, image1: &[u8], image2: &[u8]) -> facerec_core::Result<serde_json::Value> {
        let first = self.template(image1)?;
        let second = self.template(image2)?;
        let mut ctx = Context::new();
        let root = ctx.root_mut()?;
        root.insert("template1", wrap_template(first))?;
        root.insert("template2", wrap_template(second))?;
        self.verification.process(&mut ctx)?;
        Ok(ctx.get_by_key("result")?.to_json())
    }
}

fn wrap_template(template: ContextTemplate) -> Value {
    Value::Object(vec![("template".to_string(), Value::Template(template))])
}

fn read_block_config(path: &Path) -> Result<Context, EngineError> {
    Context::from_json_file(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "cannot read block config");
        EngineError::Facerec(e)
    })
}

fn load_block(service: &FacerecService, path: &Path) -> Result<Box<dyn ProcessingBlock>, EngineError> {
    let config = read_block_config(path)?;
    let block = service.create_processing_block(config.root()?)?;
    tracing::info!(path = %path.display(), unit = %block.unit_type(), "block config loaded");
    Ok(block)
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Template {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<ContextTemplate, EngineError>>,
    },
    Matching {
        image: Vec<u8>,
        index: DynamicTemplateIndex,
        reply: oneshot::Sender<Result<serde_json::Value, EngineError>>,
    },
    Verify {
        image1: Vec<u8>,
        image2: Vec<u8>,
        reply: oneshot::Sender<Result<serde_json::Value, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Requests are served one at a time, so at most one pipeline runs at once.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect, fit and extract the single face of an encoded image.
    pub async fn template(&self, image: Vec<u8>) -> Result<ContextTemplate, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Template { image, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn matching(&self, image: Vec<u8>, index: DynamicTemplateIndex) -> Result<serde_json::Value, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Matching { image, index, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn verify(&self, image1: Vec<u8>, image2: Vec<u8>) -> Result<serde_json::Value, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Verify { image1, image2, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread and return its handle.
pub fn spawn_engine(mut engine: Engine) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facerec-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Template { image, reply } => {
                        let _ = reply.send(engine.template(&image).map_err(EngineError::from));
                    }
                    EngineRequest::Matching { image, index, reply } => {
                        let _ = reply.send(engine.matching(&image, &index).map_err(EngineError::from));
                    }
                    EngineRequest::Verify { image1, image2, reply } => {
                        let _ = reply.send(engine.verify(&image1, &image2).map_err(EngineError::from));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Model-free stand-ins for the detector and extractor.

    use super::*;
    use facerec_core::frame::ImageRef;
    use facerec_core::processing_block::{MatcherBlock, VerificationBlock};
    use facerec_core::{Embedding, UnitType};

    /// One face per 4 pixels of image width.
    pub struct StripDetector;

    impl ProcessingBlock for StripDetector {
        fn unit_type(&self) -> UnitType {
            UnitType::FaceDetector
        }

        fn process(&mut self, ctx: &mut Context) -> facerec_core::Result<()> {
            let faces = ImageRef::from_context_root(ctx.root()?)?.width / 4;
            let objects = (0..faces)
                .map(|i| {
                    Value::from(serde_json::json!({
                        "id": i, "class": "face", "confidence": 0.9, "bbox": [0.0, 0.0, 1.0, 1.0]
                    }))
                })
                .collect();
            ctx.root_mut()?.insert("objects", Value::Array(objects))
        }
    }

    /// Uses the colour of the top-left pixel as the embedding.
    pub struct ColourExtractor;

    impl ProcessingBlock for ColourExtractor {
        fn unit_type(&self) -> UnitType {
            UnitType::FaceTemplateExtractor
        }

        fn process(&mut self, ctx: &mut Context) -> facerec_core::Result<()> {
            let [r, g, b] = ImageRef::from_context_root(ctx.root()?)?.pixel(0, 0);
            let template = ContextTemplate::new(
                method(),
                Embedding {
                    values: vec![r as f32, g as f32, b as f32],
                },
            );
            let first = ctx.get_or_insert_by_key("objects")?.get_by_index_mut(0)?;
            first.insert("face_template", wrap_template(template))
        }
    }

    pub fn method() -> Method {
        Method::new("arcface_r50", 1)
    }

    pub fn engine() -> Engine {
        let detection: Pipeline = std::iter::once(Box::new(StripDetector) as Box<dyn ProcessingBlock>).collect();
        Engine::new(
            FaceTemplatePipeline::new(detection, Box::new(ColourExtractor)),
            Box::new(MatcherBlock::default()),
            Box::new(VerificationBlock::default()),
        )
    }

    /// PNG of `width` x 4 pixels filled with `colour`.
    pub fn png(width: u32, colour: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, 4, image::Rgb(colour));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use facerec_core::IndexConfig;

    #[tokio::test]
    async fn test_template_requires_single_face() {
        let handle = spawn_engine(engine()).unwrap();
        let t = handle.template(png(4, [0, 255, 0])).await.unwrap();
        assert_eq!(t.embedding().values, vec![0.0, 255.0, 0.0]);

        for width in [2, 8] {
            let err = handle.template(png(width, [0, 255, 0])).await.unwrap_err();
            assert!(matches!(err, EngineError::Facerec(facerec_core::Error::FaceCount { .. })), "{err}");
        }
    }

    #[tokio::test]
    async fn test_bad_image_is_decode_error() {
        let handle = spawn_engine(engine()).unwrap();
        let err = handle.template(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Facerec(facerec_core::Error::Decode(_))), "{err}");
    }

    #[tokio::test]
    async fn test_matching_returns_matcher_context() {
        let handle = spawn_engine(engine()).unwrap();
        let index = DynamicTemplateIndex::create(IndexConfig::new(method(), 10)).unwrap();
        index.add(&handle.template(png(4, [255, 0, 0])).await.unwrap(), "red.png").unwrap();
        index.add(&handle.template(png(4, [0, 0, 255])).await.unwrap(), "blue.png").unwrap();

        let json = handle.matching(png(4, [200, 0, 10]), index).await.unwrap();
        assert_eq!(json["results"][0]["uuid"], "red.png");
        assert_eq!(json["template_index"]["$template_index"]["size"], 2);
        assert!(json["queries"]["$template"].is_object());
    }

    #[tokio::test]
    async fn test_verify() {
        let handle = spawn_engine(engine()).unwrap();
        let same = handle.verify(png(4, [10, 20, 30]), png(4, [20, 40, 60])).await.unwrap();
        assert_eq!(same["verdict"], true);
        let different = handle.verify(png(4, [255, 0, 0]), png(4, [0, 255, 0])).await.unwrap();
        assert_eq!(different["verdict"], false);
        assert_eq!(different["distance"], 1.0);
    }
}
