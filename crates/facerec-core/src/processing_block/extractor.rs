use super::fitter::read_landmarks;
use super::{objects, write_per_object, ProcessingBlock, UnitType};
use crate::context::Context;
use crate::error::Result;
use crate::frame::ImageRef;
use crate::recognizer::FaceRecognizer;
use crate::template::{ContextTemplate, Method};
use crate::value::Value;

/// `FACE_TEMPLATE_EXTRACTOR`: `face_template.template` for every object.
///
/// Requires `keypoints` on each object (see `FACE_FITTER`).
pub struct TemplateExtractorBlock {
    recognizer: FaceRecognizer,
    method: Method,
}

impl TemplateExtractorBlock {
    pub fn new(recognizer: FaceRecognizer, method: Method) -> Self {
        Self { recognizer, method }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl ProcessingBlock for TemplateExtractorBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::FaceTemplateExtractor
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let templates = {
            let root = ctx.root()?;
            let image = ImageRef::from_context_root(root)?;
            let objects = objects(root)?;
            (0..objects.len()?)
                .map(|i| -> Result<_> {
                    let landmarks = read_landmarks(objects.get_by_index(i)?, image.width, image.height)?;
                    let embedding = self.recognizer.extract(&image, &landmarks)?;
                    Ok(ContextTemplate::new(self.method.clone(), embedding))
                })
                .collect::<Result<Vec<_>>>()?
        };
        tracing::debug!(method = %self.method, count = templates.len(), "templates extracted");

        let values = templates
            .into_iter()
            .map(|t| Value::Object(vec![("template".to_string(), Value::Template(t))]))
            .collect();
        write_per_object(ctx, "face_template", values)
    }
}
