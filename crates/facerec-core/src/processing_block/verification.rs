use super::{template_of, ProcessingBlock, UnitType};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::value::Value;

pub const DEFAULT_THRESHOLD: f32 = 0.40;

/// `VERIFICATION_MODULE`: compares `template1` with `template2`.
///
/// Writes `result: {score, distance, verdict}` where the verdict holds when
/// the cosine similarity reaches the threshold.
pub struct VerificationBlock {
    threshold: f32,
}

impl VerificationBlock {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for VerificationBlock {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ProcessingBlock for VerificationBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::VerificationModule
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let root = ctx.root()?;
        let read = |key: &str| {
            root.get_by_key(key)
                .map_err(|_| Error::Processing(format!("verification requires \"{key}\"")))
                .and_then(template_of)
        };
        let (first, second) = (read("template1")?, read("template2")?);

        let similarity = first.compare(&second)?;
        let verdict = similarity.similarity >= self.threshold;
        tracing::debug!(similarity = similarity.similarity, threshold = self.threshold, verdict, "templates verified");

        let result = Value::Object(vec![
            ("score".to_string(), Value::Float(similarity.score as f64)),
            ("distance".to_string(), Value::Float(similarity.distance as f64)),
            ("verdict".to_string(), Value::Bool(verdict)),
        ]);
        ctx.root_mut()?.insert("result", result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::template;
    use super::*;
    use serde_json::json;

    fn context(a: &[f32], b: &[f32]) -> Context {
        let mut ctx = Context::new();
        ctx.get_or_insert_by_key("template1").unwrap().set_template(template(a)).unwrap();
        // Wrapped the way a detection pipeline leaves it.
        ctx.root_mut()
            .unwrap()
            .insert("template2", Value::Object(vec![("template".to_string(), Value::Template(template(b)))]))
            .unwrap();
        ctx
    }

    #[test]
    fn test_same_face_verdict() {
        let mut ctx = context(&[1.0, 0.0], &[3.0, 0.0]);
        VerificationBlock::default().process(&mut ctx).unwrap();
        assert_eq!(
            ctx.get_by_key("result").unwrap().to_json(),
            json!({"score": 1.0, "distance": 0.0, "verdict": true})
        );
    }

    #[test]
    fn test_threshold_is_inclusive_lower_bound() {
        // cos = 0.6 between (1, 0) and (0.6, 0.8)
        let mut ctx = context(&[1.0, 0.0], &[0.6, 0.8]);
        VerificationBlock::new(0.7).process(&mut ctx).unwrap();
        assert!(!ctx.get_by_key("result").unwrap().get_by_key("verdict").unwrap().get_bool().unwrap());

        let mut ctx = context(&[1.0, 0.0], &[0.6, 0.8]);
        VerificationBlock::new(0.5).process(&mut ctx).unwrap();
        assert!(ctx.get_by_key("result").unwrap().get_by_key("verdict").unwrap().get_bool().unwrap());
    }

    #[test]
    fn test_missing_template() {
        let mut ctx = Context::new();
        ctx.get_or_insert_by_key("template1").unwrap().set_template(template(&[1.0])).unwrap();
        assert!(matches!(VerificationBlock::default().process(&mut ctx), Err(Error::Processing(_))));
    }
}
