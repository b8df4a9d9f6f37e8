use super::{template_of, ProcessingBlock, UnitType};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::SearchResult;
use crate::value::Value;

pub const DEFAULT_KNN: usize = 1;

/// `MATCHER_MODULE`: searches `template_index` with `queries`.
///
/// `queries` is a template (or an object holding one) or an array of them.
/// `results` mirrors that shape: one ranked list for a single query, a list
/// of ranked lists for an array. A `knn` key in the context overrides the
/// configured default.
pub struct MatcherBlock {
    default_knn: usize,
}

impl MatcherBlock {
    pub fn new(default_knn: usize) -> Self {
        Self { default_knn }
    }
}

impl Default for MatcherBlock {
    fn default() -> Self {
        Self::new(DEFAULT_KNN)
    }
}

impl ProcessingBlock for MatcherBlock {
    fn unit_type(&self) -> UnitType {
        UnitType::MatcherModule
    }

    fn process(&mut self, ctx: &mut Context) -> Result<()> {
        let root = ctx.root()?;
        let index = root
            .get_by_key("template_index")
            .and_then(Value::get_template_index)
            .map_err(|_| Error::Processing("matcher requires a template index under \"template_index\"".into()))?
            .clone();
        let queries = root
            .get_by_key("queries")
            .map_err(|_| Error::Processing("matcher requires \"queries\"".into()))?;

        let (templates, batched) = match queries {
            Value::Array(items) => (items.iter().map(template_of).collect::<Result<Vec<_>>>()?, true),
            single => (vec![template_of(single)?], false),
        };
        let knn = match root.get_by_key("knn") {
            Ok(v) => v
                .as_i64()
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::Processing("\"knn\" must be a positive integer".into()))?,
            Err(_) => self.default_knn,
        };

        let mut ranked = index.search(&templates, knn)?;
        tracing::debug!(queries = templates.len(), knn, "template index searched");

        let results = if batched {
            Value::Array(ranked.iter().map(|r| results_value(r)).collect())
        } else {
            results_value(&ranked.pop().unwrap_or_default())
        };
        ctx.root_mut()?.insert("results", results)
    }
}

fn results_value(results: &[SearchResult]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|r| {
                Value::Object(vec![
                    ("uuid".to_string(), Value::String(r.uuid.clone())),
                    ("score".to_string(), Value::Float(r.score as f64)),
                    ("distance".to_string(), Value::Float(r.distance as f64)),
                ])
            })
            .collect(),
    )
}
