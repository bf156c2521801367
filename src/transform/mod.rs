//! Byte-block transforms applied between framing and field decoding.
//!
//! A transform rewrites one framed message; the ordered pipeline threads a
//! per-connection context through all stages so an early stage can deposit
//! session material (an RSA-unsealed XTEA key) for a later one.

mod rsa;
mod xtea;

pub use rsa::RsaTransform;
pub use xtea::{xtea_decrypt, xtea_encrypt, XteaTransform};

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::codec::Value;
use crate::schema::TransformSpec;

/// Per-connection scratch state shared along the pipeline. Lives as long as
/// the connection, not the message.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    entries: HashMap<String, Value>,
}

impl TransformContext {
    pub fn new() -> Self {
        TransformContext::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: String, value: Value) {
        self.entries.insert(key, value);
    }
}

/// A named byte-block rewriting stage. Must not fail: a stage that cannot
/// apply returns its input unchanged.
pub trait Transform {
    fn name(&self) -> &'static str;
    fn apply(&self, data: Vec<u8>, ctx: &mut TransformContext) -> Vec<u8>;
}

/// Ordered transform chain built from the schema's declarations.
#[derive(Default)]
pub struct TransformPipeline {
    stages: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl TransformPipeline {
    pub fn empty() -> Self {
        TransformPipeline { stages: Vec::new() }
    }

    /// Build the pipeline from schema transform specs. Unknown kinds and
    /// malformed options are load-time errors.
    pub fn from_specs(specs: &[TransformSpec]) -> Result<Self> {
        let mut stages: Vec<Box<dyn Transform>> = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec.kind.as_str() {
                "rsa" => stages.push(Box::new(RsaTransform::from_spec(spec)?)),
                "xtea" => stages.push(Box::new(XteaTransform::from_spec(spec)?)),
                other => bail!("Unknown transform kind: {}", other),
            }
        }
        Ok(TransformPipeline { stages })
    }

    /// Apply every stage in declaration order. Stages may change the block's
    /// length.
    pub fn apply(&self, mut data: Vec<u8>, ctx: &mut TransformContext) -> Vec<u8> {
        for stage in &self.stages {
            data = stage.apply(data, ctx);
        }
        data
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
