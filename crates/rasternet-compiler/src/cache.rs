//! Memoization of generated programs.

use crate::Result;
use crate::layout::GpuResourceLayout;
use crate::shader::ProgramParams;
use rasternet_core::OpKind;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a program's source depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub kind: OpKind,
    pub params: ProgramParams,
    pub inputs: Vec<GpuResourceLayout>,
    pub output: GpuResourceLayout,
}

/// Validated WGSL source and its parsed module.
#[derive(Debug)]
pub struct ShaderArtifact {
    pub source: String,
    pub module: naga::Module,
}

/// Cache of shader artifacts keyed on [`ProgramKey`].
///
/// Identical keys yield the same `Arc`, so nodes with equal kind,
/// parameters and layouts share one shader and one pipeline.
#[derive(Debug, Default)]
pub struct ProgramCache {
    entries: HashMap<ProgramKey, Arc<ShaderArtifact>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached artifact for `key`, or build and insert it.
    ///
    /// # Errors
    /// Propagates the error of `build`; nothing is cached on failure.
    pub fn get_or_try_insert(
        &mut self,
        key: ProgramKey,
        build: impl FnOnce() -> Result<ShaderArtifact>,
    ) -> Result<Arc<ShaderArtifact>> {
        if let Some(artifact) = self.entries.get(&key) {
            tracing::trace!(kind = %key.kind, "program cache hit");
            return Ok(Arc::clone(artifact));
        }
        let artifact = Arc::new(build()?);
        self.entries.insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
