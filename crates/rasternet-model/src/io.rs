//! Model IO handlers and the load/save router registry.
//!
//! A router inspects a URL and either claims it by returning a handler or
//! declines. Routers live in an explicitly constructed [`RouterRegistry`]
//! that is passed to whoever loads models; there is no process-wide registry.

use crate::record::ModelDescription;
use crate::tensor::NamedTensorMap;
use crate::weights::{WeightGroup, decode_weights};
use crate::{ModelError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Boxed future returned by [`IoHandler::load`].
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelArtifacts>> + Send + 'a>>;

/// Boxed future returned by [`IoHandler::save`].
pub type SaveFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Router that may claim a URL for loading.
pub type LoadRouter = Box<dyn Fn(&str) -> Option<Box<dyn IoHandler>> + Send + Sync>;

/// Router that may claim a URL for saving.
pub type SaveRouter = Box<dyn Fn(&str) -> Option<Box<dyn IoHandler>> + Send + Sync>;

/// Raw artifacts of a model: the description plus all weight shard bytes
/// concatenated in manifest order.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifacts {
    pub description: ModelDescription,
    pub weight_data: Vec<u8>,
}

/// A source or sink of model artifacts.
pub trait IoHandler: Send + Sync {
    /// Fetch the description and weight bytes.
    fn load(&self) -> LoadFuture<'_>;

    /// Persist artifacts. Handlers that are read-only keep the default.
    fn save<'a>(&'a self, _artifacts: &'a ModelArtifacts) -> SaveFuture<'a> {
        Box::pin(async {
            Err(ModelError::Unsupported(
                "this handler cannot save models".to_string(),
            ))
        })
    }
}

/// Reads `model.json` and its weight shards from the local filesystem.
///
/// Shard paths in the manifest are resolved relative to the directory that
/// contains the description file.
#[derive(Debug, Clone)]
pub struct FileSystemHandler {
    path: PathBuf,
}

impl FileSystemHandler {
    pub const URL_SCHEME: &'static str = "file://";

    /// Name of the single shard written by [`IoHandler::save`].
    pub const WEIGHTS_FILE: &'static str = "weights.bin";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Router claiming `file://` URLs and bare paths ending in `.json`.
    pub fn router() -> LoadRouter {
        Box::new(|url: &str| {
            let path = match url.strip_prefix(Self::URL_SCHEME) {
                Some(rest) => rest,
                None if url.ends_with(".json") && !url.contains("://") => url,
                None => return None,
            };
            Some(Box::new(FileSystemHandler::new(path)) as Box<dyn IoHandler>)
        })
    }

    fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl IoHandler for FileSystemHandler {
    fn load(&self) -> LoadFuture<'_> {
        Box::pin(async move {
            let text = read_file(&self.path).await?;
            let text = String::from_utf8(text).map_err(|e| {
                ModelError::InvalidModel(format!(
                    "{} is not valid UTF-8: {e}",
                    self.path.display()
                ))
            })?;
            let description = ModelDescription::from_json(&text)?;

            let mut weight_data = Vec::new();
            for group in &description.weights_manifest {
                for shard in &group.paths {
                    let shard_path = self.base_dir().join(shard);
                    let bytes = read_file(&shard_path).await?;
                    tracing::debug!(shard = %shard_path.display(), bytes = bytes.len(), "read weight shard");
                    weight_data.extend_from_slice(&bytes);
                }
            }

            Ok(ModelArtifacts {
                description,
                weight_data,
            })
        })
    }

    fn save<'a>(&'a self, artifacts: &'a ModelArtifacts) -> SaveFuture<'a> {
        Box::pin(async move {
            // All groups are rewritten to point at one shard.
            let mut description = artifacts.description.clone();
            let weights = description
                .weights_manifest
                .drain(..)
                .flat_map(|group| group.weights)
                .collect::<Vec<_>>();
            if !weights.is_empty() {
                description.weights_manifest.push(WeightGroup {
                    paths: vec![Self::WEIGHTS_FILE.to_string()],
                    weights,
                });
            }

            let json = serde_json::to_vec_pretty(&description)?;
            write_file(&self.path, &json).await?;
            write_file(&self.base_dir().join(Self::WEIGHTS_FILE), &artifacts.weight_data).await
        })
    }
}

/// Serves artifacts that are already in memory.
#[derive(Debug, Clone)]
pub struct MemoryHandler {
    artifacts: ModelArtifacts,
}

impl MemoryHandler {
    pub fn new(artifacts: ModelArtifacts) -> Self {
        Self { artifacts }
    }
}

impl IoHandler for MemoryHandler {
    fn load(&self) -> LoadFuture<'_> {
        let artifacts = self.artifacts.clone();
        Box::pin(async move { Ok(artifacts) })
    }
}

/// Ordered collection of load and save routers.
#[derive(Default)]
pub struct RouterRegistry {
    load_routers: Vec<LoadRouter>,
    save_routers: Vec<SaveRouter>,
}

impl RouterRegistry {
    /// Empty registry with no routers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the filesystem router for both loading and saving.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_load_router(FileSystemHandler::router());
        registry.register_save_router(FileSystemHandler::router());
        registry
    }

    pub fn register_load_router(&mut self, router: LoadRouter) -> &mut Self {
        self.load_routers.push(router);
        self
    }

    pub fn register_save_router(&mut self, router: SaveRouter) -> &mut Self {
        self.save_routers.push(router);
        self
    }

    /// All handlers whose router claims `url`, in registration order.
    pub fn load_handlers(&self, url: &str) -> Vec<Box<dyn IoHandler>> {
        self.load_routers.iter().filter_map(|r| r(url)).collect()
    }

    pub fn save_handlers(&self, url: &str) -> Vec<Box<dyn IoHandler>> {
        self.save_routers.iter().filter_map(|r| r(url)).collect()
    }

    /// The single load handler for `url`.
    ///
    /// # Errors
    /// Returns `NoHandler` when nothing matches and `AmbiguousHandler` when
    /// more than one router claims the URL.
    pub fn resolve_load(&self, url: &str) -> Result<Box<dyn IoHandler>> {
        Self::exactly_one(url, self.load_handlers(url))
    }

    pub fn resolve_save(&self, url: &str) -> Result<Box<dyn IoHandler>> {
        Self::exactly_one(url, self.save_handlers(url))
    }

    fn exactly_one(url: &str, mut handlers: Vec<Box<dyn IoHandler>>) -> Result<Box<dyn IoHandler>> {
        match handlers.len() {
            0 => Err(ModelError::NoHandler(url.to_string())),
            1 => Ok(handlers.remove(0)),
            count => Err(ModelError::AmbiguousHandler {
                url: url.to_string(),
                count,
            }),
        }
    }
}

/// A model whose weights are fully decoded.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub description: ModelDescription,
    pub weights: NamedTensorMap,
}

impl LoadedModel {
    /// Decode the weights of already fetched artifacts.
    pub fn from_artifacts(artifacts: ModelArtifacts) -> Result<Self> {
        let weights = decode_weights(&artifacts.weight_data, artifacts.description.weight_specs())?;
        Ok(Self {
            description: artifacts.description,
            weights,
        })
    }
}

/// Load a model from a path or `file://` URL with the default routers.
pub async fn load_model(path: impl AsRef<str>) -> Result<LoadedModel> {
    load_model_with(&RouterRegistry::with_defaults(), path.as_ref()).await
}

/// Load a model through an explicit registry.
///
/// Every weight entry is decoded and validated before this returns.
#[tracing::instrument(skip(registry))]
pub async fn load_model_with(registry: &RouterRegistry, url: &str) -> Result<LoadedModel> {
    let handler = registry.resolve_load(url)?;
    let artifacts = handler.load().await?;
    let model = LoadedModel::from_artifacts(artifacts)?;
    tracing::info!(weights = model.weights.len(), "model loaded");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_router_claims() {
        let router = FileSystemHandler::router();
        assert!(router("file:///tmp/model").is_some());
        assert!(router("models/model.json").is_some());
        assert!(router("https://example.com/model.json").is_none());
        assert!(router("models/model.bin").is_none());
    }

    #[test]
    fn test_registry_no_handler() {
        let registry = RouterRegistry::new();
        assert!(matches!(
            registry.resolve_load("model.json"),
            Err(ModelError::NoHandler(_))
        ));
    }

    #[test]
    fn test_registry_ambiguous() {
        let mut registry = RouterRegistry::with_defaults();
        registry.register_load_router(FileSystemHandler::router());
        assert!(matches!(
            registry.resolve_load("model.json"),
            Err(ModelError::AmbiguousHandler { count: 2, .. })
        ));
    }
}
