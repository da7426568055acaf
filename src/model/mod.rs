//! Entity model collaborators: the opaque `text -> spans` capability and its loaders.

pub mod http;
pub mod patterns;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{PipelineError, Result};
use crate::record::Entity;

pub use http::HttpNerModel;
pub use patterns::PatternModel;

/// A loaded sequence-labelling model.
///
/// Implementations must return exactly one span list per input text, in input order,
/// with character offsets into that text.
pub trait EntityModel: Send {
    /// Extracts entity spans from every text in the batch.
    fn extract(&mut self, texts: &[&str]) -> Result<Vec<Vec<Entity>>>;
}

/// Produces independent model instances, one per worker.
pub trait ModelLoader: Send + Sync {
    /// Loads a fresh model instance.
    fn load(&self) -> Result<Box<dyn EntityModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Box<dyn EntityModel>> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn EntityModel>> {
        self()
    }
}

/// Where the model lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    /// NER serving endpoint reached over HTTP.
    Service(Url),
    /// Entity-ruler pattern file on disk.
    Patterns(PathBuf),
}

impl ModelLocation {
    /// Interprets `http(s)://` locations as services and anything else as a pattern file.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(PipelineError::config("model location is empty"));
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            let url = Url::parse(location).map_err(|err| {
                PipelineError::config(format!("invalid model service URL `{location}`: {err}"))
            })?;
            Ok(ModelLocation::Service(url))
        } else {
            Ok(ModelLocation::Patterns(PathBuf::from(location)))
        }
    }
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLocation::Service(url) => write!(f, "{url}"),
            ModelLocation::Patterns(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Everything needed to load the configured model.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Model location.
    pub location: ModelLocation,
    /// Per-request timeout for service models.
    pub timeout: Duration,
    /// Attempts per batch for service models, including the first.
    pub max_retries: usize,
}

impl ModelSettings {
    /// Settings with the default timeout (60s) and retry budget (5).
    pub fn new(location: ModelLocation) -> Self {
        Self {
            location,
            timeout: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl ModelLoader for ModelSettings {
    fn load(&self) -> Result<Box<dyn EntityModel>> {
        match &self.location {
            ModelLocation::Service(url) => Ok(Box::new(HttpNerModel::new(
                url.clone(),
                self.timeout,
                self.max_retries,
            )?)),
            ModelLocation::Patterns(path) => Ok(Box::new(PatternModel::from_path(path)?)),
        }
    }
}
