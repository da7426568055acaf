#![warn(missing_docs)]
//! Streaming named-entity extraction over GOV.UK page titles, descriptions and body text.
//!
//! Rows are pulled from a source, cut into fixed-size chunks, reshaped into model-ready
//! units, run through an order-preserving inference engine and written as one JSONL
//! artifact per chunk.

pub mod assemble;
pub mod chunker;
pub mod driver;
pub mod engine;
pub mod error;
pub mod model;
pub mod record;
pub mod reshape;
pub mod settings;
pub mod sink;
pub mod source;

pub use chunker::{Chunk, Chunker};
pub use driver::{chunk_file_name, ChunkSelection, OutputTarget, RunConfig, RunSummary};
pub use engine::{EngineConfig, Inference, InferenceEngine};
pub use error::{PipelineError, Result};
pub use model::{EntityModel, ModelLoader, ModelLocation, ModelSettings};
pub use record::{Entity, OutputRecord, PagePart, Record, Row, Unit, UnitMeta};
pub use reshape::{reshape, FieldNames, MissingIdPolicy, ReshapeOptions};
pub use settings::{Cli, PipelineConfig};
pub use sink::{write_records, Destination, JsonlSink, ObjectStore};
pub use source::{SourceDescriptor, TableName};
