//! Per-run state machine: chunk the row stream, run each chunk end to end, keep going.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assemble::assemble;
use crate::chunker::{Chunk, Chunker};
use crate::engine::{EngineConfig, InferenceEngine};
use crate::error::{PipelineError, Result};
use crate::model::ModelLoader;
use crate::record::{PagePart, Row};
use crate::reshape::{reshape, ReshapeOptions};
use crate::sink::{write_records, Destination, ObjectStore};
use crate::source::{self, SourceDescriptor};

/// Name of the artifact holding chunk `index` of a run.
pub fn chunk_file_name(date: &str, part: PagePart, index: usize) -> String {
    format!("entities_{date}_{part}_{index}.jsonl")
}

/// Where chunk artifacts are written.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// A directory on the local filesystem.
    LocalDir(PathBuf),
    /// Objects under `prefix` in a bucket.
    Object {
        /// Bucket client.
        store: ObjectStore,
        /// Name prefix, usually ending in `/`.
        prefix: String,
    },
}

impl OutputTarget {
    /// Destination for an artifact called `file_name`.
    pub fn destination(&self, file_name: &str) -> Destination {
        match self {
            OutputTarget::LocalDir(dir) => Destination::Local(dir.join(file_name)),
            OutputTarget::Object { store, prefix } => Destination::Object {
                store: store.clone(),
                name: format!("{prefix}{file_name}"),
            },
        }
    }
}

/// Which chunk indices a run processes; the rest are read and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSelection {
    from: usize,
    only: BTreeSet<usize>,
}

impl ChunkSelection {
    /// Every chunk.
    pub fn all() -> Self {
        Self::default()
    }

    /// Chunks at or after `from`, further restricted to `only` when it is non-empty.
    pub fn new(from: usize, only: impl IntoIterator<Item = usize>) -> Self {
        Self {
            from,
            only: only.into_iter().collect(),
        }
    }

    /// Whether chunk `index` is processed.
    pub fn includes(&self, index: usize) -> bool {
        index >= self.from && (self.only.is_empty() || self.only.contains(&index))
    }

    /// Highest index that can still be selected, if the selection is bounded.
    fn last(&self) -> Option<usize> {
        self.only.iter().next_back().copied()
    }
}

/// Everything a run needs besides the rows and the engine.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Part of page being processed.
    pub part: PagePart,
    /// Run date used in artifact names.
    pub date: String,
    /// Rows per chunk.
    pub chunk_size: usize,
    /// Row-to-unit settings.
    pub reshape: ReshapeOptions,
    /// Artifact location.
    pub output: OutputTarget,
    /// Chunk indices to process.
    pub selection: ChunkSelection,
}

/// A chunk whose artifact was written completely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    /// Zero-based chunk index.
    pub index: usize,
    /// Artifact name.
    pub destination: String,
    /// Lines written.
    pub records: u64,
    /// Rows dropped for lacking an id.
    pub rows_without_id: u64,
    /// Wall time spent on the chunk.
    pub elapsed: Duration,
}

/// A chunk that failed and was skipped.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Zero-based chunk index.
    pub index: usize,
    /// Artifact name the chunk would have been written to.
    pub destination: String,
    /// Why it failed.
    pub error: PipelineError,
}

/// Outcome of a run that was not aborted.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Chunks written successfully, in order.
    pub completed: Vec<ChunkReport>,
    /// Chunks that failed, in order.
    pub failed: Vec<ChunkFailure>,
    /// Chunks read but not selected.
    pub skipped: Vec<usize>,
}

impl RunSummary {
    /// True when no processed chunk failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Indices of completed chunks.
    pub fn completed_indices(&self) -> Vec<usize> {
        self.completed.iter().map(|c| c.index).collect()
    }

    /// Indices of failed chunks.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|c| c.index).collect()
    }

    /// Total lines written across completed chunks.
    pub fn records_written(&self) -> u64 {
        self.completed.iter().map(|c| c.records).sum()
    }
}

/// Runs every chunk of `rows` through `engine`, writing one artifact per chunk.
///
/// Chunk-local failures are logged and recorded, then the next chunk starts. Any other
/// failure aborts the run.
pub fn run<I>(rows: I, engine: &mut InferenceEngine, config: &RunConfig) -> Result<RunSummary>
where
    I: Iterator<Item = Result<Row>>,
{
    let mut chunker = Chunker::new(rows, config.chunk_size)?;
    let mut summary = RunSummary::default();
    let part = config.part;

    while let Some(chunk) = chunker.next_chunk() {
        let index = chunk.index();
        if !config.selection.includes(index) {
            drop(chunk);
            tracing::debug!(chunk = index, part = %part, "skipping unselected chunk");
            summary.skipped.push(index);
            if config.selection.last().is_some_and(|last| index >= last) {
                break;
            }
            continue;
        }

        let destination = config.output.destination(&chunk_file_name(&config.date, part, index));
        let name = destination.to_string();
        tracing::info!(chunk = index, part = %part, destination = %name, "chunk started");
        let started = Instant::now();

        match process_chunk(chunk, engine, config, &destination) {
            Ok((records, rows_without_id)) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    chunk = index,
                    part = %part,
                    destination = %name,
                    records,
                    rows_without_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "chunk finished"
                );
                summary.completed.push(ChunkReport {
                    index,
                    destination: name,
                    records,
                    rows_without_id,
                    elapsed,
                });
            }
            Err(error) if error.is_chunk_local() => {
                tracing::error!(
                    chunk = index,
                    part = %part,
                    destination = %name,
                    error = %error,
                    "chunk failed, continuing with the next chunk"
                );
                summary.failed.push(ChunkFailure {
                    index,
                    destination: name,
                    error,
                });
            }
            Err(error) => {
                tracing::error!(chunk = index, part = %part, error = %error, "run aborted");
                return Err(error);
            }
        }

        if config.selection.last().is_some_and(|last| index >= last) {
            break;
        }
    }

    tracing::info!(
        part = %part,
        completed = ?summary.completed_indices(),
        failed = ?summary.failed_indices(),
        skipped = summary.skipped.len(),
        records = summary.records_written(),
        "run finished"
    );
    Ok(summary)
}

fn process_chunk<I>(
    chunk: Chunk<'_, I>,
    engine: &mut InferenceEngine,
    config: &RunConfig,
    destination: &Destination,
) -> Result<(u64, u64)>
where
    I: Iterator<Item = Result<Row>>,
{
    let mut units = reshape(chunk, &config.reshape);
    let written = {
        let inferences = engine.infer(units.by_ref());
        write_records(destination, assemble(inferences, config.part))?
    };
    Ok((written, units.skipped()))
}

/// Loads the model, opens the source and runs every chunk.
pub fn execute(
    descriptor: &SourceDescriptor,
    loader: Arc<dyn ModelLoader>,
    engine_config: EngineConfig,
    config: &RunConfig,
) -> Result<RunSummary> {
    let mut engine = InferenceEngine::start(loader, engine_config)?;
    let rows = source::stream(descriptor)?;
    run(rows, &mut engine, config)
}
