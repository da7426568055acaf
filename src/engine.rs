//! Batched entity inference that preserves submission order across a worker pool.
//!
//! Units are grouped into batches of `batch_size`. With one worker the batches run on
//! the calling thread; with more, each batch is tagged with a sequence number and sent to
//! a pool of threads that each own a model instance. Completed batches land in a reorder
//! buffer and are released strictly by sequence number, so the output order never
//! depends on which worker finished first.

use std::collections::{BTreeMap, VecDeque};
use std::iter::Fuse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{PipelineError, Result};
use crate::model::{EntityModel, ModelLoader};
use crate::record::{Entity, Unit, UnitMeta};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Throughput knobs; neither changes what the engine outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    batch_size: usize,
    worker_count: usize,
}

impl EngineConfig {
    /// Validates and builds the engine settings.
    pub fn new(batch_size: usize, worker_count: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::config("batch size must be at least 1"));
        }
        if worker_count == 0 {
            return Err(PipelineError::config("worker count must be at least 1"));
        }
        Ok(Self {
            batch_size,
            worker_count,
        })
    }

    /// Units per model call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of model instances running in parallel.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

/// Spans found for one unit, paired with the unit's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    /// Extracted spans.
    pub entities: Vec<Entity>,
    /// Metadata of the unit the spans belong to.
    pub meta: UnitMeta,
}

/// Owns the loaded model(s) for the lifetime of a run.
pub struct InferenceEngine {
    config: EngineConfig,
    backend: Backend,
}

enum Backend {
    Inline(Box<dyn EntityModel>),
    Pool(WorkerPool),
}

impl InferenceEngine {
    /// Loads the model once (inline) or once per worker thread (pool).
    pub fn start(loader: Arc<dyn ModelLoader>, config: EngineConfig) -> Result<Self> {
        let backend = if config.worker_count == 1 {
            Backend::Inline(loader.load()?)
        } else {
            Backend::Pool(WorkerPool::spawn(loader, config.worker_count)?)
        };
        tracing::info!(
            workers = config.worker_count,
            batch_size = config.batch_size,
            "inference engine ready"
        );
        Ok(Self { config, backend })
    }

    /// Runs `units` through the model, yielding results in submission order.
    ///
    /// The first error ends the stream. Dropping the stream early waits for batches
    /// still in flight, so the engine is clean for the next call.
    pub fn infer<I>(&mut self, units: I) -> InferStream<'_, I>
    where
        I: Iterator<Item = Result<Unit>>,
    {
        InferStream {
            batch_size: self.config.batch_size,
            engine: self,
            units: units.fuse(),
            ready: VecDeque::new(),
            pending: BTreeMap::new(),
            next_batch_id: 0,
            next_result_id: 0,
            inflight: 0,
            input_done: false,
            finished: false,
        }
    }
}

/// Lazy, ordered result stream returned by [`InferenceEngine::infer`].
pub struct InferStream<'e, I> {
    engine: &'e mut InferenceEngine,
    units: Fuse<I>,
    batch_size: usize,
    ready: VecDeque<Inference>,
    pending: BTreeMap<u64, Result<Vec<Inference>>>,
    next_batch_id: u64,
    next_result_id: u64,
    inflight: usize,
    input_done: bool,
    finished: bool,
}

impl<I> InferStream<'_, I>
where
    I: Iterator<Item = Result<Unit>>,
{
    fn allocate_batch_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }
}

impl<I> Iterator for InferStream<'_, I>
where
    I: Iterator<Item = Result<Unit>>,
{
    type Item = Result<Inference>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inference) = self.ready.pop_front() {
                return Some(Ok(inference));
            }
            if self.finished {
                return None;
            }
            if let Some(outcome) = self.pending.remove(&self.next_result_id) {
                self.next_result_id += 1;
                match outcome {
                    Ok(batch) => {
                        self.ready.extend(batch);
                        continue;
                    }
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(err));
                    }
                }
            }

            match &mut self.engine.backend {
                Backend::Inline(model) => {
                    if self.input_done {
                        self.finished = true;
                        return None;
                    }
                    let (units, bad_unit) = take_batch(&mut self.units, self.batch_size);
                    if units.is_empty() && bad_unit.is_none() {
                        self.finished = true;
                        return None;
                    }
                    if !units.is_empty() {
                        let outcome = run_batch(model.as_mut(), units);
                        let id = self.allocate_batch_id();
                        self.pending.insert(id, outcome);
                    }
                    if let Some(err) = bad_unit {
                        let id = self.allocate_batch_id();
                        self.pending.insert(id, Err(err));
                        self.input_done = true;
                    }
                }
                Backend::Pool(pool) => {
                    while !self.input_done && self.inflight < pool.max_inflight {
                        let (units, bad_unit) = take_batch(&mut self.units, self.batch_size);
                        if units.is_empty() && bad_unit.is_none() {
                            self.input_done = true;
                            break;
                        }
                        if !units.is_empty() {
                            let id = self.next_batch_id;
                            self.next_batch_id += 1;
                            if let Err(err) = pool.submit(BatchTask { id, units }) {
                                self.pending.insert(id, Err(err));
                                self.input_done = true;
                                break;
                            }
                            self.inflight += 1;
                        }
                        if let Some(err) = bad_unit {
                            let id = self.next_batch_id;
                            self.next_batch_id += 1;
                            self.pending.insert(id, Err(err));
                            self.input_done = true;
                        }
                    }

                    if self.inflight == 0 {
                        if self.pending.is_empty() {
                            self.finished = true;
                            return None;
                        }
                        continue;
                    }

                    match pool.recv(self.next_result_id, self.inflight) {
                        Ok(result) => {
                            self.inflight -= 1;
                            self.pending.insert(result.id, result.outcome);
                        }
                        Err(err) => {
                            self.inflight = 0;
                            self.finished = true;
                            return Some(Err(err));
                        }
                    }
                }
            }
        }
    }
}

impl<I> Drop for InferStream<'_, I> {
    fn drop(&mut self) {
        if let Backend::Pool(pool) = &self.engine.backend {
            while self.inflight > 0 {
                if pool.results.recv().is_err() {
                    break;
                }
                self.inflight -= 1;
            }
        }
    }
}

/// Pulls up to `size` units. A bad unit ends the batch early and is returned next to the
/// units read before it, so those still get inferred ahead of the failure.
fn take_batch<I>(units: &mut I, size: usize) -> (Vec<Unit>, Option<PipelineError>)
where
    I: Iterator<Item = Result<Unit>>,
{
    let mut batch = Vec::with_capacity(size.min(1024));
    while batch.len() < size {
        match units.next() {
            Some(Ok(unit)) => batch.push(unit),
            Some(Err(err)) => return (batch, Some(err)),
            None => break,
        }
    }
    (batch, None)
}

fn run_batch(model: &mut dyn EntityModel, units: Vec<Unit>) -> Result<Vec<Inference>> {
    let spans = {
        let texts: Vec<&str> = units.iter().map(|unit| unit.text.as_str()).collect();
        model.extract(&texts)?
    };
    if spans.len() != units.len() {
        return Err(PipelineError::Model(format!(
            "model returned {} results for {} texts",
            spans.len(),
            units.len()
        )));
    }

    units
        .into_iter()
        .zip(spans)
        .map(|(unit, entities)| {
            check_offsets(&unit, &entities)?;
            Ok(Inference {
                entities,
                meta: unit.meta,
            })
        })
        .collect()
}

fn check_offsets(unit: &Unit, entities: &[Entity]) -> Result<()> {
    if entities.is_empty() {
        return Ok(());
    }
    let len = unit.text.chars().count();
    for entity in entities {
        if entity.start > entity.end || entity.end > len {
            return Err(PipelineError::Model(format!(
                "entity `{}` [{}, {}) is outside the {len}-character text of `{}`",
                entity.name, entity.start, entity.end, unit.meta.page_id
            )));
        }
    }
    Ok(())
}

struct BatchTask {
    id: u64,
    units: Vec<Unit>,
}

struct BatchResult {
    id: u64,
    outcome: Result<Vec<Inference>>,
}

struct WorkerPool {
    tasks: Option<Sender<BatchTask>>,
    results: Receiver<BatchResult>,
    handles: Vec<JoinHandle<()>>,
    max_inflight: usize,
}

impl WorkerPool {
    fn spawn(loader: Arc<dyn ModelLoader>, worker_count: usize) -> Result<Self> {
        let capacity = worker_count * 2;
        let (task_tx, task_rx) = bounded::<BatchTask>(capacity);
        let (result_tx, result_rx) = bounded::<BatchResult>(capacity);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(worker_count);

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker_loader = Arc::clone(&loader);
            let worker_rx = task_rx.clone();
            let worker_tx = result_tx.clone();
            let worker_ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("govner-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, worker_loader, worker_rx, worker_tx, worker_ready)
                })
                .map_err(|err| {
                    PipelineError::WorkerPool(format!("failed to spawn worker {worker_id}: {err}"))
                })?;
            handles.push(handle);
        }
        drop(task_rx);
        drop(result_tx);
        drop(ready_tx);

        let pool = Self {
            tasks: Some(task_tx),
            results: result_rx,
            handles,
            max_inflight: capacity,
        };
        for _ in 0..worker_count {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(PipelineError::WorkerPool(
                        "worker exited before loading its model".to_string(),
                    ))
                }
            }
        }
        Ok(pool)
    }

    fn submit(&self, task: BatchTask) -> Result<()> {
        let sender = self
            .tasks
            .as_ref()
            .ok_or_else(|| PipelineError::WorkerPool("worker pool is shut down".to_string()))?;
        sender
            .send(task)
            .map_err(|_| PipelineError::WorkerPool("inference worker channel closed".to_string()))
    }

    fn recv(&self, waiting_on: u64, inflight: usize) -> Result<BatchResult> {
        loop {
            match self.results.recv_timeout(WAIT_LOG_INTERVAL) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::info!(
                        inflight,
                        oldest_batch = waiting_on,
                        "still waiting on inference batches"
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::WorkerPool(
                        "inference workers exited unexpectedly".to_string(),
                    ))
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tasks.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("inference worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(
    worker_id: usize,
    loader: Arc<dyn ModelLoader>,
    receiver: Receiver<BatchTask>,
    sender: Sender<BatchResult>,
    ready: Sender<Result<()>>,
) {
    let mut model = match loader.load() {
        Ok(model) => {
            let _ = ready.send(Ok(()));
            model
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    drop(ready);
    tracing::debug!(worker = worker_id, "inference worker ready");

    for task in receiver.iter() {
        let BatchTask { id, units } = task;
        let unit_count = units.len();
        tracing::debug!(worker = worker_id, batch = id, units = unit_count, "running batch");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_batch(model.as_mut(), units)))
            .unwrap_or_else(|_| {
                Err(PipelineError::WorkerPool(format!(
                    "worker {worker_id} panicked on batch {id} ({unit_count} units)"
                )))
            });
        if sender.send(BatchResult { id, outcome }).is_err() {
            break;
        }
    }
    tracing::debug!(worker = worker_id, "inference worker stopped");
}
