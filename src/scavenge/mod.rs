//! The scavenge pipeline: accumulate, calculate, execute chunks,
//! merge, execute index, clean.
//!
//! The driver reads the durable checkpoint and resumes the owning
//! stage from its sub-progress; completed work is never redone. All
//! state mutation happens inside stage-owned transactions, and any
//! error propagating past a stage boundary leaves no transaction
//! open.

mod accumulator;
mod calculator;
mod chunk_executor;
mod cleaner;
mod index_executor;
mod runner;
mod throttle;

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::core::{ScavengeCheckpoint, chunk_of};
use crate::error::{CancelReason, ScavengeError};
use crate::ports::{
    ChunkManager, Clock, IndexReader, IndexWriter, MetastreamLookup, ScavengePointSource,
    ScavengerLog, StandardStreamNames, SystemClock, TracingScavengerLog,
};
use crate::state::{ScavengeState, StateTransaction};
use crate::{Result, ScavengeConfig};

pub use runner::{CancellationToken, ScavengeRunner, StartOutcome, StopOutcome};
pub use throttle::Throttle;

/// Weight of one discardable event.
pub(crate) const DISCARD_WEIGHT: f64 = 1.0;
/// Weight per discardable event of a tombstoned stream.
pub(crate) const TOMBSTONED_DISCARD_WEIGHT: f64 = 2.0;
/// Weight of a superseded metadata event.
pub(crate) const METADATA_REPLACEMENT_WEIGHT: f64 = 2.0;

/// Result tag of one scavenge run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScavengeOutcome {
    Success,
    /// Operator stop, or the chunk store withdrew a chunk mid-rewrite.
    Stopped,
    Errored { error: String },
    /// Process shutdown interrupted the run.
    Interrupted,
    /// Another scavenge is already running.
    InProgress,
    /// A stop request named an id that is not running.
    InvalidScavengeId,
    /// Surfaced by hosts that gate scavenging on authorization; the
    /// core never produces it.
    Unauthorized,
}

/// The scavenge driver: owns the durable state and the collaborator
/// ports for one run at a time.
pub struct Scavenger {
    state: ScavengeState,
    chunk_manager: Arc<dyn ChunkManager>,
    index_reader: Arc<dyn IndexReader>,
    index_writer: Arc<dyn IndexWriter>,
    scavenge_points: Arc<dyn ScavengePointSource>,
    metastreams: Arc<dyn MetastreamLookup>,
    clock: Arc<dyn Clock>,
    log: Arc<dyn ScavengerLog>,
    config: ScavengeConfig,
}

impl Scavenger {
    pub fn new(
        state: ScavengeState,
        chunk_manager: Arc<dyn ChunkManager>,
        index_reader: Arc<dyn IndexReader>,
        index_writer: Arc<dyn IndexWriter>,
        scavenge_points: Arc<dyn ScavengePointSource>,
        config: ScavengeConfig,
    ) -> Self {
        Self {
            state,
            chunk_manager,
            index_reader,
            index_writer,
            scavenge_points,
            metastreams: Arc::new(StandardStreamNames),
            clock: Arc::new(SystemClock),
            log: Arc::new(TracingScavengerLog),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn ScavengerLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_metastream_lookup(mut self, metastreams: Arc<dyn MetastreamLookup>) -> Self {
        self.metastreams = metastreams;
        self
    }

    pub fn state(&self) -> &ScavengeState {
        &self.state
    }

    /// Run to completion (or cancellation), resuming from whatever
    /// checkpoint the state holds.
    pub fn run(
        &mut self,
        scavenge_id: Uuid,
        threads: usize,
        start_from_chunk: Option<u32>,
        cancel: &CancellationToken,
    ) -> ScavengeOutcome {
        let started = Instant::now();
        let outcome = match self.run_inner(scavenge_id, threads, start_from_chunk, cancel) {
            Ok(()) => ScavengeOutcome::Success,
            Err(err) => {
                if self.state.in_transaction() {
                    if let Err(rollback_err) = self.state.rollback() {
                        tracing::warn!(error = %rollback_err, "rollback at run boundary");
                    }
                }
                match err {
                    ScavengeError::Cancelled {
                        reason: CancelReason::Stop,
                    } => ScavengeOutcome::Stopped,
                    ScavengeError::Cancelled {
                        reason: CancelReason::Shutdown,
                    } => ScavengeOutcome::Interrupted,
                    ScavengeError::ChunkBeingDeleted { chunk } => {
                        tracing::info!(chunk, "chunk withdrawn mid-rewrite, stopping run");
                        ScavengeOutcome::Stopped
                    }
                    err => {
                        tracing::error!(error = %err, "scavenge failed");
                        ScavengeOutcome::Errored {
                            error: err.to_string(),
                        }
                    }
                }
            }
        };
        self.log
            .run_completed(scavenge_id, &outcome, started.elapsed().as_millis() as u64);
        outcome
    }

    fn run_inner(
        &mut self,
        scavenge_id: Uuid,
        threads: usize,
        start_from_chunk: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let checkpoint = self.resolve_checkpoint(start_from_chunk)?;
        self.log
            .run_started(scavenge_id, checkpoint.scavenge_point());
        self.advance(checkpoint, threads, cancel)
    }

    /// Resume an interrupted run, or begin a round against the latest
    /// existing scavenge point (writing one only when the log has
    /// none).
    fn resolve_checkpoint(
        &mut self,
        start_from_chunk: Option<u32>,
    ) -> Result<ScavengeCheckpoint> {
        let stored = self.state.checkpoint()?;
        if let Some(checkpoint) = &stored {
            if !checkpoint.is_done() {
                return Ok(checkpoint.clone());
            }
        }

        let previous = stored.map(|checkpoint| *checkpoint.scavenge_point());
        // The run always targets the latest existing scavenge point;
        // a new one is written only when the log holds none at all.
        let target = match self.scavenge_points.latest()? {
            Some(latest) => latest,
            None => self
                .scavenge_points
                .add(self.clock.now_ms(), self.config.threshold)?,
        };

        let first_chunk = start_from_chunk.unwrap_or_else(|| {
            previous
                .map(|previous| chunk_of(previous.position, self.config.chunk_size))
                .unwrap_or(0)
        });
        let entry = ScavengeCheckpoint::Accumulating {
            scavenge_point: target,
            first_chunk,
            done_chunk: None,
        };
        self.state.begin()?;
        self.state.commit(&entry)?;
        Ok(entry)
    }

    fn advance(
        &mut self,
        mut checkpoint: ScavengeCheckpoint,
        threads: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            checkpoint = match checkpoint {
                ScavengeCheckpoint::Accumulating {
                    scavenge_point,
                    first_chunk,
                    done_chunk,
                } => {
                    self.log.stage_started("accumulating");
                    accumulator::accumulate(
                        &mut self.state,
                        self.chunk_manager.as_ref(),
                        self.metastreams.as_ref(),
                        &self.config,
                        &scavenge_point,
                        first_chunk,
                        done_chunk,
                        cancel,
                    )?;
                    self.enter(ScavengeCheckpoint::Calculating {
                        scavenge_point,
                        last_handle: None,
                    })?
                }
                ScavengeCheckpoint::Calculating {
                    scavenge_point,
                    last_handle,
                } => {
                    self.log.stage_started("calculating");
                    calculator::calculate(
                        &mut self.state,
                        self.index_reader.as_ref(),
                        &self.config,
                        &scavenge_point,
                        last_handle,
                        cancel,
                    )?;
                    self.enter(ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point,
                        done_chunk: None,
                    })?
                }
                ScavengeCheckpoint::ExecutingChunks {
                    scavenge_point,
                    done_chunk,
                } => {
                    self.log.stage_started("executing_chunks");
                    chunk_executor::execute_chunks(
                        &mut self.state,
                        self.chunk_manager.as_ref(),
                        &self.config,
                        &scavenge_point,
                        done_chunk,
                        cancel,
                        self.log.as_ref(),
                    )?;
                    self.enter(ScavengeCheckpoint::MergingChunks { scavenge_point })?
                }
                ScavengeCheckpoint::MergingChunks { scavenge_point } => {
                    self.log.stage_started("merging_chunks");
                    self.chunk_manager.merge_chunks(cancel)?;
                    self.enter(ScavengeCheckpoint::ExecutingIndex { scavenge_point })?
                }
                ScavengeCheckpoint::ExecutingIndex { scavenge_point } => {
                    self.log.stage_started("executing_index");
                    index_executor::execute_index(
                        &self.state,
                        self.chunk_manager.as_ref(),
                        self.index_writer.as_ref(),
                        &self.config,
                        &scavenge_point,
                        threads,
                        cancel,
                        self.log.as_ref(),
                    )?;
                    self.enter(ScavengeCheckpoint::Cleaning { scavenge_point })?
                }
                ScavengeCheckpoint::Cleaning { scavenge_point } => {
                    self.log.stage_started("cleaning");
                    cleaner::clean(&mut self.state, &self.config, &scavenge_point, cancel)?;
                    ScavengeCheckpoint::Done { scavenge_point }
                }
                ScavengeCheckpoint::Done { .. } => return Ok(()),
            };
        }
    }

    /// One-way transition into the next stage.
    fn enter(&mut self, checkpoint: ScavengeCheckpoint) -> Result<ScavengeCheckpoint> {
        self.state.begin()?;
        self.state.commit(&checkpoint)?;
        Ok(checkpoint)
    }
}
