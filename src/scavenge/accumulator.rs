//! Stage 1: sweep the log and materialise retention facts.
//!
//! The accumulator walks chunks from the one holding the previous
//! completed scavenge point up to the target point, updating state
//! idempotently inside one transaction per chunk. It is strictly
//! single-writer against state.

use crate::core::{
    PrepareBuffer, RecordKind, ScavengeCheckpoint, ScavengePoint, StreamMetadata, SystemBuffer,
    chunk_of,
};
use crate::error::ScavengeError;
use crate::ports::{ChunkManager, ChunkReader, MetastreamLookup};
use crate::state::{MetastreamUpdate, StateForAccumulator};
use crate::{Result, ScavengeConfig};

use super::runner::CancellationToken;
use super::METADATA_REPLACEMENT_WEIGHT;

#[allow(clippy::too_many_arguments)]
pub(crate) fn accumulate<S: StateForAccumulator>(
    state: &mut S,
    chunk_manager: &dyn ChunkManager,
    metastreams: &dyn MetastreamLookup,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    first_chunk: u32,
    done_chunk: Option<u32>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut chunk = match done_chunk {
        Some(done) => done + 1,
        None => first_chunk,
    };
    let last_chunk = scavenge_point.last_chunk(config.chunk_size);

    while chunk <= last_chunk {
        cancel.check()?;
        let mut reader =
            chunk_manager.reader_for_position(u64::from(chunk) * config.chunk_size)?;
        let done = reader.chunk_end_number();

        state.begin()?;
        match accumulate_chunk(
            state,
            reader.as_mut(),
            metastreams,
            config,
            scavenge_point,
            cancel,
        ) {
            Ok(reached_point) => {
                state.commit(&ScavengeCheckpoint::Accumulating {
                    scavenge_point: *scavenge_point,
                    first_chunk,
                    done_chunk: Some(done),
                })?;
                tracing::debug!(chunk = done, "chunk accumulated");
                if reached_point {
                    return Ok(());
                }
            }
            Err(err) => {
                if let Err(rollback_err) = state.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after accumulate failure");
                }
                return Err(err);
            }
        }
        chunk = done + 1;
    }
    Ok(())
}

/// Returns true once the target scavenge point was reached.
fn accumulate_chunk<S: StateForAccumulator>(
    state: &mut S,
    reader: &mut dyn ChunkReader,
    metastreams: &dyn MetastreamLookup,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut prepare = PrepareBuffer::new();
    let mut system = SystemBuffer::new();
    let mut since_check = 0u32;

    loop {
        match reader.next_record(&mut prepare, &mut system)? {
            None => return Ok(false),
            Some(RecordKind::System) => {}
            Some(RecordKind::Prepare) => {
                // The scavenge point record is the boundary marker.
                if prepare.log_position >= scavenge_point.position {
                    return Ok(true);
                }
                accumulate_prepare(state, &prepare, metastreams, config)?;
            }
        }
        since_check += 1;
        if since_check >= config.cancellation_check_period.max(1) {
            cancel.check()?;
            since_check = 0;
        }
    }
}

fn accumulate_prepare<S: StateForAccumulator>(
    state: &mut S,
    prepare: &PrepareBuffer,
    metastreams: &dyn MetastreamLookup,
    config: &ScavengeConfig,
) -> Result<()> {
    state.observe_stream(&prepare.stream_id)?;

    if metastreams.is_metastream(&prepare.stream_id) {
        if prepare.is_tombstone {
            return Err(ScavengeError::InvalidMetastreamOperation {
                metastream: prepare.stream_id.clone(),
                position: prepare.log_position,
            });
        }
        let Some(original) = metastreams.original_stream_of(&prepare.stream_id) else {
            return Err(ScavengeError::CorruptState {
                reason: format!("metastream `{}` has no original stream", prepare.stream_id),
            });
        };
        state.observe_stream(original)?;

        match StreamMetadata::parse(&prepare.payload) {
            Ok(metadata) => {
                let update = state.set_metastream_latest(
                    &prepare.stream_id,
                    original,
                    prepare.event_number,
                    prepare.log_position,
                )?;
                match update {
                    MetastreamUpdate::Applied { superseded } => {
                        if let Some(position) = superseded {
                            state.add_chunk_weight(
                                chunk_of(position, config.chunk_size),
                                METADATA_REPLACEMENT_WEIGHT,
                            )?;
                        }
                        state.set_original_stream_metadata(original, metadata)?;
                    }
                    // A previous run already absorbed this event.
                    MetastreamUpdate::Stale => {}
                }
            }
            Err(err) => {
                // Junk user metadata: the previous metadata stands.
                let err = ScavengeError::Metadata {
                    stream: prepare.stream_id.clone(),
                    source: err,
                };
                tracing::warn!(
                    position = prepare.log_position,
                    error = %err,
                    "skipping unparseable stream metadata"
                );
            }
        }
        return Ok(());
    }

    if prepare.is_tombstone {
        state.set_original_tombstoned(&prepare.stream_id, prepare.event_number)?;
        return Ok(());
    }

    state.widen_chunk_time_range(
        chunk_of(prepare.log_position, config.chunk_size),
        prepare.timestamp_ms,
    )?;
    Ok(())
}
