//! Stage 3: rewrite chunks whose weight clears the threshold.

use std::collections::HashMap;
use std::time::Instant;

use crate::core::{
    PrepareBuffer, RecordKind, ScavengeCheckpoint, ScavengePoint, SystemBuffer,
};
use crate::error::ScavengeError;
use crate::ports::{ChunkManager, ChunkReader, ChunkWriter, ScavengerLog};
use crate::state::{StateForChunkExecutor, StreamExecutionInfo};
use crate::{Result, ScavengeConfig};

use super::runner::CancellationToken;
use super::throttle::Throttle;

#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_chunks<S: StateForChunkExecutor>(
    state: &mut S,
    chunk_manager: &dyn ChunkManager,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    done_chunk: Option<u32>,
    cancel: &CancellationToken,
    log: &dyn ScavengerLog,
) -> Result<()> {
    let throttle = Throttle::new(config.throttle_percent);
    let mut chunk = match done_chunk {
        Some(done) => done + 1,
        None => 0,
    };
    let last_chunk = scavenge_point.last_chunk(config.chunk_size);

    while chunk <= last_chunk {
        cancel.check()?;
        let started = Instant::now();
        let reader = chunk_manager.reader_for_position(u64::from(chunk) * config.chunk_size)?;
        if !reader.is_read_only() {
            // The open chunk at the write head is never rewritten.
            break;
        }
        let start = reader.chunk_start_number();
        let end = reader.chunk_end_number();
        let weight = state.sum_chunk_weights(start, end)?;

        if should_rewrite(weight, scavenge_point.threshold, config.unsafe_ignore_hard_deletes) {
            let (kept, discarded) =
                rewrite_chunk(state, chunk_manager, reader, config, scavenge_point, cancel)?;
            state.begin()?;
            if let Err(err) = state.reset_chunk_weights(start, end) {
                if let Err(rollback_err) = state.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after weight reset failure");
                }
                return Err(err.into());
            }
            state.commit(&ScavengeCheckpoint::ExecutingChunks {
                scavenge_point: *scavenge_point,
                done_chunk: Some(end),
            })?;
            log.chunk_scavenged(start, kept, discarded, started.elapsed().as_millis() as u64);
        } else {
            log.chunk_skipped(start, weight);
            state.begin()?;
            state.commit(&ScavengeCheckpoint::ExecutingChunks {
                scavenge_point: *scavenge_point,
                done_chunk: Some(end),
            })?;
        }

        throttle.rest(started.elapsed());
        chunk = end + 1;
    }
    Ok(())
}

fn should_rewrite(weight: f64, threshold: i64, unsafe_ignore_hard_deletes: bool) -> bool {
    if unsafe_ignore_hard_deletes {
        return true;
    }
    if threshold < 0 {
        // A negative threshold forces no rewrites at all.
        return false;
    }
    weight > threshold as f64
}

fn rewrite_chunk<S: StateForChunkExecutor>(
    state: &mut S,
    chunk_manager: &dyn ChunkManager,
    mut reader: Box<dyn ChunkReader>,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    let mut writer = chunk_manager.create_writer(reader.as_ref())?;
    match copy_records(
        state,
        reader.as_mut(),
        writer.as_mut(),
        config,
        scavenge_point,
        cancel,
    ) {
        Ok(counts) => {
            let completed = writer.complete()?;
            tracing::debug!(
                chunk = reader.chunk_start_number(),
                path = %completed.path.display(),
                file_size = completed.file_size,
                "chunk replacement committed"
            );
            Ok(counts)
        }
        Err(err) => {
            // Cancellation keeps the temp chunk around; everything
            // else deletes it immediately.
            let delete = !matches!(err, ScavengeError::Cancelled { .. });
            writer.abort(delete);
            Err(err)
        }
    }
}

fn copy_records<S: StateForChunkExecutor>(
    state: &mut S,
    reader: &mut dyn ChunkReader,
    writer: &mut dyn ChunkWriter,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    let mut prepare = PrepareBuffer::new();
    let mut system = SystemBuffer::new();
    let mut memo: HashMap<String, StreamExecutionInfo> = HashMap::new();
    let mut kept = 0u64;
    let mut discarded = 0u64;
    let mut since_check = 0u32;

    loop {
        match reader.next_record(&mut prepare, &mut system)? {
            None => return Ok((kept, discarded)),
            Some(RecordKind::System) => {
                writer.write_system(&system)?;
                kept += 1;
            }
            Some(RecordKind::Prepare) => {
                if should_discard(state, &mut memo, &prepare, config, scavenge_point)? {
                    discarded += 1;
                } else {
                    writer.write_prepare(&prepare)?;
                    kept += 1;
                }
            }
        }
        since_check += 1;
        if since_check >= config.cancellation_check_period.max(1) {
            cancel.check()?;
            since_check = 0;
        }
    }
}

fn should_discard<S: StateForChunkExecutor>(
    state: &S,
    memo: &mut HashMap<String, StreamExecutionInfo>,
    prepare: &PrepareBuffer,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
) -> Result<bool> {
    // Records at or past the scavenge point belong to a later round.
    if prepare.log_position >= scavenge_point.position {
        return Ok(false);
    }
    // Mid-transaction prepares are kept; transactions are out of
    // scavenge scope.
    if !prepare.is_self_committed {
        return Ok(false);
    }

    let info = match memo.get(prepare.stream_id.as_str()) {
        Some(info) => *info,
        None => {
            let info = state.chunk_execution_info(&prepare.stream_id)?;
            memo.insert(prepare.stream_id.clone(), info);
            info
        }
    };

    if info.is_tombstoned {
        if config.unsafe_ignore_hard_deletes {
            return Ok(true);
        }
        if info.is_metastream {
            // The whole metastream of a tombstoned stream is moot.
            return Ok(true);
        }
        if prepare.is_tombstone {
            return Ok(false);
        }
    }

    if info.discard_point.should_discard(prepare.event_number) {
        return Ok(true);
    }

    // The maybe point is confirmed against the record's own
    // timestamp.
    if info.maybe_discard_point.should_discard(prepare.event_number) {
        if let Some(max_age_ms) = info.max_age_ms {
            let cutoff = scavenge_point.effective_now_ms.saturating_sub(max_age_ms);
            if prepare.timestamp_ms < cutoff {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
