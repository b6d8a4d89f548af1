//! Stage 4: drop index entries for discarded events.
//!
//! The index stores only (hash, event number, position), so entries
//! under a colliding hash are resolved by reading the stream id of
//! the record at the entry's position. Index entries carry no
//! timestamp, so the maybe point is confirmed with the same coarse
//! chunk-range test the calculator raised it with; that test is what
//! keeps the index and the rewritten chunks in agreement.

use std::collections::HashMap;

use crate::core::{ScavengePoint, chunk_of};
use crate::ports::{ChunkManager, IndexWriter, ScavengerLog};
use crate::state::{StateForIndexExecutor, StreamExecutionInfo};
use crate::{Result, ScavengeConfig};

use super::runner::CancellationToken;

#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_index<S: StateForIndexExecutor>(
    state: &S,
    chunk_manager: &dyn ChunkManager,
    index_writer: &dyn IndexWriter,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    threads: usize,
    cancel: &CancellationToken,
    log: &dyn ScavengerLog,
) -> Result<()> {
    let mut memo: HashMap<u64, StreamExecutionInfo> = HashMap::new();

    let stats = index_writer.scavenge(
        &mut |entry| {
            // Entries at or past the scavenge point are out of this
            // round.
            if entry.log_position >= scavenge_point.position {
                return Ok(true);
            }

            let info = if state.is_colliding_hash(entry.stream_hash) {
                match chunk_manager.stream_id_at(entry.log_position)? {
                    Some(stream_id) => state.index_execution_info_by_id(&stream_id)?,
                    // The record is gone; the entry dangles.
                    None => return Ok(false),
                }
            } else {
                match memo.get(&entry.stream_hash.get()) {
                    Some(info) => *info,
                    None => {
                        let info = state.index_execution_info_by_hash(entry.stream_hash)?;
                        memo.insert(entry.stream_hash.get(), info);
                        info
                    }
                }
            };

            if info.is_tombstoned {
                if config.unsafe_ignore_hard_deletes {
                    return Ok(false);
                }
                if info.is_metastream {
                    return Ok(false);
                }
            }
            if info.discard_point.should_discard(entry.event_number) {
                return Ok(false);
            }
            if info.maybe_discard_point.should_discard(entry.event_number) {
                if let Some(max_age_ms) = info.max_age_ms {
                    let cutoff = scavenge_point.effective_now_ms.saturating_sub(max_age_ms);
                    let chunk = chunk_of(entry.log_position, config.chunk_size);
                    let safely_old = state
                        .chunk_time_range(chunk)?
                        .is_some_and(|range| range.ended_before(cutoff, config.skew_tolerance_ms));
                    if safely_old {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        },
        threads,
        cancel,
    )?;

    log.index_scavenged(stats.kept, stats.dropped);
    Ok(())
}
