//! Stage 2: turn retention facts into discard points and chunk
//! weights.
//!
//! Streams are visited in stable handle order so a restart replays
//! nothing before the checkpointed handle. Index walks happen in
//! bounded slices; max-age only ever raises the maybe point, via the
//! coarse per-chunk timestamp ranges.

use crate::core::{
    DiscardPoint, OriginalStreamData, ScavengeCheckpoint, ScavengePoint, StreamHandle,
    StreamStatus, chunk_of,
};
use crate::ports::IndexReader;
use crate::state::StateForCalculator;
use crate::{Result, ScavengeConfig};

use super::runner::CancellationToken;
use super::{DISCARD_WEIGHT, TOMBSTONED_DISCARD_WEIGHT};

const INDEX_SLICE: usize = 100;

pub(crate) fn calculate<S: StateForCalculator>(
    state: &mut S,
    index: &dyn IndexReader,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    resume_after: Option<StreamHandle>,
    cancel: &CancellationToken,
) -> Result<()> {
    let batch_size = config.calculator_checkpoint_interval.max(1);
    let mut cursor = resume_after;

    loop {
        cancel.check()?;
        let batch = state.active_originals_after(cursor.as_ref(), batch_size)?;
        let Some((last_handle, _)) = batch.last() else {
            return Ok(());
        };
        let last_handle = last_handle.clone();

        state.begin()?;
        let mut failed = None;
        for (handle, data) in &batch {
            if let Err(err) =
                calculate_stream(state, index, config, scavenge_point, handle, data)
            {
                failed = Some(err);
                break;
            }
        }
        if let Some(err) = failed {
            if let Err(rollback_err) = state.rollback() {
                tracing::warn!(error = %rollback_err, "rollback after calculate failure");
            }
            return Err(err);
        }

        cursor = Some(last_handle);
        state.commit(&ScavengeCheckpoint::Calculating {
            scavenge_point: *scavenge_point,
            last_handle: cursor.clone(),
        })?;
        tracing::debug!(streams = batch.len(), "calculated batch");
    }
}

fn calculate_stream<S: StateForCalculator>(
    state: &mut S,
    index: &dyn IndexReader,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    handle: &StreamHandle,
    data: &OriginalStreamData,
) -> Result<()> {
    let Some(last_event_number) = index.last_event_number(handle, scavenge_point)? else {
        // No events at or before the point: nothing to discard yet.
        return Ok(());
    };

    let old = *data;
    let (definite, maybe, weight, weight_from) = if old.is_tombstoned {
        // The accumulator already spared only the tombstone. Weight
        // every surviving discardable entry; this runs once, since
        // the stream is archived below.
        let definite = old.discard_point;
        let maybe = old.maybe_discard_point.or(definite);
        (definite, maybe, TOMBSTONED_DISCARD_WEIGHT, DiscardPoint::keep_all())
    } else {
        let mut definite = old.discard_point;
        if let Some(truncate_before) = old.metadata.truncate_before {
            definite = definite.or(DiscardPoint::discard_before(truncate_before));
        }
        if let Some(max_count) = old.metadata.max_count {
            let cut = last_event_number.saturating_sub(max_count.min(i64::MAX as u64) as i64);
            if let Some(point) = DiscardPoint::discard_including(cut) {
                definite = definite.or(point);
            }
        }
        // The last event is always retained.
        definite = definite.min(DiscardPoint::discard_before(last_event_number));
        // Monotonicity guard: neither point ever moves backwards.
        definite = old.discard_point.or(definite);

        let mut maybe = definite;
        if let Some(max_age_ms) = old.metadata.max_age_ms {
            maybe = raise_for_max_age(
                state,
                index,
                config,
                scavenge_point,
                handle,
                definite,
                last_event_number,
                max_age_ms,
            )?;
        }
        let maybe = old.maybe_discard_point.or(maybe).or(definite);
        (definite, maybe, DISCARD_WEIGHT, old.maybe_discard_point)
    };

    deposit_weights(
        state,
        index,
        config,
        scavenge_point,
        handle,
        weight_from,
        maybe,
        weight,
    )?;

    let status = if old.is_tombstoned {
        StreamStatus::Archived
    } else if old.metadata.is_empty()
        && definite == DiscardPoint::keep_all()
        && maybe == DiscardPoint::keep_all()
    {
        StreamStatus::Spent
    } else {
        StreamStatus::Active
    };

    let updated = OriginalStreamData {
        metadata: old.metadata,
        is_tombstoned: old.is_tombstoned,
        status,
        discard_point: definite,
        maybe_discard_point: maybe,
    };
    if updated != old {
        state.update_original(handle, &updated)?;
    }
    Ok(())
}

/// Raise the maybe point for max-age using the coarse per-chunk test:
/// a record is safely old only when its whole chunk ended before the
/// cutoff, minus the configured clock-skew margin.
#[allow(clippy::too_many_arguments)]
fn raise_for_max_age<S: StateForCalculator>(
    state: &S,
    index: &dyn IndexReader,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    handle: &StreamHandle,
    definite: DiscardPoint,
    last_event_number: i64,
    max_age_ms: u64,
) -> Result<DiscardPoint> {
    let cutoff = scavenge_point.effective_now_ms.saturating_sub(max_age_ms);
    let mut maybe = definite;
    let mut from = definite.first_to_keep();

    'walk: loop {
        let infos = index.event_infos_forward(handle, from, INDEX_SLICE, scavenge_point)?;
        let Some(last_info) = infos.last().copied() else {
            break;
        };
        for info in infos {
            if info.event_number >= last_event_number {
                break 'walk;
            }
            let chunk = chunk_of(info.log_position, config.chunk_size);
            let safely_old = state
                .chunk_time_range(chunk)?
                .is_some_and(|range| range.ended_before(cutoff, config.skew_tolerance_ms));
            if !safely_old {
                // Stops at the first kept event.
                break 'walk;
            }
            match DiscardPoint::discard_including(info.event_number) {
                Some(point) => maybe = maybe.or(point),
                None => break 'walk,
            }
        }
        from = last_info.event_number + 1;
    }
    Ok(maybe)
}

/// Attribute weight to the chunk of every event in
/// `[from_point, to_point)`, walking the index in slices.
#[allow(clippy::too_many_arguments)]
fn deposit_weights<S: StateForCalculator>(
    state: &mut S,
    index: &dyn IndexReader,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    handle: &StreamHandle,
    from_point: DiscardPoint,
    to_point: DiscardPoint,
    weight: f64,
) -> Result<()> {
    let mut from = from_point.first_to_keep();
    while from < to_point.first_to_keep() {
        let infos = index.event_infos_forward(handle, from, INDEX_SLICE, scavenge_point)?;
        let Some(last_info) = infos.last().copied() else {
            return Ok(());
        };
        for info in infos {
            if !to_point.should_discard(info.event_number) {
                return Ok(());
            }
            state.add_chunk_weight(chunk_of(info.log_position, config.chunk_size), weight)?;
        }
        from = last_info.event_number + 1;
    }
    Ok(())
}
