//! Stage 5: garbage-collect fully executed scavenge state.

use crate::core::{ScavengeCheckpoint, ScavengePoint};
use crate::state::StateForCleaner;
use crate::{Result, ScavengeConfig};

use super::runner::CancellationToken;

pub(crate) fn clean<S: StateForCleaner>(
    state: &mut S,
    config: &ScavengeConfig,
    scavenge_point: &ScavengePoint,
    cancel: &CancellationToken,
) -> Result<()> {
    cancel.check()?;
    state.begin()?;
    // Archived rows are reclaimed only when the operator also opted
    // out of keeping tombstones.
    let stats = match state.prune(config.unsafe_ignore_hard_deletes) {
        Ok(stats) => stats,
        Err(err) => {
            if let Err(rollback_err) = state.rollback() {
                tracing::warn!(error = %rollback_err, "rollback after prune failure");
            }
            return Err(err.into());
        }
    };
    state.commit(&ScavengeCheckpoint::Done {
        scavenge_point: *scavenge_point,
    })?;
    tracing::info!(
        originals = stats.originals,
        metastreams = stats.metastreams,
        "scavenge state cleaned"
    );
    Ok(())
}
