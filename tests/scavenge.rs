//! End-to-end scavenge scenarios over the in-memory harness.

use std::sync::mpsc;
use std::sync::Arc;

use uuid::Uuid;

use strata_scavenge::core::DiscardPoint;
use strata_scavenge::state::StateTransaction;
use strata_scavenge::test_harness::{
    ControlledHasher, LogFixture, RewriteFailure, TestClock, RECORD_SIZE,
};
use strata_scavenge::{
    CancellationToken, ChunkManager, ChunkReader, ChunkWriter, ScavengeCheckpoint, ScavengeConfig,
    ScavengeOutcome, ScavengeRunner, ScavengeState, Scavenger, StandardStreamNames, StartOutcome,
    StopOutcome, StreamHasher, StreamStatus, TwoHalfHasher,
};

const CHUNK_RECORDS: u64 = 8;

fn test_config() -> ScavengeConfig {
    ScavengeConfig {
        chunk_size: CHUNK_RECORDS * RECORD_SIZE,
        ..ScavengeConfig::default()
    }
}

fn fixture_with(config: &ScavengeConfig, hasher: Arc<dyn StreamHasher>) -> LogFixture {
    LogFixture::new(config.chunk_size, hasher)
}

fn scavenger_for(
    fixture: &LogFixture,
    hasher: Arc<dyn StreamHasher>,
    config: ScavengeConfig,
    clock: TestClock,
) -> Scavenger {
    let state = ScavengeState::open_in_memory(
        hasher,
        Arc::new(StandardStreamNames),
        config.hash_cache_capacity,
    )
    .expect("open state");
    Scavenger::new(
        state,
        fixture.chunk_manager(),
        fixture.index(),
        fixture.index(),
        fixture.scavenge_point_source(),
        config,
    )
    .with_clock(Arc::new(clock))
}

fn run(scavenger: &mut Scavenger) -> ScavengeOutcome {
    scavenger.run(Uuid::new_v4(), 1, None, &CancellationToken::new())
}

#[test]
fn max_count_keeps_only_the_last_event() {
    // $$ab-1 -> maxCount=1 at t=0; ab-1 events at t=1,2,3; SP at t=4.
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_event("ab-1", 3);
    fixture.append_scavenge_point(4, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Chunk 0 keeps the last event plus the metadata and SP records.
    assert_eq!(fixture.surviving_events("ab-1"), vec![2]);
    assert_eq!(fixture.surviving_events("$$ab-1"), vec![0]);
    assert_eq!(fixture.surviving_events("$scavenges"), vec![0]);

    let data = scavenger
        .state()
        .original_stream("ab-1")
        .unwrap()
        .expect("stream state");
    assert_eq!(data.discard_point, DiscardPoint::discard_before(2));

    // The index dropped the same entries the chunk did.
    assert_eq!(fixture.index_event_numbers("ab-1"), vec![2]);
    assert!(fixture.index_is_consistent());
}

#[test]
fn tombstone_keeps_only_itself_and_archives_the_stream() {
    // ab-1 event at t=0; tombstone at t=1; SP at t=2.
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_event("ab-1", 0);
    fixture.append_tombstone("ab-1", 1);
    fixture.append_scavenge_point(2, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(2));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Only the tombstone (event 1) and the SP survive.
    assert_eq!(fixture.surviving_events("ab-1"), vec![1]);
    assert_eq!(fixture.surviving_events("$scavenges"), vec![0]);
    assert_eq!(fixture.index_event_numbers("ab-1"), vec![1]);

    let data = scavenger
        .state()
        .original_stream("ab-1")
        .unwrap()
        .expect("stream state");
    assert!(data.is_tombstoned);
    assert_eq!(data.status, StreamStatus::Archived);
}

#[test]
fn tombstone_in_a_metastream_is_fatal_before_any_mutation() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metastream_tombstone("ab-1", 0);
    fixture.append_scavenge_point(1, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(1));
    let outcome = run(&mut scavenger);
    match outcome {
        ScavengeOutcome::Errored { error } => {
            assert!(error.contains("$$ab-1"), "unexpected error: {error}")
        }
        other => panic!("expected Errored, got {other:?}"),
    }

    // The failing chunk's transaction rolled back: no per-stream
    // state was committed.
    assert!(scavenger.state().original_stream("ab-1").unwrap().is_none());
    assert!(scavenger.state().metastream("$$ab-1").unwrap().is_none());
    assert!(scavenger.state().collisions().unwrap().is_empty());
    // Nothing was rewritten.
    assert_eq!(fixture.surviving_events("$$ab-1"), vec![0]);
}

#[test]
fn next_round_resumes_from_the_previous_scavenge_point_chunk() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    // Fill chunk 0 and put SP-0 into chunk 1.
    for t in 0..CHUNK_RECORDS + 2 {
        fixture.append_event("ab-1", t);
    }
    let sp0 = fixture.append_scavenge_point(20, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(20));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    match scavenger.state().checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => {
            assert_eq!(scavenge_point.position, sp0.position)
        }
        other => panic!("expected Done, got {other:?}"),
    }

    // Two new events land in a later chunk, then SP-1.
    fixture.append_event("ab-1", 30);
    fixture.append_event("ab-1", 31);
    let sp1 = fixture.append_scavenge_point(40, 0);

    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    match scavenger.state().checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => {
            assert_eq!(scavenge_point.position, sp1.position)
        }
        other => panic!("expected Done, got {other:?}"),
    }
    // No retention metadata anywhere: nothing was removed in either
    // round.
    let survivors = fixture.surviving_events("ab-1");
    assert_eq!(survivors.len() as u64, CHUNK_RECORDS + 4);
}

#[test]
fn loosened_metadata_never_moves_the_discard_point_backwards() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_event("ab-1", 3);
    fixture.append_scavenge_point(4, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    assert_eq!(
        scavenger
            .state()
            .original_stream("ab-1")
            .unwrap()
            .expect("stream state")
            .discard_point,
        DiscardPoint::discard_before(2)
    );

    // Metadata is loosened to maxCount=4, two more events arrive.
    fixture.append_metadata("ab-1", r#"{"maxCount": 4}"#, 5);
    fixture.append_event("ab-1", 6);
    fixture.append_event("ab-1", 7);
    fixture.append_scavenge_point(8, 0);

    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    let data = scavenger
        .state()
        .original_stream("ab-1")
        .unwrap()
        .expect("stream state");
    // maxCount=4 over last=4 would allow DiscardBefore(1); the point
    // stays where the stricter metadata put it.
    assert_eq!(data.discard_point, DiscardPoint::discard_before(2));
    assert_eq!(fixture.surviving_events("ab-1"), vec![2, 3, 4]);
}

#[test]
fn streams_born_after_the_scavenge_point_are_untouched() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"truncateBefore": 4}"#, 0);
    fixture.append_scavenge_point(1, 0);
    fixture.append_event("ab-1", 2);
    fixture.append_event("ab-1", 3);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(1));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // No events existed before the point, so nothing is removed and
    // the later events stay.
    assert_eq!(fixture.surviving_events("ab-1"), vec![0, 1]);
    let data = scavenger
        .state()
        .original_stream("ab-1")
        .unwrap()
        .expect("stream state");
    assert_eq!(data.discard_point, DiscardPoint::keep_all());
}

#[test]
fn chunks_below_the_threshold_are_untouched() {
    let mut config = test_config();
    config.threshold = 5;
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    // Weight will be 2 (discardable events 0 and 1)... below 5.
    fixture.append_event("ab-1", 3);
    let before = fixture.chunk_records(0);
    fixture.append_scavenge_point(4, 5);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Byte-identical chunk contents (modulo the SP appended after the
    // snapshot, which lives in the same chunk).
    let after = fixture.chunk_records(0);
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(fixture.surviving_events("ab-1"), vec![0, 1, 2]);
    // The discard point still advanced; only execution was skipped.
    assert_eq!(
        scavenger
            .state()
            .original_stream("ab-1")
            .unwrap()
            .expect("stream state")
            .discard_point,
        DiscardPoint::discard_before(2)
    );
}

#[test]
fn negative_threshold_forces_no_rewrites() {
    let mut config = test_config();
    config.threshold = -1;
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_scavenge_point(3, -1);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(3));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    assert_eq!(fixture.surviving_events("ab-1"), vec![0, 1]);
}

#[test]
fn max_age_discards_only_confirmed_old_events() {
    let mut config = test_config();
    config.skew_tolerance_ms = 10;
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());

    // Old events fill chunk 0; fresh events follow in chunk 1.
    fixture.append_metadata("ab-1", r#"{"maxAgeMs": 500}"#, 100);
    for t in [110, 120, 130, 140, 150, 160, 170] {
        fixture.append_event("ab-1", t);
    }
    // Chunk 1: recent events.
    for t in [900, 910, 920] {
        fixture.append_event("ab-1", t);
    }
    fixture.append_scavenge_point(1_000, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(1_000));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Cutoff is 500; chunk 0's range ends at 170, safely old. Events
    // 0..=6 go; the fresh ones and the last stay.
    assert_eq!(fixture.surviving_events("ab-1"), vec![7, 8, 9]);
    assert!(fixture.index_is_consistent());
}

#[test]
fn junk_metadata_is_skipped_and_the_previous_stands() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_metadata("ab-1", "not json at all", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_event("ab-1", 3);
    fixture.append_scavenge_point(4, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // maxCount=1 from the first event still applies.
    assert_eq!(fixture.surviving_events("ab-1"), vec![1]);
    let data = scavenger
        .state()
        .original_stream("ab-1")
        .unwrap()
        .expect("stream state");
    assert_eq!(data.metadata.max_count, Some(1));
}

#[test]
fn colliding_streams_are_tracked_and_scavenged_separately() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> =
        Arc::new(ControlledHasher::with_overrides([("aa", 77), ("bb", 77)]));
    let fixture = fixture_with(&config, hasher.clone());

    fixture.append_metadata("aa", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("aa", 1);
    fixture.append_event("aa", 2);
    fixture.append_event("bb", 3);
    fixture.append_event("bb", 4);
    fixture.append_scavenge_point(5, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(5));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Both names are recorded as collisions.
    assert_eq!(
        scavenger.state().collisions().unwrap(),
        vec!["aa".to_string(), "bb".to_string()]
    );
    // aa loses its first event to maxCount; bb is untouched even
    // though it shares the hash.
    assert_eq!(fixture.surviving_events("aa"), vec![1]);
    assert_eq!(fixture.surviving_events("bb"), vec![0, 1]);
    assert_eq!(fixture.index_event_numbers("aa"), vec![1]);
    assert_eq!(fixture.index_event_numbers("bb"), vec![0, 1]);
    assert!(fixture.index_is_consistent());
}

#[test]
fn unsafe_ignore_hard_deletes_reclaims_the_tombstone_too() {
    let mut config = test_config();
    config.unsafe_ignore_hard_deletes = true;
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 10}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_tombstone("ab-1", 3);
    fixture.append_scavenge_point(4, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Everything is gone: the events, the tombstone, the metastream.
    assert_eq!(fixture.surviving_events("ab-1"), Vec::<i64>::new());
    assert_eq!(fixture.surviving_events("$$ab-1"), Vec::<i64>::new());
    assert_eq!(fixture.index_event_numbers("ab-1"), Vec::<i64>::new());
    // And the archived state row was reclaimed by the cleaner.
    assert!(scavenger.state().original_stream("ab-1").unwrap().is_none());
}

#[test]
fn spent_streams_are_pruned_after_the_run() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    // Metadata that imposes nothing: the stream becomes Spent and its
    // row is cleaned.
    fixture.append_metadata("ab-1", "{}", 0);
    fixture.append_event("ab-1", 1);
    fixture.append_scavenge_point(2, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(2));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    assert!(scavenger.state().original_stream("ab-1").unwrap().is_none());
    assert!(scavenger.state().metastream("$$ab-1").unwrap().is_none());
    assert_eq!(fixture.surviving_events("ab-1"), vec![0]);
}

#[test]
fn mid_transaction_prepares_are_kept() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"truncateBefore": 10}"#, 0);
    fixture.append_transaction_part("ab-1", 1);
    fixture.append_transaction_part("ab-1", 2);
    fixture.append_event("ab-1", 3);
    fixture.append_scavenge_point(4, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(4));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Events 0 and 1 are below the discard point but not
    // self-committed, so they survive; event 2 survives as the last.
    assert_eq!(fixture.surviving_events("ab-1"), vec![0, 1, 2]);
}

#[test]
fn chunk_being_deleted_stops_the_run_and_cleans_the_temp() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_scavenge_point(3, 0);
    fixture.fail_next_rewrite(RewriteFailure::ChunkBeingDeleted);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(3));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Stopped);
    // The temp chunk was deleted immediately.
    assert_eq!(fixture.writer_aborts(), vec![true]);

    // A later run completes the round from the checkpoint.
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    assert_eq!(fixture.surviving_events("ab-1"), vec![1]);
}

#[test]
fn io_failure_during_rewrite_errors_the_run() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    fixture.append_scavenge_point(3, 0);
    fixture.fail_next_rewrite(RewriteFailure::Io);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(3));
    assert!(matches!(run(&mut scavenger), ScavengeOutcome::Errored { .. }));
    assert_eq!(fixture.writer_aborts(), vec![true]);
}

#[test]
fn pre_cancelled_run_reports_stopped_without_touching_anything() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_event("ab-1", 0);
    fixture.append_scavenge_point(1, 0);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(1));
    let cancel = CancellationToken::new();
    cancel.request_stop();
    assert_eq!(
        scavenger.run(Uuid::new_v4(), 1, None, &cancel),
        ScavengeOutcome::Stopped
    );
    assert_eq!(fixture.surviving_events("ab-1"), vec![0]);
}

#[test]
fn interrupted_and_resumed_run_matches_an_uninterrupted_one() {
    let build = |config: &ScavengeConfig, hasher: Arc<dyn StreamHasher>| {
        let fixture = fixture_with(config, hasher);
        fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
        for t in 1..=9 {
            fixture.append_event("ab-1", t);
        }
        fixture.append_metadata("cd-2", r#"{"truncateBefore": 2}"#, 10);
        for t in 11..=14 {
            fixture.append_event("cd-2", t);
        }
        fixture.append_scavenge_point(20, 0);
        fixture
    };
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);

    // Reference: straight-through run.
    let reference = build(&config, hasher.clone());
    let mut scavenger = scavenger_for(&reference, hasher.clone(), config.clone(), TestClock::new(20));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // Interrupted: the first rewrite dies mid-chunk, then the run is
    // re-invoked and resumes from the checkpoint.
    let interrupted = build(&config, hasher.clone());
    interrupted.fail_next_rewrite(RewriteFailure::Io);
    let mut scavenger = scavenger_for(&interrupted, hasher, config, TestClock::new(20));
    assert!(matches!(run(&mut scavenger), ScavengeOutcome::Errored { .. }));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    for stream in ["ab-1", "cd-2"] {
        assert_eq!(
            interrupted.surviving_events(stream),
            reference.surviving_events(stream),
            "stream {stream} diverged after resumption"
        );
        assert_eq!(
            interrupted.index_event_numbers(stream),
            reference.index_event_numbers(stream)
        );
    }
    assert!(interrupted.index_is_consistent());
}

#[test]
fn state_survives_reopening_from_disk() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_metadata("ab-1", r#"{"maxCount": 1}"#, 0);
    fixture.append_event("ab-1", 1);
    fixture.append_event("ab-1", 2);
    let sp = fixture.append_scavenge_point(3, 0);

    let temp = tempfile::TempDir::new().unwrap();
    let open_state = || {
        ScavengeState::open(
            temp.path(),
            Arc::new(TwoHalfHasher),
            Arc::new(StandardStreamNames),
            128,
        )
        .expect("open state")
    };

    let mut scavenger = Scavenger::new(
        open_state(),
        fixture.chunk_manager(),
        fixture.index(),
        fixture.index(),
        fixture.scavenge_point_source(),
        config.clone(),
    )
    .with_clock(Arc::new(TestClock::new(3)));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    drop(scavenger);

    // A new process sees the completed round.
    let state = open_state();
    match state.checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => {
            assert_eq!(scavenge_point.position, sp.position)
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[test]
fn driver_writes_a_scavenge_point_when_none_exists() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_event("ab-1", 5);
    fixture.append_event("ab-1", 6);

    let clock = TestClock::new(777);
    let mut scavenger = scavenger_for(&fixture, hasher, config, clock);
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);

    // The driver appended SP-0 carrying the clock reading.
    assert_eq!(fixture.surviving_events("$scavenges"), vec![0]);
    match scavenger.state().checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => {
            assert_eq!(scavenge_point.effective_now_ms, 777);
            assert_eq!(scavenge_point.event_number, 0);
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[test]
fn rerun_without_a_new_scavenge_point_targets_the_existing_one() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_event("ab-1", 5);
    fixture.append_event("ab-1", 6);

    let mut scavenger = scavenger_for(&fixture, hasher, config, TestClock::new(777));
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    let first_position = match scavenger.state().checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => scavenge_point.position,
        other => panic!("expected Done, got {other:?}"),
    };

    // No new point was appended in between: the second run targets
    // the existing SP-0 instead of writing a wasteful SP-1.
    assert_eq!(run(&mut scavenger), ScavengeOutcome::Success);
    assert_eq!(fixture.surviving_events("$scavenges"), vec![0]);
    match scavenger.state().checkpoint().unwrap() {
        Some(ScavengeCheckpoint::Done { scavenge_point }) => {
            assert_eq!(scavenge_point.position, first_position)
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

// --- runner ---

/// Chunk manager that parks the first reader call until released, so
/// runner tests can observe the Running state deterministically.
struct GatedChunkManager {
    inner: Arc<dyn ChunkManager>,
    gate: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ChunkManager for GatedChunkManager {
    fn reader_for_position(&self, position: u64) -> strata_scavenge::Result<Box<dyn ChunkReader>> {
        if let Some(gate) = self.gate.lock().expect("gate lock").take() {
            let _ = gate.recv();
        }
        self.inner.reader_for_position(position)
    }

    fn create_writer(
        &self,
        source: &dyn ChunkReader,
    ) -> strata_scavenge::Result<Box<dyn ChunkWriter>> {
        self.inner.create_writer(source)
    }

    fn stream_id_at(&self, position: u64) -> strata_scavenge::Result<Option<String>> {
        self.inner.stream_id_at(position)
    }

    fn merge_chunks(&self, cancel: &CancellationToken) -> strata_scavenge::Result<()> {
        self.inner.merge_chunks(cancel)
    }
}

#[test]
fn runner_rejects_concurrent_runs_and_mismatched_stops() {
    let config = test_config();
    let hasher: Arc<dyn StreamHasher> = Arc::new(TwoHalfHasher);
    let fixture = fixture_with(&config, hasher.clone());
    fixture.append_event("ab-1", 0);
    fixture.append_scavenge_point(1, 0);

    let (release, gate) = mpsc::channel();
    let gated = Arc::new(GatedChunkManager {
        inner: fixture.chunk_manager(),
        gate: std::sync::Mutex::new(Some(gate)),
    });

    let state = ScavengeState::open_in_memory(
        hasher.clone(),
        Arc::new(StandardStreamNames),
        config.hash_cache_capacity,
    )
    .expect("open state");
    let scavenger = Scavenger::new(
        state,
        gated,
        fixture.index(),
        fixture.index(),
        fixture.scavenge_point_source(),
        config.clone(),
    )
    .with_clock(Arc::new(TestClock::new(1)));

    let runner = ScavengeRunner::new();
    let scavenge_id = match runner.start(scavenger, 1, None) {
        StartOutcome::Started { scavenge_id } => scavenge_id,
        StartOutcome::InProgress => panic!("first start must run"),
    };

    // While parked on the gate: a second start and a mismatched stop
    // are both rejected.
    let second = scavenger_for(&fixture, hasher, config, TestClock::new(1));
    assert_eq!(runner.start(second, 1, None), StartOutcome::InProgress);
    assert_eq!(runner.stop(Uuid::new_v4()), StopOutcome::InvalidScavengeId);
    assert_eq!(runner.stop(scavenge_id), StopOutcome::Stopping);

    release.send(()).expect("release gate");
    assert_eq!(runner.join(), Some(ScavengeOutcome::Stopped));
    assert!(runner.is_idle());
}
