mod common;

use std::time::Duration;

use lan_ipam_rs::scheduler::{PollState, PollingScheduler};
use lan_ipam_rs::types::NewSegment;
use lan_ipam_rs::Error;
use tokio::time::sleep;

use common::{harness, Harness};

fn segment(h: &Harness, cidr: &str) -> i64 {
    let (segment, _) = h
        .engine
        .address_space()
        .create_segment(NewSegment {
            name: cidr.into(),
            cidr: cidr.into(),
            ..Default::default()
        })
        .unwrap();
    segment.id
}

fn scheduler(h: &Harness) -> PollingScheduler {
    PollingScheduler::new(h.engine.clone(), Duration::from_millis(50))
}

#[tokio::test]
async fn duplicate_start_keeps_one_cycle_in_flight() {
    let h = harness(Duration::from_millis(200));
    let a = segment(&h, "10.0.0.0/30");
    h.prober.reply("10.0.0.1", 1);
    h.prober.reply("10.0.0.2", 1);
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.prober.calls(), 2);
    assert!(h.prober.peak() <= 2, "peak {}", h.prober.peak());
    assert_eq!(sched.status().await.state, PollState::Running);
    sched.shutdown().await;
}

#[tokio::test]
async fn switching_segments_discards_pending_results() {
    let h = harness(Duration::from_millis(300));
    let a = segment(&h, "10.0.0.0/30");
    let b = segment(&h, "10.0.1.0/30");
    h.prober.reply("10.0.0.1", 1);
    h.prober.reply("10.0.0.2", 1);
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    sched.select_segment(b).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    assert!(h.engine.cache().latest_for_segment(a).is_empty());
    let status = sched.status().await;
    assert_eq!(status.segment_id, Some(b));
    assert!(status.cycles_discarded >= 1);
    sched.shutdown().await;
}

#[tokio::test]
async fn stop_lets_in_flight_cycle_commit_then_idles() {
    let h = harness(Duration::from_millis(300));
    let a = segment(&h, "10.0.0.0/30");
    h.prober.reply("10.0.0.1", 7);
    h.prober.reply("10.0.0.2", 9);
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    sched.stop(a).await;
    assert_eq!(sched.status().await.state, PollState::Idle);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(h.engine.cache().latest_for_segment(a).len(), 2);
    let calls = h.prober.calls();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(h.prober.calls(), calls);

    let status = sched.status().await;
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.last_summary.map(|s| s.online), Some(2));
}

#[tokio::test]
async fn stop_for_other_segment_is_ignored() {
    let h = harness(Duration::from_millis(50));
    let a = segment(&h, "10.0.0.0/30");
    let b = segment(&h, "10.0.1.0/30");
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sched.stop(b).await;
    assert_eq!(sched.status().await.state, PollState::Running);
    sched.shutdown().await;
}

#[tokio::test]
async fn visibility_pauses_and_resumes() {
    let h = harness(Duration::from_millis(50));
    let a = segment(&h, "10.0.0.0/30");
    let sched = scheduler(&h);

    // Without a selected segment the signal does nothing.
    sched.set_visible(false).await;
    assert_eq!(sched.status().await.state, PollState::Idle);

    sched.start(a).await.unwrap();
    sched.set_visible(false).await;
    let status = sched.status().await;
    assert_eq!(status.state, PollState::Paused);
    assert_eq!(status.segment_id, Some(a));

    sched.set_visible(true).await;
    assert_eq!(sched.status().await.state, PollState::Running);
    sched.shutdown().await;
}

#[tokio::test]
async fn start_rejects_unknown_segment() {
    let h = harness(Duration::from_millis(1));
    let sched = scheduler(&h);
    let err = sched.start(99).await.unwrap_err();
    assert!(matches!(err, Error::SegmentNotFound(99)));
    assert_eq!(sched.status().await.state, PollState::Idle);
}

#[tokio::test]
async fn forget_clears_selection() {
    let h = harness(Duration::from_millis(50));
    let a = segment(&h, "10.0.0.0/30");
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sched.forget(a).await;
    let status = sched.status().await;
    assert_eq!(status.state, PollState::Idle);
    assert_eq!(status.segment_id, None);
    sched.shutdown().await;
}

#[tokio::test]
async fn cache_write_failure_keeps_polling_and_recovers() {
    let h = harness(Duration::from_millis(20));
    let a = segment(&h, "10.0.0.0/30");
    h.prober.reply("10.0.0.1", 1);
    h.prober.reply("10.0.0.2", 1);
    h.db.lock()
        .execute_batch(
            "CREATE TABLE fail_writes (x INTEGER);
             INSERT INTO fail_writes VALUES (1);
             CREATE TRIGGER liveness_write_fails BEFORE INSERT ON liveness
             WHEN EXISTS (SELECT 1 FROM fail_writes)
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    let status = sched.status().await;
    assert_eq!(status.state, PollState::Running);
    assert_eq!(status.cycles_completed, 0);
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("cache write failed")),
        "{:?}",
        status.last_error
    );
    assert!(h.prober.calls() > 2);
    assert!(h.engine.cache().latest_for_segment(a).is_empty());

    h.db.lock().execute_batch("DELETE FROM fail_writes;").unwrap();
    sleep(Duration::from_millis(300)).await;
    let status = sched.status().await;
    assert!(status.cycles_completed >= 1);
    assert_eq!(status.last_error, None);
    assert_eq!(h.engine.cache().latest_for_segment(a).len(), 2);
    sched.shutdown().await;
}

#[tokio::test]
async fn denied_probing_halts_the_loop() {
    let h = harness(Duration::from_millis(5));
    let a = segment(&h, "10.0.0.0/30");
    h.prober.deny_all();
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    let status = sched.status().await;
    assert_eq!(status.state, PollState::Idle);
    assert_eq!(status.segment_id, Some(a));
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Probing unavailable")),
        "{:?}",
        status.last_error
    );

    let calls = h.prober.calls();
    assert_eq!(calls, 2);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.prober.calls(), calls);
}

#[tokio::test]
async fn instant_cycles_are_paced() {
    // Silent hosts time out instantly, so each batch takes no time at all.
    let h = harness(Duration::ZERO);
    let a = segment(&h, "10.0.0.0/30");
    let sched = scheduler(&h);

    sched.start(a).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    sched.stop(a).await;

    // 1000 ms timeout / 20 = 50 ms floor; two probes per cycle.
    let calls = h.prober.calls();
    assert!(calls >= 2 && calls <= 2 * 8, "calls {calls}");
    sched.shutdown().await;
}
