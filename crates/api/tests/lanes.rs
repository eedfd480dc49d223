//! End-to-end lane tests: queue -> gate -> supervisor -> ingestion, with
//! `/bin/sh` scripts standing in for the engine and the converter.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{write_script, TestApp, PARSE_OUTPUT_ARG};
use crackq_api::engine::{self, lanes::HandlerOutcome, lanes::LaneHandler, lanes::LaneRouter};
use crackq_core::scheduling::state_machine;
use crackq_core::types::DbId;
use crackq_db::models::queue::{LaneKind, Lease, NewQueueItem, QueueItem};
use crackq_db::models::status::{StatusId, TargetStatus};
use crackq_db::models::target::NewTarget;
use crackq_db::queue::JobQueue;
use crackq_db::store::{CredentialStore, JobStore, StoreResult, TargetStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn engine_env(script: &Path) -> Vec<(&'static str, String)> {
    vec![("ENGINE_BIN", script.to_string_lossy().into_owned())]
}

async fn enqueue(app: &TestApp, kind: LaneKind, subject_id: DbId, owner_id: DbId) {
    app.queue
        .enqueue(NewQueueItem {
            kind,
            subject_id,
            owner_id,
        })
        .await
        .unwrap();
}

async fn wait_for_status(app: &TestApp, job_id: DbId, wanted: StatusId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = app.store.job_status(job_id).await.unwrap();
        if status == Some(wanted) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {status:?}, wanted {wanted}",
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn start_lanes(app: &TestApp) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let router = engine::lane_router(&app.state, None);
    let handle = tokio::spawn(router.run(cancel.clone()));
    (cancel, handle)
}

// ---------------------------------------------------------------------------
// Test: a cracking run records credentials and completes the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attack_lane_cracks_and_records() {
    let scripts = TempDir::new().unwrap();
    let engine_bin = write_script(
        scripts.path(),
        "engine.sh",
        &format!(
            "{PARSE_OUTPUT_ARG}printf 'Status...........: Running\\nProgress.........: 5/10 (50.00%%)\\n\\n'\n\
             echo '5b2a8c9d:a4b1c2d3e4f5:001122334455:HomeNet:hunter2' > \"$out\"\nexit 0\n"
        ),
    );
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let job = app.seed_job(1, vec![], None).await;
    let mut events = app.state.event_bus.subscribe();

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::COMPLETED).await;
    cancel.cancel();
    handle.await.unwrap();

    let credentials = app.store.credentials_for_job(job.id).await.unwrap();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].identifier, "5b2a8c9d:a4b1c2d3e4f5:001122334455:HomeNet");
    assert_eq!(credentials[0].secret, "hunter2");

    let target = app.store.find_target(job.target_id).await.unwrap().unwrap();
    assert_eq!(target.discovered_secret.as_deref(), Some("hunter2"));
    assert_eq!(target.status_id, TargetStatus::Ready.id());

    let stored = app.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress_percent, 100.0);
    assert_eq!(stored.result.unwrap()["success"], true);

    let event = events.try_recv().unwrap();
    assert_eq!(event.event_type, "attack.cracked");
    assert!(app.queue.pending(LaneKind::Attack).await.is_empty());
    assert_eq!(app.state.propagator.tracked_jobs().await, 0);
}

// ---------------------------------------------------------------------------
// Test: an engine error with no results fails the job with its stderr
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_error_fails_job() {
    let scripts = TempDir::new().unwrap();
    let engine_bin = write_script(
        scripts.path(),
        "engine.sh",
        "echo 'Hash-file exception' >&2\nexit 255\n",
    );
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let job = app.seed_job(1, vec![], None).await;
    let mut events = app.state.event_bus.subscribe();

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::FAILED).await;
    cancel.cancel();
    handle.await.unwrap();

    let stored = app.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.error_message.as_deref(), Some("Hash-file exception"));
    assert_eq!(events.try_recv().unwrap().event_type, "attack.failed");
}

// ---------------------------------------------------------------------------
// Test: a clean exhaustion completes without results or notification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_run_completes_unsuccessfully() {
    let scripts = TempDir::new().unwrap();
    let engine_bin = write_script(scripts.path(), "engine.sh", "exit 1\n");
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let job = app.seed_job(1, vec![], None).await;
    let mut events = app.state.event_bus.subscribe();

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::COMPLETED).await;
    cancel.cancel();
    handle.await.unwrap();

    let stored = app.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.result.unwrap()["success"], false);
    assert!(app.store.credentials_for_job(job.id).await.unwrap().is_empty());
    assert!(events.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test: cancelling a running job stops the engine and keeps it cancelled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_job_is_cancelled() {
    let scripts = TempDir::new().unwrap();
    let engine_bin = write_script(scripts.path(), "engine.sh", "exec sleep 30\n");
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let job = app.seed_job(1, vec![], None).await;

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::RUNNING).await;

    assert_eq!(
        app.store.cancel_job(job.id).await.unwrap(),
        Some(state_machine::RUNNING)
    );
    // The supervisor notices within a poll and the lane finishes the item.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !app.queue.pending(LaneKind::Attack).await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "cancel not observed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(
        app.store.job_status(job.id).await.unwrap(),
        Some(state_machine::CANCELLED)
    );
    let target = app.store.find_target(job.target_id).await.unwrap().unwrap();
    assert_eq!(target.status_id, TargetStatus::Ready.id());
}

// ---------------------------------------------------------------------------
// Test: shutdown fails the running job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_fails_running_job() {
    let scripts = TempDir::new().unwrap();
    let engine_bin = write_script(scripts.path(), "engine.sh", "exec sleep 30\n");
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let job = app.seed_job(1, vec![], None).await;
    let mut events = app.state.event_bus.subscribe();

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::RUNNING).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("lanes stop")
        .unwrap();

    let stored = app.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status_id, state_machine::FAILED);
    assert_eq!(
        stored.error_message.as_deref(),
        Some(crackq_api::engine::ingest::SHUTDOWN_MESSAGE)
    );
    assert!(events.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test: attack jobs never run concurrently
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attack_jobs_never_overlap() {
    let scripts = TempDir::new().unwrap();
    let marks = scripts.path().display().to_string();
    let engine_bin = write_script(
        scripts.path(),
        "engine.sh",
        &format!(
            "if [ -e '{marks}/running' ]; then touch '{marks}/overlap'; fi\n\
             touch '{marks}/running'\nsleep 0.3\nrm -f '{marks}/running'\nexit 1\n"
        ),
    );
    let app = TestApp::with_env(&[
        ("ENGINE_BIN", engine_bin.to_string_lossy().into_owned()),
        ("ATTACK_CONCURRENCY", "4".to_string()),
    ]);
    let first = app.seed_job(1, vec![], None).await;
    let second = app.seed_job(2, vec![], None).await;

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, first.id, 1).await;
    enqueue(&app, LaneKind::Attack, second.id, 2).await;
    wait_for_status(&app, first.id, state_machine::COMPLETED).await;
    wait_for_status(&app, second.id, state_machine::COMPLETED).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(!scripts.path().join("overlap").exists());
}

// ---------------------------------------------------------------------------
// Test: a second router on the same queue never takes a live claim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_router_does_not_steal_running_attack() {
    let scripts = TempDir::new().unwrap();
    let marks = scripts.path().display().to_string();
    // Runs longer than the lease, so only renewal keeps the claim alive.
    let engine_bin = write_script(
        scripts.path(),
        "engine.sh",
        &format!(
            "echo run >> '{marks}/runs'
             if [ -e '{marks}/running' ]; then touch '{marks}/overlap'; fi
             touch '{marks}/running'
sleep 1.5
rm -f '{marks}/running'
exit 1
"
        ),
    );
    let app = TestApp::with_env(&[
        ("ENGINE_BIN", engine_bin.to_string_lossy().into_owned()),
        ("QUEUE_POLL_MS", "20".to_string()),
        ("QUEUE_LEASE_SECS", "1".to_string()),
    ]);
    let job = app.seed_job(1, vec![], None).await;

    let (cancel_a, handle_a) = start_lanes(&app);
    enqueue(&app, LaneKind::Attack, job.id, 1).await;
    wait_for_status(&app, job.id, state_machine::RUNNING).await;

    // A second server instance comes up while the first is mid-run.
    let (cancel_b, handle_b) = start_lanes(&app);
    wait_for_status(&app, job.id, state_machine::COMPLETED).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_a.cancel();
    cancel_b.cancel();
    handle_a.await.unwrap();
    handle_b.await.unwrap();

    assert!(!scripts.path().join("overlap").exists());
    let runs = std::fs::read_to_string(scripts.path().join("runs")).unwrap();
    assert_eq!(runs.lines().count(), 1);
    assert!(app.queue.pending(LaneKind::Attack).await.is_empty());
}

/// Delegates to the in-memory queue but refuses every renewal, as if
/// another holder had taken the item over.
struct RenewalsRefused(Arc<crackq_db::memory::MemoryQueue>);

#[async_trait]
impl JobQueue for RenewalsRefused {
    async fn enqueue(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        self.0.enqueue(item).await
    }

    async fn dequeue(
        &self,
        kind: LaneKind,
        max_in_flight: usize,
        lease: &Lease,
    ) -> StoreResult<Option<QueueItem>> {
        self.0.dequeue(kind, max_in_flight, lease).await
    }

    async fn renew(&self, _id: DbId, _lease: &Lease) -> StoreResult<bool> {
        Ok(false)
    }

    async fn ack(&self, id: DbId, holder: &str) -> StoreResult<bool> {
        self.0.ack(id, holder).await
    }

    async fn requeue(&self, id: DbId, holder: &str, delay: Duration) -> StoreResult<bool> {
        self.0.requeue(id, holder, delay).await
    }
}

/// Blocks until its token fires, then records that it was stopped.
struct WaitForStop {
    stopped: AtomicUsize,
}

#[async_trait]
impl LaneHandler for WaitForStop {
    async fn handle(&self, _item: &QueueItem, shutdown: &CancellationToken) -> HandlerOutcome {
        shutdown.cancelled().await;
        self.stopped.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Done
    }
}

#[tokio::test]
async fn lost_lease_stops_the_handler() {
    let app = TestApp::new();
    let handler = Arc::new(WaitForStop {
        stopped: AtomicUsize::new(0),
    });
    let queue = Arc::new(RenewalsRefused(app.queue.clone()));
    let router = LaneRouter::new(queue, Duration::from_millis(20), Duration::from_millis(90))
        .with_lane(LaneKind::DictionaryBuild, 1, handler.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(router.run(cancel.clone()));
    enqueue(&app, LaneKind::DictionaryBuild, 5, 1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handler.stopped.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "handler kept running without a lease");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The router itself keeps running; only the handler was stopped.
    assert!(!cancel.is_cancelled());
    cancel.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a dependent job runs only after its dependency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependent_job_runs_after_dependency() {
    let scripts = TempDir::new().unwrap();
    let order = scripts.path().join("order.txt");
    let engine_bin = write_script(
        scripts.path(),
        "engine.sh",
        &format!("echo \"$*\" | grep -o 'crackq-job-[0-9]*' >> '{}'\nexit 1\n", order.display()),
    );
    let app = TestApp::with_env(&engine_env(&engine_bin));
    let first = app.seed_job(1, vec![], None).await;
    let second = app.seed_job(1, vec![first.id], None).await;

    let (cancel, handle) = start_lanes(&app);
    // Queued dependent-first; the gate holds it back.
    enqueue(&app, LaneKind::Attack, second.id, 1).await;
    enqueue(&app, LaneKind::Attack, first.id, 1).await;
    wait_for_status(&app, second.id, state_machine::COMPLETED).await;
    cancel.cancel();
    handle.await.unwrap();

    let ran = std::fs::read_to_string(order).unwrap();
    assert_eq!(
        ran.lines().collect::<Vec<_>>(),
        vec![
            format!("crackq-job-{}", first.id),
            format!("crackq-job-{}", second.id),
        ]
    );
}

// ---------------------------------------------------------------------------
// Test: capture processing produces an artifact
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capture_lane_converts_capture() {
    let scripts = TempDir::new().unwrap();
    let converter = write_script(
        scripts.path(),
        "convert.sh",
        &format!("{PARSE_OUTPUT_ARG}echo 'WPA*02*deadbeef' > \"$out\"\n"),
    );
    let app = TestApp::with_env(&[(
        "CONVERTER_BIN",
        converter.to_string_lossy().into_owned(),
    )]);
    std::fs::write(app.root.path().join("captures").join("dump.pcapng"), b"pcap").unwrap();
    let target = app
        .store
        .create_target(NewTarget {
            owner_id: 1,
            name: "lobby".into(),
            capture_path: Some("dump.pcapng".into()),
            artifact_path: None,
        })
        .await;
    let mut events = app.state.event_bus.subscribe();

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::CaptureProcessing, target.id, 1).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = app.store.find_target(target.id).await.unwrap().unwrap();
        if current.artifact_path.is_some() {
            assert_eq!(
                current.artifact_path.as_deref(),
                Some(engine::capture::artifact_name(target.id).as_str())
            );
            assert_eq!(current.status_id, TargetStatus::Ready.id());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "capture never processed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(events.try_recv().unwrap().event_type, "capture.processed");
}

#[tokio::test]
async fn capture_without_handshakes_marks_target_failed() {
    let scripts = TempDir::new().unwrap();
    // Succeeds but writes nothing.
    let converter = write_script(scripts.path(), "convert.sh", "exit 0\n");
    let app = TestApp::with_env(&[(
        "CONVERTER_BIN",
        converter.to_string_lossy().into_owned(),
    )]);
    std::fs::write(app.root.path().join("captures").join("empty.cap"), b"pcap").unwrap();
    let target = app
        .store
        .create_target(NewTarget {
            owner_id: 1,
            name: "empty".into(),
            capture_path: Some("empty.cap".into()),
            artifact_path: None,
        })
        .await;

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::CaptureProcessing, target.id, 1).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !app.queue.pending(LaneKind::CaptureProcessing).await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "capture item never settled");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let current = app.store.find_target(target.id).await.unwrap().unwrap();
    assert_eq!(current.status_id, TargetStatus::Failed.id());
    assert!(current.artifact_path.is_none());
}

#[tokio::test]
async fn shutdown_mid_conversion_releases_target_and_keeps_item() {
    let scripts = TempDir::new().unwrap();
    let converter = write_script(scripts.path(), "convert.sh", "exec sleep 30\n");
    let app = TestApp::with_env(&[(
        "CONVERTER_BIN",
        converter.to_string_lossy().into_owned(),
    )]);
    std::fs::write(app.root.path().join("captures").join("slow.cap"), b"pcap").unwrap();
    let target = app
        .store
        .create_target(NewTarget {
            owner_id: 1,
            name: "slow".into(),
            capture_path: Some("slow.cap".into()),
            artifact_path: None,
        })
        .await;

    let (cancel, handle) = start_lanes(&app);
    enqueue(&app, LaneKind::CaptureProcessing, target.id, 1).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = app.store.find_target(target.id).await.unwrap().unwrap();
        if current.status_id == TargetStatus::Processing.id() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "conversion never started");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("lanes stop")
        .unwrap();

    let current = app.store.find_target(target.id).await.unwrap().unwrap();
    assert_eq!(current.status_id, TargetStatus::Ready.id());
    assert!(current.artifact_path.is_none());
    let pending = app.queue.pending(LaneKind::CaptureProcessing).await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].claimed_by.is_none());
}

// ---------------------------------------------------------------------------
// Test: router settles items by handler outcome
// ---------------------------------------------------------------------------

struct RetryOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl LaneHandler for RetryOnce {
    async fn handle(&self, _item: &QueueItem, _shutdown: &CancellationToken) -> HandlerOutcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            HandlerOutcome::Retry(Duration::ZERO)
        } else {
            HandlerOutcome::Done
        }
    }
}

#[tokio::test]
async fn router_requeues_then_acks() {
    let app = TestApp::new();
    let handler = Arc::new(RetryOnce {
        calls: AtomicUsize::new(0),
    });
    let router = LaneRouter::new(
        app.queue.clone(),
        Duration::from_millis(20),
        Duration::from_secs(60),
    )
    .with_lane(LaneKind::DictionaryBuild, 0, handler.clone());
    assert_eq!(router.lanes(), vec![(LaneKind::DictionaryBuild, 1)]);
    // Each router claims under its own holder id.
    assert_ne!(
        router.holder(),
        engine::lane_router(&app.state, None).holder()
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(router.run(cancel.clone()));
    enqueue(&app, LaneKind::DictionaryBuild, 77, 1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !app.queue.pending(LaneKind::DictionaryBuild).await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "item never acked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn attack_lane_is_pinned_to_one_worker() {
    let app = TestApp::with_env(&[("ATTACK_CONCURRENCY", "3".to_string())]);
    let router = engine::lane_router(&app.state, None);
    assert_eq!(
        router.lanes(),
        vec![(LaneKind::Attack, 1), (LaneKind::CaptureProcessing, 2)]
    );
}
