//! Tests for engine process supervision, using `/bin/sh` scripts in place
//! of the real engine.

mod common;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::{write_script, TestApp};
use crackq_api::engine::supervisor::{ProgressSink, RunOutcome, Supervisor, SupervisorError};
use crackq_core::engine_output::StatusSample;
use crackq_db::models::status::JobStatus;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect {
    samples: Mutex<Vec<StatusSample>>,
}

#[async_trait]
impl ProgressSink for Collect {
    async fn sample(&self, sample: StatusSample) {
        self.samples.lock().await.push(sample);
    }
}

fn supervisor(app: &TestApp, program: PathBuf) -> Supervisor {
    let mut engine = app.state.config.engine.clone();
    engine.engine_bin = program;
    Supervisor::new(app.state.store.clone(), &engine)
}

// ---------------------------------------------------------------------------
// Test: status blocks on stdout become samples
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_blocks_are_parsed() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    let script = write_script(
        app.root.path(),
        "engine.sh",
        r#"printf 'Status...........: Running\nProgress.........: 10/100 (10.00%%)\nSpeed.#1.........:   412.3 kH/s (52.43ms)\n\n'
printf 'Status...........: Running\nProgress.........: 50/100 (50.00%%)\nRecovered........: 0/1 (0.00%%) Digests\n\n'
printf 'Status...........: Exhausted\nProgress.........: 100/100 (100.00%%)'
"#,
    );

    let sink = Collect::default();
    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Exited { code: Some(0), .. });
    let samples = sink.samples.lock().await;
    let percentages: Vec<Option<f64>> = samples.iter().map(|s| s.percentage).collect();
    assert_eq!(percentages, vec![Some(10.0), Some(50.0), Some(100.0)]);
    assert!(samples[0].throughput.is_some());
    assert_eq!(samples[1].recovered, Some(0));
    assert_eq!(samples[2].stage.as_deref(), Some("Exhausted"));
}

// ---------------------------------------------------------------------------
// Test: arguments are passed as a vector, untouched by a shell
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arguments_are_passed_verbatim() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    let seen = app.root.path().join("args.txt");
    let script = write_script(
        app.root.path(),
        "engine.sh",
        &format!("for a in \"$@\"; do echo \"$a\" >> '{}'; done\n", seen.display()),
    );

    let args: Vec<OsString> = vec!["-m".into(), "22000".into(), "name with $(spaces); rm".into()];
    supervisor(&app, script)
        .run(job.id, args, &Collect::default(), &CancellationToken::new())
        .await
        .unwrap();

    let recorded = std::fs::read_to_string(seen).unwrap();
    assert_eq!(
        recorded.lines().collect::<Vec<_>>(),
        vec!["-m", "22000", "name with $(spaces); rm"]
    );
}

// ---------------------------------------------------------------------------
// Test: exit code and stderr tail are reported
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nonzero_exit_reports_stderr_tail() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    let script = write_script(
        app.root.path(),
        "engine.sh",
        "echo 'No hashes loaded.' >&2\nexit 255\n",
    );

    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Exited {
            code: Some(255),
            stderr_tail: "No hashes loaded.".to_string(),
        }
    );
}

#[tokio::test]
async fn stderr_tail_is_bounded() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    let script = write_script(
        app.root.path(),
        "engine.sh",
        "i=0\nwhile [ $i -lt 500 ]; do echo \"line $i of noisy diagnostics\" >&2; i=$((i+1)); done\nexit 1\n",
    );

    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &CancellationToken::new())
        .await
        .unwrap();

    let RunOutcome::Exited { stderr_tail, .. } = outcome else {
        panic!("expected exit");
    };
    assert!(stderr_tail.len() <= crackq_api::engine::supervisor::STDERR_TAIL_BYTES);
    assert!(stderr_tail.ends_with("line 499 of noisy diagnostics"));
}

// ---------------------------------------------------------------------------
// Test: cancellation and shutdown terminate the process
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_job_terminates_engine() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    app.store
        .force_job_status(job.id, JobStatus::Running)
        .await
        .unwrap();
    let script = write_script(app.root.path(), "engine.sh", "exec sleep 30\n");

    let store = app.store.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        store
            .force_job_status(job_id, JobStatus::Cancelled)
            .await
            .unwrap();
    });

    let started = tokio::time::Instant::now();
    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    // Poll interval is 100ms in tests; SIGTERM ends `sleep` at once.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn shutdown_terminates_engine() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    app.store
        .force_job_status(job.id, JobStatus::Running)
        .await
        .unwrap();
    let script = write_script(app.root.path(), "engine.sh", "exec sleep 30\n");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Shutdown);
}

#[tokio::test]
async fn engine_ignoring_sigterm_is_killed() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    app.store
        .force_job_status(job.id, JobStatus::Running)
        .await
        .unwrap();
    let script = write_script(
        app.root.path(),
        "engine.sh",
        "trap '' TERM\nwhile true; do sleep 1; done\n",
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Shutdown);
    // Grace period is 1s in tests.
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ---------------------------------------------------------------------------
// Test: nothing is spawned once the job is already cancelled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_before_spawn_never_starts_engine() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    // Admitted, then cancelled before the supervisor got to spawn.
    app.store
        .force_job_status(job.id, JobStatus::Running)
        .await
        .unwrap();
    app.store
        .force_job_status(job.id, JobStatus::Cancelled)
        .await
        .unwrap();
    let spawned = app.root.path().join("spawned");
    let script = write_script(
        app.root.path(),
        "engine.sh",
        &format!("touch '{}'
exec sleep 30
", spawned.display()),
    );

    let started = tokio::time::Instant::now();
    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!spawned.exists());
}

#[tokio::test]
async fn shutdown_before_spawn_never_starts_engine() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    app.store
        .force_job_status(job.id, JobStatus::Running)
        .await
        .unwrap();
    let spawned = app.root.path().join("spawned");
    let script = write_script(
        app.root.path(),
        "engine.sh",
        &format!("touch '{}'
exec sleep 30
", spawned.display()),
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let outcome = supervisor(&app, script)
        .run(job.id, vec![], &Collect::default(), &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Shutdown);
    assert!(!spawned.exists());
}

// ---------------------------------------------------------------------------
// Test: a missing binary is a spawn error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_binary_fails_to_spawn() {
    let app = TestApp::new();
    let job = app.seed_job(1, vec![], None).await;
    let missing = app.root.path().join("no-such-engine");

    let result = supervisor(&app, missing)
        .run(job.id, vec![], &Collect::default(), &CancellationToken::new())
        .await;
    assert_matches!(result, Err(SupervisorError::Spawn(_)));
}
