//! Termination signals during a running job.
//!
//! Lives in its own test binary: the job installs process-wide SIGTERM
//! handling, and the test signals its own process.

mod common;

use std::path::Path;
use std::time::Duration;

use autoseg_core::{JobError, JobPhase};
use common::Fixture;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Records its pid, comes up, and then never produces output.
const STALLED_WORKER: &str = r#"
echo $$ > "$PID_FILE"
echo "ready" > "$PROGRESS_LOG"
echo "loading models"
exec sleep 60
"#;

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn sigterm_stops_worker_and_removes_scratch() {
    let mut fixture = Fixture::new(STALLED_WORKER, 2);
    let pid_file = fixture.path("worker.pid");
    fixture
        .config
        .worker
        .env
        .insert("PID_FILE".to_string(), pid_file.display().to_string());
    fixture.config.waits.output_timeout = Duration::from_secs(600);
    fixture.config.waits.job_timeout = Duration::from_secs(600);

    // Signal only once the input is staged, so the job is parked in its
    // output wait with scratch state on disk.
    let staged = fixture.config.paths.watch_dir.join("slice_001.dcm");
    let sender = tokio::spawn(async move {
        wait_for(&staged).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        kill(Pid::this(), Signal::SIGTERM).unwrap();
    });

    let started = std::time::Instant::now();
    let report = fixture.run().await;
    sender.await.unwrap();

    assert_eq!(report.exit_code, 143);
    assert_eq!(report.phase, JobPhase::WaitOutput);
    assert!(matches!(
        report.result,
        Err(JobError::Interrupted { signal: 15 })
    ));
    assert!(started.elapsed() < Duration::from_secs(30));

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        kill(Pid::from_raw(pid), None).is_err(),
        "worker {pid} survived the signal"
    );

    assert!(!fixture.archive().exists());
    assert!(
        !fixture
            .config
            .paths
            .download_dir
            .join(common::UPLOAD_ID)
            .exists()
    );
}
