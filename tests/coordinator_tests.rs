//! End-to-end tests for JobManager: a scripted transfer tool, a fake remote
//! and an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use transferd::coordinator::{JobManager, JobRequest, OpenMode};
use transferd::error::EngineError;
use transferd::models::{JobStatus, Operation};
use transferd::repositories::{JobRepository, TerminalFields};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    FakeRemote, engine_config, recorded_argv, recording_tool, setup_test_db, write_tool,
};

fn completed() -> TerminalFields {
    TerminalFields {
        status: JobStatus::Completed,
        progress: 100,
        status_text: String::new(),
        error_text: String::new(),
        exit_status: 0,
        log_text: None,
    }
}

async fn wait_until<F>(mut check: F) -> bool
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn startup_recovery_repairs_previous_run() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = JobRepository::new(db.clone());
    repo.create(1, Operation::Copy, "/a", "/b").await?;
    repo.mark_running(1).await?;
    repo.create(2, Operation::Sync, "/a", "/b").await?;
    repo.mark_running(2).await?;
    repo.finalize(2, JobStatus::Running, &completed()).await?;
    repo.create(3, Operation::Move, "/a", "/b").await?;
    let completed_at = repo.require(2).await?.finished_at;

    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(db, Arc::new(FakeRemote::new()), engine_config(&tool)).await?;

    assert_eq!(manager.startup_report().interrupted, vec![1]);
    assert_eq!(manager.startup_report().abandoned, vec![3]);

    let interrupted = manager.job_status(1).await?;
    assert_eq!(interrupted.job_status(), Some(JobStatus::Interrupted));
    assert!(interrupted.finished_at.is_some());

    let untouched = manager.job_status(2).await?;
    assert_eq!(untouched.job_status(), Some(JobStatus::Completed));
    assert_eq!(untouched.finished_at, completed_at);

    assert_eq!(
        manager.job_status(3).await?.job_status(),
        Some(JobStatus::Interrupted)
    );
    Ok(())
}

#[tokio::test]
async fn sync_job_runs_to_completion() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/data/", "remote:backup"))
        .await?;
    assert_eq!(job_id, 1);

    let job = manager.wait_for_terminal(job_id).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Completed));
    assert_eq!(job.progress, 100);
    assert_eq!(job.exit_status, 0);
    assert!(job.finished_at.is_some());
    assert!(job.status_text.contains("Transferred"));
    assert!(job.error_text.is_empty());

    assert_eq!(
        recorded_argv(&dir)?,
        "sync /data/ remote:backup --progress --stats 2s"
    );
    Ok(())
}

#[tokio::test]
async fn fast_exit_is_finalized_once() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = write_tool(&dir, "instant", "exit 0")?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("check", "/a", "/b"))
        .await?;
    assert!(wait_until(async || manager.supervisor().is_finished(job_id)).await);

    let (first, second) = tokio::join!(manager.job_status(job_id), manager.job_status(job_id));
    let (first, second) = (first?, second?);
    assert_eq!(first.job_status(), Some(JobStatus::Completed));
    assert_eq!(second.job_status(), Some(JobStatus::Completed));
    assert_eq!(first.finished_at, second.finished_at);

    assert!(
        !manager
            .repository()
            .finalize(job_id, JobStatus::Running, &completed())
            .await?,
        "a finished job cannot be finalized again"
    );
    Ok(())
}

#[tokio::test]
async fn failed_job_keeps_exit_status_and_errors() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 3)?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    let job = manager.wait_for_terminal(job_id).await?;

    assert_eq!(job.job_status(), Some(JobStatus::Failed));
    assert_eq!(job.exit_status, 3);
    assert!(job.error_text.contains("quota exceeded"));
    Ok(())
}

#[tokio::test]
async fn stop_cancels_running_job_idempotently() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = write_tool(&dir, "slow", "exec sleep 30")?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    assert_eq!(
        manager.job_status(job_id).await?.job_status(),
        Some(JobStatus::Running)
    );
    assert_eq!(manager.supervisor().get_running_jobs(), vec![job_id]);

    manager.stop_job(job_id).await?;
    manager.stop_job(job_id).await?;

    let job = manager.wait_for_terminal(job_id).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Cancelled));
    assert_eq!(job.exit_status, -1);

    manager.stop_job(job_id).await?;
    assert_eq!(
        manager.job_status(job_id).await?.job_status(),
        Some(JobStatus::Cancelled)
    );
    assert!(matches!(
        manager.stop_job(404).await,
        Err(EngineError::JobNotFound(404))
    ));
    Ok(())
}

#[tokio::test]
async fn rejections_create_no_job() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::timing_out()),
        engine_config(&tool),
    )
    .await?;

    let err = manager
        .start_job(JobRequest::new("rsync", "/a", "/b"))
        .await
        .expect_err("unknown operation");
    assert!(matches!(err, EngineError::InvalidOperation(ref op) if op == "rsync"));
    assert!(err.is_rejection());

    let err = manager
        .start_job(JobRequest::new("copy", "/a", "/b"))
        .await
        .expect_err("listing deadline exceeded");
    assert!(matches!(err, EngineError::Timeout { .. }));
    assert!(!err.is_rejection());

    assert!(manager.list_jobs(None, None, None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn launch_failure_marks_job_failed() -> Result<()> {
    let dir = TempDir::new()?;
    let missing = dir.path().join("no-such-tool");
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&missing),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    let job = manager.wait_for_terminal(job_id).await?;

    assert_eq!(job.job_status(), Some(JobStatus::Failed));
    assert_eq!(job.exit_status, -1);
    assert!(job.error_text.contains("failed to launch"));
    Ok(())
}

#[tokio::test]
async fn directory_copy_into_existing_directory_keeps_its_name() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let remote = Arc::new(
        FakeRemote::new()
            .with_dir("/src", "album")
            .with_dir("/", "dst"),
    );
    let manager = JobManager::open(setup_test_db().await?, remote.clone(), engine_config(&tool))
        .await?;

    let job_id = manager
        .start_job(JobRequest::new("copy", "/src/album", "/dst"))
        .await?;
    manager.wait_for_terminal(job_id).await?;

    assert_eq!(
        recorded_argv(&dir)?,
        "copy /src/album/ /dst/album/ --progress --stats 2s"
    );
    assert_eq!(remote.calls(), vec!["mkdir /dst/album"]);
    Ok(())
}

#[tokio::test]
async fn directory_rename_removes_source_after_success() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let remote = Arc::new(FakeRemote::new().with_dir("/data", "photos"));
    let manager = JobManager::open(setup_test_db().await?, remote.clone(), engine_config(&tool))
        .await?;

    let job_id = manager
        .start_job(JobRequest::new("move", "/data/photos", "/archive/photos-2024"))
        .await?;

    let job = manager.job_status(job_id).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Completed));
    assert_eq!(
        recorded_argv(&dir)?,
        "move /data/photos/ /archive/photos-2024/ --progress --stats 2s"
    );
    assert_eq!(
        remote.calls(),
        vec!["mkdir /archive/photos-2024", "rmdir /data/photos"]
    );
    Ok(())
}

#[tokio::test]
async fn directory_rename_keeps_source_after_failure() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 1)?;
    let remote = Arc::new(FakeRemote::new().with_dir("/data", "photos"));
    let manager = JobManager::open(setup_test_db().await?, remote.clone(), engine_config(&tool))
        .await?;

    let job_id = manager
        .start_job(JobRequest::new("move", "/data/photos", "/archive/photos-2024"))
        .await?;

    let job = manager.job_status(job_id).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Failed));
    assert_eq!(remote.calls(), vec!["mkdir /archive/photos-2024"]);
    Ok(())
}

#[tokio::test]
async fn resume_relaunches_as_copy_and_links_once() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = JobRepository::new(db.clone());
    repo.create(1, Operation::Move, "/src/report.pdf", "/dst/report.pdf")
        .await?;
    repo.mark_running(1).await?;

    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(db, Arc::new(FakeRemote::new()), engine_config(&tool)).await?;

    let resumed = manager.resume_job(1).await?;
    assert_eq!(resumed, 2);

    let original = manager.job_status(1).await?;
    assert_eq!(original.job_status(), Some(JobStatus::Interrupted));
    assert_eq!(original.resumed_by_job_id, Some(2));

    let job = manager.wait_for_terminal(resumed).await?;
    assert_eq!(job.operation, "copy");
    assert_eq!(job.job_status(), Some(JobStatus::Completed));
    assert_eq!(
        recorded_argv(&dir)?,
        "copyto /src/report.pdf /dst/report.pdf --progress --stats 2s"
    );

    assert!(matches!(
        manager.resume_job(1).await,
        Err(EngineError::NotResumable { job_id: 1, .. })
    ));
    assert!(matches!(
        manager.resume_job(2).await,
        Err(EngineError::NotResumable { job_id: 2, .. })
    ));
    assert!(matches!(
        manager.resume_job(9).await,
        Err(EngineError::JobNotFound(9))
    ));
    Ok(())
}

#[tokio::test]
async fn identifiers_continue_after_reopen() -> Result<()> {
    let db = setup_test_db().await?;
    JobRepository::new(db.clone())
        .create(41, Operation::Sync, "/a", "/b")
        .await?;

    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;

    let first = JobManager::open(db.clone(), Arc::new(FakeRemote::new()), engine_config(&tool))
        .await?;
    let job_id = first.start_job(JobRequest::new("sync", "/a", "/b")).await?;
    assert_eq!(job_id, 42);
    first.wait_for_terminal(job_id).await?;
    drop(first);

    let second = JobManager::open(db, Arc::new(FakeRemote::new()), engine_config(&tool)).await?;
    let job_id = second.start_job(JobRequest::new("sync", "/a", "/b")).await?;
    assert_eq!(job_id, 43);
    second.wait_for_terminal(job_id).await?;
    Ok(())
}

#[tokio::test]
async fn clear_keeps_running_jobs_and_their_identifiers() -> Result<()> {
    let dir = TempDir::new()?;
    let slow = write_tool(&dir, "slow", "exec sleep 30")?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&slow),
    )
    .await?;

    manager.repository().create(1, Operation::Sync, "/a", "/b").await?;
    manager.repository().interrupt(1, JobStatus::Pending).await?;

    let running = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    assert_eq!(running, 2);

    assert_eq!(manager.clear_stopped_jobs().await?, vec![1]);
    assert_eq!(
        manager.job_status(running).await?.job_status(),
        Some(JobStatus::Running)
    );

    let next = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    assert_eq!(next, 3);

    for job_id in [running, next] {
        manager.stop_job(job_id).await?;
        manager.wait_for_terminal(job_id).await?;
    }
    Ok(())
}

#[tokio::test]
async fn clear_restarts_counter_when_store_is_empty() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    for _ in 0..2 {
        let job_id = manager
            .start_job(JobRequest::new("sync", "/a", "/b"))
            .await?;
        manager.wait_for_terminal(job_id).await?;
    }

    let mut removed = manager.clear_stopped_jobs().await?;
    removed.sort_unstable();
    assert_eq!(removed, vec![1, 2]);
    assert!(!manager.supervisor().is_tracked(1));

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    assert_eq!(job_id, 1);
    manager.wait_for_terminal(job_id).await?;
    Ok(())
}

#[tokio::test]
async fn delete_removes_job_everywhere() -> Result<()> {
    let dir = TempDir::new()?;
    let slow = write_tool(&dir, "slow", "exec sleep 30")?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&slow),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    manager.delete_job(job_id).await?;

    assert!(!manager.supervisor().is_tracked(job_id));
    assert!(matches!(
        manager.job_status(job_id).await,
        Err(EngineError::JobNotFound(_))
    ));
    assert!(matches!(
        manager.delete_job(job_id).await,
        Err(EngineError::JobNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unsupervised_running_row_is_interrupted() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine_config(&tool),
    )
    .await?;

    manager.repository().create(9, Operation::Copy, "/a", "/b").await?;
    manager.repository().mark_running(9).await?;

    let job = manager.job_status(9).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Interrupted));
    assert!(job.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn reconciler_finalizes_without_caller_polls() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let manager = Arc::new(
        JobManager::open(
            setup_test_db().await?,
            Arc::new(FakeRemote::new()),
            engine_config(&tool),
        )
        .await?,
    );

    let shutdown = CancellationToken::new();
    let reconciler = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;

    let finalized = wait_until(async || {
        manager
            .repository()
            .get(job_id)
            .await
            .ok()
            .flatten()
            .is_some_and(|job| job.job_status() == Some(JobStatus::Completed))
    })
    .await;
    assert!(finalized, "reconciler should persist the terminal status");

    shutdown.cancel();
    reconciler.await?;
    Ok(())
}

#[tokio::test]
async fn log_sidecar_is_merged_and_removed() -> Result<()> {
    let dir = TempDir::new()?;
    let logs = TempDir::new()?;
    let tool = write_tool(
        &dir,
        "logging",
        r#"LOG=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--log-file" ]; then LOG="$2"; fi
  shift
done
echo "2025/01/02 10:00:00 INFO  : a.txt: Copied (new)" >> "$LOG"
echo "2025/01/02 10:00:01 ERROR : b.txt: Failed to copy: quota exceeded" >> "$LOG"
exit 1"#,
    )?;
    let mut engine = engine_config(&tool);
    engine.log_dir = Some(logs.path().to_path_buf());
    let manager = JobManager::open(
        setup_test_db().await?,
        Arc::new(FakeRemote::new()),
        engine.clone(),
    )
    .await?;

    let job_id = manager
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;
    let job = manager.wait_for_terminal(job_id).await?;

    assert_eq!(job.job_status(), Some(JobStatus::Failed));
    let log_text = job.log_text.unwrap_or_default();
    assert!(log_text.contains("Copied (new)"));
    assert!(job.error_text.contains("quota exceeded"));
    assert!(!job.error_text.contains("Copied"));

    let sidecar = engine.log_sidecar(job_id).expect("log dir configured");
    assert!(!sidecar.exists());
    Ok(())
}

#[tokio::test]
async fn file_onto_existing_file_is_overwritten_in_place() -> Result<()> {
    let dir = TempDir::new()?;
    let tool = recording_tool(&dir, 0)?;
    let remote = Arc::new(
        FakeRemote::new()
            .with_file("/src", "report.pdf")
            .with_file("/dst", "report.pdf"),
    );
    let manager = JobManager::open(setup_test_db().await?, remote.clone(), engine_config(&tool))
        .await?;

    let job_id = manager
        .start_job(JobRequest::new("copy", "/src/report.pdf", "/dst/report.pdf"))
        .await?;
    let job = manager.wait_for_terminal(job_id).await?;

    assert_eq!(job.job_status(), Some(JobStatus::Completed));
    assert_eq!(
        recorded_argv(&dir)?,
        "copyto /src/report.pdf /dst/report.pdf --progress --stats 2s"
    );
    assert!(remote.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn readers_leave_jobs_of_another_manager_alone() -> Result<()> {
    let db = setup_test_db().await?;
    let dir = TempDir::new()?;
    let slow = write_tool(&dir, "slow", "exec sleep 30")?;

    let runner = JobManager::open(db.clone(), Arc::new(FakeRemote::new()), engine_config(&slow))
        .await?;
    let other_runner =
        JobManager::open(db.clone(), Arc::new(FakeRemote::new()), engine_config(&slow)).await?;

    let job_id = runner
        .start_job(JobRequest::new("sync", "/a", "/b"))
        .await?;

    let reader = JobManager::attach(db, Arc::new(FakeRemote::new()), engine_config(&slow)).await?;
    assert_eq!(reader.mode(), OpenMode::Observer);
    assert!(reader.startup_report().interrupted.is_empty());

    let listed = reader.list_jobs(None, None, None).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].job_status(), Some(JobStatus::Running));
    assert_eq!(
        reader.job_status(job_id).await?.job_status(),
        Some(JobStatus::Running)
    );

    other_runner.reconcile_running().await?;
    assert_eq!(
        other_runner.list_jobs(None, None, None).await?[0].job_status(),
        Some(JobStatus::Running)
    );

    runner.stop_job(job_id).await?;
    let job = runner.wait_for_terminal(job_id).await?;
    assert_eq!(job.job_status(), Some(JobStatus::Cancelled));
    assert_eq!(
        reader.job_status(job_id).await?.job_status(),
        Some(JobStatus::Cancelled)
    );
    Ok(())
}

#[tokio::test]
async fn stop_while_waiting_on_rename_keeps_source() -> Result<()> {
    let dir = TempDir::new()?;
    let slow = write_tool(&dir, "slow", "exec sleep 30")?;
    let remote = Arc::new(FakeRemote::new().with_dir("/data", "photos"));
    let manager = JobManager::open(setup_test_db().await?, remote.clone(), engine_config(&slow))
        .await?;

    let stopper = async {
        let launched =
            wait_until(async || !manager.supervisor().get_running_jobs().is_empty()).await;
        assert!(launched, "transfer should be supervised while start_job waits");
        manager.stop_all()
    };
    let (started, stopped) = tokio::join!(
        manager.start_job(JobRequest::new("move", "/data/photos", "/archive/photos-2024")),
        stopper
    );
    let job_id = started?;

    assert_eq!(stopped, vec![job_id]);
    assert_eq!(
        manager.job_status(job_id).await?.job_status(),
        Some(JobStatus::Cancelled)
    );
    assert_eq!(remote.calls(), vec!["mkdir /archive/photos-2024"]);
    Ok(())
}
