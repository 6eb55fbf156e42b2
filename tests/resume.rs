use ripd::config::AppConfig;
use ripd::context::AppContext;
use ripd::core::{
    Capability, DriveRegistry, Job, JobError, JobRunner, JobStatus, NewJob, Orchestrator, PlanError, PlannedStep,
    PlannerRegistry, ResumeSnapshot, RunnerContext, RunnerOptions, StepPlanner, find_resumable,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

const DRIVE: &str = "/dev/sr0";

fn sh(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Three steps that each append their name to `markers`. The last one fails
/// while `fail_flag` exists.
fn marker_plan(markers: PathBuf, fail_flag: PathBuf) -> Arc<dyn StepPlanner> {
    Arc::new(move |_: &Job| -> Result<Vec<PlannedStep>, PlanError> {
        let m = markers.display().to_string();
        let f = fail_flag.display().to_string();
        Ok(vec![
            PlannedStep::new(sh(format!("echo rip >> '{m}'")), "Rip").release_drive_after(),
            PlannedStep::new(sh(format!("echo encode >> '{m}'")), "Encode"),
            PlannedStep::new(
                sh(format!("[ -f '{f}' ] && exit 1; echo move >> '{m}'")),
                "Move",
            ),
        ])
    })
}

fn runner_context(planners: PlannerRegistry) -> RunnerContext {
    let drives = DriveRegistry::new();
    drives.register(DRIVE, "Test Drive", [Capability::Cd]);
    RunnerContext {
        drives,
        planners: Arc::new(planners),
        options: RunnerOptions {
            eject_on_release: false,
            kill_grace: Duration::from_millis(500),
            progress_half_way_lines: 10,
        },
        output: None,
    }
}

fn new_job(temp_root: &Path, id: &str) -> Arc<Job> {
    Arc::new(Job::new(NewJob {
        id: id.to_string(),
        disc_type: "cd_rom".to_string(),
        disc_label: "DATA".to_string(),
        source_drive: DRIVE.to_string(),
        temp_path: temp_root.join(id),
        output_path: temp_root.join("out").join("DATA"),
        log_capacity: 15,
    }))
}

#[tokio::test]
async fn resumed_job_skips_completed_steps() {
    let temp = tempdir().unwrap();
    let markers = temp.path().join("markers");
    let fail_flag = temp.path().join("fail");
    std::fs::write(&fail_flag, "").unwrap();

    let planners = PlannerRegistry::new().with("cd_rom", marker_plan(markers.clone(), fail_flag.clone()));
    let ctx = runner_context(planners);

    let job = new_job(temp.path(), "resume-1");
    JobRunner::new(job.clone(), ctx.clone()).run().await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);

    let path = ResumeSnapshot::path_in(job.temp_path());
    let snapshot = ResumeSnapshot::load_resumable(&path, "resume-1").await.unwrap();
    assert_eq!(snapshot.completed_steps(), 2);

    std::fs::remove_file(&fail_flag).unwrap();

    let resumed = Arc::new(Job::from_snapshot(snapshot, 15));
    assert_eq!(resumed.status(), JobStatus::Queued);
    assert_eq!(resumed.current_step(), 2);
    assert_eq!(resumed.progress(), 67);

    JobRunner::new(resumed.clone(), ctx).run().await.unwrap();

    assert_eq!(resumed.status(), JobStatus::Finished);
    assert_eq!(resumed.progress(), 100);
    assert_eq!(std::fs::read_to_string(&markers).unwrap(), "rip\nencode\nmove\n");
    assert!(!path.exists());
}

#[tokio::test]
async fn resume_with_changed_plan_fails() {
    let temp = tempdir().unwrap();
    let markers = temp.path().join("markers");
    let fail_flag = temp.path().join("fail");
    std::fs::write(&fail_flag, "").unwrap();

    let ctx = runner_context(PlannerRegistry::new().with("cd_rom", marker_plan(markers, fail_flag)));
    let job = new_job(temp.path(), "resume-2");
    JobRunner::new(job.clone(), ctx).run().await.unwrap();

    let snapshot = ResumeSnapshot::load_resumable(&ResumeSnapshot::path_in(job.temp_path()), "resume-2")
        .await
        .unwrap();

    let different = PlannerRegistry::new().with(
        "cd_rom",
        Arc::new(|_: &Job| -> Result<Vec<PlannedStep>, PlanError> {
            Ok(vec![PlannedStep::new(vec!["true".to_string()], "Something else")])
        }) as Arc<dyn StepPlanner>,
    );
    let resumed = Arc::new(Job::from_snapshot(snapshot, 15));
    JobRunner::new(resumed.clone(), runner_context(different)).run().await.unwrap();

    assert_eq!(resumed.status(), JobStatus::Failed);
    assert!(resumed.log_lines().last().unwrap().contains("does not match"));
}

#[tokio::test]
async fn snapshot_without_completed_steps_is_not_resumable() {
    let temp = tempdir().unwrap();
    let ctx = runner_context(PlannerRegistry::new().with(
        "cd_rom",
        Arc::new(|_: &Job| -> Result<Vec<PlannedStep>, PlanError> {
            Ok(vec![PlannedStep::new(vec!["false".to_string()], "Rip")])
        }) as Arc<dyn StepPlanner>,
    ));

    let job = new_job(temp.path(), "resume-3");
    JobRunner::new(job.clone(), ctx).run().await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);

    let err = ResumeSnapshot::load_resumable(&ResumeSnapshot::path_in(job.temp_path()), "resume-3")
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NotResumable { .. }));
    assert!(find_resumable(temp.path()).await.is_empty());
}

fn orchestrator_for(temp_root: &Path, planners: PlannerRegistry) -> Orchestrator {
    let config = AppConfig {
        temp_directory: temp_root.to_path_buf(),
        output_directory: temp_root.join("out"),
        eject_on_release: false,
        kill_grace_secs: 1,
        ..AppConfig::default()
    };
    Orchestrator::new(AppContext::with_planners(config, planners))
}

#[tokio::test]
async fn orchestrator_resumes_by_id_and_rejects_active_jobs() {
    let temp = tempdir().unwrap();
    let markers = temp.path().join("markers");
    let fail_flag = temp.path().join("fail");
    std::fs::write(&fail_flag, "").unwrap();

    let orchestrator = orchestrator_for(
        temp.path(),
        PlannerRegistry::new().with("cd_rom", marker_plan(markers.clone(), fail_flag.clone())),
    );
    let ctx = orchestrator.context();
    ctx.drives.register(DRIVE, "Test Drive", [Capability::Cd]);

    let job = orchestrator.start_job(DRIVE, "cd_rom", "DATA").await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !job.status().is_terminal() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(job.status(), JobStatus::Failed);

    let listed = orchestrator.list_resumable().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].job_id, job.id());

    std::fs::remove_file(&fail_flag).unwrap();
    let resumed = orchestrator.resume_job(job.id()).await.unwrap();
    // Only the last step is left and it does not need the disc.
    assert!(resumed.held_drive().is_none());

    timeout(Duration::from_secs(5), async {
        while !resumed.status().is_terminal() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(resumed.status(), JobStatus::Finished);
    assert_eq!(std::fs::read_to_string(&markers).unwrap(), "rip\nencode\nmove\n");

    let again = orchestrator.resume_job(job.id()).await.unwrap_err();
    assert!(matches!(again, JobError::NotResumable { .. }));

    let missing = orchestrator.resume_job("no-such-job").await.unwrap_err();
    assert!(matches!(missing, JobError::NotResumable { .. }));
}

#[tokio::test]
async fn concurrent_resumes_run_the_job_once() {
    let temp = tempdir().unwrap();
    let markers = temp.path().join("markers");
    let fail_flag = temp.path().join("fail");
    std::fs::write(&fail_flag, "").unwrap();

    let orchestrator = orchestrator_for(
        temp.path(),
        PlannerRegistry::new().with("cd_rom", marker_plan(markers.clone(), fail_flag.clone())),
    );
    orchestrator.context().drives.register(DRIVE, "Test Drive", [Capability::Cd]);

    let job = orchestrator.start_job(DRIVE, "cd_rom", "DATA").await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !job.status().is_terminal() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    std::fs::remove_file(&fail_flag).unwrap();

    let (first, second) = tokio::join!(orchestrator.resume_job(job.id()), orchestrator.resume_job(job.id()));

    let (resumed, rejected) = match (first, second) {
        (Ok(job), Err(e)) | (Err(e), Ok(job)) => (job, e),
        (first, second) => panic!("expected exactly one resume, got {:?} and {:?}", first.is_ok(), second.is_ok()),
    };
    assert!(matches!(rejected, JobError::AlreadyActive(id) if id == job.id()));

    timeout(Duration::from_secs(5), async {
        while !resumed.status().is_terminal() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(resumed.status(), JobStatus::Finished);
    assert_eq!(std::fs::read_to_string(&markers).unwrap(), "rip\nencode\nmove\n");
}
