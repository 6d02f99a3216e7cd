use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use webceph_auto::wait::poll_until;
use webceph_auto::{
    AutomationError, PipelineEvent, PipelineRun, PipelineStage, PollSpec, RunControl, StageContext,
    StageStatus, SystemClock,
};

type Ctx<'a> = StageContext<'a, Vec<String>>;

fn stage(id: &'static str) -> PipelineStage<Vec<String>> {
    PipelineStage::new(id, id, move |ctx: &mut Ctx<'_>| {
        ctx.checkpoint()?;
        ctx.state.push(id.to_string());
        Ok(format!("{id} ok"))
    })
}

fn run(control: RunControl) -> Result<PipelineRun<Vec<String>>, AutomationError> {
    let mut run = PipelineRun::with_control(Vec::new(), Arc::new(SystemClock), control);
    for id in ["capture", "upload", "report"] {
        run.add_stage(stage(id))?;
    }
    Ok(run)
}

/// A run hosted on a blocking worker reports its lifecycle to an async listener
#[tokio::test]
async fn test_worker_thread_run_reports_events() -> Result<(), AutomationError> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut pipeline = run(RunControl::new())?;
    let mut events = pipeline.subscribe();
    let listener = tokio::spawn(async move {
        let mut completed = Vec::new();
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StageCompleted { id, success, .. } => completed.push((id, success)),
                PipelineEvent::Progress { percent: 100 } => break,
                _ => {}
            }
        }
        completed
    });

    let pipeline = tokio::task::spawn_blocking(move || {
        pipeline.run_all()?;
        Ok::<_, AutomationError>(pipeline)
    })
    .await
    .expect("worker panicked")?;

    let completed = listener.await.expect("listener panicked");
    assert_eq!(
        completed,
        vec![
            ("capture".to_string(), true),
            ("upload".to_string(), true),
            ("report".to_string(), true)
        ]
    );
    assert_eq!(pipeline.state(), &vec!["capture", "upload", "report"]);
    Ok(())
}

/// Pausing holds the worker at its next checkpoint until resumed
#[tokio::test]
async fn test_pause_holds_worker_until_resume() -> Result<(), AutomationError> {
    let control = RunControl::new();
    control.pause();
    let mut pipeline = run(control.clone())?;

    let worker = tokio::task::spawn_blocking(move || {
        pipeline.run_all()?;
        Ok::<_, AutomationError>(pipeline)
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!worker.is_finished());

    control.resume();
    let pipeline = worker.await.expect("worker panicked")?;
    assert_eq!(pipeline.progress(), 100);
    Ok(())
}

/// Cancelling from the controlling task ends a long poll inside a stage
#[tokio::test]
async fn test_cancel_interrupts_polling_stage() -> Result<(), AutomationError> {
    let control = RunControl::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();

    let mut pipeline =
        PipelineRun::with_control(Vec::<String>::new(), Arc::new(SystemClock), control.clone());
    let wait = PipelineStage::new("wait_analysis", "Wait", move |ctx: &mut Ctx<'_>| {
        poll_until(
            ctx.clock(),
            ctx.control(),
            PollSpec::new(Duration::from_secs(30), Duration::from_millis(20)),
            "analysis completion",
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None::<()>)
            },
        )?;
        Ok("done".into())
    });
    pipeline.add_stage(wait)?;
    pipeline.add_stage(stage("report"))?;

    let worker = tokio::task::spawn_blocking(move || {
        let outcome = pipeline.run_all();
        (pipeline, outcome)
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    control.cancel();
    let (pipeline, outcome) = worker.await.expect("worker panicked");

    assert!(matches!(outcome, Err(AutomationError::Cancelled(_))));
    assert!(polls.load(Ordering::SeqCst) >= 1);
    assert_eq!(pipeline.status("wait_analysis"), Some(StageStatus::Failed));
    assert_eq!(pipeline.status("report"), Some(StageStatus::Pending));
    Ok(())
}

/// A failed stage keeps its successor waiting until an operator re-run succeeds
#[test]
fn test_failed_stage_gates_successor() -> Result<(), AutomationError> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut pipeline = PipelineRun::with_control(
        Vec::<String>::new(),
        Arc::new(webceph_auto::ManualClock::new()),
        RunControl::new(),
    );
    pipeline.add_stage(stage("sign_in"))?;
    let upload = PipelineStage::new("upload_images", "Upload", move |ctx: &mut Ctx<'_>| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(AutomationError::PlatformError("upload input detached".into()));
        }
        ctx.state.push("upload_images".into());
        Ok("uploaded".into())
    });
    pipeline.add_stage(upload)?;
    pipeline.add_stage(stage("start_analysis"))?;

    pipeline.run_stage("sign_in")?;
    assert!(pipeline.run_stage("upload_images").is_err());
    match pipeline.run_stage("start_analysis") {
        Err(AutomationError::OutOfOrderExecution { stage, blocking }) => {
            assert_eq!(stage, "start_analysis");
            assert_eq!(blocking, "upload_images");
        }
        other => panic!("expected OutOfOrderExecution, got {other:?}"),
    }

    pipeline.rerun_stage("upload_images")?;
    pipeline.run_stage("start_analysis")?;
    assert_eq!(
        pipeline.state(),
        &vec!["sign_in", "upload_images", "start_analysis"]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    Ok(())
}

/// After an interrupted run the operator can re-run the cancelled stage and
/// continue without rebuilding the pipeline
#[tokio::test]
async fn test_rerun_after_cancel_resumes_pipeline() -> Result<(), AutomationError> {
    let control = RunControl::new();
    let release = Arc::new(AtomicUsize::new(0));
    let gate = release.clone();

    let mut pipeline =
        PipelineRun::with_control(Vec::<String>::new(), Arc::new(SystemClock), control.clone());
    pipeline.add_stage(stage("upload_images"))?;
    let wait = PipelineStage::new("wait_analysis", "Wait", move |ctx: &mut Ctx<'_>| {
        poll_until(
            ctx.clock(),
            ctx.control(),
            PollSpec::new(Duration::from_secs(30), Duration::from_millis(20)),
            "analysis completion",
            || Ok((gate.load(Ordering::SeqCst) > 0).then_some(())),
        )?;
        ctx.state.push("wait_analysis".into());
        Ok("analysis finished".into())
    });
    pipeline.add_stage(wait)?;
    pipeline.add_stage(stage("download_report"))?;

    let worker = tokio::task::spawn_blocking(move || {
        let outcome = pipeline.run_all();
        (pipeline, outcome)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    control.cancel();
    let (mut pipeline, outcome) = worker.await.expect("worker panicked");
    assert!(matches!(outcome, Err(AutomationError::Cancelled(_))));
    assert_eq!(pipeline.status("wait_analysis"), Some(StageStatus::Failed));

    release.store(1, Ordering::SeqCst);
    let pipeline = tokio::task::spawn_blocking(move || {
        pipeline.run_from("wait_analysis")?;
        Ok::<_, AutomationError>(pipeline)
    })
    .await
    .expect("worker panicked")?;

    assert!(!control.is_cancelled());
    assert_eq!(pipeline.progress(), 100);
    assert_eq!(
        pipeline.state(),
        &vec!["upload_images", "wait_analysis", "download_report"]
    );
    Ok(())
}
