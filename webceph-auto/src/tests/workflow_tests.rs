use chrono::{Local, NaiveDate};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{window, FakeStore, FakeSurface, FakeWindowSystem};
use crate::config::AppConfig;
use crate::errors::AutomationError;
use crate::pipeline::{LogLevel, PipelineEvent, PipelineRun, StageStatus};
use crate::platforms::Rect;
use crate::queue::OfflineQueue;
use crate::record::{Gender, PatientRecord};
use crate::selector::Selector;
use crate::sync::{SyncAction, SyncService};
use crate::wait::ManualClock;
use crate::workflow::strategies::{self, Strategies};
use crate::workflow::{
    DetectionMethod, ImageAsset, ImageKind, WorkflowDriver, WorkflowState, STAGE_IDS,
};

fn first(strategies: Strategies) -> Selector {
    strategies[0].matcher.clone()
}

fn patient() -> PatientRecord {
    let mut record = PatientRecord::new(
        "홍길동",
        NaiveDate::from_ymd_opt(1990, 1, 2).unwrap(),
        "20431",
    );
    record.gender = Some(Gender::Male);
    record
}

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.remote.username = "doctor@example.com".into();
    config.remote.password = "s3cret".into();
    config.paths.report_folder = dir.join("reports");
    config.paths.cache_folder = dir.join("cache");
    config
}

struct Harness {
    surface: Arc<FakeSurface>,
    clock: Arc<ManualClock>,
    run: PipelineRun<WorkflowState>,
}

fn harness(config: AppConfig, surface: FakeSurface, sync: Option<SyncService>) -> Harness {
    let surface = Arc::new(surface);
    let clock = Arc::new(ManualClock::new());
    let driver = WorkflowDriver::new(config, surface.clone(), sync).with_clock(clock.clone());
    let state = WorkflowState::new(
        patient(),
        vec![
            ImageAsset::new("ceph.png", ImageKind::Xray),
            ImageAsset::new("face.jpg", ImageKind::Face),
        ],
    );
    let run = driver.build_pipeline(state).unwrap();
    Harness {
        surface,
        clock,
        run,
    }
}

#[test]
fn catalogue_is_built_in_workflow_order() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(config(dir.path()), FakeSurface::new(), None);

    let ids: Vec<&str> = h.run.stages().iter().map(|s| s.id()).collect();
    assert_eq!(ids, STAGE_IDS);
    let register = &h.run.stages()[1];
    assert!(!register.is_retryable());
    let sync = &h.run.stages()[8];
    assert!(!sync.is_required());
}

#[test]
fn missing_credentials_block_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.remote.password.clear();
    let mut h = harness(config, FakeSurface::new(), None);

    let err = h.run.run_stage("sign_in").unwrap_err();
    assert!(err.is_fatal());
    assert!(h.run.is_blocked());
    assert!(h.surface.actions().is_empty());
}

#[test]
fn sign_in_fills_credentials_and_waits_for_dashboard() {
    super::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    let link = surface.add(first(strategies::login_link()), "로그인");
    let email = surface.add(first(strategies::email_field()), "");
    let password = surface.add(first(strategies::password_field()), "");
    let button = surface.add(first(strategies::login_button()), "");
    surface.reveal_on_click(&button, first(strategies::login_success()), "");
    let mut h = harness(config(dir.path()), surface, None);

    let message = h.run.run_stage("sign_in").unwrap();
    assert!(message.contains("doctor@example.com"));
    assert!(h.surface.was_clicked(&link));
    assert_eq!(h.surface.value(&email).as_deref(), Some("doctor@example.com"));
    assert_eq!(h.surface.value(&password).as_deref(), Some("s3cret"));
    assert_eq!(
        h.surface.actions().first().map(String::as_str),
        Some("navigate https://www.webceph.com")
    );
}

#[test]
fn sign_in_without_confirmation_fails_the_stage_only() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    surface.add(first(strategies::email_field()), "");
    surface.add(first(strategies::password_field()), "");
    surface.add(first(strategies::login_button()), "");
    let mut h = harness(config(dir.path()), surface, None);

    match h.run.run_stage("sign_in").unwrap_err() {
        AutomationError::StageFailed { stage, cause } => {
            assert_eq!(stage, "sign_in");
            assert!(matches!(*cause, AutomationError::LocatorNotFound { .. }));
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert!(!h.run.is_blocked());
    assert_eq!(h.run.status("sign_in"), Some(StageStatus::Failed));
}

fn registration_form(surface: &FakeSurface) {
    surface.add(first(strategies::new_patient_button()), "+ 신규 환자");
    surface.add(first(strategies::patient_id_field()), "");
    surface.add(first(strategies::first_name_field()), "");
    surface.add(first(strategies::last_name_field()), "");
    surface.add(first(strategies::race_select()), "");
    surface.add(first(strategies::race_asian_option()), "Asian");
    surface.add(first(strategies::gender_select()), "");
    surface.add(first(strategies::gender_option(Gender::Male)), "남자");
    surface.add(first(strategies::birth_date_field()), "");
    surface.add(first(strategies::agreement_checkbox()), "");
    surface.add(first(strategies::create_patient_button()), "만들기");
}

#[test]
fn register_patient_survives_data_store_outage() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    registration_form(&surface);
    let queue = Arc::new(OfflineQueue::in_dir(dir.path().join("cache")));
    let sync = SyncService::new(Arc::new(FakeStore::always_failing()), queue.clone());
    let mut h = harness(config(dir.path()), surface, Some(sync));
    let mut events = h.run.subscribe();

    h.run.rerun_stage("register_patient").unwrap();

    let typed: Vec<String> = h
        .surface
        .actions()
        .into_iter()
        .filter(|a| a.starts_with("type "))
        .map(|a| a.splitn(3, ' ').nth(2).unwrap_or_default().to_string())
        .collect();
    assert_eq!(typed, vec!["20431", "길동", "홍", "1990-01-02"]);

    assert_eq!(h.run.state().sync_errors.len(), 1);
    assert!(h.run.state().store_record_id.is_none());
    let queued = queue.items().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action_type, "create_patient");
    assert_eq!(queued[0].payload["fields"]["registration_number"], "20431");

    let warned = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
        matches!(e, PipelineEvent::Log { ref message, .. } if message.contains("not synced"))
    });
    assert!(warned);
}

#[test]
fn register_patient_keeps_store_record_id() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    registration_form(&surface);
    let store = Arc::new(FakeStore::healthy());
    let sync = SyncService::new(
        store.clone(),
        Arc::new(OfflineQueue::in_dir(dir.path().join("cache"))),
    );
    let mut h = harness(config(dir.path()), surface, Some(sync));

    h.run.rerun_stage("register_patient").unwrap();
    assert_eq!(h.run.state().store_record_id.as_deref(), Some("rec1"));
    assert_eq!(store.calls()[0].payload["fields"]["total_images"], 2);
}

#[test]
fn select_patient_prefers_chart_number_search() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    let search = surface.add(first(strategies::patient_search_input()), "");
    surface.add(strategies::patient_rows()[0].clone(), "11111 이영희");
    let row = surface.add(strategies::patient_rows()[0].clone(), "20431 홍길동 1990-01-02");
    let mut h = harness(config(dir.path()), surface, None);

    h.run.rerun_stage("select_patient").unwrap();

    let detection = h.run.state().detection.clone().unwrap();
    assert_eq!(detection.method, DetectionMethod::ExactSearch);
    assert!(h.surface.was_clicked(&row));
    assert_eq!(h.surface.value(&search).as_deref(), Some("20431"));
    assert!(h
        .surface
        .actions()
        .contains(&"navigate https://www.webceph.com/dashboard".to_string()));
}

#[test]
fn select_patient_scores_rows_when_search_and_first_row_miss() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    surface.add(first(strategies::first_patient_row()), "99999 이영희");
    surface.add(strategies::patient_rows()[0].clone(), "99999 이영희");
    let row = surface.add(strategies::patient_rows()[0].clone(), "홍 길동 | 1990-01-02");
    let mut h = harness(config(dir.path()), surface, None);
    h.run.state_mut().patient.first_name = Some("길동".into());
    h.run.state_mut().patient.last_name = Some("홍".into());

    h.run.rerun_stage("select_patient").unwrap();

    assert_eq!(
        h.run.state().detection.as_ref().map(|d| d.method),
        Some(DetectionMethod::Scored)
    );
    assert!(h.surface.was_clicked(&row));
}

#[test]
fn select_patient_never_clicks_an_unrelated_row() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    let newest = surface.add(first(strategies::first_patient_row()), "99999 이영희");
    surface.add(strategies::patient_rows()[0].clone(), "99999 이영희");
    let mut h = harness(config(dir.path()), surface, None);

    let err = h.run.rerun_stage("select_patient").unwrap_err();
    assert!(matches!(err, AutomationError::StageFailed { .. }));
    assert!(!h.surface.was_clicked(&newest));
    assert!(h.run.state().detection.is_none());
}

#[test]
fn create_record_falls_back_to_memo_without_title_field() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    surface.add(first(strategies::new_record_button()), "새 레코드");
    let memo = surface.add(first(strategies::record_memo_field()), "");
    let confirm = surface.add(first(strategies::confirm_record_button()), "생성");
    surface.reveal_on_click(&confirm, first(strategies::record_ready()), "");
    let mut h = harness(config(dir.path()), surface, None);

    let message = h.run.rerun_stage("create_record").unwrap();
    let today = Local::now().format("%Y-%m-%d").to_string();
    assert!(message.contains(&format!("홍길동 - 초진 ({today})")));
    assert_eq!(
        h.surface.value(&memo),
        Some(format!("환자: 홍길동\n날짜: {today}\n타입: 초진"))
    );
}

#[test]
fn start_analysis_marks_state() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    let analyze = surface.add(first(strategies::analyze_button()), "분석");
    surface.reveal_on_click(&analyze, first(strategies::analysis_started()), "");
    let mut h = harness(config(dir.path()), surface, None);
    let mut events = h.run.subscribe();

    h.run.rerun_stage("start_analysis").unwrap();
    assert!(h.run.state().analysis_started);
    let warned = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
        matches!(
            e,
            PipelineEvent::Log {
                level: LogLevel::Warning,
                ..
            }
        )
    });
    assert!(!warned);
}

#[test]
fn upload_attaches_each_image_to_its_input() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    let xray = surface.add(first(strategies::upload_input("xray")), "");
    let photo = surface.add(first(strategies::upload_input("photo")), "");
    surface.add(first(strategies::upload_confirmation()), "");
    let mut h = harness(config(dir.path()), surface, None);

    let message = h.run.rerun_stage("upload_images").unwrap();
    assert_eq!(message, "Uploaded 2 image(s)");
    let attached: Vec<String> = h
        .surface
        .actions()
        .into_iter()
        .filter(|a| a.starts_with("attach "))
        .collect();
    assert_eq!(
        attached,
        vec![
            format!("attach {} ceph.png", xray.0),
            format!("attach {} face.jpg", photo.0)
        ]
    );
}

#[test]
fn wait_analysis_accepts_download_button_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    // The second download strategy is not also a completion indicator
    surface.add(strategies::download_button()[1].matcher.clone(), "PDF");
    let mut h = harness(config(dir.path()), surface, None);

    h.run.rerun_stage("wait_analysis").unwrap();
    assert!(h.run.state().analysis_complete);
    assert_eq!(h.clock.elapsed(), Duration::from_secs(2));
}

#[test]
fn wait_analysis_gives_up_after_the_bounded_wait() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.automation.max_analysis_minutes = 1;
    let surface = FakeSurface::new();
    surface.add(first(strategies::progress_indicator()), "Processing");
    let mut h = harness(config, surface, None);

    match h.run.rerun_stage("wait_analysis").unwrap_err() {
        AutomationError::StageFailed { cause, .. } => {
            assert!(matches!(*cause, AutomationError::Timeout(_)))
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert_eq!(h.clock.elapsed(), Duration::from_secs(60));
    assert!(!h.run.state().analysis_complete);
}

#[test]
fn wait_analysis_grace_period_stays_inside_the_bounded_wait() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.automation.max_analysis_minutes = 1;
    config.automation.poll_interval_secs = 15;
    let mut h = harness(config, FakeSurface::new(), None);

    match h.run.rerun_stage("wait_analysis").unwrap_err() {
        AutomationError::StageFailed { cause, .. } => {
            assert!(matches!(*cause, AutomationError::Timeout(_)))
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert_eq!(h.clock.elapsed(), Duration::from_secs(60));
}

#[test]
fn download_renames_the_new_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let reports = config.paths.report_folder.clone();
    std::fs::create_dir_all(&reports).unwrap();
    std::fs::write(reports.join("older.pdf"), b"%PDF-old").unwrap();

    let surface = FakeSurface::new();
    let button = surface.add(first(strategies::download_button()), "Download");
    let target = reports.clone();
    surface.on_click(
        &button,
        Box::new(move || std::fs::write(target.join("report (1).pdf"), b"%PDF-new").unwrap()),
    );
    let mut h = harness(config, surface, None);

    h.run.rerun_stage("download_report").unwrap();

    let expected = reports.join(format!(
        "홍길동_20431_{}.pdf",
        Local::now().format("%Y%m%d")
    ));
    assert_eq!(h.run.state().report_path.as_ref(), Some(&expected));
    assert_eq!(std::fs::read(&expected).unwrap(), b"%PDF-new");
    assert!(reports.join("older.pdf").exists());
    assert!(!reports.join("report (1).pdf").exists());
}

#[test]
fn download_falls_back_to_newest_existing_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let reports = config.paths.report_folder.clone();
    std::fs::create_dir_all(&reports).unwrap();
    std::fs::write(reports.join("earlier.pdf"), b"%PDF").unwrap();

    let surface = FakeSurface::new();
    surface.add(first(strategies::download_button()), "Download");
    let mut h = harness(config, surface, None);

    h.run.rerun_stage("download_report").unwrap();
    assert!(!reports.join("earlier.pdf").exists());
    assert!(h.run.state().report_path.as_ref().unwrap().exists());
}

#[test]
fn download_without_any_report_fails() {
    let dir = tempfile::tempdir().unwrap();
    let surface = FakeSurface::new();
    surface.add(first(strategies::download_button()), "Download");
    let mut h = harness(config(dir.path()), surface, None);

    assert!(h.run.rerun_stage("download_report").is_err());
    assert_eq!(h.run.status("download_report"), Some(StageStatus::Failed));
    assert!(h.run.state().report_path.is_none());
}

#[test]
fn sync_results_replays_backlog_then_updates_record() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(OfflineQueue::in_dir(dir.path().join("cache")));
    queue
        .enqueue("create_patient", json!({"fields": {"patient_name": "earlier"}}))
        .unwrap();
    let store = Arc::new(FakeStore::healthy());
    let sync = SyncService::new(store.clone(), queue.clone());
    let mut h = harness(config(dir.path()), FakeSurface::new(), Some(sync));
    h.run.state_mut().store_record_id = Some("recA".into());

    h.run.rerun_stage("sync_results").unwrap();

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].payload["fields"]["patient_name"], "earlier");
    assert_eq!(calls[1].action, SyncAction::UpdateResult);
    assert_eq!(calls[1].payload["record_id"], "recA");
    assert_eq!(calls[1].payload["fields"]["status"], "COMPLETED");
    assert!(queue.is_empty().unwrap());
}

#[test]
fn sync_results_without_record_creates_a_full_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::healthy());
    let sync = SyncService::new(
        store.clone(),
        Arc::new(OfflineQueue::in_dir(dir.path().join("cache"))),
    );
    let mut h = harness(config(dir.path()), FakeSurface::new(), Some(sync));

    h.run.rerun_stage("sync_results").unwrap();
    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, SyncAction::CreatePatient);
    assert_eq!(calls[0].payload["fields"]["registration_number"], "20431");
    assert_eq!(calls[0].payload["fields"]["status"], "COMPLETED");
    assert_eq!(h.run.state().store_record_id.as_deref(), Some("rec1"));
}

#[test]
fn sync_results_is_skipped_without_data_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(config(dir.path()), FakeSurface::new(), None);
    let message = h.run.rerun_stage("sync_results").unwrap();
    assert!(message.contains("skipped"));
}

#[test]
fn source_window_capture_region_follows_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let driver = WorkflowDriver::new(config(dir.path()), Arc::new(FakeSurface::new()), None)
        .with_clock(Arc::new(ManualClock::new()));
    let system = Arc::new(FakeWindowSystem::new(vec![
        window(1, "카카오톡", Rect::new(0, 0, 400, 700)),
        window(
            2,
            "▶ 덴트웹 - Chart No. 20431 이름 홍길동",
            Rect::new(-8, -8, 1936, 1056),
        ),
    ]));

    let source = driver.acquire_source_window(system).unwrap();
    assert_eq!(source.window.title, "▶ 덴트웹 - Chart No. 20431 이름 홍길동");
    assert_eq!(source.capture_region, Rect::new(0, 0, 670, 470));
}
