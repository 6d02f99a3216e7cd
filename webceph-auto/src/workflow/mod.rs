//! The concrete WebCeph workflow: stage catalogue, driver and shared state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::errors::AutomationError;
use crate::locator::Locator;
use crate::pipeline::{PipelineRun, PipelineStage, StageContext};
use crate::platforms::{Rect, WindowSystem};
use crate::record::PatientRecord;
use crate::surface::DocumentSurface;
use crate::sync::SyncService;
use crate::wait::{Clock, RunControl, SystemClock};
use crate::window::{ActivatedWindow, WindowAcquirer};

pub mod detect;
mod stages;
pub mod strategies;

pub use detect::{match_score, Detection, DetectionMethod, PatientDetector};

/// Stage ids in execution order.
pub const STAGE_IDS: [&str; 9] = [
    "sign_in",
    "register_patient",
    "select_patient",
    "create_record",
    "upload_images",
    "start_analysis",
    "wait_analysis",
    "download_report",
    "sync_results",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Xray,
    Face,
}

impl ImageKind {
    /// Fragment of the upload input's `name` attribute for this kind.
    pub fn input_name(&self) -> &'static str {
        match self {
            ImageKind::Xray => "xray",
            ImageKind::Face => "photo",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Xray => write!(f, "x-ray"),
            ImageKind::Face => write!(f, "face photo"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub path: PathBuf,
    pub kind: ImageKind,
}

impl ImageAsset {
    pub fn new(path: impl Into<PathBuf>, kind: ImageKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Everything the stages read and produce during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub patient: PatientRecord,
    pub images: Vec<ImageAsset>,
    pub detection: Option<Detection>,
    pub analysis_started: bool,
    pub analysis_complete: bool,
    pub report_path: Option<PathBuf>,
    /// Record id the data store assigned to this patient's row
    pub store_record_id: Option<String>,
    pub sync_errors: Vec<String>,
}

impl WorkflowState {
    pub fn new(patient: PatientRecord, images: Vec<ImageAsset>) -> Self {
        Self {
            patient,
            images,
            detection: None,
            analysis_started: false,
            analysis_complete: false,
            report_path: None,
            store_record_id: None,
            sync_errors: Vec::new(),
        }
    }
}

/// Activated desktop window plus the region downstream capture should read.
#[derive(Debug, Clone)]
pub struct SourceWindow {
    pub window: ActivatedWindow,
    pub capture_region: Rect,
}

/// Dependencies shared by every stage closure of one pipeline.
pub(crate) struct StageEnv {
    pub config: AppConfig,
    pub surface: Arc<dyn DocumentSurface>,
    pub sync: Option<SyncService>,
    pub locator: Locator,
}

type StageFn = fn(&StageEnv, &mut StageContext<'_, WorkflowState>) -> Result<String, AutomationError>;

/// Builds the WebCeph pipeline and runs the desktop-side window acquisition.
pub struct WorkflowDriver {
    config: AppConfig,
    surface: Arc<dyn DocumentSurface>,
    sync: Option<SyncService>,
    clock: Arc<dyn Clock>,
    control: RunControl,
}

impl WorkflowDriver {
    pub fn new(
        config: AppConfig,
        surface: Arc<dyn DocumentSurface>,
        sync: Option<SyncService>,
    ) -> Self {
        Self {
            config,
            surface,
            sync,
            clock: Arc::new(SystemClock),
            control: RunControl::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Locator sharing this driver's clock, run control and per-strategy timeout.
    pub fn locator(&self) -> Locator {
        Locator::new(self.clock.clone(), self.control.clone())
            .set_default_timeout(self.config.automation.strategy_timeout())
    }

    /// Wire the stage catalogue into a run over `state`.
    pub fn build_pipeline(
        &self,
        state: WorkflowState,
    ) -> Result<PipelineRun<WorkflowState>, AutomationError> {
        let env = Arc::new(StageEnv {
            config: self.config.clone(),
            surface: self.surface.clone(),
            sync: self.sync.clone(),
            locator: self.locator(),
        });

        let catalogue: [(&str, &str, StageFn); 9] = [
            (STAGE_IDS[0], "Sign in", stages::sign_in),
            (STAGE_IDS[1], "Register patient", stages::register_patient),
            (STAGE_IDS[2], "Select patient", stages::select_patient),
            (STAGE_IDS[3], "Create record", stages::create_record),
            (STAGE_IDS[4], "Upload images", stages::upload_images),
            (STAGE_IDS[5], "Start analysis", stages::start_analysis),
            (STAGE_IDS[6], "Wait for analysis", stages::wait_analysis),
            (STAGE_IDS[7], "Download report", stages::download_report),
            (STAGE_IDS[8], "Sync results", stages::sync_results),
        ];

        let mut run =
            PipelineRun::with_control(state, self.clock.clone(), self.control.clone());
        for (id, label, action) in catalogue {
            let env = env.clone();
            let mut stage = PipelineStage::new(id, label, move |ctx| action(&env, ctx));
            match id {
                // A second registration would duplicate the remote patient
                "register_patient" => stage = stage.non_retryable(),
                "sync_results" => stage = stage.optional(),
                _ => {}
            }
            run.add_stage(stage)?;
        }
        info!("Built workflow pipeline with {} stages", run.stages().len());
        Ok(run)
    }

    /// Find the desktop chart window, bring it to a usable state and work out
    /// the region to capture from it.
    pub fn acquire_source_window(
        &self,
        system: Arc<dyn WindowSystem>,
    ) -> Result<SourceWindow, AutomationError> {
        let acquirer = WindowAcquirer::new(system, self.locator())
            .with_policy(self.config.source_window.activation);
        let window = acquirer.find_and_activate(&self.config.source_window.patterns)?;
        let capture_region = window.capture_region(acquirer.screen_size());
        info!(
            "Source window {} ready, capture region {}",
            window.handle, capture_region
        );
        Ok(SourceWindow {
            window,
            capture_region,
        })
    }
}
