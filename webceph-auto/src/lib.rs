//! Automation engine for moving a patient from the DentWeb chart view into
//! WebCeph and bringing the analysis back.
//!
//! The engine resolves UI targets through ordered fallback strategies
//! ([`Locator`]), brings the source desktop window into a usable state
//! ([`WindowAcquirer`]), runs the workflow as an ordered, resumable list of
//! stages ([`PipelineRun`]) and keeps data-store writes that could not be
//! delivered in a durable [`OfflineQueue`].
//!
//! All calls are synchronous. Host a run on a dedicated worker thread and
//! observe it through [`PipelineRun::subscribe`].

pub mod config;
pub mod errors;
pub mod locator;
pub mod pipeline;
pub mod platforms;
pub mod queue;
pub mod record;
pub mod selector;
pub mod surface;
pub mod sync;
#[cfg(test)]
mod tests;
pub mod wait;
pub mod window;
pub mod workflow;

pub use config::{AppConfig, Credentials};
pub use errors::AutomationError;
pub use locator::{Located, Locator, LocatorStrategy, Requirement, TargetKind, TargetSource};
pub use pipeline::{
    EventSink, LogLevel, PipelineEvent, PipelineRun, PipelineStage, StageContext, StageSnapshot,
    StageStatus,
};
pub use platforms::{create_window_system, Rect, WindowCommand, WindowHandle, WindowSystem};
pub use queue::{OfflineQueue, QueueItem, ReplaySummary};
pub use record::{Gender, PatientRecord};
pub use selector::Selector;
pub use surface::{DocumentSurface, RemoteElements, WebDriverSurface};
pub use sync::{
    AirtableStore, BackupSummary, DailyStatistics, RemoteStore, RetryPolicy, SyncAction,
    SyncOperation, SyncService,
};
pub use wait::{Clock, ManualClock, PollSpec, RunControl, SystemClock};
pub use window::{
    ActivatedWindow, ActivationPolicy, CandidateTarget, PatternTier, PatternTiers, WindowAcquirer,
};
pub use workflow::{ImageAsset, ImageKind, SourceWindow, WorkflowDriver, WorkflowState};
