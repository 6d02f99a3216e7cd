//! Ordered, resumable stage execution with per-stage status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::errors::AutomationError;
use crate::wait::{Clock, RunControl, SystemClock};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        id: String,
        label: String,
    },
    StatusChanged {
        id: String,
        status: StageStatus,
        message: String,
    },
    StageCompleted {
        id: String,
        success: bool,
        message: String,
    },
    Progress {
        percent: u8,
    },
    Log {
        message: String,
        level: LogLevel,
    },
}

/// Broadcast sender that mirrors every event to `tracing`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventSink {
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::Log { message, level } => match level {
                LogLevel::Info | LogLevel::Success => info!("{}", message),
                LogLevel::Warning => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
            PipelineEvent::StatusChanged {
                id,
                status: StageStatus::Failed,
                message,
            } => error!(stage = %id, "Stage failed: {}", message),
            PipelineEvent::StatusChanged {
                id,
                status,
                message,
            } => info!(stage = %id, "Stage {}: {}", status, message),
            _ => {}
        }
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(PipelineEvent::Log {
            message: message.into(),
            level,
        });
    }
}

/// What a stage action sees while it runs.
pub struct StageContext<'a, C> {
    pub state: &'a mut C,
    stage_id: &'a str,
    events: &'a EventSink,
    control: &'a RunControl,
    clock: &'a dyn Clock,
}

impl<'a, C> StageContext<'a, C> {
    pub fn stage_id(&self) -> &str {
        self.stage_id
    }

    pub fn control(&self) -> &RunControl {
        self.control
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock
    }

    /// Honour pause and cancel requests inside long-running actions.
    pub fn checkpoint(&self) -> Result<(), AutomationError> {
        self.control.checkpoint(self.clock)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.events.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.events.log(LogLevel::Warning, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.events.log(LogLevel::Success, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.events.log(LogLevel::Error, message);
    }
}

pub type StageAction<C> =
    Box<dyn FnMut(&mut StageContext<'_, C>) -> Result<String, AutomationError> + Send>;

/// One named unit of the workflow.
pub struct PipelineStage<C> {
    id: String,
    display_name: String,
    status: StageStatus,
    action: StageAction<C>,
    retryable: bool,
    required: bool,
    last_message: Option<String>,
}

impl<C> PipelineStage<C> {
    pub fn new<F>(id: &str, display_name: &str, action: F) -> Self
    where
        F: FnMut(&mut StageContext<'_, C>) -> Result<String, AutomationError> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            status: StageStatus::Pending,
            action: Box::new(action),
            retryable: true,
            required: true,
            last_message: None,
        }
    }

    /// Later stages do not wait for this one, and its failure does not stop `run_all`.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Refuse operator re-runs once this stage has completed.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }
}

impl<C> fmt::Debug for PipelineStage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("status", &self.status)
            .field("retryable", &self.retryable)
            .field("required", &self.required)
            .finish()
    }
}

/// Serializable view of one stage, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub id: String,
    pub display_name: String,
    pub status: StageStatus,
    pub message: Option<String>,
}

/// A run of an ordered stage list over shared state `C`.
///
/// A stage may start only when every required stage before it is completed.
/// `rerun_stage` is the single exception and is meant for operator retries.
pub struct PipelineRun<C> {
    stages: Vec<PipelineStage<C>>,
    cursor: usize,
    state: C,
    events: EventSink,
    control: RunControl,
    clock: Arc<dyn Clock>,
    blocked: Option<String>,
    interrupted: bool,
}

impl<C> PipelineRun<C> {
    pub fn new(state: C) -> Self {
        Self::with_control(state, Arc::new(SystemClock), RunControl::new())
    }

    pub fn with_control(state: C, clock: Arc<dyn Clock>, control: RunControl) -> Self {
        Self {
            stages: Vec::new(),
            cursor: 0,
            state,
            events: EventSink::default(),
            control,
            clock,
            blocked: None,
            interrupted: false,
        }
    }

    pub fn add_stage(&mut self, stage: PipelineStage<C>) -> Result<(), AutomationError> {
        if self.stages.iter().any(|s| s.id == stage.id) {
            return Err(AutomationError::InvalidArgument(format!(
                "duplicate stage id '{}'",
                stage.id
            )));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn pause(&self) {
        self.control.pause();
        self.events.log(LogLevel::Info, "Pipeline paused");
    }

    pub fn resume(&self) {
        self.control.resume();
        self.events.log(LogLevel::Info, "Pipeline resumed");
    }

    pub fn cancel(&self) {
        self.control.cancel();
        self.events.log(LogLevel::Warning, "Pipeline cancellation requested");
    }

    pub fn state(&self) -> &C {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut C {
        &mut self.state
    }

    pub fn into_state(self) -> C {
        self.state
    }

    pub fn stages(&self) -> &[PipelineStage<C>] {
        &self.stages
    }

    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        self.stages
            .iter()
            .map(|s| StageSnapshot {
                id: s.id.clone(),
                display_name: s.display_name.clone(),
                status: s.status,
                message: s.last_message.clone(),
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.id == id).map(|s| s.status)
    }

    /// Index of the first stage that has not completed.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Completed stages as a percentage of all stages.
    pub fn progress(&self) -> u8 {
        if self.stages.is_empty() {
            return 0;
        }
        let completed = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count();
        ((completed * 100) / self.stages.len()) as u8
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked.as_deref()
    }

    /// Clear a fatal block after the operator fixed its cause.
    pub fn unblock(&mut self) {
        if let Some(reason) = self.blocked.take() {
            self.events
                .log(LogLevel::Info, format!("Pipeline unblocked (was: {reason})"));
        }
    }

    fn index_of(&self, id: &str) -> Result<usize, AutomationError> {
        self.stages
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| AutomationError::InvalidArgument(format!("unknown stage '{id}'")))
    }

    fn ensure_unblocked(&self) -> Result<(), AutomationError> {
        match &self.blocked {
            Some(reason) => Err(AutomationError::PipelineBlocked(reason.clone())),
            None => Ok(()),
        }
    }

    /// An operator call after a cancelled attempt starts with a fresh token.
    /// A cancel requested since then is left in place.
    fn clear_interruption(&mut self) {
        if std::mem::take(&mut self.interrupted) && self.control.reset() {
            self.events
                .log(LogLevel::Info, "Cancellation cleared for operator run");
        }
    }

    fn checkpoint(&mut self) -> Result<(), AutomationError> {
        let result = self.control.checkpoint(self.clock.as_ref());
        if result.is_err() {
            self.interrupted = true;
        }
        result
    }

    /// Run a pending stage, enforcing pipeline order.
    #[instrument(level = "debug", skip(self))]
    pub fn run_stage(&mut self, id: &str) -> Result<String, AutomationError> {
        self.ensure_unblocked()?;
        self.clear_interruption();
        self.run_pending(id)
    }

    fn run_pending(&mut self, id: &str) -> Result<String, AutomationError> {
        self.ensure_unblocked()?;
        let index = self.index_of(id)?;

        match self.stages[index].status {
            StageStatus::Pending => {}
            StageStatus::Completed | StageStatus::Failed => {
                return Err(AutomationError::InvalidArgument(format!(
                    "stage '{id}' already ran ({}); use rerun_stage to run it again",
                    self.stages[index].status
                )))
            }
            StageStatus::Running => {
                return Err(AutomationError::InvalidArgument(format!(
                    "stage '{id}' is already running"
                )))
            }
        }

        if let Some(blocking) = self.stages[..index]
            .iter()
            .find(|s| s.required && s.status != StageStatus::Completed)
        {
            let blocking = blocking.id.clone();
            self.events.log(
                LogLevel::Warning,
                format!("Stage '{id}' cannot start before '{blocking}' completes"),
            );
            return Err(AutomationError::OutOfOrderExecution {
                stage: id.to_string(),
                blocking,
            });
        }

        self.execute(index)
    }

    /// Run a single stage again regardless of the state of its predecessors.
    #[instrument(level = "debug", skip(self))]
    pub fn rerun_stage(&mut self, id: &str) -> Result<String, AutomationError> {
        self.ensure_unblocked()?;
        self.clear_interruption();
        self.rerun(id)
    }

    fn rerun(&mut self, id: &str) -> Result<String, AutomationError> {
        self.ensure_unblocked()?;
        let index = self.index_of(id)?;
        let status = self.stages[index].status;

        if status == StageStatus::Running {
            return Err(AutomationError::InvalidArgument(format!(
                "stage '{id}' is already running"
            )));
        }
        if status == StageStatus::Completed && !self.stages[index].retryable {
            return Err(AutomationError::InvalidArgument(format!(
                "stage '{id}' completed and cannot be re-run"
            )));
        }

        self.checkpoint()?;
        if status != StageStatus::Pending {
            self.stages[index].status = StageStatus::Pending;
            self.events.emit(PipelineEvent::StatusChanged {
                id: id.to_string(),
                status: StageStatus::Pending,
                message: "reset for manual re-run".to_string(),
            });
        }
        self.execute(index)
    }

    /// Run every stage that has not completed yet, in order.
    ///
    /// Stops at the first failing required stage; optional failures are logged.
    /// A stage that already failed is not retried here, see [`Self::rerun_stage`].
    pub fn run_all(&mut self) -> Result<(), AutomationError> {
        self.ensure_unblocked()?;
        self.clear_interruption();
        for index in 0..self.stages.len() {
            let stage = &self.stages[index];
            if stage.status == StageStatus::Completed {
                continue;
            }
            let id = stage.id.clone();
            let required = stage.required;
            match self.run_pending(&id) {
                Ok(_) => {}
                Err(e) if !required && !matches!(e, AutomationError::Cancelled(_)) => {
                    self.events.log(
                        LogLevel::Warning,
                        format!("Optional stage '{id}' failed, continuing: {e}"),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.events.log(LogLevel::Success, "All stages completed");
        Ok(())
    }

    /// Operator-directed run of `id` and every stage after it, bypassing the
    /// ordering guard for stages before `id`.
    pub fn run_from(&mut self, id: &str) -> Result<(), AutomationError> {
        let start = self.index_of(id)?;
        self.ensure_unblocked()?;
        self.clear_interruption();
        for index in start..self.stages.len() {
            let stage = &self.stages[index];
            let id = stage.id.clone();
            let required = stage.required;
            match self.rerun(&id) {
                Ok(_) => {}
                Err(e) if !required && !matches!(e, AutomationError::Cancelled(_)) => {
                    self.events.log(
                        LogLevel::Warning,
                        format!("Optional stage '{id}' failed, continuing: {e}"),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn execute(&mut self, index: usize) -> Result<String, AutomationError> {
        self.checkpoint()?;

        let stage = &mut self.stages[index];
        let id = stage.id.clone();
        stage.status = StageStatus::Running;
        self.events.emit(PipelineEvent::StageStarted {
            id: id.clone(),
            label: stage.display_name.clone(),
        });
        self.events.emit(PipelineEvent::StatusChanged {
            id: id.clone(),
            status: StageStatus::Running,
            message: format!("{} started", stage.display_name),
        });

        let result = {
            let mut ctx = StageContext {
                state: &mut self.state,
                stage_id: &id,
                events: &self.events,
                control: &self.control,
                clock: self.clock.as_ref(),
            };
            (stage.action)(&mut ctx)
        };

        let outcome = match result {
            Ok(message) => {
                stage.status = StageStatus::Completed;
                stage.last_message = Some(message.clone());
                self.events.emit(PipelineEvent::StatusChanged {
                    id: id.clone(),
                    status: StageStatus::Completed,
                    message: message.clone(),
                });
                self.events.emit(PipelineEvent::StageCompleted {
                    id: id.clone(),
                    success: true,
                    message: message.clone(),
                });
                Ok(message)
            }
            Err(e) => {
                let message = e.to_string();
                stage.status = StageStatus::Failed;
                stage.last_message = Some(message.clone());
                self.events.emit(PipelineEvent::StatusChanged {
                    id: id.clone(),
                    status: StageStatus::Failed,
                    message: message.clone(),
                });
                self.events.emit(PipelineEvent::StageCompleted {
                    id: id.clone(),
                    success: false,
                    message: message.clone(),
                });
                if e.is_fatal() {
                    self.events.log(
                        LogLevel::Error,
                        format!("Pipeline blocked until the operator fixes: {message}"),
                    );
                    self.blocked = Some(message);
                }
                match e {
                    AutomationError::Cancelled(reason) => {
                        self.interrupted = true;
                        Err(AutomationError::Cancelled(reason))
                    }
                    cause => Err(AutomationError::StageFailed {
                        stage: id.clone(),
                        cause: Box::new(cause),
                    }),
                }
            }
        };

        self.cursor = self
            .stages
            .iter()
            .position(|s| s.status != StageStatus::Completed)
            .unwrap_or(self.stages.len());
        self.events.emit(PipelineEvent::Progress {
            percent: self.progress(),
        });
        outcome
    }
}

impl<C> fmt::Debug for PipelineRun<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("stages", &self.stages)
            .field("cursor", &self.cursor)
            .field("blocked", &self.blocked)
            .finish()
    }
}
