//! Pipeline controller: owns the scheduler task and the UI-side mutators.

pub mod deferred;
pub mod scheduler;

pub use deferred::DeferredQueue;
pub use scheduler::{AnalysisScheduler, CycleError, CycleOutcome, SkipReason};

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ai::ModelClient;
use crate::capture::{CaptureCoordinator, CaptureHost};
use crate::config::SchedulerConfig;
use crate::events::{EventSink, PipelineEvent};
use crate::history::{HistoryStore, SessionLog};
use crate::state::PipelineState;

pub struct Pipeline {
    state: Arc<PipelineState>,
    events: Arc<dyn EventSink>,
    session: Arc<SessionLog>,
    deferred: DeferredQueue,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the scheduler on the current tokio runtime and returns the
    /// controller plus the capture host, which the caller must drive from
    /// the display-owning thread.
    pub fn start(
        state: Arc<PipelineState>,
        client: Arc<ModelClient>,
        history: Arc<HistoryStore>,
        events: Arc<dyn EventSink>,
        coordinator: CaptureCoordinator,
        config: SchedulerConfig,
    ) -> (Self, CaptureHost) {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let session = Arc::new(SessionLog::new());
        let deferred = DeferredQueue::new();

        state.set_running(true);

        let scheduler = AnalysisScheduler {
            state: Arc::clone(&state),
            captures: capture_tx,
            client,
            history,
            session: Arc::clone(&session),
            events: Arc::clone(&events),
            deferred: deferred.clone(),
            config,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(scheduler.run());

        let pipeline = Self {
            state,
            events,
            session,
            deferred,
            cancel,
            handle: Some(handle),
        };
        (pipeline, CaptureHost::new(capture_rx, coordinator))
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    pub fn session(&self) -> &Arc<SessionLog> {
        &self.session
    }

    pub fn toggle_pause(&self) -> bool {
        let paused = self.state.toggle_paused();
        let status = if paused { "paused" } else { "resumed" };
        self.events
            .emit(PipelineEvent::status(format!("Capture and analysis {}", status)));
        paused
    }

    pub fn toggle_hide_during_capture(&self) -> bool {
        let hide = !self.state.hide_during_capture();
        self.state.set_hide_during_capture(hide);
        let status = if hide { "hidden" } else { "visible" };
        self.events.emit(PipelineEvent::status(format!(
            "Overlay will be {} during screenshots",
            status
        )));
        hide
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        self.state.set_system_prompt(prompt);
        self.events
            .emit(PipelineEvent::status(format!("System prompt updated to: {}", prompt)));
    }

    pub fn set_alert(&self, condition: &str) {
        self.state.set_alert(condition);
        if condition.trim().is_empty() {
            self.events.emit(PipelineEvent::status("Alert cleared"));
        } else {
            self.events.emit(PipelineEvent::status(format!(
                "Alert set for condition: {}",
                condition
            )));
        }
    }

    pub fn clear_alert(&self) {
        self.state.clear_alert();
        self.events.emit(PipelineEvent::status("Alert condition cleared"));
    }

    /// Runs `f` on the scheduler task at the end of the current cycle.
    pub fn queue_function<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(f);
    }

    /// Saves this run's results as plain text and reports the outcome as a
    /// status or error event.
    pub fn save_results(&self, path: &Path) {
        match self.session.save_text(path) {
            Ok(msg) => self.events.emit(PipelineEvent::status(msg)),
            Err(e) => {
                log::error!("{}", e);
                self.events.emit(PipelineEvent::error(e));
            }
        }
    }

    /// Stops the loop, wakes any pending wait, and joins the worker. No
    /// history write happens after this returns.
    pub async fn stop(&mut self) -> Result<()> {
        self.state.set_running(false);
        self.cancel.cancel();

        let Some(handle) = self.handle.take() else {
            bail!("pipeline already stopped");
        };
        handle.await.context("scheduler task failed to join")?;
        log::info!("[SCHEDULER] Joined");
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.state.set_running(false);
            self.cancel.cancel();
        }
    }
}
