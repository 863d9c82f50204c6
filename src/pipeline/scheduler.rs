use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::deferred::DeferredQueue;
use crate::ai::{AlertEvaluator, ModelClient};
use crate::capture::{CaptureOutcome, CaptureRequest};
use crate::config::SchedulerConfig;
use crate::events::{EventSink, PipelineEvent};
use crate::history::{AnalysisResult, HistoryStore, SessionLog};
use crate::state::{CyclePhase, PipelineState};

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Timeout,
    Cancelled,
    Refused(String),
    NoImage(String),
    EmptyImage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Stopped, paused or selecting a region.
    NotStarted,
    Skipped(SkipReason),
    Analyzed { text: String, alert: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Capture host is gone")]
    CaptureHostGone,

    #[error("Analysis cycle panicked: {0}")]
    Panicked(String),
}

/// The background loop: capture, analyze, record, evaluate the alert, sleep.
pub struct AnalysisScheduler {
    pub(super) state: Arc<PipelineState>,
    pub(super) captures: mpsc::UnboundedSender<CaptureRequest>,
    pub(super) client: Arc<ModelClient>,
    pub(super) history: Arc<HistoryStore>,
    pub(super) session: Arc<SessionLog>,
    pub(super) events: Arc<dyn EventSink>,
    pub(super) deferred: DeferredQueue,
    pub(super) config: SchedulerConfig,
    pub(super) cancel: CancellationToken,
}

impl AnalysisScheduler {
    pub async fn run(self) {
        log::info!(
            "[SCHEDULER] Started (interval {}ms, capture timeout {}ms)",
            self.config.interval_ms,
            self.config.capture_timeout_ms
        );

        loop {
            if self.cancel.is_cancelled() || !self.state.is_running() {
                break;
            }

            match self.cycle().await {
                Ok(CycleOutcome::Skipped(reason)) => {
                    log::warn!("[SCHEDULER] Cycle skipped: {:?}", reason)
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("[SCHEDULER] {}", e);
                    self.events.emit(PipelineEvent::error(e.to_string()));
                }
            }

            let drained = self.deferred.drain();
            if drained > 0 {
                log::debug!("[SCHEDULER] Ran {} deferred callbacks", drained);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }

        self.state.set_phase(CyclePhase::Idle);
        log::info!("[SCHEDULER] Stopped");
    }

    /// One guarded cycle. Panics inside become `CycleError::Panicked` and the
    /// phase always returns to `Idle`.
    pub async fn cycle(&self) -> Result<CycleOutcome, CycleError> {
        let result = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
        self.state.set_phase(CyclePhase::Idle);
        match result {
            Ok(outcome) => outcome,
            Err(panic) => Err(CycleError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        if !self.state.can_start_cycle() {
            return Ok(CycleOutcome::NotStarted);
        }
        let snapshot = self.state.snapshot();
        let start = Instant::now();

        self.state.set_phase(CyclePhase::AwaitingCapture);
        let (request, reply) = CaptureRequest::new();
        self.captures
            .send(request)
            .map_err(|_| CycleError::CaptureHostGone)?;

        let captured = match self.await_capture(reply).await {
            Ok(CaptureOutcome::Captured(c)) if c.has_content => c,
            Ok(CaptureOutcome::Captured(_)) => return Ok(CycleOutcome::Skipped(SkipReason::EmptyImage)),
            Ok(CaptureOutcome::NoImage(e)) => return Ok(CycleOutcome::Skipped(SkipReason::NoImage(e))),
            Ok(CaptureOutcome::Refused(r)) => return Ok(CycleOutcome::Skipped(SkipReason::Refused(r))),
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };

        self.state.set_phase(CyclePhase::Analyzing);
        let text = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Skipped(SkipReason::Cancelled)),
            text = self.client.analyze(Some(&captured.image), &snapshot.system_prompt) => text,
        };

        self.record(&text, &snapshot.system_prompt).await;
        self.events.emit(PipelineEvent::AnalysisComplete { text: text.clone() });

        let alert = match snapshot.alert {
            Some(condition) => {
                let evaluator = AlertEvaluator::new(&self.client);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    hit = evaluator.check(Some(&captured.image), &text, &condition, self.events.as_ref()) => hit,
                }
            }
            None => false,
        };

        log::info!(
            "[SCHEDULER] Cycle done in {}ms (alert: {})",
            start.elapsed().as_millis(),
            alert
        );
        Ok(CycleOutcome::Analyzed { text, alert })
    }

    /// Bounded wait for the capture reply; shutdown wakes it early.
    async fn await_capture(
        &self,
        reply: oneshot::Receiver<CaptureOutcome>,
    ) -> Result<CaptureOutcome, SkipReason> {
        let timeout = self.config.capture_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SkipReason::Cancelled),
            res = tokio::time::timeout(timeout, reply) => match res {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Err(SkipReason::NoImage("capture request dropped".to_string())),
                Err(_) => {
                    log::warn!("[SCHEDULER] Timeout waiting for valid screenshot");
                    Err(SkipReason::Timeout)
                }
            },
        }
    }

    async fn record(&self, text: &str, prompt: &str) {
        self.session.push(AnalysisResult {
            timestamp: chrono::Utc::now(),
            prompt_text: prompt.to_string(),
            result_text: text.to_string(),
        });

        let history = Arc::clone(&self.history);
        let (text, prompt) = (text.to_string(), prompt.to_string());
        let saved = tokio::task::spawn_blocking(move || history.add(&text, &prompt)).await;

        let err = match saved {
            Ok(Ok(entry)) => {
                log::debug!("[HISTORY] Saved entry {} at {}", entry.id, entry.timestamp);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        log::error!("[HISTORY] Failed to save analysis: {}", err);
        self.events
            .emit(PipelineEvent::error(format!("Failed to save analysis: {}", err)));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
