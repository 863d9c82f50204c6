use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Everything the pipeline reports to whoever presents it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    AnalysisComplete { text: String },
    AlertTriggered { condition: String, analysis: String },
    Error { message: String },
    CaptureCompleted { valid: bool },
    Status { message: String },
}

impl PipelineEvent {
    pub fn error(message: impl Into<String>) -> Self {
        PipelineEvent::Error {
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        PipelineEvent::Status {
            message: message.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

impl EventSink for UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        if self.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}

/// Writes events to the log only. Used when nothing is listening.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Error { message } => log::error!("{}", message),
            other => log::info!("{:?}", other),
        }
    }
}
