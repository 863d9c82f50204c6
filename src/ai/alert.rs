use image::DynamicImage;

use super::kobold::ModelClient;
use crate::events::{EventSink, PipelineEvent};

pub fn build_alert_prompt(condition: &str, analysis: &str) -> String {
    format!(
        "Based on the image and the following analysis, determine if the condition '{}' is met. \
         Respond with only 'Yes' or 'No'.\n\nImage analysis: {}",
        condition, analysis
    )
}

/// Only an exact "yes" (ignoring case and surrounding whitespace) counts.
pub fn is_affirmative(response: &str) -> bool {
    response.trim().to_lowercase() == "yes"
}

/// Second-pass yes/no classification of an analysis against a condition.
pub struct AlertEvaluator<'a> {
    client: &'a ModelClient,
}

impl<'a> AlertEvaluator<'a> {
    pub fn new(client: &'a ModelClient) -> Self {
        Self { client }
    }

    pub async fn evaluate(&self, image: Option<&DynamicImage>, analysis: &str, condition: &str) -> bool {
        let prompt = build_alert_prompt(condition, analysis);
        let response = self.client.analyze(image, &prompt).await;
        let triggered = is_affirmative(&response);
        log::info!(
            "[ALERT] '{}' -> {:?} ({})",
            condition,
            response,
            if triggered { "triggered" } else { "not met" }
        );
        triggered
    }

    /// Evaluates and emits `AlertTriggered` when the condition is met.
    pub async fn check(
        &self,
        image: Option<&DynamicImage>,
        analysis: &str,
        condition: &str,
        events: &dyn EventSink,
    ) -> bool {
        let triggered = self.evaluate(image, analysis, condition).await;
        if triggered {
            events.emit(PipelineEvent::AlertTriggered {
                condition: condition.to_string(),
                analysis: analysis.to_string(),
            });
        }
        triggered
    }
}
