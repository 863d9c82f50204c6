use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub timestamp: DateTime<Utc>,
    pub prompt_text: String,
    pub result_text: String,
}

/// Results produced since this process started, in arrival order.
#[derive(Default)]
pub struct SessionLog {
    results: Mutex<Vec<AnalysisResult>>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: AnalysisResult) {
        self.results.lock().push(result);
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    pub fn results(&self) -> Vec<AnalysisResult> {
        self.results.lock().clone()
    }

    /// Writes each result text followed by a blank line.
    pub fn save_text(&self, path: &Path) -> Result<String, String> {
        let results = self.results();
        if results.is_empty() {
            return Ok("No results to save.".to_string());
        }

        let mut file = std::io::BufWriter::new(
            std::fs::File::create(path).map_err(|e| format!("Error saving results: {}", e))?,
        );
        for r in &results {
            write!(file, "{}\n\n", r.result_text)
                .map_err(|e| format!("Error saving results: {}", e))?;
        }
        file.flush()
            .map_err(|e| format!("Error saving results: {}", e))?;

        Ok(format!("Results saved to {}", path.display()))
    }
}
