pub mod export;
pub mod session;
pub mod storage;

pub use session::{AnalysisResult, SessionLog};
pub use storage::{HistoryEntry, HistoryError, HistoryStore};
