pub mod alert;
pub mod kobold;

pub use alert::AlertEvaluator;
pub use kobold::{InferenceError, ModelClient, FALLBACK_TEXT};
