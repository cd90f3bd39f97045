use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress of one batch-capable step invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub current_batch: usize,
    pub total_batches: usize,
}

impl BatchProgress {
    pub fn new(total_items: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            total_items,
            total_batches: total_items.div_ceil(batch_size),
            ..Default::default()
        }
    }

    /// Mark the start of the next batch (1-based)
    pub fn begin_batch(&mut self) {
        self.current_batch += 1;
    }

    /// Count a batch whose implementation call returned normally
    pub fn record_success(&mut self, batch_len: usize, successful: usize) {
        let successful = successful.min(batch_len);
        self.processed_items += batch_len;
        self.successful_items += successful;
        self.failed_items += batch_len - successful;
    }

    /// Count every item of a batch whose implementation call failed
    pub fn record_failure(&mut self, batch_len: usize) {
        self.processed_items += batch_len;
        self.failed_items += batch_len;
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        self.processed_items as f64 / self.total_items as f64 * 100.0
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "total_items": self.total_items,
            "processed_items": self.processed_items,
            "successful_items": self.successful_items,
            "failed_items": self.failed_items,
            "total_batches": self.total_batches,
        })
    }
}
