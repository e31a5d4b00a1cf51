//! Bounded per-producer evidence queue with batch flush.
//!
//! Delivery is best-effort and biased toward recency: a monitoring
//! pipeline cares more about the current state than full history. The
//! buffer never blocks the sampling loop; on overflow the oldest
//! records are dropped.

use std::collections::VecDeque;
use tracing::{debug, warn};
use triage_common::{EvidenceRecord, TriageError};

/// How far pending records may accumulate during an outage before the
/// buffer trims back to one batch worth of the most recent records.
const OUTAGE_TRIM_FACTOR: usize = 4;

/// Destination for flushed batches.
pub trait EvidenceSink {
    fn send_batch(
        &self,
        batch: &[EvidenceRecord],
    ) -> impl std::future::Future<Output = Result<usize, TriageError>> + Send;
}

pub struct EvidenceBuffer {
    pending: VecDeque<EvidenceRecord>,
    capacity: usize,
    batch_max: usize,
    dropped_total: u64,
}

impl EvidenceBuffer {
    pub fn new(capacity: usize, batch_max: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            batch_max: batch_max.max(1),
            dropped_total: 0,
        }
    }

    /// Non-blocking O(1) add. At capacity, the oldest record is evicted
    /// to admit the new one.
    pub fn add(&mut self, record: EvidenceRecord) {
        if self.pending.len() == self.capacity {
            self.pending.pop_front();
            self.dropped_total += 1;
        }
        self.pending.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records dropped by eviction or outage trims since start.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Whether the pending size alone warrants a flush, independent of
    /// the periodic tick.
    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.batch_max
    }

    /// Attempt one batch send of up to `batch_max` records. On success
    /// exactly the sent records are removed; on failure they are
    /// retained, and if pending exceeds `batch_max * 4` the buffer is
    /// trimmed to the most recent `batch_max` records to cap memory
    /// under sustained outage.
    pub async fn flush<S: EvidenceSink>(&mut self, sink: &S) -> Result<usize, TriageError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let count = self.pending.len().min(self.batch_max);
        let batch: Vec<EvidenceRecord> = self.pending.iter().take(count).cloned().collect();

        match sink.send_batch(&batch).await {
            Ok(accepted) => {
                self.pending.drain(..count);
                debug!("Flushed {} evidence records ({} accepted)", count, accepted);
                Ok(count)
            }
            Err(e) => {
                if self.pending.len() > self.batch_max * OUTAGE_TRIM_FACTOR {
                    let excess = self.pending.len() - self.batch_max;
                    self.pending.drain(..excess);
                    self.dropped_total += excess as u64;
                    warn!(
                        "Flush failing and buffer over limit; dropped {} oldest records",
                        excess
                    );
                }
                Err(e)
            }
        }
    }
}
