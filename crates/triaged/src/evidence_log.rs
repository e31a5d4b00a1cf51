//! Append-only evidence log, keyed by arrival order.
//!
//! Bounded in memory: the oldest entries fall off once capacity is
//! reached, matching the producer-side recency bias.

use std::collections::VecDeque;
use triage_common::EvidenceRecord;

pub struct EvidenceLog {
    entries: VecDeque<EvidenceRecord>,
    capacity: usize,
    total_ingested: u64,
}

impl EvidenceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            total_ingested: 0,
        }
    }

    /// Append a whole accepted batch in producer order.
    pub fn append_batch(&mut self, batch: &[EvidenceRecord]) {
        for record in batch {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(record.clone());
            self.total_ingested += 1;
        }
    }

    /// The most recent `limit` records, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<EvidenceRecord> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_ingested(&self) -> u64 {
        self.total_ingested
    }
}
