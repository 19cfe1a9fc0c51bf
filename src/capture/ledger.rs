//! Per-slot frame accounting.

use std::path::PathBuf;

use super::device::GrabFailure;

/// A grab attempt whose frame was written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Device slot.
    pub slot: usize,
    /// Index of the stimulus in the source list.
    pub stimulus_index: usize,
    /// Sequence index assigned within the slot.
    pub sequence: usize,
    pub path: PathBuf,
}

/// A grab attempt that produced no saved frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    /// Index of the stimulus in the source list.
    pub stimulus_index: usize,
    /// Stimulus filename.
    pub filename: String,
    /// Device slot.
    pub slot: usize,
    pub reason: GrabFailure,
}

/// Saved-frame counters with append-only logs of saved frames and failures.
///
/// Owned by the orchestrator, which is the only writer.
#[derive(Debug, Clone)]
pub struct FrameLedger {
    counts: Vec<usize>,
    frames: Vec<FrameRecord>,
    failures: Vec<FailureRecord>,
}

impl FrameLedger {
    pub fn new(slot_count: usize) -> Self {
        Self {
            counts: vec![0; slot_count],
            frames: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.counts.len()
    }

    /// Count a frame saved to `path` for `slot` and return the sequence
    /// index assigned to it. Indices start at 0 and are never reused.
    ///
    /// # Panics
    /// If `slot` is outside the ledger.
    pub fn record_success(&mut self, slot: usize, stimulus_index: usize, path: PathBuf) -> usize {
        let assigned = self.counts[slot];
        self.counts[slot] += 1;
        self.frames.push(FrameRecord {
            slot,
            stimulus_index,
            sequence: assigned,
            path,
        });
        assigned
    }

    /// Append a failure. The slot's counter is unchanged.
    pub fn record_failure(
        &mut self,
        slot: usize,
        stimulus_index: usize,
        filename: &str,
        reason: GrabFailure,
    ) {
        self.failures.push(FailureRecord {
            stimulus_index,
            filename: filename.to_string(),
            slot,
            reason,
        });
    }

    /// Next sequence index for `slot`, equal to its number of saved frames.
    pub fn sequence_index_of(&self, slot: usize) -> usize {
        self.counts.get(slot).copied().unwrap_or(0)
    }

    /// Saved frames in capture order.
    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn frames_for_slot(&self, slot: usize) -> impl Iterator<Item = &FrameRecord> {
        self.frames.iter().filter(move |r| r.slot == slot)
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn failures_for_slot(&self, slot: usize) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(move |r| r.slot == slot)
    }

    pub fn total_saved(&self) -> usize {
        self.counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_per_slot() {
        let mut ledger = FrameLedger::new(3);
        assert_eq!(ledger.record_success(0, 0, "a0.tiff".into()), 0);
        assert_eq!(ledger.record_success(0, 1, "a1.tiff".into()), 1);
        ledger.record_failure(1, 0, "a.png", GrabFailure::Timeout);
        assert_eq!(ledger.record_success(2, 0, "c0.tiff".into()), 0);

        assert_eq!(ledger.sequence_index_of(0), 2);
        assert_eq!(ledger.sequence_index_of(1), 0);
        assert_eq!(ledger.sequence_index_of(2), 1);
        assert_eq!(ledger.sequence_index_of(9), 0);
        assert_eq!(ledger.total_saved(), 3);

        let slot0: Vec<_> = ledger.frames_for_slot(0).collect();
        assert_eq!(slot0.len(), 2);
        assert_eq!(slot0[1].sequence, 1);
        assert_eq!(slot0[1].stimulus_index, 1);
        assert_eq!(slot0[1].path, PathBuf::from("a1.tiff"));
        assert_eq!(ledger.frames().len(), 3);
    }

    #[test]
    fn test_failures_are_append_only() {
        let mut ledger = FrameLedger::new(2);
        ledger.record_failure(1, 3, "im3.png", GrabFailure::Timeout);
        ledger.record_failure(0, 4, "im4.png", GrabFailure::Grab("bus error".into()));
        ledger.record_success(1, 5, "b5.tiff".into());

        assert_eq!(ledger.failures().len(), 2);
        assert_eq!(ledger.failures()[0].stimulus_index, 3);
        assert_eq!(ledger.failures_for_slot(0).count(), 1);
        assert_eq!(ledger.failures_for_slot(0).next().unwrap().filename, "im4.png");
    }
}
