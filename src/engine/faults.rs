//! Operator-visible fault channel
//!
//! Integrity problems that the engine survives on its own (index corruption,
//! reference-count underflow, damaged snapshot files) are logged, counted and
//! queued here instead of being returned to the caller. The queue is bounded;
//! when nobody drains it, new faults are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};

use atlas_core::{AtomId, NamespaceId};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::clock::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    IndexCorruption {
        namespace: NamespaceId,
        detail: String,
        at: Timestamp,
    },
    ReferenceCountUnderflow {
        atom: AtomId,
        at: Timestamp,
    },
    SnapshotFileRejected {
        file: String,
        detail: String,
        at: Timestamp,
    },
}

pub struct FaultChannel {
    tx: Sender<Fault>,
    rx: Receiver<Fault>,
    pub corruption_total: AtomicU64,
    pub underflow_total: AtomicU64,
    pub dropped_total: AtomicU64,
}

impl FaultChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            corruption_total: AtomicU64::new(0),
            underflow_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn report(&self, fault: Fault) {
        match &fault {
            Fault::IndexCorruption {
                namespace, detail, ..
            } => {
                tracing::error!("index corruption in {namespace}: {detail}; falling back to linear scan");
                self.corruption_total.fetch_add(1, Ordering::Relaxed);
            }
            Fault::ReferenceCountUnderflow { atom, .. } => {
                tracing::warn!("reference count underflow on {atom}: release without matching insert");
                self.underflow_total.fetch_add(1, Ordering::Relaxed);
            }
            Fault::SnapshotFileRejected { file, detail, .. } => {
                tracing::warn!("snapshot file {file} rejected: {detail}");
            }
        }
        if self.tx.try_send(fault).is_err() {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Takes every queued fault.
    pub fn drain(&self) -> Vec<Fault> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_drain() {
        let faults = FaultChannel::new(8);
        faults.report(Fault::ReferenceCountUnderflow {
            atom: AtomId(3),
            at: 10,
        });
        faults.report(Fault::IndexCorruption {
            namespace: NamespaceId(1),
            detail: "child bounds escape parent".to_string(),
            at: 11,
        });
        assert_eq!(faults.pending(), 2);
        let drained = faults.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Fault::ReferenceCountUnderflow { .. }));
        assert_eq!(faults.underflow_total.load(Ordering::Relaxed), 1);
        assert_eq!(faults.corruption_total.load(Ordering::Relaxed), 1);
        assert!(faults.drain().is_empty());
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let faults = FaultChannel::new(1);
        for i in 0..3 {
            faults.report(Fault::ReferenceCountUnderflow {
                atom: AtomId(i),
                at: i,
            });
        }
        assert_eq!(faults.drain().len(), 1);
        assert_eq!(faults.dropped_total.load(Ordering::Relaxed), 2);
        assert_eq!(faults.underflow_total.load(Ordering::Relaxed), 3);
    }
}
