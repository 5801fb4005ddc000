use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use alyx_core::value::Document;

/// The kind of committed mutation a change event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// The record of one committed mutation, the unit of real-time delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub op: ChangeOp,
    pub document: Document,
    /// Present on updates (and deletes record the deleted document).
    pub previous_document: Option<Document>,
    pub at: DateTime<Utc>,
}

/// A change event stamped with its commit-time sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: ChangeEvent,
}

/// Process-wide monotonic event numbering.
///
/// Sequence numbers are assigned on the single database-write path at
/// commit time: the gateway calls [`Sequencer::stamp`] while it still
/// holds the writer connection, so stamp order cannot diverge from
/// commit order even with concurrent writers. The counter is
/// process-local; subscribers resync after a restart.
#[derive(Debug, Default)]
pub struct Sequencer {
    counter: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest assigned sequence number.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Stamps a batch of events in order, returning them sequenced.
    pub fn stamp(&self, events: Vec<ChangeEvent>) -> Vec<SequencedEvent> {
        events
            .into_iter()
            .map(|event| SequencedEvent {
                seq: self.counter.fetch_add(1, Ordering::AcqRel) + 1,
                event,
            })
            .collect()
    }
}

/// Receives post-commit event batches.
///
/// The gateway buffers events inside the transaction and hands the
/// whole batch over only after a successful commit; rolled-back events
/// are dropped with the buffer.
pub trait EventSink: Send + Sync {
    fn publish(&self, events: Vec<SequencedEvent>);
}

/// A sink that drops everything; used before the router is wired up
/// and in store-only tests.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _events: Vec<SequencedEvent>) {}
}

/// A sink wrapping a plain function.
pub struct FnSink<F: Fn(Vec<SequencedEvent>) + Send + Sync>(pub F);

impl<F: Fn(Vec<SequencedEvent>) + Send + Sync> EventSink for FnSink<F> {
    fn publish(&self, events: Vec<SequencedEvent>) {
        (self.0)(events)
    }
}

/// Shared handle type the gateway holds.
pub type SharedSink = Arc<dyn EventSink>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(collection: &str) -> ChangeEvent {
        ChangeEvent {
            collection: collection.to_string(),
            op: ChangeOp::Insert,
            document: Document::new(),
            previous_document: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let sequencer = Sequencer::new();
        let batch1 = sequencer.stamp(vec![event("a"), event("a")]);
        let batch2 = sequencer.stamp(vec![event("b")]);
        assert_eq!(batch1[0].seq, 1);
        assert_eq!(batch1[1].seq, 2);
        assert_eq!(batch2[0].seq, 3);
        assert_eq!(sequencer.current(), 3);
    }

    #[test]
    fn fn_sink_receives_batches() {
        let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&received);
        let sink = FnSink(move |events: Vec<SequencedEvent>| {
            inner.lock().unwrap().extend(events.iter().map(|e| e.seq));
        });
        let sequencer = Sequencer::new();
        sink.publish(sequencer.stamp(vec![event("a"), event("b")]));
        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    }
}
