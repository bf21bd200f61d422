//! Analyzer pipeline: ordered frame consumers with per-registration
//! frame-retention, plus the keep-only-latest delivery queue.

use crate::frame::{FrameBuffer, FrameError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A pluggable consumer of captured frames.
///
/// `analyze` runs synchronously on the controller's delivery thread and must
/// not block it for long; hand long-running work to an analyzer-owned thread
/// and register the entry as retaining so the frame survives dispatch.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, frame: &FrameBuffer);
}

/// A registered analyzer: identity, ordering position, and whether it takes
/// over frame ownership.
#[derive(Clone)]
pub struct AnalyzerEntry {
    name: String,
    analyzer: Arc<dyn FrameAnalyzer>,
    retains_frame: bool,
}

impl AnalyzerEntry {
    /// Entry whose frames are auto-released after dispatch.
    pub fn new(name: impl Into<String>, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        Self {
            name: name.into(),
            analyzer,
            retains_frame: false,
        }
    }

    /// Entry that keeps the frame alive past dispatch. The analyzer is then
    /// responsible for releasing it exactly once.
    pub fn retaining(name: impl Into<String>, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        Self {
            name: name.into(),
            analyzer,
            retains_frame: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retains_frame(&self) -> bool {
        self.retains_frame
    }
}

impl std::fmt::Debug for AnalyzerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerEntry")
            .field("name", &self.name)
            .field("retains_frame", &self.retains_frame)
            .finish()
    }
}

/// Ordered set of analyzers. Registration and removal are safe while frames
/// are in flight: each dispatch works from a snapshot of the list.
#[derive(Default)]
pub struct AnalyzerPipeline {
    entries: RwLock<Vec<AnalyzerEntry>>,
}

impl AnalyzerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: AnalyzerEntry) {
        tracing::debug!(analyzer = entry.name(), retains = entry.retains_frame(), "analyzer added");
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Remove every entry registered under `name`. Returns whether any was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.name != name);
        let removed = entries.len() != before;
        if removed {
            tracing::debug!(analyzer = name, "analyzer removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch one frame to every registered analyzer in registration order,
    /// then auto-release it unless at least one entry retains ownership.
    pub fn dispatch(&self, frame: FrameBuffer) {
        let snapshot: Vec<AnalyzerEntry> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut retained = false;
        for entry in &snapshot {
            if entry.retains_frame {
                retained = true;
            }
            entry.analyzer.analyze(&frame);
        }

        if !retained {
            if let Err(FrameError::AlreadyReleased { sequence }) = frame.release() {
                tracing::warn!(sequence, "frame was released during dispatch");
            }
        }
    }
}

/// Frame delivery policy when analyzers cannot keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Drop and release the undelivered frame when a newer one arrives.
    #[default]
    KeepOnlyLatest,
    /// Queue every frame; memory-unbounded, for offline consumers.
    QueueAll,
}

/// Hand-off point between a capture backend's delivery callback and the
/// controller thread. Stale-frame dropping under [`Backpressure::KeepOnlyLatest`]
/// happens here, at push time, so a slow consumer only ever sees the newest frame.
pub struct FrameQueue {
    mode: Backpressure,
    pending: Mutex<VecDeque<FrameBuffer>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(mode: Backpressure) -> Self {
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> Backpressure {
        self.mode
    }

    /// Offer a frame for delivery. Under keep-only-latest, a frame still
    /// waiting is released without analysis; dropped frames are not errors.
    pub fn push(&self, frame: FrameBuffer) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.mode == Backpressure::KeepOnlyLatest {
            if let Some(stale) = pending.pop_front() {
                let sequence = stale.sequence();
                let _ = stale.release();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence, "dropped stale frame under backpressure");
            }
        }
        pending.push_back(frame);
    }

    pub fn pop(&self) -> Option<FrameBuffer> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Frames released without analysis since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Release everything still pending. Used on shutdown.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for frame in pending.drain(..) {
            let _ = frame.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, Rotation};
    use std::sync::atomic::AtomicUsize;

    fn frame(seq: u64) -> FrameBuffer {
        FrameBuffer::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8, Rotation::Deg0, seq).unwrap()
    }

    struct Recorder {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl FrameAnalyzer for Recorder {
        fn analyze(&self, frame: &FrameBuffer) {
            self.order.lock().unwrap().push(self.label);
            self.seen.lock().unwrap().push(frame.sequence());
        }
    }

    fn recorder(
        label: &'static str,
        order: &Arc<Mutex<Vec<&'static str>>>,
        seen: &Arc<Mutex<Vec<u64>>>,
    ) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            order: order.clone(),
            seen: seen.clone(),
        })
    }

    #[test]
    fn dispatch_runs_in_registration_order_and_releases() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AnalyzerPipeline::new();
        pipeline.add(AnalyzerEntry::new("first", recorder("first", &order, &seen)));
        pipeline.add(AnalyzerEntry::new("second", recorder("second", &order, &seen)));

        let f = frame(1);
        pipeline.dispatch(f.clone());

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(f.is_released(), "non-retained frame must be auto-released");
    }

    #[test]
    fn retaining_entry_suppresses_auto_release() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AnalyzerPipeline::new();
        pipeline.add(AnalyzerEntry::new("plain", recorder("plain", &order, &seen)));
        pipeline.add(AnalyzerEntry::retaining(
            "keeper",
            recorder("keeper", &order, &seen),
        ));

        let f = frame(2);
        pipeline.dispatch(f.clone());

        assert!(!f.is_released(), "retained frame stays alive past dispatch");
        f.release().unwrap();
    }

    #[test]
    fn remove_by_name() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AnalyzerPipeline::new();
        pipeline.add(AnalyzerEntry::new("a", recorder("a", &order, &seen)));
        pipeline.add(AnalyzerEntry::new("b", recorder("b", &order, &seen)));

        assert!(pipeline.remove("a"));
        assert!(!pipeline.remove("a"));
        assert_eq!(pipeline.len(), 1);

        pipeline.dispatch(frame(3));
        assert_eq!(*order.lock().unwrap(), vec!["b"]);
    }

    /// An analyzer that mutates the pipeline mid-dispatch must not affect the
    /// frame currently in flight.
    #[test]
    fn dispatch_uses_snapshot() {
        struct SelfRemover {
            pipeline: Arc<AnalyzerPipeline>,
            calls: Arc<AtomicUsize>,
        }
        impl FrameAnalyzer for SelfRemover {
            fn analyze(&self, _frame: &FrameBuffer) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.pipeline.remove("tail");
            }
        }

        let pipeline = Arc::new(AnalyzerPipeline::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let tail_calls = Arc::new(AtomicUsize::new(0));

        struct Counter(Arc<AtomicUsize>);
        impl FrameAnalyzer for Counter {
            fn analyze(&self, _frame: &FrameBuffer) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        pipeline.add(AnalyzerEntry::new(
            "head",
            Arc::new(SelfRemover {
                pipeline: pipeline.clone(),
                calls: calls.clone(),
            }),
        ));
        pipeline.add(AnalyzerEntry::new("tail", Arc::new(Counter(tail_calls.clone()))));

        pipeline.dispatch(frame(1));
        // The snapshot still contains "tail" for this frame.
        assert_eq!(tail_calls.load(Ordering::SeqCst), 1);

        pipeline.dispatch(frame(2));
        // Removed for subsequent frames.
        assert_eq!(tail_calls.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn keep_only_latest_drops_undelivered_frame() {
        let queue = FrameQueue::new(Backpressure::KeepOnlyLatest);
        let f1 = frame(1);
        let f2 = frame(2);

        queue.push(f1.clone());
        queue.push(f2.clone());

        assert!(f1.is_released(), "stale frame released without analysis");
        assert_eq!(queue.dropped(), 1);

        let delivered = queue.pop().expect("latest frame available");
        assert_eq!(delivered.sequence(), 2);
        assert!(queue.pop().is_none());
        delivered.release().unwrap();
    }

    #[test]
    fn queue_all_preserves_every_frame() {
        let queue = FrameQueue::new(Backpressure::QueueAll);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.dropped(), 0);
        let seqs: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|f| {
                let s = f.sequence();
                f.release().unwrap();
                s
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn clear_releases_pending() {
        let queue = FrameQueue::new(Backpressure::KeepOnlyLatest);
        let f = frame(9);
        queue.push(f.clone());
        queue.clear();
        assert!(f.is_released());
        assert!(queue.pop().is_none());
    }
}
