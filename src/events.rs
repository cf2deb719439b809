//! Consumer-facing event streams
//!
//! Sessions never call a consumer directly. They push `StreamEvent`s into a
//! `ChunkQueue`, and a dispatcher thread drains the queue into whatever sink
//! is currently attached to the session's `SinkSlot`.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

use crate::audio::buffer::{Popped, SharedChunkQueue};
use crate::error::{Error, ErrorKind};

/// One item of a recording or playback stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Little-endian signed 16-bit PCM
    Data(Bytes),
    /// Terminal failure
    Error { kind: ErrorKind, message: String },
    /// Terminal success
    End,
}

impl StreamEvent {
    pub fn error(err: &Error) -> Self {
        StreamEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Data(_))
    }
}

/// The consumer behind a sink has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for stream events
pub trait EventSink: Send + Sync {
    fn send(&self, event: StreamEvent) -> Result<(), SinkClosed>;
}

/// Sink backed by an unbounded crossbeam channel
pub struct ChannelSink {
    tx: Sender<StreamEvent>,
}

impl EventSink for ChannelSink {
    fn send(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).map_err(|_| SinkClosed)
    }
}

/// Create a channel sink and the receiver that consumes it.
/// Dropping the receiver detaches the consumer.
pub fn channel() -> (Arc<ChannelSink>, Receiver<StreamEvent>) {
    let (tx, rx) = unbounded();
    (Arc::new(ChannelSink { tx }), rx)
}

/// Replaceable reference to the current consumer of one stream kind.
///
/// Every time an attached consumer goes away (explicit detach or a closed
/// sink) the departure counter advances. Sessions remember the counter when
/// they start and stop once it moves.
#[derive(Default)]
pub struct SinkSlot {
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    departures: AtomicU64,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer, replacing the previous one
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Remove the consumer. Returns false when none was attached.
    pub fn detach(&self) -> bool {
        let previous = self.sink.write().take();
        if previous.is_some() {
            self.departures.fetch_add(1, Ordering::SeqCst);
        }
        previous.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.read().is_some()
    }

    pub fn departures(&self) -> u64 {
        self.departures.load(Ordering::SeqCst)
    }

    /// Whether a consumer left after `baseline` was taken
    pub fn departed_since(&self, baseline: u64) -> bool {
        self.departures() != baseline
    }

    /// Deliver to the current consumer. A missing consumer is a no-op; a
    /// closed one is cleared from the slot. Returns whether it was delivered.
    pub fn deliver(&self, event: StreamEvent) -> bool {
        let sink = match self.sink.read().as_ref() {
            Some(sink) => sink.clone(),
            None => return false,
        };

        if sink.send(event).is_ok() {
            return true;
        }

        let mut slot = self.sink.write();
        // Only clear it if nobody attached a new consumer in the meantime
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &sink)) {
            *slot = None;
            self.departures.fetch_add(1, Ordering::SeqCst);
            debug!("Consumer closed, sink detached");
        }
        false
    }
}

/// Deliver a stopped session's terminal event.
///
/// Runs after the worker and dispatcher have been joined. `discarded` holds
/// the events the stop pulled out of the queue; a terminal event among them
/// still goes out. Otherwise `End` is sent unless the worker already settled
/// the stream (queued its own terminal event or lost its consumer).
pub fn settle_stopped(slot: &SinkSlot, discarded: Vec<StreamEvent>, settled: bool) {
    match discarded.into_iter().find(StreamEvent::is_terminal) {
        Some(terminal) => {
            slot.deliver(terminal);
        }
        None if !settled => {
            slot.deliver(StreamEvent::End);
        }
        None => {}
    }
}

/// Counters returned by a finished dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub discarded: u64,
}

/// Spawn a thread forwarding queued events to `slot` in order until the
/// queue is closed and drained
pub fn spawn_dispatcher(
    name: &str,
    queue: SharedChunkQueue<StreamEvent>,
    slot: Arc<SinkSlot>,
) -> io::Result<JoinHandle<DispatchStats>> {
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("{}-dispatch", name))
        .spawn(move || {
            let mut stats = DispatchStats::default();
            while let Popped::Item(event) = queue.pop() {
                if slot.deliver(event) {
                    stats.delivered += 1;
                } else {
                    stats.discarded += 1;
                }
            }
            info!(
                "{} dispatcher finished ({} delivered, {} discarded)",
                label, stats.delivered, stats.discarded
            );
            stats
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;

    #[test]
    fn test_delivery_to_empty_slot_is_noop() {
        let slot = SinkSlot::new();
        assert!(!slot.deliver(StreamEvent::End));
        assert_eq!(slot.departures(), 0);
    }

    #[test]
    fn test_closed_consumer_is_latched() {
        let slot = SinkSlot::new();
        let (sink, rx) = channel();
        slot.attach(sink);
        let baseline = slot.departures();

        assert!(slot.deliver(StreamEvent::Data(Bytes::from_static(&[1, 2]))));
        assert_eq!(rx.recv().unwrap(), StreamEvent::Data(Bytes::from_static(&[1, 2])));

        drop(rx);
        assert!(!slot.deliver(StreamEvent::End));
        assert!(!slot.is_attached());
        assert!(slot.departed_since(baseline));
    }

    #[test]
    fn test_detach_counts_only_attached_consumers() {
        let slot = SinkSlot::new();
        assert!(!slot.detach());
        assert_eq!(slot.departures(), 0);

        let (sink, _rx) = channel();
        slot.attach(sink);
        assert!(slot.detach());
        assert_eq!(slot.departures(), 1);
    }

    #[test]
    fn test_dispatcher_preserves_order() {
        let slot = Arc::new(SinkSlot::new());
        let (sink, rx) = channel();
        slot.attach(sink);

        let queue = create_shared_queue(2);
        let handle = spawn_dispatcher("test", queue.clone(), slot).unwrap();
        for i in 0..10u8 {
            queue.push(StreamEvent::Data(Bytes::from(vec![i]))).unwrap();
        }
        queue.push(StreamEvent::End).unwrap();
        queue.close();

        let stats = handle.join().unwrap();
        assert_eq!(stats.delivered, 11);

        let received: Vec<StreamEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 11);
        for (i, event) in received.iter().take(10).enumerate() {
            assert_eq!(event, &StreamEvent::Data(Bytes::from(vec![i as u8])));
        }
        assert!(received[10].is_terminal());
    }

    #[test]
    fn test_settle_stopped() {
        let slot = SinkSlot::new();
        let (sink, rx) = channel();
        slot.attach(sink);

        // Cancelled before any terminal event: End
        settle_stopped(&slot, vec![StreamEvent::Data(Bytes::new())], false);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::End);

        // A queued terminal event survives the stop, discarded data does not
        let failure = StreamEvent::Error {
            kind: ErrorKind::Device,
            message: "gone".to_string(),
        };
        settle_stopped(
            &slot,
            vec![StreamEvent::Data(Bytes::new()), failure.clone()],
            true,
        );
        assert_eq!(rx.try_recv().unwrap(), failure);

        // Already delivered by the dispatcher: nothing more
        settle_stopped(&slot, Vec::new(), true);
        assert!(rx.try_recv().is_err());
    }
}
