//! Microphone capture session
//!
//! A dedicated worker owns the input device: it opens it, reads one hardware
//! buffer at a time and pushes each buffer onto a chunk queue. A dispatcher
//! thread drains the queue into the recording sink, so a slow consumer only
//! ever stalls the worker, never the device callback.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{create_shared_queue, SharedChunkQueue};
use crate::audio::device::{AudioBackend, PcmFormat};
use crate::codec::pcm::samples_to_bytes;
use crate::config::{BackpressurePolicy, CaptureConfig};
use crate::error::{AudioError, Error, Result};
use crate::events::{settle_stopped, spawn_dispatcher, DispatchStats, SinkSlot, StreamEvent};

/// Lifecycle of a capture session.
///
/// `start` blocks until the device is open, so a session is never seen
/// before it is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Inactive,
    Active,
    Stopping,
}

/// Counters reported by a finished capture worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks: u64,
    pub samples: u64,
    /// Chunks evicted under the drop-oldest policy
    pub dropped: u64,
    /// Hardware buffers the device lost while the worker was not reading
    pub overruns: u64,
}

/// One live microphone recording
pub struct CaptureSession {
    /// Current lifecycle state
    state: Mutex<CaptureState>,
    /// Format delivered to the consumer
    format: PcmFormat,
    /// Samples per chunk, fixed by the device
    frame_samples: usize,
    /// Cleared by `stop` or by the worker when it exits on its own
    running: Arc<AtomicBool>,
    /// The worker queued its own terminal event or lost its consumer
    settled: Arc<AtomicBool>,
    /// Chunks waiting for the dispatcher
    queue: SharedChunkQueue<StreamEvent>,
    /// Capture thread, owns the input device
    worker: Option<JoinHandle<CaptureStats>>,
    /// Thread forwarding queued events to the consumer
    dispatcher: Option<JoinHandle<DispatchStats>>,
    /// Where the recording consumer is attached
    slot: Arc<SinkSlot>,
    /// Chunks queued so far, readable while running
    chunks_captured: Arc<AtomicU64>,
    /// When the device finished opening
    started_at: Instant,
}

impl CaptureSession {
    /// Open the input device and start capturing.
    ///
    /// Returns once the device is open. A device that cannot be opened at
    /// the configured format fails here with `Error::Device`, and nothing is
    /// left running.
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        config: &CaptureConfig,
        slot: Arc<SinkSlot>,
    ) -> Result<Self> {
        let format = PcmFormat::mono(config.sample_rate);
        let queue = create_shared_queue::<StreamEvent>(config.queue_depth);
        let running = Arc::new(AtomicBool::new(true));
        let settled = Arc::new(AtomicBool::new(false));
        let chunks_captured = Arc::new(AtomicU64::new(0));

        let dispatcher = spawn_dispatcher("capture", queue.clone(), slot.clone())
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let (init_tx, init_rx) = bounded::<std::result::Result<usize, AudioError>>(1);
        let worker = {
            let running = running.clone();
            let settled = settled.clone();
            let queue = queue.clone();
            let slot = slot.clone();
            let chunks_captured = chunks_captured.clone();
            let policy = config.backpressure;
            let poll_interval = config.poll_interval();
            let baseline = slot.departures();

            thread::Builder::new()
                .name("capture-mic".to_string())
                .spawn(move || {
                    let mut stats = CaptureStats::default();
                    let mut device = match backend.open_input(format) {
                        Ok(device) => {
                            let _ = init_tx.send(Ok(device.frame_samples()));
                            device
                        }
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            queue.close();
                            return stats;
                        }
                    };

                    while running.load(Ordering::Relaxed) {
                        if slot.departed_since(baseline) {
                            info!("Recording consumer detached, stopping capture");
                            settled.store(true, Ordering::SeqCst);
                            break;
                        }

                        let read = device.read_frame(poll_interval);

                        // Blocking on the queue leaves the device unread, and
                        // it drops buffers once its own backlog is full
                        let overruns = device.overruns();
                        if overruns > stats.overruns {
                            if stats.overruns == 0 {
                                warn!(
                                    "Capture device is losing audio: {} buffers overrun",
                                    overruns
                                );
                            } else {
                                debug!("Capture device overruns now {}", overruns);
                            }
                            stats.overruns = overruns;
                        }

                        let samples = match read {
                            Ok(Some(samples)) => samples,
                            Ok(None) => continue,
                            Err(e) => {
                                error!("Capture device failed: {}", e);
                                let event = StreamEvent::error(&Error::Device(e));
                                if queue.push(event).is_ok() {
                                    settled.store(true, Ordering::SeqCst);
                                }
                                break;
                            }
                        };

                        let sample_count = samples.len() as u64;
                        let event = StreamEvent::Data(samples_to_bytes(&samples));
                        let pushed = match policy {
                            BackpressurePolicy::Block => queue.push(event).is_ok(),
                            BackpressurePolicy::DropOldest => match queue.push_drop_oldest(event) {
                                Ok(Some(_)) => {
                                    stats.dropped += 1;
                                    debug!("Capture queue full, dropped oldest chunk");
                                    true
                                }
                                Ok(None) => true,
                                Err(_) => false,
                            },
                        };
                        if !pushed {
                            break;
                        }

                        stats.chunks += 1;
                        stats.samples += sample_count;
                        chunks_captured.fetch_add(1, Ordering::Relaxed);
                    }

                    running.store(false, Ordering::SeqCst);
                    drop(device);
                    queue.close();
                    debug!("Capture worker exiting ({} chunks)", stats.chunks);
                    stats
                })
        };

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                queue.close();
                let _ = dispatcher.join();
                return Err(AudioError::StreamError(e.to_string()).into());
            }
        };

        let frame_samples = match init_rx.recv() {
            Ok(Ok(frame_samples)) => frame_samples,
            Ok(Err(e)) => {
                warn!("Capture device failed to open: {}", e);
                let _ = worker.join();
                let _ = dispatcher.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = worker.join();
                let _ = dispatcher.join();
                return Err(AudioError::StreamError("capture worker exited".to_string()).into());
            }
        };

        info!(
            "Recording started: {} Hz mono, {} samples per chunk, {:?} backpressure",
            format.sample_rate, frame_samples, config.backpressure
        );

        Ok(Self {
            state: Mutex::new(CaptureState::Active),
            format,
            frame_samples,
            running,
            settled,
            queue,
            worker: Some(worker),
            dispatcher: Some(dispatcher),
            slot,
            chunks_captured,
            started_at: Instant::now(),
        })
    }

    /// Stop capturing, release the device and discard undelivered chunks.
    /// Waits for the worker to exit, then ends the stream with exactly one
    /// terminal event. Idempotent.
    pub fn stop(&mut self) -> CaptureStats {
        {
            let mut state = self.state.lock();
            if *state == CaptureState::Inactive {
                return CaptureStats::default();
            }
            *state = CaptureState::Stopping;
        }

        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        let pending = self.queue.drain();
        let discarded = pending.len();

        let stats = self
            .worker
            .take()
            .and_then(|worker| worker.join().ok())
            .unwrap_or_default();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        settle_stopped(&self.slot, pending, self.settled.load(Ordering::SeqCst));

        *self.state.lock() = CaptureState::Inactive;
        info!(
            "Recording stopped after {:.1}s: {} chunks captured, {} discarded, {} overruns",
            self.started_at.elapsed().as_secs_f32(),
            stats.chunks,
            discarded,
            stats.overruns
        );
        stats
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Whether the worker is still capturing
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn chunks_captured(&self) -> u64 {
        self.chunks_captured.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBackend;
    use crate::codec::pcm::bytes_to_samples;
    use crate::events;
    use std::time::Duration;

    fn config(policy: BackpressurePolicy) -> CaptureConfig {
        CaptureConfig {
            sample_rate: 8000,
            queue_depth: 2,
            backpressure: policy,
            poll_interval_ms: 10,
        }
    }

    #[test]
    fn test_chunks_arrive_in_capture_order() {
        let backend = MemoryBackend::new().with_frame_samples(64);
        let slot = Arc::new(SinkSlot::new());
        let (sink, rx) = events::channel();
        slot.attach(sink);

        let mut session =
            CaptureSession::start(Arc::new(backend.clone()), &config(BackpressurePolicy::Block), slot)
                .unwrap();
        assert_eq!(session.state(), CaptureState::Active);
        assert_eq!(session.frame_samples(), 64);

        let mut samples = Vec::new();
        while samples.len() < 64 * 5 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                StreamEvent::Data(bytes) => samples.extend(bytes_to_samples(&bytes)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        session.stop();

        let expected: Vec<i16> = (0..samples.len() as i16).collect();
        assert_eq!(samples, expected);
        assert_eq!(session.state(), CaptureState::Inactive);
        assert_eq!(backend.open_inputs(), 0);
    }

    #[test]
    fn test_open_failure_is_synchronous() {
        let backend = MemoryBackend::new();
        backend.fail_input(true);
        let slot = Arc::new(SinkSlot::new());

        let err = CaptureSession::start(
            Arc::new(backend.clone()),
            &config(BackpressurePolicy::Block),
            slot,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Device(_)));
        assert_eq!(backend.open_inputs(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = MemoryBackend::new().with_frame_samples(32);
        let slot = Arc::new(SinkSlot::new());
        let mut session =
            CaptureSession::start(Arc::new(backend.clone()), &config(BackpressurePolicy::Block), slot)
                .unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), CaptureState::Inactive);
        assert!(!session.is_running());
        assert_eq!(backend.open_inputs(), 0);
    }

    #[test]
    fn test_state_names() {
        let names: Vec<String> = [
            CaptureState::Inactive,
            CaptureState::Active,
            CaptureState::Stopping,
        ]
        .iter()
        .map(|state| serde_json::to_string(state).unwrap())
        .collect();
        assert_eq!(names, vec!["\"inactive\"", "\"active\"", "\"stopping\""]);
    }

    #[test]
    fn test_device_overruns_are_counted() {
        let backend = MemoryBackend::new()
            .with_frame_samples(16)
            .with_realtime(false);
        let slot = Arc::new(SinkSlot::new());
        slot.attach(Arc::new(SlowSink));

        let mut session =
            CaptureSession::start(Arc::new(backend.clone()), &config(BackpressurePolicy::Block), slot)
                .unwrap();
        thread::sleep(Duration::from_millis(50));
        backend.inject_input_overruns(2);
        thread::sleep(Duration::from_millis(100));
        backend.inject_input_overruns(3);
        thread::sleep(Duration::from_millis(100));

        let stats = session.stop();
        assert_eq!(stats.overruns, 5);
        assert_eq!(stats.dropped, 0);
        assert_eq!(backend.open_inputs(), 0);
    }

    #[test]
    fn test_device_error_is_reported_once() {
        let backend = MemoryBackend::new().with_frame_samples(32);
        backend.fail_input_after(Some(3));
        let slot = Arc::new(SinkSlot::new());
        let (sink, rx) = events::channel();
        slot.attach(sink);

        let mut session =
            CaptureSession::start(Arc::new(backend.clone()), &config(BackpressurePolicy::Block), slot)
                .unwrap();

        let mut data = 0;
        loop {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                StreamEvent::Data(_) => data += 1,
                StreamEvent::Error { kind, .. } => {
                    assert_eq!(kind, crate::error::ErrorKind::Device);
                    break;
                }
                StreamEvent::End => panic!("end before error"),
            }
        }
        assert_eq!(data, 3);

        session.stop();
        assert_eq!(backend.open_inputs(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_oldest_never_blocks_producer() {
        let backend = MemoryBackend::new()
            .with_frame_samples(16)
            .with_realtime(false);
        let slot = Arc::new(SinkSlot::new());
        let consumer = Arc::new(SlowSink);
        slot.attach(consumer);

        let mut session = CaptureSession::start(
            Arc::new(backend.clone()),
            &config(BackpressurePolicy::DropOldest),
            slot,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        let stats = session.stop();
        assert!(stats.dropped > 0);
        assert_eq!(backend.open_inputs(), 0);
    }

    struct SlowSink;

    impl events::EventSink for SlowSink {
        fn send(&self, _event: StreamEvent) -> std::result::Result<(), events::SinkClosed> {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }
    }
}
