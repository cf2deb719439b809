//! Streaming playback session
//!
//! Decodes a source, plays every frame on the output device and hands the
//! very same frame to the stream consumer as PCM bytes. The output device
//! paces the loop, so chunks arrive at the source's natural rate.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{create_shared_queue, SharedChunkQueue};
use crate::audio::device::{AudioBackend, OutputDevice};
use crate::codec::pcm::samples_to_bytes;
use crate::codec::PcmDecoder;
use crate::config::{NetworkConfig, StreamingConfig};
use crate::error::{AudioError, Error, Result};
use crate::events::{settle_stopped, spawn_dispatcher, DispatchStats, SinkSlot, StreamEvent};
use crate::source::Source;

/// Why a stream finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
    /// The source ran out
    Completed,
    /// Stopped by the caller
    Cancelled,
    /// The consumer went away
    ConsumerDetached,
}

/// Outcome of a successful stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StreamSummary {
    pub chunks: u64,
    pub bytes: u64,
    pub end: StreamEnd,
}

/// Resolves once when the stream fails to open, fails mid-way or ends
pub struct StreamCompletion {
    rx: Receiver<Result<StreamSummary>>,
}

impl StreamCompletion {
    /// Block until the stream terminates
    pub fn wait(self) -> Result<StreamSummary> {
        self.rx.recv().unwrap_or_else(|_| Err(worker_lost()))
    }

    /// `None` if the stream is still running after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<StreamSummary>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_lost())),
        }
    }
}

fn worker_lost() -> Error {
    Error::Stream("stream worker exited without a result".to_string())
}

/// One live streaming playback
pub struct StreamSession {
    /// What is being streamed
    source: Source,
    /// Set by `stop` to end the worker at the next chunk
    cancel: Arc<AtomicBool>,
    /// Set by the worker once it has returned
    finished: Arc<AtomicBool>,
    /// The worker queued its own terminal event, failed to open or lost its
    /// consumer
    settled: Arc<AtomicBool>,
    /// Chunks waiting for the dispatcher
    queue: SharedChunkQueue<StreamEvent>,
    /// Decode thread, owns the decoder and the output device
    worker: Option<JoinHandle<Option<StreamEnd>>>,
    /// Thread forwarding queued events to the consumer
    dispatcher: Option<JoinHandle<DispatchStats>>,
    /// Where the stream consumer is attached
    slot: Arc<SinkSlot>,
    /// Chunks queued so far, readable while running
    chunks_streamed: Arc<AtomicU64>,
}

impl StreamSession {
    /// Start streaming `source`. Returns immediately; opening happens on the
    /// worker and open failures resolve the completion without any stream
    /// event.
    pub fn start(
        source: Source,
        backend: Arc<dyn AudioBackend>,
        streaming: &StreamingConfig,
        network: &NetworkConfig,
        slot: Arc<SinkSlot>,
    ) -> Result<(Self, StreamCompletion)> {
        let queue = create_shared_queue::<StreamEvent>(streaming.queue_depth);
        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let settled = Arc::new(AtomicBool::new(false));
        let chunks_streamed = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = bounded::<Result<StreamSummary>>(1);

        let dispatcher = spawn_dispatcher("stream", queue.clone(), slot.clone())
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let job = StreamJob {
            source: source.clone(),
            backend,
            network: network.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            slot: slot.clone(),
            settled: settled.clone(),
            baseline: slot.departures(),
            chunks_streamed: chunks_streamed.clone(),
        };
        let worker_finished = finished.clone();
        let worker = thread::Builder::new()
            .name("stream-decode".to_string())
            .spawn(move || {
                let queue = job.queue.clone();
                let result = job.run();
                match &result {
                    Ok(summary) => info!(
                        "Stream finished ({:?}): {} chunks, {} bytes",
                        summary.end, summary.chunks, summary.bytes
                    ),
                    Err(e) => warn!("Stream failed: {}", e),
                }
                let end = result.as_ref().ok().map(|summary| summary.end);
                queue.close();
                worker_finished.store(true, Ordering::SeqCst);
                let _ = done_tx.send(result);
                end
            });

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                queue.close();
                let _ = dispatcher.join();
                return Err(AudioError::StreamError(e.to_string()).into());
            }
        };

        info!("Playback stream started: {}", source);
        Ok((
            Self {
                source,
                cancel,
                finished,
                settled,
                queue,
                worker: Some(worker),
                dispatcher: Some(dispatcher),
                slot,
                chunks_streamed,
            },
            StreamCompletion { rx: done_rx },
        ))
    }

    /// Cancel the stream and wait for the worker to release the device.
    ///
    /// A stream that already finished keeps everything it queued; the
    /// dispatcher drains it before this returns. Otherwise undelivered chunks
    /// are discarded and the consumer gets `End`. Idempotent.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };

        let pending = if self.is_finished() {
            Vec::new()
        } else {
            self.cancel.store(true, Ordering::SeqCst);
            self.queue.close();
            self.queue.drain()
        };
        let discarded = pending.iter().filter(|event| !event.is_terminal()).count();

        let end = worker.join().ok().flatten();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        settle_stopped(&self.slot, pending, self.settled.load(Ordering::SeqCst));
        debug!(
            "Playback stream {} stopped ({:?}, {} chunks discarded)",
            self.source, end, discarded
        );
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Whether the worker has terminated
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn chunks_streamed(&self) -> u64 {
        self.chunks_streamed.load(Ordering::Relaxed)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the decode worker needs
struct StreamJob {
    source: Source,
    backend: Arc<dyn AudioBackend>,
    /// Timeouts for network sources
    network: NetworkConfig,
    queue: SharedChunkQueue<StreamEvent>,
    cancel: Arc<AtomicBool>,
    slot: Arc<SinkSlot>,
    settled: Arc<AtomicBool>,
    /// Departure count of `slot` when the session started
    baseline: u64,
    chunks_streamed: Arc<AtomicU64>,
}

impl StreamJob {
    fn run(self) -> Result<StreamSummary> {
        let (mut decoder, mut output) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                // Open failures only resolve the completion
                self.settle();
                return Err(e);
            }
        };
        let frame_samples = output.frame_samples();
        debug!(
            "Streaming {} as {:?}, {} samples per chunk",
            self.source,
            decoder.format(),
            frame_samples
        );

        let mut summary = StreamSummary {
            chunks: 0,
            bytes: 0,
            end: StreamEnd::Completed,
        };

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Stream cancelled");
                summary.end = StreamEnd::Cancelled;
                break;
            }
            if self.slot.departed_since(self.baseline) {
                info!("Stream consumer detached");
                self.settle();
                summary.end = StreamEnd::ConsumerDetached;
                break;
            }

            let frame = match decoder.next_frame(frame_samples) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if let Err(e) = output.drain() {
                        warn!("Output drain failed: {}", e);
                    }
                    debug!("End of source after {} chunks", summary.chunks);
                    break;
                }
                Err(e) => {
                    let err = Error::Stream(e.to_string());
                    error!("Decode failed mid-stream: {}", err);
                    self.finish(StreamEvent::error(&err));
                    return Err(err);
                }
            };

            if let Err(e) = output.write(&frame) {
                let err = Error::Device(e);
                error!("Output failed mid-stream: {}", err);
                self.finish(StreamEvent::error(&err));
                return Err(err);
            }

            let bytes = samples_to_bytes(&frame);
            let len = bytes.len() as u64;
            if self.queue.push(StreamEvent::Data(bytes)).is_err() {
                summary.end = StreamEnd::Cancelled;
                break;
            }
            summary.chunks += 1;
            summary.bytes += len;
            self.chunks_streamed.fetch_add(1, Ordering::Relaxed);
        }

        drop(output);
        if summary.end == StreamEnd::Completed && !self.finish(StreamEvent::End) {
            // Stopped while the last chunk was in flight
            summary.end = StreamEnd::Cancelled;
        }
        Ok(summary)
    }

    fn open(&self) -> Result<(PcmDecoder, Box<dyn OutputDevice>)> {
        let decoder = PcmDecoder::open(&self.source, &self.network)?;
        let output = self.backend.open_output(decoder.format())?;
        Ok((decoder, output))
    }

    /// Queue the terminal event. Fails once the session has been stopped.
    fn finish(&self, event: StreamEvent) -> bool {
        let queued = self.queue.push(event).is_ok();
        if queued {
            self.settle();
        }
        queued
    }

    fn settle(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBackend;
    use crate::codec::pcm::bytes_to_samples;
    use crate::events;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_wav(path: &Path, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn start(
        path: &Path,
        backend: &MemoryBackend,
        slot: Arc<SinkSlot>,
    ) -> (StreamSession, StreamCompletion) {
        let source = Source::resolve(path.to_str().unwrap()).unwrap();
        StreamSession::start(
            source,
            Arc::new(backend.clone()),
            &StreamingConfig::default(),
            &NetworkConfig::default(),
            slot,
        )
        .unwrap()
    }

    #[test]
    fn test_streamed_bytes_match_played_samples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<i16> = (0..2000).map(|i| (i * 7 % 3000) as i16).collect();
        write_wav(&path, &samples);

        let backend = MemoryBackend::new()
            .with_realtime(false)
            .with_frame_samples(256)
            .with_recorded_output(true);
        let slot = Arc::new(SinkSlot::new());
        let (sink, rx) = events::channel();
        slot.attach(sink);

        let (_session, completion) = start(&path, &backend, slot);
        let summary = completion.wait().unwrap();
        assert_eq!(summary.end, StreamEnd::Completed);
        assert_eq!(summary.chunks, 8);

        let mut streamed = Vec::new();
        let mut ended = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(2)) {
            match event {
                StreamEvent::Data(bytes) => streamed.extend(bytes_to_samples(&bytes)),
                StreamEvent::End => {
                    ended = true;
                    break;
                }
                StreamEvent::Error { message, .. } => panic!("stream error: {}", message),
            }
        }
        assert!(ended);
        assert_eq!(streamed, samples);
        assert_eq!(backend.played_samples(), samples);
        assert_eq!(backend.open_outputs(), 0);
    }

    #[test]
    fn test_missing_file_fails_completion_without_events() {
        let backend = MemoryBackend::new();
        let slot = Arc::new(SinkSlot::new());
        let (sink, rx) = events::channel();
        slot.attach(sink);

        let (mut session, completion) =
            start(Path::new("/no/such/file.wav"), &backend, slot);
        let err = completion.wait().unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        session.stop();
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.outputs_opened(), 0);
    }

    #[test]
    fn test_stop_cancels_within_a_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("long.wav");
        write_wav(&path, &vec![100i16; 8000 * 5]);

        let backend = MemoryBackend::new().with_frame_samples(256);
        let slot = Arc::new(SinkSlot::new());
        let (mut session, completion) = start(&path, &backend, slot);

        thread::sleep(Duration::from_millis(150));
        session.stop();
        let summary = completion
            .wait_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(summary.end, StreamEnd::Cancelled);
        assert!(session.is_finished());
        assert_eq!(backend.open_outputs(), 0);
    }
}
