//! The engine: single owner of the playback, capture and stream sessions
//!
//! Each session kind has at most one live instance. Starting a new one
//! stops, joins and releases the previous one before the replacement opens
//! its device.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::capture::CaptureSession;
use crate::audio::device::{AudioBackend, CpalBackend, DeviceProperties};
use crate::audio::playback::{PlaybackController, PlaybackHandle, PlaybackState};
use crate::audio::stream::{StreamCompletion, StreamSession};
use crate::codec::PcmDecoder;
use crate::config::EngineConfig;
use crate::constants::{BYTES_PER_SAMPLE, CAPTURE_CHANNELS};
use crate::error::Result;
use crate::events::{EventSink, SinkSlot};
use crate::source::Source;

/// Answer to `getAudioProperties`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioProperties {
    pub backend: String,
    #[serde(flatten)]
    pub device: DeviceProperties,
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    pub bits_per_sample: u16,
}

pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn AudioBackend>,
    playback: Mutex<PlaybackController>,
    playback_view: PlaybackHandle,
    capture: Mutex<Option<CaptureSession>>,
    stream: Mutex<Option<StreamSession>>,
    recording_slot: Arc<SinkSlot>,
    stream_slot: Arc<SinkSlot>,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let playback = PlaybackController::new(
            backend.clone(),
            config.network.clone(),
            config.playback.default_volume,
        );
        let playback_view = playback.handle();
        info!("Engine ready on {} backend", backend.name());

        Ok(Self {
            config,
            backend,
            playback: Mutex::new(playback),
            playback_view,
            capture: Mutex::new(None),
            stream: Mutex::new(None),
            recording_slot: Arc::new(SinkSlot::new()),
            stream_slot: Arc::new(SinkSlot::new()),
        })
    }

    /// Engine on the host's default audio devices
    pub fn with_default_backend(config: EngineConfig) -> Result<Self> {
        Self::new(config, Arc::new(CpalBackend::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ----- playback -----

    pub fn play(&self, locator: &str, volume: Option<f32>, looping: bool) -> Result<()> {
        let source = Source::resolve(locator)?;
        info!("play {} (volume {:?}, loop {})", source, volume, looping);
        self.playback.lock().play(source, volume, looping)
    }

    pub fn pause(&self) -> bool {
        self.playback.lock().pause()
    }

    pub fn resume(&self) -> bool {
        self.playback.lock().resume()
    }

    pub fn stop(&self) {
        self.playback.lock().stop();
    }

    /// Returns the clamped volume actually applied
    pub fn set_volume(&self, volume: f32) -> Result<f32> {
        self.playback.lock().set_volume(volume)
    }

    pub fn is_playing(&self) -> bool {
        self.playback_view.is_playing()
    }

    pub fn current_position(&self) -> u64 {
        self.playback_view.position_millis()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback_view.state()
    }

    /// Length of `locator` in milliseconds, 0 when unknown.
    ///
    /// Network sources always answer 0 without touching the network.
    pub fn get_duration(&self, locator: &str) -> Result<u64> {
        let source = Source::resolve(locator)?;
        if source.is_network() {
            return Ok(0);
        }

        let state = self.playback_view.state();
        if state.source.as_deref() == Some(source.locator()) && state.duration_millis > 0 {
            return Ok(state.duration_millis);
        }

        let decoder = PcmDecoder::open(&source, &self.config.network)?;
        let duration = decoder.duration_millis().unwrap_or(0);
        debug!("Duration of {}: {} ms", source, duration);
        Ok(duration)
    }

    // ----- recording -----

    /// Start recording, replacing any running recording
    pub fn start_recording(&self) -> Result<()> {
        let mut capture = self.capture.lock();
        if let Some(mut previous) = capture.take() {
            info!("Replacing active recording");
            previous.stop();
        }
        let session = CaptureSession::start(
            self.backend.clone(),
            &self.config.capture,
            self.recording_slot.clone(),
        )?;
        *capture = Some(session);
        Ok(())
    }

    pub fn stop_recording(&self) {
        if let Some(mut session) = self.capture.lock().take() {
            session.stop();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_running())
    }

    pub fn attach_recording_sink(&self, sink: Arc<dyn EventSink>) {
        self.recording_slot.attach(sink);
    }

    /// Detach the recording consumer. This also stops the recording.
    pub fn detach_recording_sink(&self) {
        if self.recording_slot.detach() {
            info!("Recording consumer detached");
        }
        self.stop_recording();
    }

    // ----- streaming playback -----

    /// Start streaming `locator`, replacing any running stream.
    ///
    /// The returned completion resolves when the stream fails to open, fails
    /// mid-way, is stopped, loses its consumer or reaches the end.
    pub fn start_playback_stream(&self, locator: &str) -> Result<StreamCompletion> {
        let source = Source::resolve(locator)?;
        let mut stream = self.stream.lock();
        if let Some(mut previous) = stream.take() {
            info!("Replacing active playback stream {}", previous.source());
            previous.stop();
        }
        let (session, completion) = StreamSession::start(
            source,
            self.backend.clone(),
            &self.config.streaming,
            &self.config.network,
            self.stream_slot.clone(),
        )?;
        *stream = Some(session);
        Ok(completion)
    }

    pub fn stop_playback_stream(&self) {
        if let Some(mut session) = self.stream.lock().take() {
            session.stop();
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
            .lock()
            .as_ref()
            .is_some_and(|session| !session.is_finished())
    }

    pub fn attach_stream_sink(&self, sink: Arc<dyn EventSink>) {
        self.stream_slot.attach(sink);
    }

    /// Detach the stream consumer; a running stream ends at its next chunk
    pub fn detach_stream_sink(&self) {
        if self.stream_slot.detach() {
            info!("Playback stream consumer detached");
        }
    }

    // ----- platform -----

    pub fn platform_version(&self) -> String {
        format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn audio_properties(&self) -> AudioProperties {
        AudioProperties {
            backend: self.backend.name().to_string(),
            device: self.backend.properties(),
            capture_sample_rate: self.config.capture.sample_rate,
            capture_channels: CAPTURE_CHANNELS,
            bits_per_sample: (BYTES_PER_SAMPLE * 8) as u16,
        }
    }

    /// Stop every session and release every device
    pub fn shutdown(&self) {
        self.stop_playback_stream();
        self.stop_recording();
        self.stop();
        debug!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
