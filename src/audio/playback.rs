//! File and network playback controller
//!
//! One playback session at a time. `play` hands the slow work (opening the
//! source, probing the container, opening the output device) to a worker
//! thread and returns at once; the worker publishes progress into a shared
//! `PlaybackState` that every getter reads.
//!
//! ```text
//!            play                open ok
//!  Idle ──────────────► Preparing ────────► Playing ◄──────► Paused
//!   ▲                       │               │    pause/resume
//!   │ stop                  │ open failed   │ end of media (no loop)
//!   │                       ▼               ▼
//!   └──────────────────── Error          Stopped
//! ```

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::device::AudioBackend;
use crate::codec::pcm::frames_to_millis;
use crate::codec::PcmDecoder;
use crate::config::NetworkConfig;
use crate::error::{AudioError, Error, ErrorKind, Result};
use crate::source::Source;

/// How often a paused worker re-checks for cancellation
const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Preparing,
    Playing,
    Paused,
    /// Reached the end of non-looped media
    Stopped,
    Error,
}

/// Why the last session failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for PlaybackErrorInfo {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of the playback controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub source: Option<String>,
    pub volume: f32,
    pub looping: bool,
    pub position_millis: u64,
    /// 0 when unknown
    pub duration_millis: u64,
    pub error_info: Option<PlaybackErrorInfo>,
    pub loops_completed: u32,
}

impl PlaybackState {
    fn idle(volume: f32) -> Self {
        Self {
            status: PlaybackStatus::Idle,
            source: None,
            volume,
            looping: false,
            position_millis: 0,
            duration_millis: 0,
            error_info: None,
            loops_completed: 0,
        }
    }
}

struct Shared {
    state: Mutex<PlaybackState>,
    wake: Condvar,
}

/// Read-only view of the controller's state
#[derive(Clone)]
pub struct PlaybackHandle {
    shared: Arc<Shared>,
}

impl PlaybackHandle {
    pub fn state(&self) -> PlaybackState {
        self.shared.state.lock().clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.state.lock().status
    }

    pub fn is_playing(&self) -> bool {
        self.status() == PlaybackStatus::Playing
    }

    pub fn position_millis(&self) -> u64 {
        self.shared.state.lock().position_millis
    }

    pub fn duration_millis(&self) -> u64 {
        self.shared.state.lock().duration_millis
    }
}

struct Session {
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Drives a single playback session
pub struct PlaybackController {
    shared: Arc<Shared>,
    backend: Arc<dyn AudioBackend>,
    network: NetworkConfig,
    /// Used by the next `play` that does not pass a volume
    volume: f32,
    session: Option<Session>,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn AudioBackend>, network: NetworkConfig, volume: f32) -> Self {
        let volume = volume.clamp(0.0, 1.0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::idle(volume)),
                wake: Condvar::new(),
            }),
            backend,
            network,
            volume,
            session: None,
        }
    }

    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            shared: self.shared.clone(),
        }
    }

    /// Replace the current session with one playing `source`.
    ///
    /// Returns once the worker is launched. Open and decode failures show up
    /// later as `PlaybackStatus::Error`.
    pub fn play(&mut self, source: Source, volume: Option<f32>, looping: bool) -> Result<()> {
        let volume = match volume {
            Some(v) => validate_volume(v)?,
            None => self.volume,
        };

        self.end_session();
        self.volume = volume;

        {
            let mut state = self.shared.state.lock();
            *state = PlaybackState {
                status: PlaybackStatus::Preparing,
                source: Some(source.locator().to_string()),
                looping,
                ..PlaybackState::idle(volume)
            };
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let job = PlaybackJob {
            source,
            backend: self.backend.clone(),
            network: self.network.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };

        let worker = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || job.run())
            .map_err(|e| {
                let err = Error::from(AudioError::StreamError(e.to_string()));
                let mut state = self.shared.state.lock();
                state.status = PlaybackStatus::Error;
                state.error_info = Some(PlaybackErrorInfo::from(&err));
                err
            })?;

        self.session = Some(Session { cancel, worker });
        Ok(())
    }

    /// Playing → Paused. No-op in any other state.
    pub fn pause(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.status != PlaybackStatus::Playing {
            return false;
        }
        state.status = PlaybackStatus::Paused;
        info!("Playback paused at {} ms", state.position_millis);
        self.shared.wake.notify_all();
        true
    }

    /// Paused → Playing. No-op in any other state.
    pub fn resume(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.status != PlaybackStatus::Paused {
            return false;
        }
        state.status = PlaybackStatus::Playing;
        info!("Playback resumed at {} ms", state.position_millis);
        self.shared.wake.notify_all();
        true
    }

    /// Stop and release everything. Always safe; leaves the controller Idle
    /// with position 0.
    pub fn stop(&mut self) {
        let had_session = self.end_session();
        let mut state = self.shared.state.lock();
        *state = PlaybackState::idle(self.volume);
        if had_session {
            info!("Playback stopped");
        }
    }

    /// Clamp to [0, 1] and apply. Takes effect within one frame when a
    /// session is running, otherwise on the next `play`.
    pub fn set_volume(&mut self, volume: f32) -> Result<f32> {
        let volume = validate_volume(volume)?;
        self.volume = volume;
        self.shared.state.lock().volume = volume;
        debug!("Volume set to {:.2}", volume);
        Ok(volume)
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state.lock().clone()
    }

    /// Cancel and join the running worker. Returns whether there was one.
    fn end_session(&mut self) -> bool {
        let session = match self.session.take() {
            Some(session) => session,
            None => return false,
        };
        session.cancel.store(true, Ordering::SeqCst);
        {
            let _state = self.shared.state.lock();
            self.shared.wake.notify_all();
        }
        if session.worker.join().is_err() {
            error!("Playback worker panicked");
        }
        true
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.end_session();
    }
}

fn validate_volume(volume: f32) -> Result<f32> {
    if volume.is_nan() {
        return Err(Error::InvalidArgument("volume must be a number".to_string()));
    }
    Ok(volume.clamp(0.0, 1.0))
}

enum Finish {
    EndOfMedia,
    Cancelled,
}

/// Everything a playback worker needs
struct PlaybackJob {
    source: Source,
    backend: Arc<dyn AudioBackend>,
    network: NetworkConfig,
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
}

impl PlaybackJob {
    fn run(self) {
        let result = self.play_loop();
        let mut state = self.shared.state.lock();
        if self.cancelled() {
            return;
        }
        match result {
            Ok(Finish::EndOfMedia) => {
                info!("Playback of {} finished", self.source);
                state.status = PlaybackStatus::Stopped;
            }
            Ok(Finish::Cancelled) => {}
            Err(e) => {
                error!("Playback of {} failed: {}", self.source, e);
                state.status = PlaybackStatus::Error;
                state.error_info = Some(PlaybackErrorInfo::from(&e));
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.shared.state.lock()
    }

    fn open_decoder(&self) -> Result<PcmDecoder> {
        PcmDecoder::open(&self.source, &self.network)
    }

    fn play_loop(&self) -> Result<Finish> {
        let mut decoder = self.open_decoder()?;
        if self.cancelled() {
            return Ok(Finish::Cancelled);
        }

        let format = decoder.format();
        let mut output = self.backend.open_output(format)?;
        let frame_samples = output.frame_samples();
        let channels = format.channels.max(1) as u64;

        let mut applied_volume = {
            let mut state = self.lock();
            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }
            state.status = PlaybackStatus::Playing;
            state.duration_millis = decoder.duration_millis().unwrap_or(0);
            state.position_millis = 0;
            state.volume
        };
        output.set_volume(applied_volume);
        info!(
            "Playing {} ({} Hz, {} ch, {} samples per frame)",
            self.source, format.sample_rate, format.channels, frame_samples
        );

        let mut frames_played: u64 = 0;
        loop {
            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }

            let (paused, volume, looping) = {
                let state = self.lock();
                (
                    state.status == PlaybackStatus::Paused,
                    state.volume,
                    state.looping,
                )
            };

            if paused {
                output.pause()?;
                {
                    let mut state = self.lock();
                    while state.status == PlaybackStatus::Paused && !self.cancelled() {
                        self.shared.wake.wait_for(&mut state, PAUSE_POLL);
                    }
                }
                if self.cancelled() {
                    return Ok(Finish::Cancelled);
                }
                output.resume()?;
                continue;
            }

            if volume != applied_volume {
                output.set_volume(volume);
                applied_volume = volume;
            }

            let frame = decoder
                .next_frame(frame_samples)
                .map_err(|e| Error::Stream(e.to_string()))?;

            match frame {
                Some(frame) => {
                    output.write(&frame)?;
                    frames_played += frame.len() as u64 / channels;
                    let position = frames_to_millis(frames_played, format.sample_rate);
                    let mut state = self.lock();
                    if matches!(
                        state.status,
                        PlaybackStatus::Playing | PlaybackStatus::Paused
                    ) {
                        state.position_millis = position;
                    }
                }
                None if looping && frames_played == 0 => {
                    // An empty pass would restart forever
                    info!("{} has no frames, not looping", self.source);
                    return Ok(Finish::EndOfMedia);
                }
                None if looping => {
                    self.restart(&mut decoder)?;
                    frames_played = 0;
                    let mut state = self.lock();
                    state.loops_completed += 1;
                    state.position_millis = 0;
                    debug!("Looping {} (pass {})", self.source, state.loops_completed);
                }
                None => {
                    if let Err(e) = output.drain() {
                        warn!("Output drain failed: {}", e);
                    }
                    return Ok(Finish::EndOfMedia);
                }
            }
        }
    }

    /// Back to the first frame, re-opening sources that cannot seek
    fn restart(&self, decoder: &mut PcmDecoder) -> Result<()> {
        if decoder.is_seekable() {
            match decoder.rewind() {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Rewind failed ({}), reopening {}", e, self.source),
            }
        }
        *decoder = self.open_decoder()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBackend;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn write_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 100) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn controller(backend: &MemoryBackend) -> PlaybackController {
        PlaybackController::new(Arc::new(backend.clone()), NetworkConfig::default(), 1.0)
    }

    fn source(path: &Path) -> Source {
        Source::resolve(path.to_str().unwrap()).unwrap()
    }

    fn wait_for(handle: &PlaybackHandle, status: PlaybackStatus) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.status() != status {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", status);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_plays_to_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.wav");
        write_wav(&path, 800);

        let backend = MemoryBackend::new()
            .with_frame_samples(256)
            .with_realtime(false)
            .with_recorded_output(true);
        let mut playback = controller(&backend);
        let handle = playback.handle();
        playback.play(source(&path), None, false).unwrap();

        wait_for(&handle, PlaybackStatus::Stopped);
        let state = handle.state();
        assert_eq!(state.position_millis, 100);
        assert_eq!(state.duration_millis, 100);
        assert_eq!(backend.played_samples().len(), 800);
        assert_eq!(backend.open_outputs(), 0);
    }

    #[test]
    fn test_looping_empty_source_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.wav");
        write_wav(&path, 0);

        let backend = MemoryBackend::new().with_frame_samples(256).with_realtime(false);
        let mut playback = controller(&backend);
        let handle = playback.handle();
        playback.play(source(&path), None, true).unwrap();

        wait_for(&handle, PlaybackStatus::Stopped);
        thread::sleep(Duration::from_millis(50));
        let state = handle.state();
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.loops_completed, 0);
        assert_eq!(state.position_millis, 0);
        assert!(state.looping);
    }

    #[test]
    fn test_pause_resume_noops() {
        let backend = MemoryBackend::new();
        let playback = controller(&backend);
        assert!(!playback.pause());
        assert!(!playback.resume());
        assert_eq!(playback.state().status, PlaybackStatus::Idle);
    }

    #[test]
    fn test_volume_is_clamped_and_kept() {
        let backend = MemoryBackend::new();
        let mut playback = controller(&backend);
        assert_eq!(playback.set_volume(1.5).unwrap(), 1.0);
        assert_eq!(playback.set_volume(-0.2).unwrap(), 0.0);
        assert!(matches!(
            playback.set_volume(f32::NAN),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(playback.volume(), 0.0);
        playback.stop();
        assert_eq!(playback.state().volume, 0.0);
    }

    #[test]
    fn test_output_failure_is_error_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 800);

        let backend = MemoryBackend::new();
        backend.fail_output(true);
        let mut playback = controller(&backend);
        let handle = playback.handle();
        playback.play(source(&path), Some(0.5), false).unwrap();

        wait_for(&handle, PlaybackStatus::Error);
        let info = handle.state().error_info.unwrap();
        assert_eq!(info.kind, ErrorKind::Device);

        playback.stop();
        assert_eq!(handle.status(), PlaybackStatus::Idle);
        assert!(handle.state().error_info.is_none());
    }
}
