//! In-memory audio backend
//!
//! Devices that never touch hardware: input is generated (a ramp, silence or
//! a scripted sample loop) and output is counted, and kept only when asked
//! for. Open handles are counted so callers can check that every session
//! releases what it opened.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::audio::device::{
    AudioBackend, DeviceProperties, InputDevice, OutputDevice, PcmFormat,
};
use crate::constants::DEFAULT_FRAME_SAMPLES;
use crate::error::AudioError;

/// What the memory input device produces
#[derive(Debug, Clone, PartialEq)]
pub enum InputScript {
    /// 0, 1, 2, ... wrapping at `i16::MAX`
    Ramp,
    Silence,
    /// The given samples, repeated
    Samples(Vec<i16>),
}

#[derive(Debug, Clone)]
struct Settings {
    frame_samples: usize,
    realtime: bool,
    input: InputScript,
    fail_input: bool,
    fail_output: bool,
    fail_input_after: Option<u64>,
    record_output: bool,
}

#[derive(Default)]
struct Counters {
    open_inputs: AtomicUsize,
    open_outputs: AtomicUsize,
    peak_inputs: AtomicUsize,
    peak_outputs: AtomicUsize,
    inputs_opened: AtomicUsize,
    outputs_opened: AtomicUsize,
    samples_written: AtomicU64,
    input_overruns: AtomicU64,
}

impl Counters {
    fn acquire(open: &AtomicUsize, peak: &AtomicUsize, total: &AtomicUsize) {
        let now = open.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        total.fetch_add(1, Ordering::SeqCst);
    }
}

struct Shared {
    settings: Mutex<Settings>,
    counters: Counters,
    played: Mutex<Vec<i16>>,
    output_volume: Mutex<Option<f32>>,
}

/// Backend with in-memory devices. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Ramp input, real-time pacing, default frame size
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                settings: Mutex::new(Settings {
                    frame_samples: DEFAULT_FRAME_SAMPLES,
                    realtime: true,
                    input: InputScript::Ramp,
                    fail_input: false,
                    fail_output: false,
                    fail_input_after: None,
                    record_output: false,
                }),
                counters: Counters::default(),
                played: Mutex::new(Vec::new()),
                output_volume: Mutex::new(None),
            }),
        }
    }

    pub fn with_frame_samples(self, frame_samples: usize) -> Self {
        self.shared.settings.lock().frame_samples = frame_samples.max(1);
        self
    }

    /// Whether devices block for the duration of the audio they move
    pub fn with_realtime(self, realtime: bool) -> Self {
        self.shared.settings.lock().realtime = realtime;
        self
    }

    pub fn with_input(self, input: InputScript) -> Self {
        self.shared.settings.lock().input = input;
        self
    }

    /// Keep every sample written to an output for `played_samples`.
    /// Off by default, so long sessions do not grow memory.
    pub fn with_recorded_output(self, record: bool) -> Self {
        self.shared.settings.lock().record_output = record;
        self
    }

    /// Make the next input opens fail
    pub fn fail_input(&self, fail: bool) {
        self.shared.settings.lock().fail_input = fail;
    }

    /// Make the next output opens fail
    pub fn fail_output(&self, fail: bool) {
        self.shared.settings.lock().fail_output = fail;
    }

    /// Input devices opened from now on fail after producing `frames` frames
    pub fn fail_input_after(&self, frames: Option<u64>) {
        self.shared.settings.lock().fail_input_after = frames;
    }

    /// Report `count` more buffers lost before reaching an input's reader
    pub fn inject_input_overruns(&self, count: u64) {
        self.shared.counters.input_overruns.fetch_add(count, Ordering::SeqCst);
    }

    pub fn open_inputs(&self) -> usize {
        self.shared.counters.open_inputs.load(Ordering::SeqCst)
    }

    pub fn open_outputs(&self) -> usize {
        self.shared.counters.open_outputs.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open inputs
    pub fn peak_open_inputs(&self) -> usize {
        self.shared.counters.peak_inputs.load(Ordering::SeqCst)
    }

    pub fn peak_open_outputs(&self) -> usize {
        self.shared.counters.peak_outputs.load(Ordering::SeqCst)
    }

    pub fn inputs_opened(&self) -> usize {
        self.shared.counters.inputs_opened.load(Ordering::SeqCst)
    }

    pub fn outputs_opened(&self) -> usize {
        self.shared.counters.outputs_opened.load(Ordering::SeqCst)
    }

    /// Every sample written to any output so far. Empty unless the backend
    /// was built `with_recorded_output(true)`.
    pub fn played_samples(&self) -> Vec<i16> {
        self.shared.played.lock().clone()
    }

    pub fn clear_played(&self) {
        self.shared.played.lock().clear();
    }

    /// Number of samples written to any output, recorded or not
    pub fn samples_written(&self) -> u64 {
        self.shared.counters.samples_written.load(Ordering::SeqCst)
    }

    /// Volume last applied to an output device
    pub fn output_volume(&self) -> Option<f32> {
        *self.shared.output_volume.lock()
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_input(&self, format: PcmFormat) -> Result<Box<dyn InputDevice>, AudioError> {
        let settings = self.shared.settings.lock().clone();
        if settings.fail_input {
            return Err(AudioError::DeviceNotFound("memory input disabled".to_string()));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", format)));
        }

        let counters = &self.shared.counters;
        Counters::acquire(&counters.open_inputs, &counters.peak_inputs, &counters.inputs_opened);
        debug!("Memory input opened ({:?})", format);

        Ok(Box::new(MemoryInput {
            shared: self.shared.clone(),
            format,
            frame_samples: settings.frame_samples,
            realtime: settings.realtime,
            script: settings.input,
            fail_after: settings.fail_input_after,
            cursor: 0,
            frames_read: 0,
        }))
    }

    fn open_output(&self, format: PcmFormat) -> Result<Box<dyn OutputDevice>, AudioError> {
        let settings = self.shared.settings.lock().clone();
        if settings.fail_output {
            return Err(AudioError::DeviceNotFound("memory output disabled".to_string()));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", format)));
        }

        let counters = &self.shared.counters;
        Counters::acquire(
            &counters.open_outputs,
            &counters.peak_outputs,
            &counters.outputs_opened,
        );
        debug!("Memory output opened ({:?})", format);

        // Whole frames only, so channel interleaving survives re-framing
        let channels = format.channels as usize;
        let frame_samples = (settings.frame_samples / channels).max(1) * channels;

        Ok(Box::new(MemoryOutput {
            shared: self.shared.clone(),
            format,
            frame_samples,
            realtime: settings.realtime,
            record: settings.record_output,
            paused: false,
        }))
    }

    fn properties(&self) -> DeviceProperties {
        let frame_samples = self.shared.settings.lock().frame_samples;
        DeviceProperties {
            host: "memory".to_string(),
            input_device: Some("memory-input".to_string()),
            output_device: Some("memory-output".to_string()),
            default_output_sample_rate: None,
            min_buffer_frames: Some(frame_samples as u32),
        }
    }
}

fn pace(realtime: bool, samples: usize, format: PcmFormat) {
    if !realtime || samples == 0 {
        return;
    }
    let frames = samples as u64 / format.channels.max(1) as u64;
    let micros = frames * 1_000_000 / format.sample_rate.max(1) as u64;
    thread::sleep(Duration::from_micros(micros));
}

struct MemoryInput {
    shared: Arc<Shared>,
    format: PcmFormat,
    frame_samples: usize,
    realtime: bool,
    script: InputScript,
    fail_after: Option<u64>,
    cursor: u64,
    frames_read: u64,
}

impl InputDevice for MemoryInput {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn overruns(&self) -> u64 {
        self.shared.counters.input_overruns.load(Ordering::SeqCst)
    }

    fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
        if self.fail_after.is_some_and(|limit| self.frames_read >= limit) {
            return Err(AudioError::StreamError("memory input disconnected".to_string()));
        }

        pace(self.realtime, self.frame_samples, self.format);

        let frame: Vec<i16> = match &self.script {
            InputScript::Ramp => (0..self.frame_samples as u64)
                .map(|i| ((self.cursor + i) % (i16::MAX as u64 + 1)) as i16)
                .collect(),
            InputScript::Silence => vec![0; self.frame_samples],
            InputScript::Samples(samples) if samples.is_empty() => vec![0; self.frame_samples],
            InputScript::Samples(samples) => (0..self.frame_samples as u64)
                .map(|i| samples[((self.cursor + i) % samples.len() as u64) as usize])
                .collect(),
        };
        self.cursor += self.frame_samples as u64;
        self.frames_read += 1;
        Ok(Some(frame))
    }
}

impl Drop for MemoryInput {
    fn drop(&mut self) {
        self.shared.counters.open_inputs.fetch_sub(1, Ordering::SeqCst);
        debug!("Memory input released after {} frames", self.frames_read);
    }
}

struct MemoryOutput {
    shared: Arc<Shared>,
    format: PcmFormat,
    frame_samples: usize,
    realtime: bool,
    record: bool,
    paused: bool,
}

impl OutputDevice for MemoryOutput {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        if self.paused {
            return Err(AudioError::StreamError("write to paused output".to_string()));
        }
        pace(self.realtime, samples.len(), self.format);
        self.shared
            .counters
            .samples_written
            .fetch_add(samples.len() as u64, Ordering::SeqCst);
        if self.record {
            self.shared.played.lock().extend_from_slice(samples);
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        *self.shared.output_volume.lock() = Some(volume);
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        self.paused = false;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.shared.counters.open_outputs.fetch_sub(1, Ordering::SeqCst);
        debug!("Memory output released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_counters() {
        let backend = MemoryBackend::new().with_realtime(false);
        let a = backend.open_input(PcmFormat::mono(8000)).unwrap();
        let b = backend.open_input(PcmFormat::mono(8000)).unwrap();
        assert_eq!(backend.open_inputs(), 2);
        drop(a);
        drop(b);
        assert_eq!(backend.open_inputs(), 0);
        assert_eq!(backend.peak_open_inputs(), 2);
        assert_eq!(backend.inputs_opened(), 2);
    }

    #[test]
    fn test_ramp_is_contiguous() {
        let backend = MemoryBackend::new().with_realtime(false).with_frame_samples(4);
        let mut input = backend.open_input(PcmFormat::mono(8000)).unwrap();
        let first = input.read_frame(Duration::ZERO).unwrap().unwrap();
        let second = input.read_frame(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_scripted_input_repeats() {
        let backend = MemoryBackend::new()
            .with_realtime(false)
            .with_frame_samples(3)
            .with_input(InputScript::Samples(vec![7, 8]));
        let mut input = backend.open_input(PcmFormat::mono(8000)).unwrap();
        assert_eq!(input.read_frame(Duration::ZERO).unwrap(), Some(vec![7, 8, 7]));
        assert_eq!(input.read_frame(Duration::ZERO).unwrap(), Some(vec![8, 7, 8]));
    }

    #[test]
    fn test_failure_injection() {
        let backend = MemoryBackend::new().with_realtime(false);
        backend.fail_input(true);
        assert!(backend.open_input(PcmFormat::mono(8000)).is_err());
        assert_eq!(backend.open_inputs(), 0);

        backend.fail_input(false);
        backend.fail_input_after(Some(1));
        let mut input = backend.open_input(PcmFormat::mono(8000)).unwrap();
        assert!(input.read_frame(Duration::ZERO).is_ok());
        assert!(input.read_frame(Duration::ZERO).is_err());
    }

    #[test]
    fn test_output_collects_samples() {
        let backend = MemoryBackend::new()
            .with_realtime(false)
            .with_recorded_output(true);
        let mut output = backend.open_output(PcmFormat::new(8000, 2)).unwrap();
        output.set_volume(0.5);
        output.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.played_samples(), vec![1, 2, 3, 4]);
        assert_eq!(backend.output_volume(), Some(0.5));

        output.pause().unwrap();
        assert!(output.write(&[5, 6]).is_err());
        drop(output);
        assert_eq!(backend.open_outputs(), 0);
    }

    #[test]
    fn test_output_is_counted_but_not_kept_by_default() {
        let backend = MemoryBackend::new().with_realtime(false);
        let mut output = backend.open_output(PcmFormat::mono(8000)).unwrap();
        for _ in 0..100 {
            output.write(&[0; 256]).unwrap();
        }
        assert_eq!(backend.samples_written(), 25_600);
        assert!(backend.played_samples().is_empty());
    }

    #[test]
    fn test_injected_overruns_are_reported() {
        let backend = MemoryBackend::new().with_realtime(false);
        let input = backend.open_input(PcmFormat::mono(8000)).unwrap();
        assert_eq!(input.overruns(), 0);
        backend.inject_input_overruns(3);
        assert_eq!(input.overruns(), 3);
    }
}
