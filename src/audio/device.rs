//! Audio device abstraction and the cpal backend
//!
//! Sessions talk to hardware through `AudioBackend`. Device handles are
//! opened on the worker thread that uses them (cpal streams are not `Send`)
//! and release the hardware when dropped.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::pcm::{f32_to_i16, i16_to_f32};
use crate::constants::{DEFAULT_FRAME_SAMPLES, MIN_FRAME_SAMPLES, OUTPUT_STALL_TIMEOUT_MS};
use crate::error::AudioError;

/// Sample rate and channel count of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }
}

/// Static information about the default devices of a backend
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    pub host: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub default_output_sample_rate: Option<u32>,
    /// Smallest hardware buffer the output device accepts, in frames
    pub min_buffer_frames: Option<u32>,
}

/// Entry of `list_devices`
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Open input device producing signed 16-bit samples
pub trait InputDevice {
    fn format(&self) -> PcmFormat;

    /// Samples per hardware buffer
    fn frame_samples(&self) -> usize;

    /// Next hardware buffer, or `None` if nothing arrived within `timeout`
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError>;

    /// Hardware buffers lost so far because the reader fell behind
    fn overruns(&self) -> u64;
}

/// Open output device consuming signed 16-bit samples
pub trait OutputDevice {
    fn format(&self) -> PcmFormat;

    /// Samples per hardware buffer
    fn frame_samples(&self) -> usize;

    /// Queue samples for playback, blocking at the device's real-time pace
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    fn set_volume(&mut self, volume: f32);

    fn pause(&mut self) -> Result<(), AudioError>;

    fn resume(&mut self) -> Result<(), AudioError>;

    /// Block until everything written so far has been played
    fn drain(&mut self) -> Result<(), AudioError>;
}

/// Source of input and output devices
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_input(&self, format: PcmFormat) -> Result<Box<dyn InputDevice>, AudioError>;

    fn open_output(&self, format: PcmFormat) -> Result<Box<dyn OutputDevice>, AudioError>;

    fn properties(&self) -> DeviceProperties;
}

/// Backend driving the host's default devices through cpal
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_input(&self, format: PcmFormat) -> Result<Box<dyn InputDevice>, AudioError> {
        Ok(Box::new(CpalInput::open(format)?))
    }

    fn open_output(&self, format: PcmFormat) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(CpalOutput::open(format)?))
    }

    fn properties(&self) -> DeviceProperties {
        let host = cpal::default_host();
        let output = host.default_output_device();
        let output_config = output.as_ref().and_then(|d| d.default_output_config().ok());

        DeviceProperties {
            host: host.id().name().to_string(),
            input_device: host.default_input_device().and_then(|d| d.name().ok()),
            output_device: output.as_ref().and_then(|d| d.name().ok()),
            default_output_sample_rate: output_config.as_ref().map(|c| c.sample_rate().0),
            min_buffer_frames: output_config.and_then(|c| match c.buffer_size() {
                SupportedBufferSize::Range { min, .. } => Some(*min),
                SupportedBufferSize::Unknown => None,
            }),
        }
    }
}

/// Pick a fixed hardware buffer close to the device minimum
fn buffer_size_for(supported: &SupportedBufferSize) -> cpal::BufferSize {
    match supported {
        SupportedBufferSize::Range { min, max } => {
            cpal::BufferSize::Fixed((*min).max(MIN_FRAME_SAMPLES as u32).min(*max))
        }
        SupportedBufferSize::Unknown => cpal::BufferSize::Default,
    }
}

fn frames_in(buffer_size: &cpal::BufferSize) -> usize {
    match buffer_size {
        cpal::BufferSize::Fixed(frames) => *frames as usize,
        cpal::BufferSize::Default => DEFAULT_FRAME_SAMPLES,
    }
}

/// Find a device configuration matching `format`
fn select_config(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    format: PcmFormat,
    exact_channels: bool,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let rate = cpal::SampleRate(format.sample_rate);
    let range = ranges
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .filter(|r| !exact_channels || r.channels() == format.channels)
        .filter(|r| {
            matches!(
                r.sample_format(),
                SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
            )
        })
        .max_by_key(|r| {
            (
                r.channels() == format.channels,
                r.sample_format() == SampleFormat::I16,
            )
        })
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!(
                "{} Hz, {} channel(s)",
                format.sample_rate, format.channels
            ))
        })?;

    let supported = range.with_sample_rate(rate);
    let sample_format = supported.sample_format();
    let buffer_size = buffer_size_for(supported.buffer_size());
    let mut config = supported.config();
    config.buffer_size = buffer_size;
    Ok((config, sample_format))
}

/// Raw callback buffer, converted to i16 on the reading thread
enum RawFrame {
    I16(Vec<i16>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl RawFrame {
    fn into_i16(self) -> Vec<i16> {
        match self {
            RawFrame::I16(samples) => samples,
            RawFrame::U16(samples) => samples
                .into_iter()
                .map(|s| (s as i32 - 32768) as i16)
                .collect(),
            RawFrame::F32(samples) => samples.into_iter().map(f32_to_i16).collect(),
        }
    }
}

/// Convert interleaved samples between channel counts. Mono output averages
/// every device channel; other layouts reuse the nearest channel.
fn remix(samples: Vec<i16>, from: u16, to: u16) -> Vec<i16> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples;
    }
    samples
        .chunks_exact(from)
        .flat_map(|frame| {
            (0..to).map(move |channel| {
                if to == 1 {
                    let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                    (sum / from as i32) as i16
                } else {
                    frame[channel.min(from - 1)]
                }
            })
        })
        .collect()
}

/// Capture stream on the default input device
pub struct CpalInput {
    _stream: cpal::Stream,
    format: PcmFormat,
    device_channels: u16,
    frame_samples: usize,
    frame_rx: Receiver<RawFrame>,
    error_rx: Receiver<AudioError>,
    overruns: Arc<AtomicU64>,
}

impl CpalInput {
    /// Hardware buffers held between the callback and the reader
    const CHANNEL_DEPTH: usize = 32;

    pub fn open(format: PcmFormat) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let ranges = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let (config, sample_format) = select_config(ranges, format, false)?;

        let (frame_tx, frame_rx) = bounded::<RawFrame>(Self::CHANNEL_DEPTH);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let overruns = Arc::new(AtomicU64::new(0));

        let build = |config: &StreamConfig| -> Result<cpal::Stream, cpal::BuildStreamError> {
            let error_tx = error_tx.clone();
            let on_error = move |err: cpal::StreamError| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            };
            macro_rules! input_stream {
                ($ty:ty, $variant:ident) => {{
                    let frame_tx = frame_tx.clone();
                    let overruns = overruns.clone();
                    device.build_input_stream(
                        config,
                        move |data: &[$ty], _: &cpal::InputCallbackInfo| {
                            if let Err(TrySendError::Full(_)) =
                                frame_tx.try_send(RawFrame::$variant(data.to_vec()))
                            {
                                overruns.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        on_error,
                        None,
                    )
                }};
            }
            match sample_format {
                SampleFormat::I16 => input_stream!(i16, I16),
                SampleFormat::U16 => input_stream!(u16, U16),
                _ => input_stream!(f32, F32),
            }
        };

        let (stream, config) = match build(&config) {
            Ok(stream) => (stream, config),
            Err(e) if config.buffer_size != cpal::BufferSize::Default => {
                warn!("Fixed input buffer rejected ({}), retrying with default", e);
                let config = StreamConfig {
                    buffer_size: cpal::BufferSize::Default,
                    ..config
                };
                let stream = build(&config).map_err(|e| AudioError::StreamError(e.to_string()))?;
                (stream, config)
            }
            Err(e) => return Err(AudioError::StreamError(e.to_string())),
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let frame_samples = frames_in(&config.buffer_size) * format.channels as usize;
        info!(
            "Opened input '{}' at {} Hz, {} ch, {:?}, buffer {:?}",
            name, config.sample_rate.0, config.channels, sample_format, config.buffer_size
        );

        Ok(Self {
            _stream: stream,
            format,
            device_channels: config.channels,
            frame_samples,
            frame_rx,
            error_rx,
            overruns,
        })
    }
}

impl InputDevice for CpalInput {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(err);
        }
        match self.frame_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(remix(
                frame.into_i16(),
                self.device_channels,
                self.format.channels,
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AudioError::StreamError("input stream closed".to_string()))
            }
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let overruns = self.overruns();
        if overruns > 0 {
            warn!("Input released after {} overruns", overruns);
        } else {
            debug!("Input released");
        }
    }
}

/// Playback stream on the default output device
pub struct CpalOutput {
    stream: cpal::Stream,
    format: PcmFormat,
    device_channels: u16,
    frame_samples: usize,
    queue: Arc<ArrayQueue<i16>>,
    volume: Arc<AtomicU32>,
    error_rx: Receiver<AudioError>,
}

impl CpalOutput {
    pub fn open(format: PcmFormat) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let ranges = device
            .supported_output_configs()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let (config, sample_format) = select_config(ranges, format, false)?;

        let frame_samples = frames_in(&config.buffer_size) * format.channels as usize;
        let queue = Arc::new(ArrayQueue::new(frame_samples * 4));
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let build = |config: &StreamConfig| -> Result<cpal::Stream, cpal::BuildStreamError> {
            let shared = OutputShared {
                queue: queue.clone(),
                volume: volume.clone(),
                source_channels: format.channels as usize,
            };
            let error_tx = error_tx.clone();
            let on_error = move |err: cpal::StreamError| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            };
            match sample_format {
                SampleFormat::I16 => build_output::<i16>(&device, config, shared, on_error),
                SampleFormat::U16 => build_output::<u16>(&device, config, shared, on_error),
                _ => build_output::<f32>(&device, config, shared, on_error),
            }
        };

        let (stream, config) = match build(&config) {
            Ok(stream) => (stream, config),
            Err(e) if config.buffer_size != cpal::BufferSize::Default => {
                warn!("Fixed output buffer rejected ({}), retrying with default", e);
                let config = StreamConfig {
                    buffer_size: cpal::BufferSize::Default,
                    ..config
                };
                let stream = build(&config).map_err(|e| AudioError::StreamError(e.to_string()))?;
                (stream, config)
            }
            Err(e) => return Err(AudioError::StreamError(e.to_string())),
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        info!(
            "Opened output '{}' at {} Hz, {} ch ({} source ch), {:?}",
            name, config.sample_rate.0, config.channels, format.channels, sample_format
        );

        Ok(Self {
            stream,
            format,
            device_channels: config.channels,
            frame_samples,
            queue,
            volume,
            error_rx,
        })
    }

    fn check_errors(&self) -> Result<(), AudioError> {
        match self.error_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    fn buffer_latency(&self) -> Duration {
        let frames = self.frame_samples / self.format.channels.max(1) as usize;
        Duration::from_millis(frames as u64 * 1000 / self.format.sample_rate.max(1) as u64)
    }
}

struct OutputShared {
    queue: Arc<ArrayQueue<i16>>,
    volume: Arc<AtomicU32>,
    source_channels: usize,
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: OutputShared,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let device_channels = config.channels.max(1) as usize;
    let mut frame = vec![0i16; shared.source_channels.max(1)];

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
            for out in data.chunks_mut(device_channels) {
                // Single consumer: a full source frame stays available once seen
                let available = shared.queue.len() >= frame.len();
                for sample in frame.iter_mut() {
                    *sample = if available {
                        shared.queue.pop().unwrap_or(0)
                    } else {
                        0
                    };
                }
                for (channel, slot) in out.iter_mut().enumerate() {
                    let source = frame[channel.min(frame.len() - 1)];
                    *slot = T::from_sample(i16_to_f32(source) * volume);
                }
            }
        },
        on_error,
        None,
    )
}

impl OutputDevice for CpalOutput {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.check_errors()?;
        let mut last_progress = Instant::now();
        for &sample in samples {
            while self.queue.push(sample).is_err() {
                if last_progress.elapsed() > Duration::from_millis(OUTPUT_STALL_TIMEOUT_MS) {
                    return Err(AudioError::OutputStalled(OUTPUT_STALL_TIMEOUT_MS));
                }
                thread::sleep(Duration::from_millis(1));
            }
            last_progress = Instant::now();
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        let started = Instant::now();
        while !self.queue.is_empty() {
            self.check_errors()?;
            if started.elapsed() > Duration::from_millis(OUTPUT_STALL_TIMEOUT_MS) {
                return Err(AudioError::OutputStalled(OUTPUT_STALL_TIMEOUT_MS));
            }
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(self.buffer_latency());
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        debug!(
            "Output released ({} ch device, {} samples pending)",
            self.device_channels,
            self.queue.len()
        );
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let (sample_rates, channels) = device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in [8000u32, 16000, 22050, 44100, 48000, 96000] {
            let sample_rate = cpal::SampleRate(rate);
            if sample_rate >= config.min_sample_rate()
                && sample_rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate)
            {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remix_to_mono_averages() {
        assert_eq!(remix(vec![100, 300, -50, 50], 2, 1), vec![200, 0]);
        assert_eq!(remix(vec![1, 2, 3], 1, 1), vec![1, 2, 3]);
        assert_eq!(remix(vec![7, 9], 1, 2), vec![7, 7, 9, 9]);
    }

    #[test]
    fn test_buffer_size_clamps_to_device_range() {
        let size = buffer_size_for(&SupportedBufferSize::Range { min: 64, max: 4096 });
        assert_eq!(size, cpal::BufferSize::Fixed(MIN_FRAME_SAMPLES as u32));

        let size = buffer_size_for(&SupportedBufferSize::Range { min: 512, max: 4096 });
        assert_eq!(size, cpal::BufferSize::Fixed(512));

        let size = buffer_size_for(&SupportedBufferSize::Range { min: 16, max: 128 });
        assert_eq!(size, cpal::BufferSize::Fixed(128));

        assert_eq!(
            buffer_size_for(&SupportedBufferSize::Unknown),
            cpal::BufferSize::Default
        );
    }

    #[test]
    fn test_raw_frame_conversion() {
        assert_eq!(RawFrame::I16(vec![1, -1]).into_i16(), vec![1, -1]);
        assert_eq!(RawFrame::U16(vec![32768, 0]).into_i16(), vec![0, i16::MIN]);
        assert_eq!(RawFrame::F32(vec![1.0, 0.0]).into_i16(), vec![i16::MAX, 0]);
    }

    #[test]
    fn test_list_devices() {
        // Hosts without audio hardware report an empty list
        for device in list_devices() {
            assert!(device.is_input || device.is_output);
            assert!(!device.name.is_empty());
        }
    }
}
