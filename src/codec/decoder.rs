//! Container decoding into fixed-size PCM frames
//!
//! Wraps a symphonia format reader and codec decoder. Decoded packets are
//! variable-length, so they are re-framed into chunks of the size the output
//! device asks for.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::device::PcmFormat;
use crate::codec::pcm::frames_to_millis;
use crate::config::NetworkConfig;
use crate::error::{DecodeError, Error, Result};
use crate::source::Source;

/// Consecutive bad packets tolerated before giving up
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// Decoder producing interleaved signed 16-bit PCM
pub struct PcmDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: PcmFormat,
    total_frames: Option<u64>,
    seekable: bool,
    /// Decoded samples not yet handed out
    pending: Vec<i16>,
    eof: bool,
    packets_decoded: u64,
    packets_skipped: u64,
    samples_produced: u64,
}

impl PcmDecoder {
    /// Open `source` and prepare its first audio track.
    ///
    /// Errors opening the byte stream keep their category (network errors
    /// stay `Error::Network`); anything the decoder rejects is `Error::Open`.
    pub fn open(source: &Source, network: &NetworkConfig) -> Result<Self> {
        let (stream, hint) = source.open(network)?;
        Self::from_stream(stream, &hint).map_err(|e| Error::open(source.locator(), e))
    }

    /// Probe a media stream and build a decoder for its first audio track
    pub fn from_stream(
        stream: MediaSourceStream,
        hint: &Hint,
    ) -> std::result::Result<Self, DecodeError> {
        let seekable = stream.is_seekable();
        let probed = symphonia::default::get_probe()
            .format(
                hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::Probe(e.to_string()))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoTrack)?;

        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| DecodeError::Corrupted("missing sample rate".to_string()))?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let total_frames = params.n_frames;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedCodec(e.to_string()))?;

        debug!(
            "Decoder ready: track {}, {} Hz, {} ch, {:?} frames",
            track_id, sample_rate, channels, total_frames
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: PcmFormat::new(sample_rate, channels),
            total_frames,
            seekable,
            pending: Vec::new(),
            eof: false,
            packets_decoded: 0,
            packets_skipped: 0,
            samples_produced: 0,
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Track length, when the container declares it
    pub fn duration_millis(&self) -> Option<u64> {
        self.total_frames
            .map(|frames| frames_to_millis(frames, self.format.sample_rate))
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Next chunk of `frame_samples` interleaved samples (rounded down to a
    /// whole number of frames). The final chunk may be shorter. `None` at
    /// end of stream.
    pub fn next_frame(
        &mut self,
        frame_samples: usize,
    ) -> std::result::Result<Option<Vec<i16>>, DecodeError> {
        let channels = self.format.channels.max(1) as usize;
        let wanted = (frame_samples / channels).max(1) * channels;

        while self.pending.len() < wanted && !self.eof {
            self.decode_packet()?;
        }

        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = wanted.min(self.pending.len());
        let rest = self.pending.split_off(take);
        let frame = std::mem::replace(&mut self.pending, rest);
        self.samples_produced += frame.len() as u64;
        Ok(Some(frame))
    }

    /// Seek back to the first frame
    pub fn rewind(&mut self) -> std::result::Result<(), DecodeError> {
        if !self.seekable {
            return Err(DecodeError::Seek("source is not seekable".to_string()));
        }
        self.reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: 0,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| DecodeError::Seek(e.to_string()))?;
        self.decoder.reset();
        self.pending.clear();
        self.eof = false;
        Ok(())
    }

    /// Decode one packet of the selected track into `pending`
    fn decode_packet(&mut self) -> std::result::Result<(), DecodeError> {
        let mut consecutive_errors = 0;

        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("End of stream after {} packets", self.packets_decoded);
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::IoError(e)) => return Err(DecodeError::Io(e.to_string())),
                Err(e) => return Err(DecodeError::Corrupted(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let channels = spec.channels.count() as u16;
                    if channels != self.format.channels {
                        debug!(
                            "Channel count updated from {} to {}",
                            self.format.channels, channels
                        );
                        self.format.channels = channels;
                    }

                    let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    self.pending.extend_from_slice(buffer.samples());
                    self.packets_decoded += 1;
                    return Ok(());
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    consecutive_errors += 1;
                    self.packets_skipped += 1;
                    warn!(
                        "Skipping bad packet ({}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, err
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(DecodeError::Corrupted(format!(
                            "{} consecutive bad packets: {}",
                            MAX_CONSECUTIVE_ERRORS, err
                        )));
                    }
                }
                Err(SymphoniaError::IoError(e)) => return Err(DecodeError::Io(e.to_string())),
                Err(e) => return Err(DecodeError::Corrupted(e.to_string())),
            }
        }
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            packets_decoded: self.packets_decoded,
            packets_skipped: self.packets_skipped,
            samples_produced: self.samples_produced,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub packets_decoded: u64,
    pub packets_skipped: u64,
    pub samples_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn open(path: &Path) -> PcmDecoder {
        let source = Source::resolve(path.to_str().unwrap()).unwrap();
        PcmDecoder::open(&source, &NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_reframes_to_requested_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        write_wav(&path, 8000, 1, &samples);

        let mut decoder = open(&path);
        assert_eq!(decoder.format(), PcmFormat::new(8000, 1));
        assert_eq!(decoder.duration_millis(), Some(125));

        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while let Some(frame) = decoder.next_frame(256).unwrap() {
            sizes.push(frame.len());
            out.extend(frame);
        }
        assert_eq!(sizes, vec![256, 256, 256, 232]);
        assert_eq!(out, samples);
        assert_eq!(decoder.stats().samples_produced, 1000);
        assert!(decoder.next_frame(256).unwrap().is_none());
    }

    #[test]
    fn test_stereo_frames_stay_aligned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 8000, 2, &vec![1i16; 600]);

        let mut decoder = open(&path);
        let frame = decoder.next_frame(255).unwrap().unwrap();
        assert_eq!(frame.len(), 254);
    }

    #[test]
    fn test_rewind_restarts_from_first_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.wav");
        let samples: Vec<i16> = (0..300).map(|i| (i * 3) as i16).collect();
        write_wav(&path, 8000, 1, &samples);

        let mut decoder = open(&path);
        while decoder.next_frame(128).unwrap().is_some() {}
        decoder.rewind().unwrap();
        let first = decoder.next_frame(128).unwrap().unwrap();
        assert_eq!(first, samples[..128].to_vec());
    }

    #[test]
    fn test_garbage_file_is_open_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"definitely not a riff header").unwrap();

        let source = Source::resolve(path.to_str().unwrap()).unwrap();
        let err = PcmDecoder::open(&source, &NetworkConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Open { .. }));
    }
}
