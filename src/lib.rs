//! # Sound Engine
//!
//! Single-session audio playback, microphone capture and chunked PCM
//! streaming behind one control API.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Control API (control)                            │
//! │      {"method": "play" | "startRecording" | "startPlaybackStream" ...}    │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             Engine (engine)                               │
//! │        at most one session of each kind, replaced stop-then-start         │
//! │                                                                           │
//! │  ┌────────────────┐     ┌─────────────────┐     ┌─────────────────────┐   │
//! │  │   Playback     │     │ Capture Session │     │   Stream Session    │   │
//! │  │  Controller    │     │                 │     │                     │   │
//! │  │ ┌────────────┐ │     │ ┌─────────────┐ │     │ ┌─────────────────┐ │   │
//! │  │ │  Decoder   │ │     │ │ Input Device│ │     │ │     Decoder     │ │   │
//! │  │ └─────┬──────┘ │     │ └──────┬──────┘ │     │ └────────┬────────┘ │   │
//! │  │       ▼        │     │        ▼        │     │          ▼          │   │
//! │  │ ┌────────────┐ │     │ ┌─────────────┐ │     │ ┌─────────────────┐ │   │
//! │  │ │Output Dev. │ │     │ │ Chunk Queue │ │     │ │  Output Device  │ │   │
//! │  │ └────────────┘ │     │ └──────┬──────┘ │     │ └────────┬────────┘ │   │
//! │  │                │     │        ▼        │     │          ▼          │   │
//! │  │  state + pos.  │     │ ┌─────────────┐ │     │ ┌─────────────────┐ │   │
//! │  │                │     │ │ Dispatcher  │ │     │ │   Chunk Queue   │ │   │
//! │  └────────────────┘     │ └──────┬──────┘ │     │ └────────┬────────┘ │   │
//! │                         └────────┼────────┘     │          ▼          │   │
//! │                                  │              │ ┌─────────────────┐ │   │
//! │                                  │              │ │   Dispatcher    │ │   │
//! │                                  │              │ └────────┬────────┘ │   │
//! │                                  │              └──────────┼──────────┘   │
//! └──────────────────────────────────┼─────────────────────────┼──────────────┘
//!                                    ▼                         ▼
//!                          recording event sink      playback-stream event sink
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod source;

pub use config::EngineConfig;
pub use control::{ApiResponse, Command, Reply};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventSink, StreamEvent};

/// Application-wide constants
pub mod constants {
    /// Microphone sample rate
    pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 44_100;

    /// Capture is always mono
    pub const CAPTURE_CHANNELS: u16 = 1;

    /// Signed 16-bit PCM
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Frame size used when a device does not report its buffer size
    pub const DEFAULT_FRAME_SAMPLES: usize = 1024;

    /// Lower bound for fixed hardware buffers
    pub const MIN_FRAME_SAMPLES: usize = 256;

    /// Chunks buffered between a session worker and its consumer
    pub const DEFAULT_QUEUE_DEPTH: usize = 4;

    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;

    /// Upper bound on a single device read while capturing
    pub const DEVICE_POLL_INTERVAL_MS: u64 = 50;

    /// An output device that accepts nothing for this long has failed
    pub const OUTPUT_STALL_TIMEOUT_MS: u64 = 2000;
}
