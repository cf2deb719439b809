//! Audio subsystem: devices, the chunk queue and the three session kinds

pub mod buffer;
pub mod capture;
pub mod device;
pub mod memory;
pub mod playback;
pub mod stream;

pub use buffer::{ChunkQueue, Popped, QueueClosed};
pub use capture::{CaptureSession, CaptureState};
pub use device::{list_devices, AudioBackend, CpalBackend, InputDevice, OutputDevice, PcmFormat};
pub use memory::{InputScript, MemoryBackend};
pub use playback::{PlaybackController, PlaybackHandle, PlaybackState, PlaybackStatus};
pub use stream::{StreamCompletion, StreamEnd, StreamSession, StreamSummary};
