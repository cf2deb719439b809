//! Request/response control API
//!
//! Commands arrive as `{"method": "...", "args": {...}}` and every answer is
//! an `ApiResponse`. `startPlaybackStream` is the only deferred call: its
//! response is ready when the stream terminates or fails to open.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::audio::stream::StreamCompletion;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind, Result};

/// One control API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum Command {
    GetPlatformVersion,
    Play {
        path: String,
        #[serde(default)]
        volume: Option<f32>,
        #[serde(default, rename = "loop")]
        looping: bool,
    },
    Pause,
    Resume,
    Stop,
    SetVolume {
        volume: f32,
    },
    IsPlaying,
    GetCurrentPosition,
    GetDuration {
        path: String,
    },
    GetPlaybackState,
    StartRecording,
    StopRecording,
    StartPlaybackStream {
        path: String,
    },
    StopPlaybackStream,
    GetAudioProperties,
}

impl Command {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetPlatformVersion => "getPlatformVersion",
            Command::Play { .. } => "play",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::SetVolume { .. } => "setVolume",
            Command::IsPlaying => "isPlaying",
            Command::GetCurrentPosition => "getCurrentPosition",
            Command::GetDuration { .. } => "getDuration",
            Command::GetPlaybackState => "getPlaybackState",
            Command::StartRecording => "startRecording",
            Command::StopRecording => "stopRecording",
            Command::StartPlaybackStream { .. } => "startPlaybackStream",
            Command::StopPlaybackStream => "stopPlaybackStream",
            Command::GetAudioProperties => "getAudioProperties",
        }
    }
}

/// Error payload of a failed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Standard API response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            error: None,
        }
    }

    /// Success without a payload
    pub fn ack() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: kind.code().to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::from_error(&e),
        }
    }

    fn from_ack(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ack(),
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Response to a command, possibly still pending
pub enum Reply {
    Immediate(ApiResponse),
    Deferred(Deferred),
}

impl Reply {
    /// Block until the response is available
    pub fn wait(self) -> ApiResponse {
        match self {
            Reply::Immediate(response) => response,
            Reply::Deferred(deferred) => deferred.wait(),
        }
    }
}

/// Response that becomes available when a stream terminates
pub struct Deferred {
    completion: StreamCompletion,
}

impl Deferred {
    pub fn wait(self) -> ApiResponse {
        ApiResponse::from_result(self.completion.wait())
    }

    /// `None` while the stream is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ApiResponse> {
        self.completion
            .wait_timeout(timeout)
            .map(ApiResponse::from_result)
    }
}

impl Engine {
    /// Execute one control API call
    pub fn handle(&self, command: Command) -> Reply {
        debug!("Control call {}", command.name());
        let response = match command {
            Command::GetPlatformVersion => ApiResponse::ok(self.platform_version()),
            Command::Play {
                path,
                volume,
                looping,
            } => ApiResponse::from_ack(self.play(&path, volume, looping)),
            Command::Pause => {
                self.pause();
                ApiResponse::ack()
            }
            Command::Resume => {
                self.resume();
                ApiResponse::ack()
            }
            Command::Stop => {
                self.stop();
                ApiResponse::ack()
            }
            Command::SetVolume { volume } => ApiResponse::from_result(
                self.set_volume(volume)
                    .map(|applied| json!({ "volume": applied })),
            ),
            Command::IsPlaying => ApiResponse::ok(self.is_playing()),
            Command::GetCurrentPosition => ApiResponse::ok(self.current_position()),
            Command::GetDuration { path } => ApiResponse::from_result(self.get_duration(&path)),
            Command::GetPlaybackState => ApiResponse::ok(self.playback_state()),
            Command::StartRecording => ApiResponse::from_ack(self.start_recording()),
            Command::StopRecording => {
                self.stop_recording();
                ApiResponse::ack()
            }
            Command::StartPlaybackStream { path } => {
                return match self.start_playback_stream(&path) {
                    Ok(completion) => Reply::Deferred(Deferred { completion }),
                    Err(e) => Reply::Immediate(ApiResponse::from_error(&e)),
                };
            }
            Command::StopPlaybackStream => {
                self.stop_playback_stream();
                ApiResponse::ack()
            }
            Command::GetAudioProperties => ApiResponse::ok(self.audio_properties()),
        };
        Reply::Immediate(response)
    }
}
