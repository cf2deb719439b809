//! Source classification and opening
//!
//! A locator is either a network URL (`http://`, `https://`) or anything
//! else, which is treated as a local file (plain path or `file://` URI).
//! The classification happens once, when the `Source` is built, and is the
//! only rule every session uses.

use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, Result};

const FILE_SCHEME: &str = "file://";

/// Where the audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Network,
}

/// Classify a locator by scheme
pub fn classify(locator: &str) -> SourceKind {
    let lower = locator.trim_start().to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        SourceKind::Network
    } else {
        SourceKind::Local
    }
}

/// A classified audio locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    kind: SourceKind,
    locator: String,
}

impl Source {
    /// Validate and classify a locator
    pub fn resolve(locator: &str) -> Result<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(Error::InvalidArgument("Audio path is required".to_string()));
        }

        let kind = classify(locator);
        match kind {
            SourceKind::Network => {
                reqwest::Url::parse(locator).map_err(|e| {
                    Error::InvalidArgument(format!("Malformed URL {}: {}", locator, e))
                })?;
            }
            SourceKind::Local => {
                if strip_file_scheme(locator).is_empty() {
                    return Err(Error::InvalidArgument(format!("Empty file URI: {}", locator)));
                }
            }
        }

        Ok(Self {
            kind,
            locator: locator.to_string(),
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn is_network(&self) -> bool {
        self.kind == SourceKind::Network
    }

    /// Filesystem path for local sources
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.kind {
            SourceKind::Local => Some(PathBuf::from(strip_file_scheme(&self.locator))),
            SourceKind::Network => None,
        }
    }

    /// Lower-cased file extension, used as a container hint
    pub fn extension(&self) -> Option<String> {
        let path = match self.kind {
            SourceKind::Local => strip_file_scheme(&self.locator).to_string(),
            SourceKind::Network => reqwest::Url::parse(&self.locator)
                .map(|url| url.path().to_string())
                .unwrap_or_default(),
        };
        Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    fn hint(&self) -> Hint {
        let mut hint = Hint::new();
        if let Some(ext) = self.extension() {
            hint.with_extension(&ext);
        }
        hint
    }

    /// Open the byte stream behind this source.
    ///
    /// Local files are opened directly. Network sources perform the HTTP
    /// request here: connection failures, timeouts and non-success statuses
    /// come back as `Error::Network`.
    pub fn open(&self, network: &NetworkConfig) -> Result<(MediaSourceStream, Hint)> {
        let media: Box<dyn MediaSource> = match self.kind {
            SourceKind::Local => Box::new(self.open_local()?),
            SourceKind::Network => Box::new(HttpSource::connect(&self.locator, network)?),
        };
        Ok((MediaSourceStream::new(media, Default::default()), self.hint()))
    }

    fn open_local(&self) -> Result<File> {
        let path = self.local_path().unwrap_or_default();
        debug!("Opening local source {:?}", path);
        File::open(&path).map_err(|e| Error::open(&self.locator, e))
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.locator)
    }
}

fn strip_file_scheme(locator: &str) -> &str {
    match locator.get(..FILE_SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(FILE_SCHEME) => &locator[FILE_SCHEME.len()..],
        _ => locator,
    }
}

/// Incremental HTTP body exposed as a non-seekable media source
struct HttpSource {
    response: Mutex<reqwest::blocking::Response>,
    content_length: Option<u64>,
}

impl HttpSource {
    fn connect(url: &str, network: &NetworkConfig) -> std::result::Result<Self, NetworkError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(network.connect_timeout())
            .timeout(network.read_timeout())
            .user_agent(network.user_agent.clone())
            .build()?;

        info!("Connecting to {}", url);
        let response = client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            warn!("{} returned HTTP {}", url, status);
            return Err(NetworkError::Status(status.as_u16()));
        }

        let content_length = response.content_length();
        debug!("Connected to {} (content length {:?})", url, content_length);

        Ok(Self {
            response: Mutex::new(response),
            content_length,
        })
    }
}

impl Read for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.get_mut().read(buf)
    }
}

impl Seek for HttpSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "network sources are not seekable",
        ))
    }
}

impl MediaSource for HttpSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.content_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify("http://example.com/a.mp3"), SourceKind::Network);
        assert_eq!(classify("HTTPS://example.com/a.mp3"), SourceKind::Network);
        assert_eq!(classify("/music/a.mp3"), SourceKind::Local);
        assert_eq!(classify("file:///music/a.mp3"), SourceKind::Local);
        assert_eq!(classify("relative/a.wav"), SourceKind::Local);
        assert_eq!(classify("httpfoo/a.wav"), SourceKind::Local);
    }

    #[test]
    fn test_file_uri_and_plain_path_agree() {
        let plain = Source::resolve("/music/a.wav").unwrap();
        let uri = Source::resolve("file:///music/a.wav").unwrap();
        assert_eq!(plain.kind(), uri.kind());
        assert_eq!(plain.local_path(), uri.local_path());
        assert_eq!(uri.local_path(), Some(PathBuf::from("/music/a.wav")));
    }

    #[test]
    fn test_empty_locator_rejected() {
        let err = Source::resolve("   ").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(matches!(Source::resolve("file://").unwrap_err(), Error::InvalidArgument(_)));
    }

    #[test]
    fn test_malformed_url_rejected() {
        let err = Source::resolve("http://").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_extension_hint() {
        let local = Source::resolve("file:///tmp/Song.MP3").unwrap();
        assert_eq!(local.extension().as_deref(), Some("mp3"));

        let remote = Source::resolve("https://cdn.example.com/audio/track.ogg?sig=abc").unwrap();
        assert!(remote.is_network());
        assert_eq!(remote.extension().as_deref(), Some("ogg"));
        assert_eq!(remote.local_path(), None);
    }

    #[test]
    fn test_missing_local_file_is_open_error() {
        let source = Source::resolve("/definitely/not/here.wav").unwrap();
        let err = source.open(&NetworkConfig::default()).err().expect("expected open error");
        assert!(matches!(err, Error::Open { .. }));
    }
}
