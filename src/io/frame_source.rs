//! Camera frame acquisition
//!
//! Every call opens the endpoint, takes exactly one frame and closes it
//! again. Nothing is buffered between calls, so a frame is never older than
//! the call that returned it.
//!
//! Sources report two kinds of failure:
//! - `Connect` - the endpoint could not be opened at all
//! - `Read` - it opened, but no usable frame came out
//!
//! [`FrameAcquirer`] turns these into the session's error taxonomy and owns
//! the consecutive connect-failure count.

use crate::domain::error::DetectionError;
use crate::domain::types::FrameSize;
use crate::infra::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// One encoded camera frame plus its decoded dimensions
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    size: FrameSize,
}

impl Frame {
    /// Build a frame whose dimensions are already known
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        Self { data, size: FrameSize::new(width, height) }
    }

    /// Decode the image header to learn the frame dimensions
    pub fn decode(data: Bytes) -> Result<Self, FrameReadError> {
        if data.is_empty() {
            return Err(FrameReadError::Read("empty frame".to_string()));
        }
        let (width, height) = image::ImageReader::new(Cursor::new(&data[..]))
            .with_guessed_format()
            .map_err(|e| FrameReadError::Read(format!("unreadable frame: {e}")))?
            .into_dimensions()
            .map_err(|e| FrameReadError::Read(format!("undecodable frame: {e}")))?;
        if width == 0 || height == 0 {
            return Err(FrameReadError::Read(format!("zero-sized frame {width}x{height}")));
        }
        Ok(Self::new(data, width, height))
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    /// MIME type guessed from the encoded bytes
    pub fn content_type(&self) -> &'static str {
        image::guess_format(&self.data)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameReadError {
    /// Endpoint could not be opened
    #[error("connect failed: {0}")]
    Connect(String),
    /// Endpoint opened but yielded no usable frame
    #[error("read failed: {0}")]
    Read(String),
}

/// Source of single fresh frames
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn read_frame(&self, endpoint: &str) -> Result<Frame, FrameReadError>;
}

/// Grabs one frame through an ffmpeg child process
///
/// The child is spawned with `kill_on_drop`, so a timeout or a cancelled
/// session kills it.
pub struct FfmpegFrameSource {
    ffmpeg_path: String,
    rtsp_transport: String,
    timeout: Duration,
}

impl FfmpegFrameSource {
    pub fn new(ffmpeg_path: impl Into<String>, rtsp_transport: impl Into<String>, timeout: Duration) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into(), rtsp_transport: rtsp_transport.into(), timeout }
    }

    fn args<'a>(&'a self, endpoint: &'a str) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(14);
        if endpoint.starts_with("rtsp://") || endpoint.starts_with("rtsps://") {
            args.extend(["-rtsp_transport", self.rtsp_transport.as_str()]);
        }
        args.extend([
            "-i",
            endpoint,
            "-frames:v",
            "1",
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "-loglevel",
            "error",
            "-",
        ]);
        args
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn read_frame(&self, endpoint: &str) -> Result<Frame, FrameReadError> {
        let child = Command::new(&self.ffmpeg_path)
            .args(self.args(endpoint))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FrameReadError::Connect(format!("ffmpeg spawn failed: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FrameReadError::Connect(format!("ffmpeg execution failed: {e}"))),
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "ffmpeg_timeout_killed");
                return Err(FrameReadError::Connect(format!(
                    "ffmpeg timeout ({}ms)",
                    self.timeout.as_millis()
                )));
            }
        };

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A failed exit with nothing on stdout means the stream never opened
            return if output.status.success() {
                Err(FrameReadError::Read("ffmpeg returned empty output".to_string()))
            } else {
                Err(FrameReadError::Connect(format!("ffmpeg failed: {}", stderr.trim())))
            };
        }

        debug!(bytes = output.stdout.len(), "ffmpeg_frame_captured");
        Frame::decode(Bytes::from(output.stdout))
    }
}

/// Fetches one JPEG/PNG snapshot per call over HTTP
pub struct HttpSnapshotSource {
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn read_frame(&self, endpoint: &str) -> Result<Frame, FrameReadError> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| FrameReadError::Connect(format!("snapshot request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(FrameReadError::Connect(format!("snapshot HTTP error: {}", resp.status())));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FrameReadError::Read(format!("snapshot body read error: {e}")))?;
        Frame::decode(bytes)
    }
}

/// Picks the HTTP or ffmpeg source by endpoint scheme
pub struct EndpointFrameSource {
    ffmpeg: FfmpegFrameSource,
    http: HttpSnapshotSource,
}

impl EndpointFrameSource {
    pub fn new(ffmpeg: FfmpegFrameSource, http: HttpSnapshotSource) -> Self {
        Self { ffmpeg, http }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            FfmpegFrameSource::new(config.ffmpeg_path(), config.rtsp_transport(), config.frame_timeout()),
            HttpSnapshotSource::new(config.frame_timeout())?,
        ))
    }
}

fn is_http(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}

#[async_trait]
impl FrameSource for EndpointFrameSource {
    async fn read_frame(&self, endpoint: &str) -> Result<Frame, FrameReadError> {
        if is_http(endpoint) {
            self.http.read_frame(endpoint).await
        } else {
            self.ffmpeg.read_frame(endpoint).await
        }
    }
}

/// Per-session frame acquisition with the connect-failure threshold
pub struct FrameAcquirer {
    source: Arc<dyn FrameSource>,
    max_connect_failures: u32,
    consecutive_failures: u32,
}

impl FrameAcquirer {
    pub fn new(source: Arc<dyn FrameSource>, max_connect_failures: u32) -> Self {
        Self { source, max_connect_failures: max_connect_failures.max(1), consecutive_failures: 0 }
    }

    /// Acquire one fresh frame.
    ///
    /// Connect failures count up to the threshold, where the stream is
    /// declared unavailable. Any successful open resets the count, and read
    /// failures after an open never count.
    pub async fn acquire(&mut self, endpoint: &str) -> Result<Frame, DetectionError> {
        match self.source.read_frame(endpoint).await {
            Ok(frame) => {
                self.consecutive_failures = 0;
                Ok(frame)
            }
            Err(FrameReadError::Read(reason)) => {
                self.consecutive_failures = 0;
                Err(DetectionError::NoFrame(reason))
            }
            Err(FrameReadError::Connect(reason)) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.max_connect_failures {
                    Err(DetectionError::StreamUnavailable {
                        endpoint: endpoint.to_string(),
                        attempts: self.consecutive_failures,
                    })
                } else {
                    Err(DetectionError::ConnectFailed {
                        attempt: self.consecutive_failures,
                        max_attempts: self.max_connect_failures,
                        reason,
                    })
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
