use thiserror::Error;

use crate::ffmpeg::FfmpegError;

/// Frame source could not be opened. The only failure surfaced to a client
/// when a session starts.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Video not found: {0}")]
    NotFound(String),

    #[error("Not a video file: {0}")]
    NotVideo(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Decoder failed to start: {0}")]
    Spawn(#[from] FfmpegError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// External inference call failed. Isolated to one cycle.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by inference service")]
    RateLimited,

    #[error("Inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Frame encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout
        } else if e.is_decode() {
            AnalysisError::Malformed(e.to_string())
        } else {
            AnalysisError::Transport(e.to_string())
        }
    }
}

/// Update could not be delivered to the subscriber.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Subscriber channel closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Preview encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Frame could not be turned into a compressed image.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid frame buffer: {0}")]
    InvalidBuffer(String),

    #[error("Resize failed: {0}")]
    Resize(String),

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Unexpected failure inside one loop iteration. Triggers the fixed backoff.
#[derive(Error, Debug)]
pub enum LoopFault {
    #[error("Decode failed: {0}")]
    Decode(#[from] FfmpegError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Configuration rejected at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
