//! parkwatch - live parking space analysis over WebSocket
//!
//! Decodes a looping video with FFmpeg, samples every Nth frame, asks a
//! multimodal model how many spaces are free and streams the parsed answer
//! with a JPEG preview to the connected client.

pub mod analyzer;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod image;
pub mod metrics;
pub mod parser;
pub mod protocol;
pub mod sampler;
pub mod server;
pub mod session;
pub mod video;

pub use crate::analyzer::{AnalyzerConfig, OpenAiVisionAnalyzer, VisionAnalyzer};
pub use crate::broadcast::{Broadcaster, UpdateMessage, UpdateSink};
pub use crate::config::{Args, ScannerConfig};
pub use crate::error::{AnalysisError, LoopFault, OpenError, SendError};
pub use crate::ffmpeg::{FfmpegCommand, FfmpegError};
pub use crate::image::{ImageConfig, ImageEncoder};
pub use crate::parser::{parse_response, AnalysisResult, ParsedResponse};
pub use crate::sampler::should_analyze;
pub use crate::session::{Session, SessionConfig, SessionState, StartOutcome};
pub use crate::video::{FfmpegFrameSource, FfmpegOpener, FrameSource, MemoryFrameSource, SourceOpener, VideoFrame};
